//! Canned images and model replies for pipeline tests

/// Smallest byte strings that pass magic-byte detection.
pub const JPEG_BYTES: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00, 0x00, 0x01,
];
pub const PNG_BYTES: &[u8] = &[
    0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D', b'R',
];

/// A plain-text file that a client renamed to `.jpg`.
pub const TEXT_AS_JPG: &[u8] = b"Batch 2291 inspection notes: all knives polished.\n";

/// A model reply as it arrives from the provider, plus what it should parse to.
#[derive(Debug, Clone)]
pub struct ModelReplyFixture {
    pub name: &'static str,
    pub text: &'static str,
    pub defect_detected: bool,
    pub boxes: usize,
}

pub const CLEAN_REPLY: &str = r#"{"defect_detected": false, "confidence": 0.91}"#;

pub const MODEL_REPLIES: &[ModelReplyFixture] = &[
    ModelReplyFixture {
        name: "bare clean object",
        text: CLEAN_REPLY,
        defect_detected: false,
        boxes: 0,
    },
    ModelReplyFixture {
        name: "fenced rust spot",
        text: "Here is the inspection result:\n```json\n{\"defect_detected\": true, \"defect_type\": \"rust_spot\", \"severity\": \"critical\", \"description\": \"Orange oxidation near the bolster.\", \"confidence\": 0.87, \"bounding_boxes\": [{\"x\": 120, \"y\": 48, \"width\": 30, \"height\": 22}]}\n```",
        defect_detected: true,
        boxes: 1,
    },
    ModelReplyFixture {
        name: "legacy pass shape",
        text: r#"{"has_defect": false, "defect_type": "none", "severity": "pass", "confidence": 0.95, "location": {"region": "full_product", "bounding_box": {"x": 0, "y": 0, "width": 640, "height": 480}}, "description": "Product meets all quality standards."}"#,
        defect_detected: false,
        boxes: 1,
    },
    ModelReplyFixture {
        name: "prose wrapped scratch",
        text: r#"I looked closely. {"defect_detected": true, "defect_type": "blade_scratch", "severity": "minor", "description": "3mm scratch on the flat.", "confidence": 0.72, "bounding_boxes": []} That is my answer."#,
        defect_detected: true,
        boxes: 0,
    },
];

/// Replies that must be classified as malformed.
pub const MALFORMED_REPLIES: &[&str] = &[
    "I'm unable to assess this image.",
    r#"{"defect_detected": true, "confidence": 0.4} or maybe {"defect_detected": false, "confidence": 0.6}"#,
    r#"{"defect_detected": true, "defect_type": "bent_tine", "severity": "major", "confidence": 0.5}"#,
];
