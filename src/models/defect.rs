use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};

/// Defect categories recognized for Wiko cutlery inspection.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, EnumIter, AsRefStr, IntoStaticStr, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DefectType {
    RustSpot,
    BladeScratch,
    EdgeIrregularity,
    BladeChip,
    HandleCrack,
    HandleDiscoloration,
    WeldDefect,
    PolishDefect,
    DimensionalError,
    AssemblyMisalignment,
    SurfaceContamination,
    HeatTreatmentDefect,
}

impl DefectType {
    /// Short guidance embedded in the model instructions.
    pub fn guidance(&self) -> &'static str {
        match self {
            DefectType::RustSpot => "CRITICAL - surface oxidation from vacuum quench failure",
            DefectType::BladeScratch => "surface scratches (major if >5mm, minor if <5mm)",
            DefectType::EdgeIrregularity => "uneven cutting edge",
            DefectType::BladeChip => "CRITICAL - missing blade material",
            DefectType::HandleCrack => "cracks in handle",
            DefectType::HandleDiscoloration => "uneven or faded handle colour",
            DefectType::WeldDefect => "bolster welding issues",
            DefectType::PolishDefect => "uneven polish",
            DefectType::DimensionalError => "size or shape out of spec",
            DefectType::AssemblyMisalignment => "misaligned components",
            DefectType::SurfaceContamination => "foreign material on the surface",
            DefectType::HeatTreatmentDefect => "warping or hardness marks from heat treatment",
        }
    }
}

/// Severity grading for a detected defect.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, EnumIter, AsRefStr, IntoStaticStr, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Severity {
    Critical,
    Major,
    Minor,
    Cosmetic,
}

impl Severity {
    pub fn guidance(&self) -> &'static str {
        match self {
            Severity::Critical => "safety hazard (rust_spot, blade_chip)",
            Severity::Major => "cannot ship (weld defects, large scratches, handle cracks)",
            Severity::Minor => "can ship with discount (small scratches <5mm)",
            Severity::Cosmetic => "within tolerance",
        }
    }
}

/// Pixel rectangle locating a defect in the source image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate, PartialEq, Eq)]
pub struct BoundingBox {
    #[garde(range(min = 0))]
    pub x: i64,
    #[garde(range(min = 0))]
    pub y: i64,
    #[garde(range(min = 0))]
    pub width: i64,
    #[garde(range(min = 0))]
    pub height: i64,
}

/// Validated defect assessment returned by the inference adapter.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct DefectFindings {
    #[garde(skip)]
    pub defect_detected: bool,

    #[garde(skip)]
    pub defect_type: Option<DefectType>,

    #[garde(skip)]
    pub severity: Option<Severity>,

    #[garde(length(max = 4000))]
    pub description: String,

    #[garde(range(min = 0.0, max = 1.0))]
    pub confidence: f64,

    #[garde(dive)]
    pub bounding_boxes: Vec<BoundingBox>,
}

impl DefectFindings {
    /// Full schema check: field ranges plus cross-field consistency.
    pub fn check_schema(&self) -> Result<(), String> {
        self.validate().map_err(|report| report.to_string())?;

        if self.defect_detected {
            if self.defect_type.is_none() {
                return Err("defect_detected is true but defect_type is missing".to_string());
            }
            if self.severity.is_none() {
                return Err("defect_detected is true but severity is missing".to_string());
            }
        }
        Ok(())
    }
}
