use garde::Validate;
use serde_json::{Map, Value};
use strsim::jaro_winkler;

/// Minimum similarity for suggesting an allowed facility in an error.
const SUGGESTION_THRESHOLD: f64 = 0.85;

/// Image formats accepted for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedFormat {
    Jpeg,
    Png,
    Webp,
}

impl SupportedFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            SupportedFormat::Jpeg => "image/jpeg",
            SupportedFormat::Png => "image/png",
            SupportedFormat::Webp => "image/webp",
        }
    }

    /// Extension used for the raw blob name.
    pub fn extension(&self) -> &'static str {
        match self {
            SupportedFormat::Jpeg => "jpg",
            SupportedFormat::Png => "png",
            SupportedFormat::Webp => "webp",
        }
    }

    /// Detect the format from magic bytes.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes).ok()? {
            image::ImageFormat::Jpeg => Some(SupportedFormat::Jpeg),
            image::ImageFormat::Png => Some(SupportedFormat::Png),
            image::ImageFormat::WebP => Some(SupportedFormat::Webp),
            _ => None,
        }
    }

    fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(SupportedFormat::Jpeg),
            "image/png" => Some(SupportedFormat::Png),
            "image/webp" => Some(SupportedFormat::Webp),
            _ => None,
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(SupportedFormat::Jpeg),
            "png" => Some(SupportedFormat::Png),
            "webp" => Some(SupportedFormat::Webp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("image payload is empty")]
    EmptyImage,

    #[error("image is {size} bytes, maximum is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("payload is not a supported image (allowed: jpeg, png, webp)")]
    UnsupportedFormat,

    #[error("declared content type `{declared}` does not match detected {detected}")]
    ContentTypeMismatch { declared: String, detected: &'static str },

    #[error("file extension of `{0}` is not allowed (allowed: jpg, jpeg, png, webp)")]
    FileExtension(String),

    #[error("facility is required")]
    MissingFacility,

    #[error("unknown facility `{value}`{}", suggestion_hint(.suggestion))]
    UnknownFacility {
        value: String,
        suggestion: Option<String>,
    },

    #[error("product_sku is required")]
    MissingProductSku,

    #[error("product_sku `{0}` is not a valid product code")]
    InvalidProductSku(String),

    #[error("product_sku `{0}` is not in the allowed product list")]
    UnknownProductSku(String),

    #[error("metadata must be a JSON object")]
    MetadataNotObject,
}

fn suggestion_hint(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean `{s}`?)"),
        None => String::new(),
    }
}

/// Limits and whitelists applied to every upload.
#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub max_image_bytes: usize,
    pub allowed_facilities: Vec<String>,
    /// Empty means any well-formed product code is accepted.
    pub allowed_product_skus: Vec<String>,
}

/// Check an uploaded image and return its detected format.
///
/// The magic bytes decide the format. A declared content type of
/// `application/octet-stream` (or none) defers to detection; any other
/// declaration must agree with it.
pub fn validate_image(
    bytes: &[u8],
    declared_content_type: Option<&str>,
    filename: Option<&str>,
    max_image_bytes: usize,
) -> Result<SupportedFormat, ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::EmptyImage);
    }
    if bytes.len() > max_image_bytes {
        return Err(ValidationError::TooLarge {
            size: bytes.len(),
            max: max_image_bytes,
        });
    }

    if let Some(name) = filename.map(str::trim).filter(|n| !n.is_empty()) {
        let allowed = name
            .rsplit_once('.')
            .and_then(|(_, ext)| SupportedFormat::from_extension(ext))
            .is_some();
        if !allowed {
            return Err(ValidationError::FileExtension(name.to_string()));
        }
    }

    let detected = SupportedFormat::detect(bytes).ok_or(ValidationError::UnsupportedFormat)?;

    if let Some(declared) = declared_content_type {
        let mime = declared
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !mime.is_empty() && mime != "application/octet-stream" {
            match SupportedFormat::from_mime(&mime) {
                Some(format) if format == detected => {}
                Some(_) => {
                    return Err(ValidationError::ContentTypeMismatch {
                        declared: mime,
                        detected: detected.mime(),
                    })
                }
                None => return Err(ValidationError::UnsupportedFormat),
            }
        }
    }

    Ok(detected)
}

/// Trim and lowercase a facility, then check it against the whitelist.
pub fn normalize_facility(raw: &str, allowed: &[String]) -> Result<String, ValidationError> {
    let facility = raw.trim().to_lowercase();
    if facility.is_empty() {
        return Err(ValidationError::MissingFacility);
    }
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(&facility)) {
        return Ok(facility);
    }

    let suggestion = allowed
        .iter()
        .map(|candidate| (candidate, jaro_winkler(&facility, &candidate.to_lowercase())))
        .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(candidate, _)| candidate.clone());

    Err(ValidationError::UnknownFacility {
        value: facility,
        suggestion,
    })
}

#[derive(Validate)]
struct ProductCode {
    #[garde(length(min = 2, max = 32), custom(product_code_charset))]
    code: String,
}

fn product_code_charset(value: &str, _ctx: &()) -> garde::Result {
    let starts_alnum = value.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    if !starts_alnum || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(garde::Error::new(
            "must start with a letter or digit and contain only letters, digits and hyphens",
        ));
    }
    Ok(())
}

/// Trim and uppercase a SKU, then check format and the optional whitelist.
pub fn normalize_product_sku(raw: &str, allowed: &[String]) -> Result<String, ValidationError> {
    let sku = raw.trim().to_uppercase();
    if sku.is_empty() {
        return Err(ValidationError::MissingProductSku);
    }
    ProductCode { code: sku.clone() }
        .validate()
        .map_err(|_| ValidationError::InvalidProductSku(sku.clone()))?;

    if !allowed.is_empty() && !allowed.iter().any(|a| a.eq_ignore_ascii_case(&sku)) {
        return Err(ValidationError::UnknownProductSku(sku));
    }
    Ok(sku)
}

/// Absent or null metadata becomes an empty map; anything but an object is rejected.
pub fn validate_metadata(metadata: Option<Value>) -> Result<Map<String, Value>, ValidationError> {
    match metadata {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(ValidationError::MetadataNotObject),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];
    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00];

    fn facilities() -> Vec<String> {
        vec!["hongkong".to_string(), "shenzhen".to_string(), "yangjiang".to_string()]
    }

    #[test]
    fn test_detects_jpeg_and_png() {
        assert_eq!(validate_image(JPEG, None, None, 1024).unwrap(), SupportedFormat::Jpeg);
        assert_eq!(
            validate_image(PNG, Some("image/png"), Some("knife.PNG"), 1024).unwrap(),
            SupportedFormat::Png
        );
    }

    #[test]
    fn test_text_file_renamed_jpg_is_rejected() {
        let err = validate_image(b"just some notes", Some("image/jpeg"), Some("notes.jpg"), 1024)
            .unwrap_err();
        assert_eq!(err, ValidationError::UnsupportedFormat);
    }

    #[test]
    fn test_size_and_empty_limits() {
        assert_eq!(validate_image(&[], None, None, 10), Err(ValidationError::EmptyImage));
        assert!(matches!(
            validate_image(JPEG, None, None, 4),
            Err(ValidationError::TooLarge { size: 11, max: 4 })
        ));
    }

    #[test]
    fn test_declared_type_must_match_magic_bytes() {
        let err = validate_image(PNG, Some("image/jpeg"), None, 1024).unwrap_err();
        assert!(matches!(err, ValidationError::ContentTypeMismatch { detected: "image/png", .. }));

        // Generic declarations defer to detection
        assert!(validate_image(PNG, Some("application/octet-stream"), None, 1024).is_ok());
        assert!(validate_image(JPEG, Some("image/jpg; q=1"), None, 1024).is_ok());
        assert_eq!(
            validate_image(JPEG, Some("text/plain"), None, 1024),
            Err(ValidationError::UnsupportedFormat)
        );
    }

    #[test]
    fn test_filename_extension_whitelist() {
        let err = validate_image(JPEG, None, Some("blade.gif"), 1024).unwrap_err();
        assert_eq!(err, ValidationError::FileExtension("blade.gif".to_string()));
        assert!(validate_image(JPEG, None, Some("no_extension"), 1024).is_err());
    }

    #[test]
    fn test_facility_normalized_and_checked() {
        assert_eq!(normalize_facility("  YangJiang ", &facilities()).unwrap(), "yangjiang");
        assert_eq!(normalize_facility("", &facilities()), Err(ValidationError::MissingFacility));
    }

    #[test]
    fn test_unknown_facility_suggests_closest() {
        let err = normalize_facility("shenzen", &facilities()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownFacility {
                value: "shenzen".to_string(),
                suggestion: Some("shenzhen".to_string()),
            }
        );
        assert!(err.to_string().contains("did you mean `shenzhen`"));

        let err = normalize_facility("berlin", &facilities()).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownFacility { suggestion: None, .. }));
    }

    #[test]
    fn test_product_sku_format() {
        assert_eq!(normalize_product_sku(" wk-kn-200 ", &[]).unwrap(), "WK-KN-200");
        assert!(matches!(
            normalize_product_sku("-KN-200", &[]),
            Err(ValidationError::InvalidProductSku(_))
        ));
        assert!(matches!(
            normalize_product_sku("WK KN 200", &[]),
            Err(ValidationError::InvalidProductSku(_))
        ));
        assert!(matches!(
            normalize_product_sku("W", &[]),
            Err(ValidationError::InvalidProductSku(_))
        ));
        assert_eq!(normalize_product_sku("  ", &[]), Err(ValidationError::MissingProductSku));
    }

    #[test]
    fn test_product_sku_whitelist() {
        let allowed = vec!["WK-KN-200".to_string()];
        assert!(normalize_product_sku("wk-kn-200", &allowed).is_ok());
        assert_eq!(
            normalize_product_sku("WK-KN-150", &allowed),
            Err(ValidationError::UnknownProductSku("WK-KN-150".to_string()))
        );
    }

    #[test]
    fn test_metadata_must_be_object() {
        assert!(validate_metadata(None).unwrap().is_empty());
        assert!(validate_metadata(Some(Value::Null)).unwrap().is_empty());
        let map = validate_metadata(Some(serde_json::json!({"batch_id": "B-17"}))).unwrap();
        assert_eq!(map["batch_id"], "B-17");
        assert_eq!(
            validate_metadata(Some(serde_json::json!(["a"]))),
            Err(ValidationError::MetadataNotObject)
        );
    }
}
