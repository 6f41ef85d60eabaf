// Firmware filename grammar.
//
// Release archives carry hex files named like "M8_V6_2_0_BETA8A_MODEL02.hex".
// The pattern encodes an upstream naming convention that predates the second
// hardware model, which is why the model suffix is optional and defaults to
// the original unit.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^M8_V(\d+)_(\d+)_(\d+)(?:_BETA(\d+)([A-Z])?)?([A-Z])?(?:_MODEL(\d+))?$")
        .unwrap()
});

static HEX_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.hex$").unwrap());

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Model {
    Model01,
    Model02,
}

impl Model {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "MODEL:01" => Some(Model::Model01),
            "MODEL:02" => Some(Model::Model02),
            _ => None,
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Model::Model01 => write!(f, "MODEL:01"),
            Model::Model02 => write!(f, "MODEL:02"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FirmwareInfo {
    pub version: String,
    pub model: Model,
}

/// Parses a firmware filename into its version and target model. Returns
/// `None` for anything outside the known naming convention; an unparseable
/// name is a normal user action, not an error.
pub fn parse_firmware_filename(filename: &str) -> Option<FirmwareInfo> {
    let base = HEX_SUFFIX.replace(filename, "");

    let captures = FILENAME.captures(&base)?;

    let major = &captures[1];
    let minor = &captures[2];
    let patch = &captures[3];

    let mut version = format!("{major}.{minor}.{patch}");

    if let Some(beta) = captures.get(4) {
        let beta_letter = captures.get(5).map_or("", |m| m.as_str());
        version.push_str(&format!(" Beta {}{}", beta.as_str(), beta_letter));
    } else if let Some(patch_letter) = captures.get(6) {
        // Patch letters attach directly, no separator.
        version.push_str(patch_letter.as_str());
    }

    let model_token = format!(
        "MODEL:{}",
        captures.get(7).map_or("01", |m| m.as_str())
    );

    let model = Model::from_token(&model_token)?;

    Some(FirmwareInfo { version, model })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_beta_with_model_suffix() {
        let info = parse_firmware_filename("M8_V6_2_0_BETA8A_MODEL02.hex").unwrap();
        assert_eq!(info.version, "6.2.0 Beta 8A");
        assert_eq!(info.model, Model::Model02);
        assert_eq!(info.model.to_string(), "MODEL:02");
    }

    #[test]
    fn parses_plain_version_defaulting_to_model01() {
        let info = parse_firmware_filename("M8_V2_0_0.hex").unwrap();
        assert_eq!(info.version, "2.0.0");
        assert_eq!(info.model, Model::Model01);
        assert_eq!(info.model.to_string(), "MODEL:01");
    }

    #[test]
    fn parses_beta_without_letter() {
        let info = parse_firmware_filename("M8_V4_0_1_BETA12.hex").unwrap();
        assert_eq!(info.version, "4.0.1 Beta 12");
    }

    #[test]
    fn parses_patch_letter_without_separator() {
        let info = parse_firmware_filename("M8_V1_2_3C.hex").unwrap();
        assert_eq!(info.version, "1.2.3C");
    }

    #[test]
    fn extension_is_optional_and_case_insensitive() {
        assert!(parse_firmware_filename("M8_V2_0_0").is_some());
        assert!(parse_firmware_filename("M8_V2_0_0.HEX").is_some());
        assert!(parse_firmware_filename("m8_v2_0_0.hex").is_some());
    }

    #[test]
    fn rejects_unknown_names() {
        assert_eq!(parse_firmware_filename("invalid.hex"), None);
        assert_eq!(parse_firmware_filename(""), None);
        assert_eq!(parse_firmware_filename("M8_V2_0.hex"), None);
    }

    #[test]
    fn rejects_unknown_model_identifiers() {
        assert_eq!(parse_firmware_filename("M8_V2_0_0_MODEL03.hex"), None);
    }
}
