use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::AcquisitionSection;

use super::AcquisitionError;

/// What an acquisition job should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetQuality {
    Lossless,
    Copy,
    /// Vertical resolution in lines, e.g. `1080` for "1080p".
    Resolution(u32),
}

impl fmt::Display for TargetQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetQuality::Lossless => f.write_str("lossless"),
            TargetQuality::Copy => f.write_str("copy"),
            TargetQuality::Resolution(height) => write!(f, "{height}p"),
        }
    }
}

impl FromStr for TargetQuality {
    type Err = AcquisitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        match value.as_str() {
            "lossless" | "flac" => Ok(Self::Lossless),
            "copy" | "passthrough" => Ok(Self::Copy),
            other => other
                .trim_end_matches('p')
                .parse::<u32>()
                .ok()
                .filter(|height| *height > 0)
                .map(Self::Resolution)
                .ok_or_else(|| AcquisitionError::InvalidQuality(s.to_string())),
        }
    }
}

impl TryFrom<String> for TargetQuality {
    type Error = AcquisitionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetQuality> for String {
    fn from(value: TargetQuality) -> Self {
        value.to_string()
    }
}

/// Content type to target quality. Unknown types get the default.
#[derive(Debug, Clone)]
pub struct QualityTable {
    default: TargetQuality,
    entries: HashMap<String, TargetQuality>,
}

impl Default for QualityTable {
    fn default() -> Self {
        Self::new(TargetQuality::Resolution(1080))
            .with("music", TargetQuality::Lossless)
            .with("podcast", TargetQuality::Copy)
            .with("game", TargetQuality::Copy)
    }
}

impl QualityTable {
    pub fn new(default: TargetQuality) -> Self {
        Self {
            default,
            entries: HashMap::new(),
        }
    }

    pub fn with(mut self, content_type: &str, quality: TargetQuality) -> Self {
        self.entries
            .insert(content_type.trim().to_ascii_lowercase(), quality);
        self
    }

    pub fn from_config(section: &AcquisitionSection) -> Result<Self, AcquisitionError> {
        let mut table = Self::new(section.default_quality.parse()?);
        for (content_type, quality) in &section.quality {
            table = table.with(content_type, quality.parse()?);
        }
        Ok(table)
    }

    pub fn resolve(&self, content_type: &str) -> TargetQuality {
        self.entries
            .get(&content_type.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quality_names() {
        assert_eq!("lossless".parse::<TargetQuality>().unwrap(), TargetQuality::Lossless);
        assert_eq!("Copy".parse::<TargetQuality>().unwrap(), TargetQuality::Copy);
        assert_eq!(
            "720p".parse::<TargetQuality>().unwrap(),
            TargetQuality::Resolution(720)
        );
        assert_eq!(
            "480".parse::<TargetQuality>().unwrap(),
            TargetQuality::Resolution(480)
        );
        assert!("0p".parse::<TargetQuality>().is_err());
        assert!("ultra".parse::<TargetQuality>().is_err());
    }

    #[test]
    fn default_table_matches_content_types() {
        let table = QualityTable::default();
        assert_eq!(table.resolve("music"), TargetQuality::Lossless);
        assert_eq!(table.resolve("Podcast"), TargetQuality::Copy);
        assert_eq!(table.resolve("game"), TargetQuality::Copy);
        assert_eq!(table.resolve("movie"), TargetQuality::Resolution(1080));
    }

    #[test]
    fn serialises_as_display_string() {
        let json = serde_json::to_string(&TargetQuality::Resolution(720)).unwrap();
        assert_eq!(json, "\"720p\"");
        let back: TargetQuality = serde_json::from_str("\"lossless\"").unwrap();
        assert_eq!(back, TargetQuality::Lossless);
    }
}
