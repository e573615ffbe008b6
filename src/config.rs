use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::kind::{PayloadKind, Variant};

/// Largest buffer capacity a frame can describe
pub const MAX_CAPACITY: usize = u32::MAX as usize;

/// Tunables for a merge session.
///
/// Every process in a group must use the same configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub variant: Variant,
    /// Text buffer size in bytes
    pub text_capacity: usize,
    /// Binary buffer sizes, in elements
    pub int_capacity: usize,
    pub float_capacity: usize,
    pub byte_capacity: usize,
    /// Frame payloads longer than this are zstd-compressed; `None` disables it
    pub compress_threshold: Option<usize>,
    pub zstd_level: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            variant: Variant::Text,
            text_capacity: 64 * 1024,
            int_capacity: 8 * 1024,
            float_capacity: 8 * 1024,
            byte_capacity: 64 * 1024,
            compress_threshold: None,
            zstd_level: 3,
        }
    }
}

impl SessionConfig {
    pub fn text(capacity: usize) -> Self {
        Self {
            variant: Variant::Text,
            text_capacity: capacity,
            ..Self::default()
        }
    }

    pub fn binary(ints: usize, floats: usize, bytes: usize) -> Self {
        Self {
            variant: Variant::Binary,
            int_capacity: ints,
            float_capacity: floats,
            byte_capacity: bytes,
            ..Self::default()
        }
    }

    pub fn with_compression(mut self, threshold: usize) -> Self {
        self.compress_threshold = Some(threshold);
        self
    }

    /// Parse a JSON configuration, filling omitted fields with defaults
    pub fn from_json(input: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(input).map_err(|e| MergeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let largest = [self.text_capacity, self.int_capacity, self.float_capacity, self.byte_capacity]
            .into_iter()
            .max()
            .unwrap_or_default();
        if largest > MAX_CAPACITY {
            return Err(MergeError::InvalidConfig(format!(
                "capacity {largest} exceeds {MAX_CAPACITY}"
            )));
        }
        match self.variant {
            Variant::Text if self.text_capacity == 0 => {
                Err(MergeError::InvalidConfig("text_capacity must be positive".into()))
            }
            Variant::Binary
                if self.int_capacity == 0 || self.float_capacity == 0 || self.byte_capacity == 0 =>
            {
                Err(MergeError::InvalidConfig("binary capacities must be positive".into()))
            }
            _ => Ok(()),
        }
    }

    pub fn capacity(&self, kind: PayloadKind) -> usize {
        match kind {
            PayloadKind::Ints => self.int_capacity,
            PayloadKind::Floats => self.float_capacity,
            PayloadKind::Bytes => self.byte_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config = SessionConfig::from_json(r#"{"variant":"binary","int_capacity":16}"#).unwrap();
        assert_eq!(config.variant, Variant::Binary);
        assert_eq!(config.int_capacity, 16);
        assert_eq!(config.float_capacity, SessionConfig::default().float_capacity);
        assert_eq!(config.compress_threshold, None);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(SessionConfig::text(0).validate().is_err());
        assert!(SessionConfig::binary(1, 0, 1).validate().is_err());
        assert!(SessionConfig::from_json(r#"{"text_capacity":0}"#).is_err());
        assert!(SessionConfig::from_json("{not json").is_err());
    }

    #[test]
    fn capacity_must_fit_a_frame() {
        assert!(SessionConfig::text(MAX_CAPACITY).validate().is_ok());
        let huge = MAX_CAPACITY.saturating_add(1);
        if huge > MAX_CAPACITY {
            assert!(SessionConfig::text(huge).validate().is_err());
            assert!(SessionConfig::binary(1, huge, 1).validate().is_err());
        }
    }
}
