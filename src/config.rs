// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_BIT_WIDTH, Error, MAX_BIT_WIDTH};

/// Configuration options for an AMT instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Each node holds `2^bit_width` slots and consumes `bit_width` bits of an index per level.
    pub bit_width: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bit_width: DEFAULT_BIT_WIDTH,
        }
    }
}

impl Config {
    pub fn with_bit_width(bit_width: u32) -> Self {
        Self { bit_width }
    }

    /// Checks that the bit width describes a usable tree shape.
    pub fn validate(&self) -> Result<(), Error> {
        if self.bit_width < 1 {
            return Err(Error::InvalidConfig(format!(
                "bit width must be at least 1 (i.e. 2 children per node), is {}",
                self.bit_width
            )));
        }
        if self.bit_width > MAX_BIT_WIDTH {
            return Err(Error::InvalidConfig(format!(
                "bit width must be at most {MAX_BIT_WIDTH}, is {}",
                self.bit_width
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_width_eight() {
        let config = Config::default();
        assert_eq!(config.bit_width, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_and_oversized_bit_width() {
        assert!(matches!(
            Config::with_bit_width(0).validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            Config::with_bit_width(MAX_BIT_WIDTH + 1).validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(Config::with_bit_width(1).validate().is_ok());
        assert!(Config::with_bit_width(MAX_BIT_WIDTH).validate().is_ok());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        let config: Config = serde_json::from_str(r#"{"bit_width":5}"#).unwrap();
        assert_eq!(config.bit_width, 5);
    }
}
