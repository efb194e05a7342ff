//! Allocator configuration
//!
//! Loaded from TOML, for example:
//!
//! ```toml
//! initial_capacity = 536870912   # two segments supplied up front
//! capacity_limit = 4294967296    # never ask for more than 4GB
//! ```

use crate::allocator::SEGMENT_SIZE;
use crate::error::{ExtAllocError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorConfig {
    /// Storage treated as already supplied at offset 0
    pub initial_capacity: u64,

    /// Hard ceiling on total capacity, `None` for unbounded
    pub capacity_limit: Option<u64>,
}

impl AllocatorConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: AllocatorConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_capacity % SEGMENT_SIZE != 0 {
            return Err(ExtAllocError::InvalidConfig(format!(
                "initial_capacity {} is not a multiple of {}",
                self.initial_capacity, SEGMENT_SIZE
            )));
        }

        if let Some(limit) = self.capacity_limit {
            if limit % SEGMENT_SIZE != 0 {
                return Err(ExtAllocError::InvalidConfig(format!(
                    "capacity_limit {} is not a multiple of {}",
                    limit, SEGMENT_SIZE
                )));
            }
            if self.initial_capacity > limit {
                return Err(ExtAllocError::InvalidConfig(format!(
                    "initial_capacity {} exceeds capacity_limit {}",
                    self.initial_capacity, limit
                )));
            }
        }

        Ok(())
    }
}
