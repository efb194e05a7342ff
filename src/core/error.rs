use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtAllocError {
    /// Backing storage is exhausted; grow it by `required` bytes at `capacity()` and retry.
    #[error("Backing storage exhausted: {required} more bytes required")]
    NeedStorage { required: u64 },

    #[error("Zero-sized allocation requested")]
    ZeroSize,

    #[error("Allocation too large: {0} bytes")]
    TooLarge(u64),

    #[error("Misaligned growth: offset {offset}, size {size} (must be segment aligned)")]
    MisalignedGrowth { offset: u64, size: u64 },

    #[error("Non-contiguous growth: expected offset {expected}, got {offset}")]
    NonContiguousGrowth { expected: u64, offset: u64 },

    #[error("Invalid offset: {0} is not a live block")]
    InvalidOffset(u64),

    #[error("Size mismatch: offset {offset} was not allocated with size {size}")]
    SizeMismatch { offset: u64, size: u64 },

    #[error("Double free detected at offset {0}")]
    DoubleFree(u64),

    #[error("Capacity limit of {limit} bytes would be exceeded by {requested} more bytes")]
    CapacityLimit { limit: u64, requested: u64 },

    #[error("Invalid allocator config: {0}")]
    InvalidConfig(String),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtAllocError {
    /// True for the one failure a caller is expected to handle by growing storage.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ExtAllocError::NeedStorage { .. })
    }

    /// Bytes of storage the caller must add before retrying, if this is a shortfall.
    pub fn required_storage(&self) -> Option<u64> {
        match self {
            ExtAllocError::NeedStorage { required } => Some(*required),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExtAllocError>;
