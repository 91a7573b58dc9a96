use crate::gpu::{BufferKind, GpuError};

/// Fatal allocation failures. Bookkeeping is left consistent, but nothing is
/// retried.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("invalid allocator config: {0}")]
    InvalidConfig(String),
    #[error("{kind} pool of {capacity} bytes cannot grow by {requested} bytes")]
    CapacityOverflow {
        kind: BufferKind,
        capacity: u32,
        requested: u32,
    },
    #[error("growing the {kind} pool to {size} bytes failed")]
    Growth {
        kind: BufferKind,
        size: u32,
        #[source]
        source: GpuError,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("reading config failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config failed: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
}
