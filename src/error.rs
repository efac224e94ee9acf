use thiserror::Error;

#[derive(Error, Debug)]
pub enum FragmapError {
    /// Zero or otherwise unusable cluster count, device size or cell size.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An extent that reaches past the end of the device.
    #[error(
        "Inconsistent extent in {file}: blocks {start}+{length} exceed device of {device_blocks} blocks"
    )]
    InconsistentExtent {
        file: String,
        start: u64,
        length: u64,
        device_blocks: u64,
    },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot format error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, FragmapError>;
