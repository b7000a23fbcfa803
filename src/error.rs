use thiserror::Error;

#[derive(Error, Debug)]
pub enum HfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error after {copied} bytes: {source}")]
    ShortRead {
        copied: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("not an HFS volume (signature 0x{signature:04X})")]
    NotHfsVolume { signature: u16 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a regular file: {0}")]
    NotAFile(String),

    #[error("file too large: {size} bytes exceeds load limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("corrupt structure: {0}")]
    CorruptStructure(String),
}

pub type Result<T> = std::result::Result<T, HfsError>;

impl HfsError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        HfsError::CorruptStructure(msg.into())
    }

    /// Bytes already placed in the caller's buffer when a read failed.
    pub fn bytes_copied(&self) -> Option<usize> {
        match self {
            HfsError::ShortRead { copied, .. } => Some(*copied),
            _ => None,
        }
    }
}
