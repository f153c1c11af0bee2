//! This module provides an `Error` type for the crate using the [`thiserror`] crate.
use thiserror::Error;

/// The `Error` type.
#[derive(Debug, Error)]
pub enum Error {
    /// The store table selector width does not fit the host pointer width.
    #[error("store table selector width {0} is out of range")]
    InvalidStoreTableBits(u8),
    /// The vector register length is not a power of two or is below the minimum.
    #[error("invalid VLEN: {0}")]
    InvalidVlen(u32),
    /// The back-end rejected an IR operation it does not implement.
    #[error("back-end does not implement `{0}`")]
    UnsupportedOp(&'static str),
    /// The configured core id collides with the store table's "no core" sentinel.
    #[error("core id {0:#x} is reserved")]
    ReservedCoreId(u32),
    /// Wraps ['std::io::Error'].
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
