use alloc::string::String;

/// Failure reported by the transfer layer for a single request.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Stall")]
    Stall,
    #[error("Timeout")]
    Timeout,
    #[error("Cancelled")]
    Cancelled,
    #[error("No transfer slot available")]
    NoSlot,
    #[error("Other error: {0}")]
    Other(String),
}
