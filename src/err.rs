use usb_if::host::hub::DescriptorError;

pub use usb_if::err::TransferError;
pub use usb_if::host::USBError;

pub type Result<T = ()> = core::result::Result<T, HubError>;

/// Error classes that decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The transfer layer reported a failure.
    Transport,
    /// A response had the wrong length or signature.
    Protocol,
    /// Chain depth or port count out of range.
    Topology,
    /// Allocation or hub slot exhaustion.
    Resource,
}

#[derive(thiserror::Error, Debug)]
pub enum HubError {
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("USB error: {0}")]
    Usb(#[from] USBError),
    #[error("Short response: expected {expected} bytes, got {actual}")]
    ShortResponse { expected: usize, actual: usize },
    #[error("Bad hub descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("Hub reports {0} ports, supported range is 1..={max}", max = crate::config::MAX_PORTS)]
    PortCount(u8),
    #[error("Hub level {level} exceeds the maximum chain depth {max}")]
    DepthExceeded { level: u8, max: u8 },
    #[error("Hub limit of {0} reached")]
    HubLimit(usize),
    #[error("No memory available")]
    NoMemory,
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::Transfer(_) => ErrorKind::Transport,
            HubError::Usb(USBError::NoMemory) => ErrorKind::Resource,
            HubError::Usb(USBError::SlotLimitReached) => ErrorKind::Resource,
            HubError::Usb(_) => ErrorKind::Transport,
            HubError::ShortResponse { .. } | HubError::Descriptor(_) => ErrorKind::Protocol,
            HubError::PortCount(_) | HubError::DepthExceeded { .. } => ErrorKind::Topology,
            HubError::HubLimit(_) | HubError::NoMemory => ErrorKind::Resource,
        }
    }
}
