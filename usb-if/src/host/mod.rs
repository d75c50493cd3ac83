use core::pin::Pin;

use alloc::{boxed::Box, vec::Vec};
use futures::future::BoxFuture;

use crate::{err::TransferError, transfer::ControlSetup};

pub mod hub;

/// The control and interrupt pipes of a bound hub device.
///
/// Requests are submitted here and complete asynchronously; the hub manager
/// decides whether to block on a control completion or keep an interrupt
/// request outstanding.
pub trait HubTransport: Send + 'static {
    fn control_in<'a>(&mut self, setup: ControlSetup, data: &'a mut [u8]) -> ResultTransfer<'a>;
    fn control_out<'a>(&mut self, setup: ControlSetup, data: &'a [u8]) -> ResultTransfer<'a>;

    /// Queues one read of the status change endpoint.
    ///
    /// Dropping the returned transfer dequeues it and releases its buffer.
    fn interrupt_in(&mut self, len: usize) -> Result<InterruptTransfer, TransferError>;
}

pub type BoxTransfer<'a> = Pin<Box<dyn Transfer<'a> + Send>>;
pub type ResultTransfer<'a> = Result<BoxTransfer<'a>, TransferError>;

/// Outstanding interrupt-IN read yielding the bytes received.
pub type InterruptTransfer = BoxFuture<'static, Result<Vec<u8>, TransferError>>;

pub trait Transfer<'a>: Future<Output = Result<usize, TransferError>> + Send + 'a {}

impl<'a, F> Transfer<'a> for F where F: Future<Output = Result<usize, TransferError>> + Send + 'a {}

#[derive(thiserror::Error, Debug)]
pub enum USBError {
    #[error("Timeout")]
    Timeout,
    #[error("No memory available")]
    NoMemory,
    #[error("Transfer error: {0}")]
    TransferError(#[from] TransferError),
    #[error("Not initialized")]
    NotInitialized,
    #[error("Not found")]
    NotFound,
    #[error("Slot limit reached")]
    SlotLimitReached,
    #[error("Configuration not set")]
    ConfigurationNotSet,
    #[error("Other error: {0}")]
    Other(#[from] Box<dyn core::error::Error + Send + Sync>),
}

impl From<&str> for USBError {
    fn from(value: &str) -> Self {
        Self::Other(value.into())
    }
}
