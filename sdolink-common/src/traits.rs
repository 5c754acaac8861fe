//! Transport traits
//!
//! A CAN driver is made usable by the SDO client by implementing [`CanSender`] and
//! [`CanReceiver`]. Both may be implemented by the same type.
use snafu::Snafu;

use crate::messages::CanMessage;

/// Error reported by a CAN transport
///
/// These represent hard faults of the underlying link. "No frame available yet" is not an error,
/// and is reported as `Ok(None)` by [`CanReceiver::try_recv`].
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum TransportError {
    /// The bus or socket is not connected
    #[snafu(display("CAN socket is not connected"))]
    NotConnected,
    /// Reading or writing the bus failed
    #[snafu(display("CAN I/O failure: {message}"))]
    Io {
        /// Description of the failure, as reported by the driver
        message: String,
    },
}

/// A synchronous CAN sender
pub trait CanSender {
    /// Send a message to the bus
    fn send(&mut self, msg: CanMessage) -> Result<(), TransportError>;
}

/// A non-blocking CAN receiver
pub trait CanReceiver {
    /// Attempt to read a message from the receiver
    ///
    /// Returns `Ok(None)` immediately if no message is currently available.
    fn try_recv(&mut self) -> Result<Option<CanMessage>, TransportError>;

    /// Remove any pending messages from the receiver
    fn flush(&mut self) -> Result<(), TransportError> {
        while self.try_recv()?.is_some() {}
        Ok(())
    }
}

impl<T: CanSender + ?Sized> CanSender for &mut T {
    fn send(&mut self, msg: CanMessage) -> Result<(), TransportError> {
        (**self).send(msg)
    }
}

impl<T: CanReceiver + ?Sized> CanReceiver for &mut T {
    fn try_recv(&mut self) -> Result<Option<CanMessage>, TransportError> {
        (**self).try_recv()
    }
}

impl<T: CanSender + ?Sized> CanSender for Box<T> {
    fn send(&mut self, msg: CanMessage) -> Result<(), TransportError> {
        (**self).send(msg)
    }
}

impl<T: CanReceiver + ?Sized> CanReceiver for Box<T> {
    fn try_recv(&mut self) -> Result<Option<CanMessage>, TransportError> {
        (**self).try_recv()
    }
}
