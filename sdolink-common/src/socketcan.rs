use std::{
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    messages::{CanId, CanMessage},
    traits::{CanReceiver, CanSender, TransportError},
};

use socketcan::{
    CanFilter, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Id, Socket, SocketOptions,
    StandardId,
};

fn socketcan_id_to_sdolink_id(id: Id) -> CanId {
    match id {
        Id::Standard(id) => CanId::std(id.as_raw()),
        Id::Extended(id) => CanId::extended(id.as_raw()),
    }
}

fn sdolink_id_to_socketcan_id(id: CanId) -> Result<Id, TransportError> {
    let id: Option<Id> = match id {
        CanId::Extended(id) => ExtendedId::new(id).map(Into::into),
        CanId::Std(id) => StandardId::new(id).map(Into::into),
    };
    id.ok_or_else(|| TransportError::Io {
        message: "CAN ID out of range".into(),
    })
}

fn sdolink_message_to_socket_frame(msg: CanMessage) -> Result<CanFrame, TransportError> {
    let id = sdolink_id_to_socketcan_id(msg.id())?;

    let frame = if msg.is_rtr() {
        CanFrame::new_remote(id, 0)
    } else {
        CanFrame::new(id, msg.data())
    };
    frame.ok_or_else(|| TransportError::Io {
        message: "Invalid CAN frame".into(),
    })
}

fn map_io_error(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::NotConnected | io::ErrorKind::NetworkDown => TransportError::NotConnected,
        _ => TransportError::Io {
            message: e.to_string(),
        },
    }
}

/// How long a send waits for room in a full TX queue
const SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Retry `write` while the TX queue is full, for at most `timeout`
fn write_with_timeout<F>(mut write: F, timeout: Duration) -> Result<(), TransportError>
where
    F: FnMut() -> io::Result<()>,
{
    let start = Instant::now();
    loop {
        match write() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    return Err(TransportError::Io {
                        message: format!("TX queue still full after {timeout:?}"),
                    });
                }
                std::thread::yield_now();
            }
            Err(e) => return Err(map_io_error(e)),
        }
    }
}

/// A socketcan socket, usable as both [`CanSender`] and [`CanReceiver`]
///
/// The socket is non-blocking. Clones share the same socket, so a clone can be handed to the
/// client as sender while another is used as receiver. Frames sent on the socket are not looped
/// back to it.
#[derive(Debug, Clone)]
pub struct SocketCanPort {
    socket: Arc<CanSocket>,
}

impl CanSender for SocketCanPort {
    fn send(&mut self, msg: CanMessage) -> Result<(), TransportError> {
        let frame = sdolink_message_to_socket_frame(msg)?;
        write_with_timeout(|| self.socket.write_frame(&frame), SEND_TIMEOUT)
    }
}

impl CanReceiver for SocketCanPort {
    fn try_recv(&mut self) -> Result<Option<CanMessage>, TransportError> {
        loop {
            let frame = match self.socket.read_frame() {
                Ok(frame) => frame,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(map_io_error(e)),
            };
            let id = socketcan_id_to_sdolink_id(EmbeddedFrame::id(&frame));
            match frame {
                CanFrame::Data(frame) => return Ok(Some(CanMessage::new(id, frame.data()))),
                CanFrame::Remote(_) => return Ok(Some(CanMessage::new_rtr(id))),
                CanFrame::Error(frame) => {
                    log::warn!("Dropping CAN error frame 0x{:x}", frame.error_bits());
                }
            }
        }
    }
}

/// Open a socketcan device for use with the sdolink client
///
/// # Arguments
/// * `device` - The name of the socketcan device to open, e.g. "vcan0", or "can0"
/// * `filters` - Optional acceptance filters to install on the socket
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub fn open_socketcan<S: AsRef<str>>(
    device: S,
    filters: Option<&[CanFilter]>,
) -> Result<SocketCanPort, io::Error> {
    let device: &str = device.as_ref();
    let socket = CanSocket::open(device)?;
    if let Some(socket_filters) = filters {
        socket.set_filters(socket_filters)?;
    }
    socket.set_nonblocking(true)?;
    Ok(SocketCanPort {
        socket: Arc::new(socket),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_retries_while_queue_full() {
        let mut calls = 0;
        let result = write_with_timeout(
            || {
                calls += 1;
                if calls < 3 {
                    Err(io::ErrorKind::WouldBlock.into())
                } else {
                    Ok(())
                }
            },
            Duration::from_millis(100),
        );
        assert_eq!(Ok(()), result);
        assert_eq!(3, calls);
    }

    #[test]
    fn test_write_gives_up_when_queue_stays_full() {
        let result = write_with_timeout(
            || Err(io::ErrorKind::WouldBlock.into()),
            Duration::from_millis(5),
        );
        assert!(matches!(result, Err(TransportError::Io { .. })));
    }

    #[test]
    fn test_write_maps_errors() {
        let result = write_with_timeout(
            || Err(io::ErrorKind::NotConnected.into()),
            Duration::from_millis(5),
        );
        assert_eq!(Err(TransportError::NotConnected), result);
    }
}
