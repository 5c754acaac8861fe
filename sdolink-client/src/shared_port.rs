//! Utility for sharing a single CAN transport among several clients
//!
//! Every [`SharedPortChannel`] has its own queue. Whenever a channel finds its queue empty, it
//! drains the underlying receiver and copies each frame into the queues of all channels, so
//! every channel sees all traffic received after it was created.
use std::{
    fmt,
    sync::{
        mpsc::{sync_channel, Receiver, SyncSender, TrySendError},
        Arc, Mutex, MutexGuard,
    },
};

use sdolink_common::{CanMessage, CanReceiver, CanSender, TransportError};

/// Number of frames buffered per channel before new frames are dropped
const QUEUE_DEPTH: usize = 100;

struct Inner {
    sender: Box<dyn CanSender + Send>,
    receiver: Box<dyn CanReceiver + Send>,
    queues: Vec<SyncSender<CanMessage>>,
}

impl Inner {
    fn create_queue(&mut self) -> Receiver<CanMessage> {
        let (tx, rx) = sync_channel(QUEUE_DEPTH);
        self.queues.push(tx);
        rx
    }

    /// Move all pending frames from the receiver into the channel queues
    fn distribute(&mut self) -> Result<(), TransportError> {
        while let Some(msg) = self.receiver.try_recv()? {
            self.queues.retain(|queue| match queue.try_send(msg) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::warn!("Dropped received message due to overflow");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
        }
        Ok(())
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    // The inner state stays consistent even if a holder panicked
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// A CAN transport shared by multiple users
///
/// ```
/// use sdolink_client::{SdoClient, SharedPort};
/// # use sdolink_client::common::{CanMessage, CanReceiver, CanSender, TransportError};
/// # struct Loopback;
/// # impl CanSender for Loopback {
/// #     fn send(&mut self, _msg: CanMessage) -> Result<(), TransportError> { Ok(()) }
/// # }
/// # impl CanReceiver for Loopback {
/// #     fn try_recv(&mut self) -> Result<Option<CanMessage>, TransportError> { Ok(None) }
/// # }
/// let port = SharedPort::new(Loopback, Loopback);
/// let client_a = SdoClient::new(port.sender(), port.channel());
/// let client_b = SdoClient::new(port.sender(), port.channel());
/// ```
#[derive(Clone)]
pub struct SharedPort {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for SharedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPort")
            .field("num_channels", &self.num_channels())
            .finish()
    }
}

impl SharedPort {
    /// Create a shared port from a transport's sender and receiver halves
    pub fn new<S, R>(sender: S, receiver: R) -> Self
    where
        S: CanSender + Send + 'static,
        R: CanReceiver + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sender: Box::new(sender),
                receiver: Box::new(receiver),
                queues: Vec::new(),
            })),
        }
    }

    /// Create a new receive channel
    pub fn channel(&self) -> SharedPortChannel {
        let queue = lock(&self.inner).create_queue();
        SharedPortChannel {
            inner: self.inner.clone(),
            queue,
        }
    }

    /// Get a sender for the port
    pub fn sender(&self) -> SharedPortSender {
        SharedPortSender {
            inner: self.inner.clone(),
        }
    }

    /// Get the number of open channels
    ///
    /// Channels which have been dropped are only removed the next time a frame is distributed.
    pub fn num_channels(&self) -> usize {
        lock(&self.inner).queues.len()
    }
}

/// Sending half of a [`SharedPort`]
#[derive(Clone)]
pub struct SharedPortSender {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for SharedPortSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPortSender").finish_non_exhaustive()
    }
}

impl CanSender for SharedPortSender {
    fn send(&mut self, msg: CanMessage) -> Result<(), TransportError> {
        lock(&self.inner).sender.send(msg)
    }
}

/// A receive channel of a [`SharedPort`]
///
/// Cloning a channel creates a new, empty queue.
pub struct SharedPortChannel {
    inner: Arc<Mutex<Inner>>,
    queue: Receiver<CanMessage>,
}

impl fmt::Debug for SharedPortChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPortChannel").finish_non_exhaustive()
    }
}

impl Clone for SharedPortChannel {
    fn clone(&self) -> Self {
        let queue = lock(&self.inner).create_queue();
        Self {
            inner: self.inner.clone(),
            queue,
        }
    }
}

impl CanReceiver for SharedPortChannel {
    fn try_recv(&mut self) -> Result<Option<CanMessage>, TransportError> {
        if let Ok(msg) = self.queue.try_recv() {
            return Ok(Some(msg));
        }
        lock(&self.inner).distribute()?;
        Ok(self.queue.try_recv().ok())
    }
}

impl CanSender for SharedPortChannel {
    fn send(&mut self, msg: CanMessage) -> Result<(), TransportError> {
        lock(&self.inner).sender.send(msg)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{channel, Sender};

    use sdolink_common::CanId;

    use super::*;

    struct MockReceiver(Receiver<CanMessage>);

    impl CanReceiver for MockReceiver {
        fn try_recv(&mut self) -> Result<Option<CanMessage>, TransportError> {
            Ok(self.0.try_recv().ok())
        }
    }

    struct MockSender(Sender<CanMessage>);

    impl CanSender for MockSender {
        fn send(&mut self, msg: CanMessage) -> Result<(), TransportError> {
            self.0.send(msg).map_err(|_| TransportError::NotConnected)
        }
    }

    #[test]
    fn test_shared_port() {
        let (bus_tx, bus_rx) = channel();
        let (out_tx, out_rx) = channel();
        let port = SharedPort::new(MockSender(out_tx), MockReceiver(bus_rx));

        let mut channel_a = port.channel();
        let mut channel_b = port.channel();

        let msg100 = CanMessage::new(CanId::std(100), &[0, 1, 2, 3]);
        bus_tx.send(msg100).unwrap();

        assert_eq!(Some(msg100), channel_a.try_recv().unwrap());
        assert_eq!(Some(msg100), channel_b.try_recv().unwrap());
        assert_eq!(None, channel_a.try_recv().unwrap());
        assert_eq!(None, channel_b.try_recv().unwrap());

        // A dropped channel is removed when the next message is distributed
        drop(channel_a);
        bus_tx.send(msg100).unwrap();
        assert_eq!(Some(msg100), channel_b.try_recv().unwrap());
        assert_eq!(1, port.num_channels());

        // A clone gets its own queue
        let mut channel_c = channel_b.clone();
        bus_tx.send(msg100).unwrap();
        channel_b.flush().unwrap();
        assert_eq!(Some(msg100), channel_c.try_recv().unwrap());

        let mut sender = port.sender();
        sender.send(msg100).unwrap();
        channel_c.send(msg100).unwrap();
        assert_eq!(2, out_rx.try_iter().count());
    }

    #[test]
    fn test_queue_overflow_drops_messages() {
        let (bus_tx, bus_rx) = channel();
        let (out_tx, _out_rx) = channel();
        let port = SharedPort::new(MockSender(out_tx), MockReceiver(bus_rx));
        let mut idle = port.channel();
        let mut busy = port.channel();

        for i in 0..QUEUE_DEPTH + 10 {
            bus_tx
                .send(CanMessage::new(CanId::std(i as u16), &[]))
                .unwrap();
            busy.try_recv().unwrap();
        }

        let mut count = 0;
        while idle.try_recv().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(QUEUE_DEPTH, count);
    }
}
