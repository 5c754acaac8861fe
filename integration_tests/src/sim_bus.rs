//! A simulated CAN bus
//!
//! Frames sent by a [`SimBusPort`] are delivered to every other port, and to every responder.
//! Frames produced by responders are delivered to all ports during the same `send` call, so a
//! simulated node answers before the sender polls for the response.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use sdolink_common::{CanMessage, CanReceiver, CanSender, TransportError};

/// A simulated device attached to the bus
pub type Responder = Box<dyn FnMut(&CanMessage) -> Vec<CanMessage> + Send>;

#[derive(Default)]
struct SimBusInner {
    queues: Vec<VecDeque<CanMessage>>,
    responders: Vec<Responder>,
    log: Vec<CanMessage>,
    connected: bool,
}

impl SimBusInner {
    fn deliver(&mut self, from: Option<usize>, msg: CanMessage) {
        self.log.push(msg);
        for (i, queue) in self.queues.iter_mut().enumerate() {
            if Some(i) != from {
                queue.push_back(msg);
            }
        }
    }
}

/// The shared state of a simulated bus
#[derive(Clone)]
pub struct SimBus {
    inner: Arc<Mutex<SimBusInner>>,
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimBusInner {
                connected: true,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimBusInner> {
        self.inner.lock().unwrap()
    }

    /// Attach a new port to the bus
    ///
    /// The port receives every frame put on the bus by others after its creation.
    pub fn new_port(&self) -> SimBusPort {
        let mut inner = self.lock();
        inner.queues.push(VecDeque::new());
        SimBusPort {
            bus: self.clone(),
            queue: inner.queues.len() - 1,
        }
    }

    /// Attach a simulated device, which is called with every frame sent by a port
    pub fn add_responder(&self, responder: Responder) {
        self.lock().responders.push(responder);
    }

    /// Put a frame on the bus as if sent by a device which is not simulated
    pub fn inject(&self, msg: CanMessage) {
        self.lock().deliver(None, msg);
    }

    /// All frames which have been on the bus, in order
    pub fn frames(&self) -> Vec<CanMessage> {
        self.lock().log.clone()
    }

    /// Disconnect all ports. Sending or receiving fails afterwards.
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    /// Print the bus history, for debugging failed tests
    pub fn print(&self) {
        println!("Bus message history");
        println!("-------------------");
        for msg in self.frames() {
            match sdolink_common::decode(&msg) {
                Ok(frame) => println!("{frame}"),
                Err(_) => println!("{msg}"),
            }
        }
    }
}

/// A connection to a [`SimBus`]
///
/// Clones share the same receive queue.
#[derive(Clone)]
pub struct SimBusPort {
    bus: SimBus,
    queue: usize,
}

impl CanSender for SimBusPort {
    fn send(&mut self, msg: CanMessage) -> Result<(), TransportError> {
        let mut inner = self.bus.lock();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        inner.deliver(Some(self.queue), msg);

        let mut responses = Vec::new();
        for responder in inner.responders.iter_mut() {
            responses.extend(responder(&msg));
        }
        for response in responses {
            inner.deliver(None, response);
        }
        Ok(())
    }
}

impl CanReceiver for SimBusPort {
    fn try_recv(&mut self) -> Result<Option<CanMessage>, TransportError> {
        let mut inner = self.bus.lock();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        Ok(inner.queues[self.queue].pop_front())
    }
}
