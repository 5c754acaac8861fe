#![allow(dead_code)]
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use integration_tests::{
    sdo_server::SimSdoServer,
    sim_bus::{SimBus, SimBusPort},
};
use sdolink_client::{
    common::{messages::sdo_request_id, CanMessage, CanReceiver, NodeId, TransportError},
    SdoClient, SdoClientConfig,
};

pub type SimClient = SdoClient<SimBusPort, SimBusPort>;

/// Short timeouts, so that tests which exhaust the retries finish quickly
pub fn fast_config() -> SdoClientConfig {
    SdoClientConfig {
        timeout_ms: 20,
        retries: 2,
        poll_interval_us: 100,
        ..Default::default()
    }
}

/// Create a bus with a single server attached, and a client using `config`
pub fn setup(
    server: SimSdoServer,
    config: SdoClientConfig,
) -> (SimClient, SimBus, Arc<Mutex<SimSdoServer>>) {
    let bus = SimBus::new();
    let server = server.attach(&bus);
    let port = bus.new_port();
    let client = SdoClient::new(port.clone(), port).with_config(config).unwrap();
    (client, bus, server)
}

/// All frames sent by the client to `node_id`
pub fn requests(bus: &SimBus, node_id: u8) -> Vec<CanMessage> {
    let id = sdo_request_id(NodeId::new(node_id).unwrap());
    bus.frames().into_iter().filter(|msg| msg.id() == id).collect()
}

/// The bytes of an abort frame for `index`/`sub` with `abort_code`
pub fn abort_bytes(index: u16, sub: u8, abort_code: u32) -> [u8; 8] {
    let mut bytes = [0x80, 0, 0, sub, 0, 0, 0, 0];
    bytes[1..3].copy_from_slice(&index.to_le_bytes());
    bytes[4..8].copy_from_slice(&abort_code.to_le_bytes());
    bytes
}

/// Data with a recognizable, non-repeating pattern
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 256) as u8).collect()
}

/// A receiver which hands out frames no faster than one per `interval`, like a slow server
pub struct PacedReceiver<R> {
    inner: R,
    pending: VecDeque<CanMessage>,
    interval: Duration,
    next_release: Instant,
}

impl<R: CanReceiver> PacedReceiver<R> {
    pub fn new(inner: R, interval: Duration) -> Self {
        Self {
            inner,
            pending: VecDeque::new(),
            interval,
            next_release: Instant::now(),
        }
    }
}

impl<R: CanReceiver> CanReceiver for PacedReceiver<R> {
    fn try_recv(&mut self) -> Result<Option<CanMessage>, TransportError> {
        while let Some(msg) = self.inner.try_recv()? {
            self.pending.push_back(msg);
        }
        let now = Instant::now();
        if self.pending.is_empty() || now < self.next_release {
            return Ok(None);
        }
        self.next_release = now + self.interval;
        Ok(self.pending.pop_front())
    }
}
