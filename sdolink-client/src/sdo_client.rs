use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use sdolink_common::{CanReceiver, CanSender, NodeId};

use crate::{
    config::{ConfigError, SdoClientConfig},
    error::{InvalidDataLengthSnafu, InvalidNodeIdSnafu, SdoClientError},
};

mod block;
mod segmented;
mod session;

use session::{TransferDirection, TransferSession};

type Result<T> = std::result::Result<T, SdoClientError>;

/// The SDO protocol used for a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Up to 4 bytes carried in the initiate frames
    Expedited,
    /// 7 bytes per round trip, with alternating toggle bit
    Segmented,
    /// Blocks of up to 127 segments per acknowledgement, with optional CRC
    Block,
}

/// Handle for cancelling the transfer currently run by an [`SdoClient`]
///
/// Can be cloned and sent to other threads. When cancelled, the running transfer sends an abort
/// to the server and returns [`SdoClientError::Cancelled`]. The flag is cleared when the next
/// transfer starts.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Request cancellation of the running transfer
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// True if cancellation was requested and not yet cleared by a new transfer
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A client for reading and writing objects on CANopen nodes
///
/// Transfers run on the calling thread, one at a time. The client is not bound to one node: each
/// operation names the node it addresses.
///
/// `upload` and `download` pick the transfer mode automatically:
///
/// - Downloads of 1 to 4 bytes are expedited
/// - Larger downloads are segmented, or block transfers if
///   [`prefer_block`](SdoClientConfig::prefer_block) is set and the size reaches
///   [`block_threshold`](SdoClientConfig::block_threshold)
/// - Uploads let the server choose between expedited and segmented transfer, or request a block
///   upload if `prefer_block` is set
#[derive(Debug)]
pub struct SdoClient<S, R> {
    sender: S,
    receiver: R,
    config: SdoClientConfig,
    cancel: CancelHandle,
}

impl<S: CanSender, R: CanReceiver> SdoClient<S, R> {
    /// Create a new client with the default configuration
    pub fn new(sender: S, receiver: R) -> Self {
        Self {
            sender,
            receiver,
            config: SdoClientConfig::default(),
            cancel: CancelHandle::default(),
        }
    }

    /// Replace the client configuration
    ///
    /// Fails if the configuration does not pass [`SdoClientConfig::validate`].
    pub fn with_config(
        mut self,
        config: SdoClientConfig,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Get the client configuration
    pub fn config(&self) -> &SdoClientConfig {
        &self.config
    }

    /// Get a handle which can cancel transfers of this client from another thread
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn run<T, F>(
        &mut self,
        node_id: u8,
        index: u16,
        sub: u8,
        direction: TransferDirection,
        mode: TransferMode,
        transfer: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut TransferSession<'_, S, R>) -> Result<T>,
    {
        let node_id =
            NodeId::new(node_id).map_err(|e| InvalidNodeIdSnafu { node_id: e.0 }.build())?;
        self.cancel.0.store(false, Ordering::Release);

        let mut session = TransferSession::new(
            &mut self.sender,
            &mut self.receiver,
            &self.config,
            &self.cancel.0,
            node_id,
            index,
            sub,
            direction,
            mode,
        );
        log::debug!("Starting {direction:?} of 0x{index:04X}sub{sub} on node {node_id} ({mode:?})");
        session.flush()?;
        let result = transfer(&mut session);
        match &result {
            Ok(_) => log::debug!(
                "{:?} of 0x{index:04X}sub{sub} on node {node_id} complete, {} bytes ({:?})",
                session.direction,
                session.bytes_transferred,
                session.mode,
            ),
            Err(e) => log::debug!(
                "{:?} of 0x{index:04X}sub{sub} on node {node_id} failed: {e}",
                session.direction
            ),
        }
        result
    }

    /// The transfer mode [`upload`](Self::upload) requests
    ///
    /// For [`TransferMode::Segmented`] the server may still answer with an expedited transfer,
    /// and for [`TransferMode::Block`] it may switch to a normal upload for small objects.
    pub fn upload_mode(&self) -> TransferMode {
        if self.config.prefer_block {
            TransferMode::Block
        } else {
            TransferMode::Segmented
        }
    }

    /// The transfer mode [`download`](Self::download) uses for `len` bytes
    pub fn download_mode(&self, len: usize) -> TransferMode {
        if (1..=4).contains(&len) {
            TransferMode::Expedited
        } else if self.config.prefer_block && len >= self.config.block_threshold {
            TransferMode::Block
        } else {
            TransferMode::Segmented
        }
    }

    /// Read a sub object from a node
    pub fn upload(&mut self, node_id: u8, index: u16, sub: u8) -> Result<Vec<u8>> {
        match self.upload_mode() {
            TransferMode::Block => self.upload_block(node_id, index, sub),
            _ => self.upload_segmented(node_id, index, sub),
        }
    }

    /// Read a sub object with the initiate upload protocol
    ///
    /// The server decides whether the value is sent expedited or segmented.
    pub fn upload_segmented(&mut self, node_id: u8, index: u16, sub: u8) -> Result<Vec<u8>> {
        self.run(
            node_id,
            index,
            sub,
            TransferDirection::Upload,
            TransferMode::Segmented,
            |session| session.upload(),
        )
    }

    /// Read a sub object with a block upload
    ///
    /// If the object is no larger than the configured
    /// [`block_threshold`](SdoClientConfig::block_threshold), the server may answer with an
    /// expedited or segmented upload instead.
    pub fn upload_block(&mut self, node_id: u8, index: u16, sub: u8) -> Result<Vec<u8>> {
        self.run(
            node_id,
            index,
            sub,
            TransferDirection::Upload,
            TransferMode::Block,
            |session| session.upload_block(),
        )
    }

    /// Read a sub object of up to 4 bytes as a u32
    ///
    /// Values shorter than 4 bytes are zero extended.
    pub fn upload_u32(&mut self, node_id: u8, index: u16, sub: u8) -> Result<u32> {
        let data = self.upload_segmented(node_id, index, sub)?;
        if data.len() > 4 {
            return InvalidDataLengthSnafu { len: data.len() }.fail();
        }
        let mut bytes = [0; 4];
        bytes[0..data.len()].copy_from_slice(&data);
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a sub object on a node
    pub fn download(&mut self, node_id: u8, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        match self.download_mode(data.len()) {
            TransferMode::Expedited => self.download_expedited(node_id, index, sub, data),
            TransferMode::Segmented => self.download_segmented(node_id, index, sub, data),
            TransferMode::Block => self.download_block(node_id, index, sub, data),
        }
    }

    /// Write 1 to 4 bytes with an expedited download
    pub fn download_expedited(
        &mut self,
        node_id: u8,
        index: u16,
        sub: u8,
        data: &[u8],
    ) -> Result<()> {
        if !(1..=4).contains(&data.len()) {
            return InvalidDataLengthSnafu { len: data.len() }.fail();
        }
        self.run(
            node_id,
            index,
            sub,
            TransferDirection::Download,
            TransferMode::Expedited,
            |session| session.download_expedited(data),
        )
    }

    /// Write a sub object with a segmented download
    pub fn download_segmented(
        &mut self,
        node_id: u8,
        index: u16,
        sub: u8,
        data: &[u8],
    ) -> Result<()> {
        check_size(data)?;
        self.run(
            node_id,
            index,
            sub,
            TransferDirection::Download,
            TransferMode::Segmented,
            |session| session.download_segmented(data),
        )
    }

    /// Write a sub object with a block download
    pub fn download_block(&mut self, node_id: u8, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        check_size(data)?;
        self.run(
            node_id,
            index,
            sub,
            TransferDirection::Download,
            TransferMode::Block,
            |session| session.download_block(data),
        )
    }

    /// Write the lowest `size` bytes of `value` with an expedited download
    pub fn download_u32(
        &mut self,
        node_id: u8,
        index: u16,
        sub: u8,
        value: u32,
        size: usize,
    ) -> Result<()> {
        if !(1..=4).contains(&size) {
            return InvalidDataLengthSnafu { len: size }.fail();
        }
        self.download_expedited(node_id, index, sub, &value.to_le_bytes()[0..size])
    }
}

fn check_size(data: &[u8]) -> Result<()> {
    if u32::try_from(data.len()).is_err() {
        return InvalidDataLengthSnafu { len: data.len() }.fail();
    }
    Ok(())
}
