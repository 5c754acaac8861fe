//! State of a single SDO transfer, and the request/response plumbing shared by all transfer modes
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use sdolink_common::{
    frame::{decode, encode, CanOpenFrame, Direction},
    messages::sdo_response_id,
    sdo::{AbortCode, BlockSegment, RawAbortCode, SdoRequest, SdoResponse},
    CanMessage, CanReceiver, CanSender, NodeId, ParseError,
};
use snafu::ResultExt;

use super::TransferMode;
use crate::{
    config::SdoClientConfig,
    error::{
        CancelledSnafu, MalformedSnafu, ServerAbortSnafu, SizeMismatchSnafu, SdoClientError,
        TimeoutSnafu, ToggleMismatchSnafu, TransportSnafu, UnexpectedResponseSnafu,
    },
};

pub(super) type Result<T> = std::result::Result<T, SdoClientError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TransferDirection {
    Upload,
    Download,
}

/// A single upload or download
///
/// Owns all state of the transfer. Dropped when the transfer ends, releasing the buffer.
pub(super) struct TransferSession<'a, S, R> {
    sender: &'a mut S,
    receiver: &'a mut R,
    pub(super) config: &'a SdoClientConfig,
    cancel: &'a AtomicBool,
    pub(super) node_id: NodeId,
    pub(super) index: u16,
    pub(super) sub: u8,
    pub(super) direction: TransferDirection,
    pub(super) mode: TransferMode,
    /// Expected toggle bit of the next segment
    pub(super) toggle: bool,
    /// Last block sequence number sent or received in order
    pub(super) seqno: u8,
    pub(super) bytes_transferred: usize,
    /// Size declared in the initiate exchange, if any
    pub(super) expected_size: Option<usize>,
    pub(super) buffer: Vec<u8>,
    retries_remaining: u32,
    deadline: Instant,
}

impl<'a, S: CanSender, R: CanReceiver> TransferSession<'a, S, R> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        sender: &'a mut S,
        receiver: &'a mut R,
        config: &'a SdoClientConfig,
        cancel: &'a AtomicBool,
        node_id: NodeId,
        index: u16,
        sub: u8,
        direction: TransferDirection,
        mode: TransferMode,
    ) -> Self {
        Self {
            sender,
            receiver,
            config,
            cancel,
            node_id,
            index,
            sub,
            direction,
            mode,
            toggle: false,
            seqno: 0,
            bytes_transferred: 0,
            expected_size: None,
            buffer: Vec::new(),
            retries_remaining: config.retries,
            deadline: Instant::now() + config.timeout(),
        }
    }

    /// Drop any frames received before the transfer started
    pub(super) fn flush(&mut self) -> Result<()> {
        self.receiver.flush().context(TransportSnafu)
    }

    pub(super) fn send(&mut self, req: SdoRequest) -> Result<()> {
        self.send_message(encode(&CanOpenFrame::from_request(self.node_id, req)))
    }

    pub(super) fn send_segment(&mut self, segment: BlockSegment) -> Result<()> {
        self.send_message(encode(&CanOpenFrame::from_block_segment(
            Direction::ClientToServer,
            self.node_id,
            segment,
        )))
    }

    fn send_message(&mut self, msg: CanMessage) -> Result<()> {
        log::trace!("SDO tx: {msg}");
        self.sender.send(msg).context(TransportSnafu)?;
        self.restart_deadline();
        Ok(())
    }

    /// Give the server another full timeout to send its next frame
    pub(super) fn restart_deadline(&mut self) {
        self.deadline = Instant::now() + self.config.timeout();
    }

    /// Wait for the next frame sent by the server
    ///
    /// Frames on other IDs are dropped. Returns `None` once the deadline of the last sent request
    /// has passed.
    pub(super) fn poll_message(&mut self) -> Result<Option<CanMessage>> {
        let resp_id = sdo_response_id(self.node_id);
        loop {
            if self.cancel.load(Ordering::Acquire) {
                return self.cancel_transfer();
            }

            match self.receiver.try_recv().context(TransportSnafu)? {
                Some(msg) if msg.id() == resp_id => {
                    log::trace!("SDO rx: {msg}");
                    return Ok(Some(msg));
                }
                Some(msg) => {
                    log::trace!("Ignoring {msg}");
                }
                None => {
                    if Instant::now() >= self.deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(self.config.poll_interval());
                    continue;
                }
            }

            if Instant::now() >= self.deadline {
                return Ok(None);
            }
        }
    }

    /// Decode a server frame into a response. Server aborts become errors here.
    pub(super) fn parse_response(&mut self, msg: &CanMessage) -> Result<SdoResponse> {
        let resp = match decode(msg)
            .and_then(|frame| SdoResponse::try_from(frame.payload.as_slice()))
        {
            Ok(resp) => resp,
            Err(e) => return self.malformed(e),
        };

        if let SdoResponse::Abort {
            index,
            sub,
            abort_code,
        } = resp
        {
            let abort_code = RawAbortCode::from(abort_code);
            log::debug!(
                "Node {} aborted transfer of 0x{index:04X}sub{sub}: {abort_code}",
                self.node_id
            );
            return ServerAbortSnafu {
                index,
                sub,
                abort_code,
            }
            .fail();
        }
        Ok(resp)
    }

    /// Wait for the next response, or `None` if the deadline passes
    pub(super) fn wait_response(&mut self) -> Result<Option<SdoResponse>> {
        match self.poll_message()? {
            Some(msg) => self.parse_response(&msg).map(Some),
            None => Ok(None),
        }
    }

    /// Wait for a response to the last request, calling `resend` every time the deadline passes
    /// until the retries are used up
    pub(super) fn await_response<F>(&mut self, mut resend: F) -> Result<SdoResponse>
    where
        F: FnMut(&mut Self) -> Result<()>,
    {
        let mut attempts = 1;
        loop {
            if let Some(resp) = self.wait_response()? {
                return Ok(resp);
            }
            self.consume_retry(attempts)?;
            attempts += 1;
            resend(self)?;
        }
    }

    /// Send a request and wait for its response, retransmitting on timeout
    pub(super) fn round_trip(&mut self, req: SdoRequest) -> Result<SdoResponse> {
        self.send(req)?;
        self.await_response(|session| session.send(req))
    }

    /// Use up one retry, or fail with a timeout if none remain
    pub(super) fn consume_retry(&mut self, attempts: u32) -> Result<()> {
        if self.retries_remaining == 0 {
            log::warn!(
                "Timeout waiting for node {} on 0x{:04X}sub{} after {attempts} attempts",
                self.node_id,
                self.index,
                self.sub
            );
            self.buffer = Vec::new();
            return TimeoutSnafu { attempts }.fail();
        }
        self.retries_remaining -= 1;
        log::warn!(
            "No response from node {}, retrying ({} retries left)",
            self.node_id,
            self.retries_remaining
        );
        Ok(())
    }

    /// Send an abort to the server
    ///
    /// A failure to send is logged, as the transfer is already failing with another error.
    pub(super) fn abort(&mut self, abort_code: AbortCode) {
        log::warn!(
            "Aborting transfer of 0x{:04X}sub{} on node {}: {abort_code}",
            self.index,
            self.sub,
            self.node_id
        );
        self.buffer = Vec::new();
        if let Err(e) = self.send(SdoRequest::abort(self.index, self.sub, abort_code)) {
            log::warn!("Failed to send abort: {e}");
        }
    }

    fn cancel_transfer<T>(&mut self) -> Result<T> {
        log::debug!("Transfer cancelled");
        self.abort(AbortCode::GeneralError);
        CancelledSnafu.fail()
    }

    /// Abort the transfer because the server sent a response which does not fit the current state
    pub(super) fn unexpected<T>(&mut self, resp: SdoResponse) -> Result<T> {
        log::warn!("Unexpected SDO response from node {}: {resp:?}", self.node_id);
        self.abort(AbortCode::InvalidCommandSpecifier);
        UnexpectedResponseSnafu.fail()
    }

    /// Abort the transfer because the server sent a frame which could not be decoded
    pub(super) fn malformed<T>(&mut self, e: ParseError) -> Result<T> {
        log::warn!("Malformed SDO response from node {}: {e}", self.node_id);
        let abort_code = match e {
            ParseError::UnknownCommandSpecifier { .. } => AbortCode::InvalidCommandSpecifier,
            _ => AbortCode::GeneralError,
        };
        self.abort(abort_code);
        Err(e).context(MalformedSnafu)
    }

    /// Check the toggle bit of a segment response, and flip the expected toggle for the next one
    pub(super) fn check_toggle(&mut self, t: bool) -> Result<()> {
        if t != self.toggle {
            self.abort(AbortCode::ToggleNotAlternated);
            return ToggleMismatchSnafu.fail();
        }
        self.toggle = !self.toggle;
        Ok(())
    }

    /// Compare the transferred byte count to the size declared when the transfer started
    ///
    /// A declared size of 0 means the size was not specified.
    pub(super) fn check_size(&mut self) -> Result<()> {
        match self.expected_size {
            Some(expected) if expected != 0 && expected != self.bytes_transferred => {
                self.abort(AbortCode::DataTypeMismatch);
                SizeMismatchSnafu {
                    expected,
                    actual: self.bytes_transferred,
                }
                .fail()
            }
            _ => Ok(()),
        }
    }

    pub(super) fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use sdolink_common::{messages::sdo_request_id, CanId, TransportError};

    use super::*;

    #[derive(Default)]
    struct MockPort {
        sent: Vec<CanMessage>,
        fail_send: bool,
    }

    impl CanSender for MockPort {
        fn send(&mut self, msg: CanMessage) -> std::result::Result<(), TransportError> {
            if self.fail_send {
                return Err(TransportError::NotConnected);
            }
            self.sent.push(msg);
            Ok(())
        }
    }

    struct MockReceiver(VecDeque<CanMessage>);

    impl CanReceiver for MockReceiver {
        fn try_recv(&mut self) -> std::result::Result<Option<CanMessage>, TransportError> {
            Ok(self.0.pop_front())
        }
    }

    fn test_config() -> SdoClientConfig {
        SdoClientConfig {
            timeout_ms: 5,
            retries: 2,
            poll_interval_us: 50,
            ..Default::default()
        }
    }

    fn node() -> NodeId {
        NodeId::new(3).unwrap()
    }

    fn response(resp: SdoResponse) -> CanMessage {
        encode(&CanOpenFrame::from_response(node(), resp))
    }

    #[test]
    fn test_round_trip_ignores_other_ids() {
        let config = test_config();
        let cancel = AtomicBool::new(false);
        let mut port = MockPort::default();
        let mut rx = MockReceiver(VecDeque::from([
            CanMessage::new(CanId::std(0x584), &[0x60, 0, 0, 0, 0, 0, 0, 0]),
            CanMessage::new(CanId::std(0x701), &[0x05]),
            response(SdoResponse::download_acknowledge(0x2000, 0)),
        ]));
        let mut session = TransferSession::new(
            &mut port,
            &mut rx,
            &config,
            &cancel,
            node(),
            0x2000,
            0,
            TransferDirection::Download,
            TransferMode::Expedited,
        );

        let resp = session
            .round_trip(SdoRequest::expedited_download(0x2000, 0, &[1]))
            .unwrap();
        assert_eq!(SdoResponse::download_acknowledge(0x2000, 0), resp);
        assert_eq!(1, port.sent.len());
        assert_eq!(sdo_request_id(node()), port.sent[0].id());
    }

    #[test]
    fn test_malformed_response_is_terminal() {
        let config = test_config();
        let cancel = AtomicBool::new(false);
        let mut port = MockPort::default();
        let mut rx = MockReceiver(VecDeque::from([CanMessage::new(
            CanId::std(0x583),
            &[0x60, 0, 0],
        )]));
        let mut session = TransferSession::new(
            &mut port,
            &mut rx,
            &config,
            &cancel,
            node(),
            0x2000,
            0,
            TransferDirection::Upload,
            TransferMode::Expedited,
        );

        assert_eq!(
            Err(SdoClientError::Malformed {
                source: ParseError::MalformedLength { dlc: 3 }
            }),
            session.round_trip(SdoRequest::initiate_upload(0x2000, 0))
        );
        // The request, then an abort so the server does not wait for the transfer to go on
        assert_eq!(2, port.sent.len());
        assert_eq!(
            SdoRequest::abort(0x2000, 0, AbortCode::GeneralError).to_bytes(),
            port.sent[1].data
        );
    }

    #[test]
    fn test_retry_budget_is_shared() {
        let config = test_config();
        let cancel = AtomicBool::new(false);
        let mut port = MockPort::default();
        let mut rx = MockReceiver(VecDeque::new());
        let mut session = TransferSession::new(
            &mut port,
            &mut rx,
            &config,
            &cancel,
            node(),
            0x2000,
            0,
            TransferDirection::Upload,
            TransferMode::Segmented,
        );

        // Two retries are available for the whole session, and one was used by an earlier
        // round trip
        session.consume_retry(1).unwrap();
        assert_eq!(
            Err(SdoClientError::Timeout { attempts: 2 }),
            session.round_trip(SdoRequest::upload_segment_request(false))
        );
        // The first request, and one retry
        assert_eq!(2, port.sent.len());
    }

    #[test]
    fn test_transport_error_is_not_retried() {
        let config = test_config();
        let cancel = AtomicBool::new(false);
        let mut port = MockPort {
            fail_send: true,
            ..Default::default()
        };
        let mut rx = MockReceiver(VecDeque::new());
        let mut session = TransferSession::new(
            &mut port,
            &mut rx,
            &config,
            &cancel,
            node(),
            0x2000,
            0,
            TransferDirection::Upload,
            TransferMode::Expedited,
        );
        assert_eq!(
            Err(SdoClientError::Transport {
                source: TransportError::NotConnected
            }),
            session.round_trip(SdoRequest::initiate_upload(0x2000, 0))
        );
    }

    #[test]
    fn test_toggle_mismatch_sends_abort() {
        let config = test_config();
        let cancel = AtomicBool::new(false);
        let mut port = MockPort::default();
        let mut rx = MockReceiver(VecDeque::new());
        let mut session = TransferSession::new(
            &mut port,
            &mut rx,
            &config,
            &cancel,
            node(),
            0x2000,
            4,
            TransferDirection::Download,
            TransferMode::Segmented,
        );

        session.check_toggle(false).unwrap();
        session.check_toggle(true).unwrap();
        assert_eq!(Err(SdoClientError::ToggleMismatch), session.check_toggle(true));
        assert_eq!(
            SdoRequest::abort(0x2000, 4, AbortCode::ToggleNotAlternated).to_bytes(),
            port.sent[0].data
        );
    }

    #[test]
    fn test_declared_size_zero_is_not_checked() {
        let config = test_config();
        let cancel = AtomicBool::new(false);
        let mut port = MockPort::default();
        let mut rx = MockReceiver(VecDeque::new());
        let mut session = TransferSession::new(
            &mut port,
            &mut rx,
            &config,
            &cancel,
            node(),
            0x2000,
            0,
            TransferDirection::Upload,
            TransferMode::Segmented,
        );
        session.bytes_transferred = 10;
        session.expected_size = Some(0);
        assert_eq!(Ok(()), session.check_size());
        session.expected_size = Some(11);
        assert_eq!(
            Err(SdoClientError::SizeMismatch {
                expected: 11,
                actual: 10
            }),
            session.check_size()
        );
        assert_eq!(
            vec![SdoRequest::abort(0x2000, 0, AbortCode::DataTypeMismatch).to_bytes()],
            port.sent.iter().map(|msg| msg.data).collect::<Vec<_>>()
        );
    }
}
