//! A scripted SDO server for end-to-end tests
//!
//! Serves a flat map of sub objects over expedited, segmented and block transfers, with knobs
//! for injecting the faults a client has to cope with.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crc16::{State, XMODEM};
use sdolink_common::{
    decode, decode_block_segment, encode,
    messages::sdo_request_id,
    sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse, BLOCK_SEGMENT_SIZE, MAX_BLOCK_SIZE},
    CanMessage, CanOpenFrame, Direction, NodeId,
};

use crate::sim_bus::SimBus;

const SEGMENT_SIZE: usize = 7;

/// Faults injected into the server's behavior
#[derive(Debug, Default, Clone)]
pub struct Faults {
    /// Never respond
    pub ignore_requests: bool,
    /// Number of frames to ignore before responding normally
    pub drop_requests: usize,
    /// Answer every initiate request with this abort
    pub abort_with: Option<AbortCode>,
    /// Acknowledge the download segment with this index (counted from 0) with the wrong toggle
    pub flip_download_toggle: Option<usize>,
    /// Send the upload segment with this index (counted from 0) with the wrong toggle
    pub flip_upload_toggle: Option<usize>,
    /// Acknowledge expedited downloads with index and sub set to 0
    pub zero_download_ack: bool,
    /// Declare this size instead of the real one on uploads
    pub declared_size: Option<u32>,
    /// Lose the first block download segment with this sequence number
    pub drop_download_segment: Option<u8>,
    /// Skip the block upload segment with this index (counted from 0) the first time it is sent
    pub drop_upload_segment: Option<usize>,
    /// Invert the data byte at this offset when sending it in a block upload
    pub corrupt_upload_byte: Option<usize>,
    /// Send a wrong CRC at the end of block uploads
    pub corrupt_crc: bool,
    /// Answer block upload requests with a normal upload when the object is no larger than the
    /// protocol switch threshold
    pub switch_protocol: bool,
}

#[derive(Debug)]
struct DownloadBlock {
    index: u16,
    sub: u8,
    size: Option<usize>,
    use_crc: bool,
    /// Last sequence number received in order in the current block
    seqno: u8,
    buf: Vec<u8>,
}

#[derive(Debug)]
struct UploadBlock {
    index: u16,
    sub: u8,
    use_crc: bool,
    blksize: u8,
    /// Index of the segment sent with sequence number 1 in the current block
    block_start: usize,
    data: Vec<u8>,
}

impl UploadBlock {
    fn total_segments(&self) -> usize {
        self.data.len().div_ceil(BLOCK_SEGMENT_SIZE).max(1)
    }

    fn block_len(&self) -> u8 {
        (self.blksize as usize).min(self.total_segments() - self.block_start) as u8
    }
}

#[derive(Debug, Default)]
enum SdoState {
    #[default]
    Idle,
    DownloadSegmented {
        index: u16,
        sub: u8,
        toggle: bool,
        segment: usize,
        size: Option<usize>,
        buf: Vec<u8>,
    },
    UploadSegmented {
        index: u16,
        sub: u8,
        toggle: bool,
        segment: usize,
        pos: usize,
        data: Vec<u8>,
    },
    DownloadBlock(DownloadBlock),
    EndDownloadBlock(DownloadBlock),
    UploadBlockInitiated(UploadBlock),
    UploadBlock(UploadBlock),
    EndUploadBlock,
}

fn crc(data: &[u8]) -> u16 {
    State::<XMODEM>::calculate(data)
}

/// A simulated SDO server
#[derive(Debug)]
pub struct SimSdoServer {
    node_id: NodeId,
    objects: HashMap<(u16, u8), Vec<u8>>,
    state: SdoState,
    /// Block size offered to the client for block downloads
    pub blksize: u8,
    /// Whether the server supports CRC on block transfers
    pub crc_supported: bool,
    pub faults: Faults,
    last_abort: Option<(u16, u8, u32)>,
    frames_received: usize,
}

impl SimSdoServer {
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id: NodeId::new(node_id).unwrap(),
            objects: HashMap::new(),
            state: SdoState::Idle,
            blksize: MAX_BLOCK_SIZE,
            crc_supported: true,
            faults: Faults::default(),
            last_abort: None,
            frames_received: 0,
        }
    }

    pub fn with_object(mut self, index: u16, sub: u8, data: &[u8]) -> Self {
        self.objects.insert((index, sub), data.to_vec());
        self
    }

    pub fn object(&self, index: u16, sub: u8) -> Option<&[u8]> {
        self.objects.get(&(index, sub)).map(|v| v.as_slice())
    }

    /// The last abort received from the client, as (index, sub, abort code)
    pub fn last_abort(&self) -> Option<(u16, u8, u32)> {
        self.last_abort
    }

    /// Number of frames received on the server's request COB-ID, including ignored ones
    pub fn frames_received(&self) -> usize {
        self.frames_received
    }

    /// True if no transfer is in progress
    pub fn is_idle(&self) -> bool {
        matches!(self.state, SdoState::Idle)
    }

    /// Attach the server to a bus. The returned handle gives tests access to the server state.
    pub fn attach(self, bus: &SimBus) -> Arc<Mutex<SimSdoServer>> {
        let server = Arc::new(Mutex::new(self));
        let server_clone = server.clone();
        bus.add_responder(Box::new(move |msg| server_clone.lock().unwrap().handle(msg)));
        server
    }

    /// Handle a frame from the bus, returning the frames sent in response
    pub fn handle(&mut self, msg: &CanMessage) -> Vec<CanMessage> {
        if msg.id() != sdo_request_id(self.node_id) {
            return Vec::new();
        }
        self.frames_received += 1;
        if self.faults.ignore_requests {
            return Vec::new();
        }
        if self.faults.drop_requests > 0 {
            self.faults.drop_requests -= 1;
            return Vec::new();
        }

        // During a block download, anything but an abort is a data segment
        if matches!(self.state, SdoState::DownloadBlock(_)) && msg.data[0] != 0x80 {
            return match decode_block_segment(msg)
                .and_then(|frame| BlockSegment::try_from(frame.payload.as_slice()))
            {
                Ok(segment) => self.block_segment(segment),
                Err(e) => {
                    log::warn!("Bad block segment: {e}");
                    Vec::new()
                }
            };
        }

        match decode(msg).and_then(|frame| SdoRequest::try_from(frame.payload.as_slice())) {
            Ok(req) => self.request(req),
            Err(e) => {
                log::warn!("Bad SDO request: {e}");
                Vec::new()
            }
        }
    }

    fn respond(&self, resp: SdoResponse) -> Vec<CanMessage> {
        vec![encode(&CanOpenFrame::from_response(self.node_id, resp))]
    }

    fn abort(&mut self, index: u16, sub: u8, abort_code: AbortCode) -> Vec<CanMessage> {
        self.state = SdoState::Idle;
        self.respond(SdoResponse::abort(index, sub, abort_code))
    }

    fn request(&mut self, req: SdoRequest) -> Vec<CanMessage> {
        if let SdoRequest::Abort {
            index,
            sub,
            abort_code,
        } = req
        {
            self.last_abort = Some((index, sub, abort_code));
            self.state = SdoState::Idle;
            return Vec::new();
        }

        if let Some(abort_code) = self.faults.abort_with {
            match req {
                SdoRequest::InitiateDownload { index, sub, .. }
                | SdoRequest::InitiateUpload { index, sub }
                | SdoRequest::InitiateBlockDownload { index, sub, .. }
                | SdoRequest::InitiateBlockUpload { index, sub, .. } => {
                    return self.abort(index, sub, abort_code)
                }
                _ => (),
            }
        }

        match (std::mem::take(&mut self.state), req) {
            (
                _,
                SdoRequest::InitiateDownload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                },
            ) => self.initiate_download(n, e, s, index, sub, data),
            (_, SdoRequest::InitiateUpload { index, sub }) => {
                match self.objects.get(&(index, sub)).cloned() {
                    Some(data) => self.start_upload(index, sub, data),
                    None => self.abort(index, sub, AbortCode::NoSuchObject),
                }
            }
            (
                _,
                SdoRequest::InitiateBlockDownload {
                    cc,
                    s,
                    index,
                    sub,
                    size,
                },
            ) => {
                self.state = SdoState::DownloadBlock(DownloadBlock {
                    index,
                    sub,
                    size: s.then_some(size as usize),
                    use_crc: cc && self.crc_supported,
                    seqno: 0,
                    buf: Vec::new(),
                });
                self.respond(SdoResponse::block_download_acknowledge(
                    self.crc_supported,
                    index,
                    sub,
                    self.blksize,
                ))
            }
            (
                _,
                SdoRequest::InitiateBlockUpload {
                    cc,
                    index,
                    sub,
                    blksize,
                    pst,
                },
            ) => self.initiate_block_upload(cc, index, sub, blksize, pst),
            (
                SdoState::DownloadSegmented {
                    index,
                    sub,
                    toggle,
                    segment,
                    size,
                    mut buf,
                },
                SdoRequest::DownloadSegment { t, n, c, data },
            ) => {
                if t != toggle {
                    return self.abort(index, sub, AbortCode::ToggleNotAlternated);
                }
                buf.extend_from_slice(&data[0..SEGMENT_SIZE - n as usize]);
                let ack_toggle = if self.faults.flip_download_toggle == Some(segment) {
                    !t
                } else {
                    t
                };
                if c {
                    if size.is_some_and(|size| size != buf.len()) {
                        return self.abort(index, sub, AbortCode::DataTypeMismatch);
                    }
                    self.objects.insert((index, sub), buf);
                } else {
                    self.state = SdoState::DownloadSegmented {
                        index,
                        sub,
                        toggle: !toggle,
                        segment: segment + 1,
                        size,
                        buf,
                    };
                }
                self.respond(SdoResponse::download_segment_acknowledge(ack_toggle))
            }
            (
                SdoState::UploadSegmented {
                    index,
                    sub,
                    toggle,
                    segment,
                    pos,
                    data,
                },
                SdoRequest::ReqUploadSegment { t },
            ) => {
                if t != toggle {
                    return self.abort(index, sub, AbortCode::ToggleNotAlternated);
                }
                let end = (pos + SEGMENT_SIZE).min(data.len());
                let c = end == data.len();
                let segment_toggle = if self.faults.flip_upload_toggle == Some(segment) {
                    !t
                } else {
                    t
                };
                let resp = SdoResponse::upload_segment(segment_toggle, c, &data[pos..end]);
                if !c {
                    self.state = SdoState::UploadSegmented {
                        index,
                        sub,
                        toggle: !toggle,
                        segment: segment + 1,
                        pos: end,
                        data,
                    };
                }
                self.respond(resp)
            }
            (SdoState::EndDownloadBlock(state), SdoRequest::EndBlockDownload { n, crc }) => {
                self.end_block_download(state, n, crc)
            }
            (
                SdoState::UploadBlockInitiated(state) | SdoState::UploadBlock(state),
                SdoRequest::StartBlockUpload,
            ) => self.send_upload_block(state, 1),
            (SdoState::UploadBlock(state), SdoRequest::ConfirmBlock { ackseq, blksize }) => {
                self.confirm_upload_block(state, ackseq, blksize)
            }
            (SdoState::EndUploadBlock, SdoRequest::ConfirmBlockUploadEnd) => Vec::new(),
            (state, req) => {
                log::warn!("Unexpected request {req:?} in state {state:?}");
                self.abort(0, 0, AbortCode::InvalidCommandSpecifier)
            }
        }
    }

    fn initiate_download(
        &mut self,
        n: u8,
        e: bool,
        s: bool,
        index: u16,
        sub: u8,
        data: [u8; 4],
    ) -> Vec<CanMessage> {
        if e {
            let len = if s { 4 - n as usize } else { 4 };
            self.objects.insert((index, sub), data[0..len].to_vec());
            if self.faults.zero_download_ack {
                return self.respond(SdoResponse::download_acknowledge(0, 0));
            }
        } else {
            self.state = SdoState::DownloadSegmented {
                index,
                sub,
                toggle: false,
                segment: 0,
                size: s.then(|| u32::from_le_bytes(data) as usize),
                buf: Vec::new(),
            };
        }
        self.respond(SdoResponse::download_acknowledge(index, sub))
    }

    fn start_upload(&mut self, index: u16, sub: u8, data: Vec<u8>) -> Vec<CanMessage> {
        if (1..=4).contains(&data.len()) && self.faults.declared_size.is_none() {
            return self.respond(SdoResponse::expedited_upload(index, sub, &data));
        }
        let size = self.faults.declared_size.unwrap_or(data.len() as u32);
        self.state = SdoState::UploadSegmented {
            index,
            sub,
            toggle: false,
            segment: 0,
            pos: 0,
            data,
        };
        self.respond(SdoResponse::upload_acknowledge(index, sub, Some(size)))
    }

    fn block_segment(&mut self, segment: BlockSegment) -> Vec<CanMessage> {
        let SdoState::DownloadBlock(mut state) = std::mem::take(&mut self.state) else {
            return Vec::new();
        };
        if self.faults.drop_download_segment == Some(segment.seqnum) {
            self.faults.drop_download_segment = None;
            self.state = SdoState::DownloadBlock(state);
            return Vec::new();
        }

        let mut complete = false;
        if segment.seqnum == state.seqno + 1 {
            state.seqno = segment.seqnum;
            state.buf.extend_from_slice(&segment.data);
            complete = segment.c;
        }

        if segment.seqnum != self.blksize && !segment.c {
            self.state = SdoState::DownloadBlock(state);
            return Vec::new();
        }

        let resp = SdoResponse::ConfirmBlock {
            ackseq: state.seqno,
            blksize: self.blksize,
        };
        if complete {
            self.state = SdoState::EndDownloadBlock(state);
        } else {
            if state.seqno == self.blksize {
                state.seqno = 0;
            }
            self.state = SdoState::DownloadBlock(state);
        }
        self.respond(resp)
    }

    fn end_block_download(
        &mut self,
        mut state: DownloadBlock,
        n: u8,
        crc_in: u16,
    ) -> Vec<CanMessage> {
        let len = state.buf.len().saturating_sub(n as usize);
        state.buf.truncate(len);
        if state.use_crc && crc(&state.buf) != crc_in {
            return self.abort(state.index, state.sub, AbortCode::CrcError);
        }
        if state.size.is_some_and(|size| size != len) {
            return self.abort(state.index, state.sub, AbortCode::DataTypeMismatch);
        }
        self.objects.insert((state.index, state.sub), state.buf);
        self.respond(SdoResponse::ConfirmBlockDownloadEnd)
    }

    fn initiate_block_upload(
        &mut self,
        cc: bool,
        index: u16,
        sub: u8,
        blksize: u8,
        pst: u8,
    ) -> Vec<CanMessage> {
        let Some(data) = self.objects.get(&(index, sub)).cloned() else {
            return self.abort(index, sub, AbortCode::NoSuchObject);
        };
        if self.faults.switch_protocol && data.len() <= pst as usize {
            return self.start_upload(index, sub, data);
        }
        if blksize == 0 || blksize > MAX_BLOCK_SIZE {
            return self.abort(index, sub, AbortCode::InvalidBlockSize);
        }
        let size = self.faults.declared_size.unwrap_or(data.len() as u32);
        self.state = SdoState::UploadBlockInitiated(UploadBlock {
            index,
            sub,
            use_crc: cc && self.crc_supported,
            blksize,
            block_start: 0,
            data,
        });
        self.respond(SdoResponse::block_upload_acknowledge(
            self.crc_supported,
            index,
            sub,
            Some(size),
        ))
    }

    /// Send the current block, from sequence number `first` to its end
    fn send_upload_block(&mut self, state: UploadBlock, first: u8) -> Vec<CanMessage> {
        let total_segments = state.total_segments();
        let mut frames = Vec::new();
        for seqnum in first..=state.block_len() {
            let segment = state.block_start + seqnum as usize - 1;
            if self.faults.drop_upload_segment == Some(segment) {
                self.faults.drop_upload_segment = None;
                continue;
            }
            let start = segment * BLOCK_SEGMENT_SIZE;
            let end = (start + BLOCK_SEGMENT_SIZE).min(state.data.len());
            let mut data = [0; BLOCK_SEGMENT_SIZE];
            data[0..end - start].copy_from_slice(&state.data[start..end]);
            if let Some(offset) = self.faults.corrupt_upload_byte {
                if (start..end).contains(&offset) {
                    data[offset - start] ^= 0xFF;
                }
            }
            let segment = BlockSegment {
                c: segment + 1 == total_segments,
                seqnum,
                data,
            };
            frames.push(encode(&CanOpenFrame::from_block_segment(
                Direction::ServerToClient,
                self.node_id,
                segment,
            )));
        }
        self.state = SdoState::UploadBlock(state);
        frames
    }

    fn confirm_upload_block(
        &mut self,
        mut state: UploadBlock,
        ackseq: u8,
        blksize: u8,
    ) -> Vec<CanMessage> {
        let block_len = state.block_len();
        if ackseq > block_len {
            return self.abort(state.index, state.sub, AbortCode::InvalidSequenceNumber);
        }
        if ackseq < block_len {
            return self.send_upload_block(state, ackseq + 1);
        }
        if blksize == 0 || blksize > MAX_BLOCK_SIZE {
            return self.abort(state.index, state.sub, AbortCode::InvalidBlockSize);
        }

        state.block_start += block_len as usize;
        state.blksize = blksize;
        let total_segments = state.total_segments();
        if state.block_start < total_segments {
            return self.send_upload_block(state, 1);
        }

        let n = (total_segments * BLOCK_SEGMENT_SIZE - state.data.len()) as u8;
        let mut data_crc = if state.use_crc { crc(&state.data) } else { 0 };
        if self.faults.corrupt_crc {
            data_crc ^= 0xFFFF;
        }
        self.state = SdoState::EndUploadBlock;
        self.respond(SdoResponse::EndBlockUpload { n, crc: data_crc })
    }
}
