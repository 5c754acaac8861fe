//! Block download and block upload
//!
//! Data is sent in blocks of up to 127 segments, numbered from 1. The receiver acknowledges each
//! block with the sequence number of the last segment it received in order. When that is less
//! than the number of segments sent, the sender retransmits from the following sequence number.
use crc16::{State, XMODEM};
use sdolink_common::{
    frame::decode_block_segment,
    sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse, BLOCK_SEGMENT_SIZE, MAX_BLOCK_SIZE},
    CanReceiver, CanSender,
};
use super::session::{Result, TransferSession};
use crate::error::{CrcMismatchSnafu, InvalidBlockSizeSnafu, SequenceSnafu};

/// First byte of an abort frame. Never a valid block segment, since sequence number 0 is not used.
const ABORT_COMMAND: u8 = 0x80;

fn crc(data: &[u8]) -> u16 {
    State::<XMODEM>::calculate(data)
}

fn make_segment(data: &[u8], segment: usize, seqnum: u8, total_segments: usize) -> BlockSegment {
    let start = segment * BLOCK_SEGMENT_SIZE;
    let end = (start + BLOCK_SEGMENT_SIZE).min(data.len());
    let mut buf = [0; BLOCK_SEGMENT_SIZE];
    buf[0..end - start].copy_from_slice(&data[start..end]);
    BlockSegment {
        c: segment + 1 == total_segments,
        seqnum,
        data: buf,
    }
}

impl<S: CanSender, R: CanReceiver> TransferSession<'_, S, R> {
    fn check_block_size(&mut self, blksize: u8) -> Result<u8> {
        if blksize == 0 || blksize > MAX_BLOCK_SIZE {
            self.abort(AbortCode::InvalidBlockSize);
            return InvalidBlockSizeSnafu { blksize }.fail();
        }
        Ok(blksize)
    }

    /// Send segments `first..=last` of the block starting at segment index `block_start`
    fn send_block_segments(
        &mut self,
        data: &[u8],
        block_start: usize,
        first: u8,
        last: u8,
        total_segments: usize,
    ) -> Result<()> {
        for seqnum in first..=last {
            let segment = block_start + seqnum as usize - 1;
            self.send_segment(make_segment(data, segment, seqnum, total_segments))?;
            self.seqno = seqnum;
        }
        Ok(())
    }

    pub(super) fn download_block(&mut self, data: &[u8]) -> Result<()> {
        self.expected_size = Some(data.len());
        let req = SdoRequest::initiate_block_download(
            self.index,
            self.sub,
            self.config.use_crc,
            data.len() as u32,
        );
        let resp = self.round_trip(req)?;
        let (server_crc, blksize) = match resp {
            SdoResponse::ConfirmBlockDownload { sc, blksize, .. } => (sc, blksize),
            _ => return self.unexpected(resp),
        };
        let mut blksize = self.check_block_size(blksize)?;
        let use_crc = server_crc && self.config.use_crc;

        let total_segments = data.len().div_ceil(BLOCK_SEGMENT_SIZE).max(1);
        // Index of the segment sent with sequence number 1 in the current block
        let mut block_start = 0;
        while block_start < total_segments {
            let block_len = (blksize as usize).min(total_segments - block_start) as u8;
            log::debug!(
                "Sending block of {block_len} segments from segment {block_start} to node {}",
                self.node_id
            );
            let mut first = 1;
            loop {
                self.send_block_segments(data, block_start, first, block_len, total_segments)?;
                // If the acknowledgement is lost, the last segment is resent to prompt another
                let last_index = block_start + block_len as usize - 1;
                let last = make_segment(data, last_index, block_len, total_segments);
                let resp = self.await_response(|session| session.send_segment(last))?;
                let (ackseq, next_blksize) = match resp {
                    SdoResponse::ConfirmBlock { ackseq, blksize } => (ackseq, blksize),
                    _ => return self.unexpected(resp),
                };
                if ackseq > block_len {
                    self.abort(AbortCode::InvalidSequenceNumber);
                    return SequenceSnafu { seqno: ackseq }.fail();
                }
                if ackseq == block_len {
                    blksize = self.check_block_size(next_blksize)?;
                    break;
                }
                log::debug!(
                    "Node {} acknowledged {ackseq} of {block_len} segments, retransmitting",
                    self.node_id
                );
                first = ackseq + 1;
            }
            block_start += block_len as usize;
            self.bytes_transferred = (block_start * BLOCK_SEGMENT_SIZE).min(data.len());
        }

        let n = (total_segments * BLOCK_SEGMENT_SIZE - data.len()) as u8;
        let data_crc = if use_crc { crc(data) } else { 0 };
        let resp = self.round_trip(SdoRequest::end_block_download(n, data_crc))?;
        match resp {
            SdoResponse::ConfirmBlockDownloadEnd => self.check_size(),
            _ => self.unexpected(resp),
        }
    }

    pub(super) fn upload_block(&mut self) -> Result<Vec<u8>> {
        let blksize = self.config.block_size;
        let pst = self.config.block_threshold.min(u8::MAX as usize) as u8;
        let req = SdoRequest::initiate_block_upload(
            self.index,
            self.sub,
            self.config.use_crc,
            blksize,
            pst,
        );
        let resp = self.round_trip(req)?;
        let server_crc = match resp {
            SdoResponse::ConfirmBlockUpload { sc, s, size, .. } => {
                if s {
                    self.expected_size = Some(size as usize);
                }
                sc
            }
            SdoResponse::ConfirmUpload { .. } => {
                log::debug!("Node {} switched to normal upload", self.node_id);
                return self.continue_upload(resp);
            }
            _ => return self.unexpected(resp),
        };
        let use_crc = server_crc && self.config.use_crc;

        self.receive_blocks(blksize)?;

        let last_ack = SdoRequest::ConfirmBlock {
            ackseq: self.seqno,
            blksize,
        };
        self.send(last_ack)?;
        let resp = self.await_response(|session| session.send(last_ack))?;
        let (n, server_crc) = match resp {
            SdoResponse::EndBlockUpload { n, crc } => (n, crc),
            _ => return self.unexpected(resp),
        };
        // The last segment was stored whole; drop its unused bytes
        let valid_len = self.buffer.len().saturating_sub(n as usize);
        self.buffer.truncate(valid_len);
        self.bytes_transferred = valid_len;

        if use_crc {
            let computed = crc(&self.buffer);
            if computed != server_crc {
                self.abort(AbortCode::CrcError);
                return CrcMismatchSnafu {
                    expected: server_crc,
                    computed,
                }
                .fail();
            }
        }
        self.check_size()?;
        self.send(SdoRequest::ConfirmBlockUploadEnd)?;
        Ok(self.take_buffer())
    }

    /// Receive segments until the last one has been received in order
    fn receive_blocks(&mut self, blksize: u8) -> Result<()> {
        let mut last_request = SdoRequest::StartBlockUpload;
        self.send(last_request)?;
        self.seqno = 0;

        let mut attempts = 1;
        loop {
            let msg = match self.poll_message()? {
                Some(msg) => msg,
                None => {
                    self.consume_retry(attempts)?;
                    attempts += 1;
                    if self.seqno > 0 {
                        // Tell the server what was received, so it can resend the rest
                        last_request = SdoRequest::ConfirmBlock {
                            ackseq: self.seqno,
                            blksize,
                        };
                    }
                    self.send(last_request)?;
                    continue;
                }
            };

            if msg.data[0] == ABORT_COMMAND {
                // Always an error
                self.parse_response(&msg)?;
                continue;
            }
            let segment = match decode_block_segment(&msg)
                .and_then(|frame| BlockSegment::try_from(frame.payload.as_slice()))
            {
                Ok(segment) => segment,
                Err(e) => return self.malformed(e),
            };
            if segment.seqnum == 0 || segment.seqnum > blksize {
                self.abort(AbortCode::InvalidSequenceNumber);
                return SequenceSnafu {
                    seqno: segment.seqnum,
                }
                .fail();
            }
            attempts = 1;

            let mut complete = false;
            if segment.seqnum == self.seqno + 1 {
                // The server sends a whole block without waiting, so each segment in order
                // restarts the timeout
                self.restart_deadline();
                self.seqno = segment.seqnum;
                self.buffer.extend_from_slice(&segment.data);
                self.bytes_transferred = self.buffer.len();
                complete = segment.c;
            } else {
                log::debug!(
                    "Dropping out of order segment {} from node {}, expected {}",
                    segment.seqnum,
                    self.node_id,
                    self.seqno + 1
                );
            }

            if complete {
                return Ok(());
            }
            if segment.seqnum == blksize || segment.c {
                // End of block from the server's point of view
                log::debug!(
                    "Acknowledging {} segments from node {}",
                    self.seqno,
                    self.node_id
                );
                last_request = SdoRequest::ConfirmBlock {
                    ackseq: self.seqno,
                    blksize,
                };
                self.send(last_request)?;
                if self.seqno == blksize {
                    self.seqno = 0;
                }
            }
        }
    }
}
