use sdolink_common::{sdo::RawAbortCode, ParseError, TransportError};
use snafu::Snafu;

/// Error returned by [`SdoClient`](crate::SdoClient) operations
///
/// Any error ends the transfer. Data received before the error is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SdoClientError {
    /// The CAN transport failed. Never retried.
    #[snafu(display("Transport error: {source}"))]
    Transport {
        /// The error reported by the transport
        source: TransportError,
    },
    /// No response was received after all retries
    #[snafu(display("No response from server after {attempts} attempts"))]
    Timeout {
        /// Number of times the unanswered request was sent
        attempts: u32,
    },
    /// The server aborted the transfer
    #[snafu(display("Server aborted transfer of 0x{index:04X}sub{sub}: {abort_code}"))]
    ServerAbort {
        /// Object index reported in the abort frame
        index: u16,
        /// Sub index reported in the abort frame
        sub: u8,
        /// The reason for the abort
        abort_code: RawAbortCode,
    },
    /// A segment response carried the wrong toggle bit
    #[snafu(display("Toggle bit not alternated"))]
    ToggleMismatch,
    /// A block acknowledgement referenced a segment which was never sent
    #[snafu(display("Invalid sequence number {seqno}"))]
    SequenceError {
        /// The offending sequence number
        seqno: u8,
    },
    /// The CRC of a block transfer did not match
    #[snafu(display("CRC mismatch: expected 0x{expected:04X}, computed 0x{computed:04X}"))]
    CrcMismatch {
        /// CRC reported by the peer
        expected: u16,
        /// CRC computed over the transferred data
        computed: u16,
    },
    /// The server sent a frame which could not be decoded
    #[snafu(display("Malformed response: {source}"))]
    Malformed {
        /// The decode error
        source: ParseError,
    },
    /// The server sent a valid SDO response which does not fit the current transfer state
    #[snafu(display("Unexpected SDO response"))]
    UnexpectedResponse,
    /// The number of bytes transferred differs from the size declared by the server
    #[snafu(display("Size mismatch: expected {expected} bytes, got {actual}"))]
    SizeMismatch {
        /// Size declared in the initiate frame
        expected: usize,
        /// Number of bytes actually transferred
        actual: usize,
    },
    /// The server requested a block size outside 1..=127
    #[snafu(display("Invalid block size {blksize}"))]
    InvalidBlockSize {
        /// The requested block size
        blksize: u8,
    },
    /// The transfer was cancelled via a [`CancelHandle`](crate::CancelHandle)
    #[snafu(display("Transfer cancelled"))]
    Cancelled,
    /// The node ID is not in 1..=127
    #[snafu(display("Invalid node ID {node_id}"))]
    InvalidNodeId {
        /// The rejected node ID
        node_id: u8,
    },
    /// The data does not fit the requested transfer
    #[snafu(display("Invalid data length {len}"))]
    InvalidDataLength {
        /// The rejected length
        len: usize,
    },
}

#[cfg(test)]
mod tests {
    use assertables::assert_contains;
    use sdolink_common::sdo::AbortCode;

    use super::*;

    #[test]
    fn test_abort_display_includes_code() {
        let err = SdoClientError::ServerAbort {
            index: 0x2000,
            sub: 1,
            abort_code: RawAbortCode::Valid(AbortCode::NoSuchObject),
        };
        let msg = err.to_string();
        assert_contains!(msg, "0x2000sub1");
        assert_contains!(msg, "0x06020000");

        let err = SdoClientError::ServerAbort {
            index: 0x2000,
            sub: 1,
            abort_code: RawAbortCode::Unknown(0x0606_0001),
        };
        assert_contains!(err.to_string(), "0x06060001");
    }
}
