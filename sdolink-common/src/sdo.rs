//! Typed SDO messages
//!
//! Requests are sent by the client, responses by the server. Both convert to and from the 8
//! bytes of an SDO frame with [`SdoRequest::to_bytes`] / [`SdoResponse::to_bytes`] and the
//! `TryFrom<&[u8]>` impls.
//!
//! The segments of a block transfer have no command specifier, and are handled separately as
//! [`BlockSegment`]s.
use core::fmt;

use crate::frame::{ParseError, TransferType, UnknownCommandSpecifierSnafu};

/// Specifies the possible server command specifier (SCS) values in SDO response packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    /// Upload segment
    SegmentUpload = 0,
    /// Acknowledge a download segment
    SegmentDownload = 1,
    /// Initiate upload response
    Upload = 2,
    /// Acknowledge a download command
    Download = 3,
    /// Abort transfer
    Abort = 4,
    /// Block download control response
    BlockDownload = 5,
    /// Block upload control response
    BlockUpload = 6,
}

impl TryFrom<u8> for ServerCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(SegmentUpload),
            1 => Ok(SegmentDownload),
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            5 => Ok(BlockDownload),
            6 => Ok(BlockUpload),
            _ => Err(()),
        }
    }
}

/// Specifies the possible client command specifier (CCS) values in SDO request packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCommand {
    /// Download segment
    DownloadSegment = 0,
    /// Initiate download
    InitiateDownload = 1,
    /// Initiate upload
    InitiateUpload = 2,
    /// Request the next upload segment
    ReqUploadSegment = 3,
    /// Abort transfer
    Abort = 4,
    /// Block upload control request
    ReqBlockUpload = 5,
    /// Block download control request
    ReqBlockDownload = 6,
}

impl TryFrom<u8> for ClientCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(ReqUploadSegment),
            4 => Ok(Abort),
            5 => Ok(ReqBlockUpload),
            6 => Ok(ReqBlockDownload),
            _ => Err(()),
        }
    }
}

/// SDO abort codes defined by CiA 301
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Invalid block size (block mode only)
    InvalidBlockSize = 0x0504_0002,
    /// Invalid sequence number (block mode only)
    InvalidSequenceNumber = 0x0504_0003,
    /// CRC Error (block mode only )
    CrcError = 0x0504_0004,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnallowedPdo = 0x0604_0041,
    /// The number and length of objects would exceed PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// General internal incompatibility in the device
    InternalIncompatibility = 0x0604_0047,
    /// Access failed due to hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter too high (download only)
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter too low (download only)
    ValueTooLow = 0x0609_0032,
    /// Maximum value is less than minimum value
    MaxLessThanMin = 0x0609_0036,
    /// Resource not available: SDO connection
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred or stored to the application because of local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred or stored to the application because of the device state
    CantStoreDeviceState = 0x0800_0022,
    /// No object dictionary is present
    NoObjectDict = 0x0800_0023,
    /// No data available
    NoData = 0x0800_0024,
}

impl AbortCode {
    const ALL: [AbortCode; 31] = [
        AbortCode::ToggleNotAlternated,
        AbortCode::SdoTimeout,
        AbortCode::InvalidCommandSpecifier,
        AbortCode::InvalidBlockSize,
        AbortCode::InvalidSequenceNumber,
        AbortCode::CrcError,
        AbortCode::OutOfMemory,
        AbortCode::UnsupportedAccess,
        AbortCode::WriteOnly,
        AbortCode::ReadOnly,
        AbortCode::NoSuchObject,
        AbortCode::UnallowedPdo,
        AbortCode::PdoTooLong,
        AbortCode::IncompatibleParameter,
        AbortCode::InternalIncompatibility,
        AbortCode::HardwareError,
        AbortCode::DataTypeMismatch,
        AbortCode::DataTypeMismatchLengthHigh,
        AbortCode::DataTypeMismatchLengthLow,
        AbortCode::NoSuchSubIndex,
        AbortCode::InvalidValue,
        AbortCode::ValueTooHigh,
        AbortCode::ValueTooLow,
        AbortCode::MaxLessThanMin,
        AbortCode::ResourceNotAvailable,
        AbortCode::GeneralError,
        AbortCode::CantStore,
        AbortCode::CantStoreLocalControl,
        AbortCode::CantStoreDeviceState,
        AbortCode::NoObjectDict,
        AbortCode::NoData,
    ];

    /// Get the numeric abort code
    pub fn raw(&self) -> u32 {
        *self as u32
    }

    /// Get a human readable description of the abort reason
    pub fn description(&self) -> &'static str {
        use AbortCode::*;
        match self {
            ToggleNotAlternated => "Toggle bit not alternated",
            SdoTimeout => "SDO protocol timed out",
            InvalidCommandSpecifier => "Client/server command specifier not valid or unknown",
            InvalidBlockSize => "Invalid block size",
            InvalidSequenceNumber => "Invalid sequence number",
            CrcError => "CRC error",
            OutOfMemory => "Out of memory",
            UnsupportedAccess => "Unsupported access to an object",
            WriteOnly => "Attempt to read a write only object",
            ReadOnly => "Attempt to write a read only object",
            NoSuchObject => "Object does not exist in the object dictionary",
            UnallowedPdo => "Object cannot be mapped to the PDO",
            PdoTooLong => "The number and length of the objects to be mapped would exceed PDO length",
            IncompatibleParameter => "General parameter incompatibility",
            InternalIncompatibility => "General internal incompatibility in the device",
            HardwareError => "Access failed due to a hardware error",
            DataTypeMismatch => "Data type does not match, length of service parameter does not match",
            DataTypeMismatchLengthHigh => {
                "Data type does not match, length of service parameter too high"
            }
            DataTypeMismatchLengthLow => {
                "Data type does not match, length of service parameter too low"
            }
            NoSuchSubIndex => "Sub-index does not exist",
            InvalidValue => "Invalid value for parameter",
            ValueTooHigh => "Value of parameter written too high",
            ValueTooLow => "Value of parameter written too low",
            MaxLessThanMin => "Maximum value is less than minimum value",
            ResourceNotAvailable => "Resource not available: SDO connection",
            GeneralError => "General error",
            CantStore => "Data cannot be transferred or stored to the application",
            CantStoreLocalControl => {
                "Data cannot be transferred or stored to the application because of local control"
            }
            CantStoreDeviceState => {
                "Data cannot be transferred or stored to the application because of the present device state"
            }
            NoObjectDict => "Object dictionary dynamic generation fails or no object dictionary is present",
            NoData => "No data available",
        }
    }
}

impl TryFrom<u32> for AbortCode {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        AbortCode::ALL
            .iter()
            .find(|code| **code as u32 == value)
            .copied()
            .ok_or(())
    }
}

impl fmt::Display for AbortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X} ({})", self.raw(), self.description())
    }
}

/// An abort code as received from the bus, which may not be one of the known codes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawAbortCode {
    /// A recognized abort code
    Valid(AbortCode),
    /// A code not defined by CiA 301
    Unknown(u32),
}

impl RawAbortCode {
    /// Get the numeric abort code
    pub fn raw(&self) -> u32 {
        match self {
            RawAbortCode::Valid(code) => code.raw(),
            RawAbortCode::Unknown(value) => *value,
        }
    }
}

impl From<u32> for RawAbortCode {
    fn from(value: u32) -> Self {
        match AbortCode::try_from(value) {
            Ok(code) => RawAbortCode::Valid(code),
            Err(_) => RawAbortCode::Unknown(value),
        }
    }
}

impl From<AbortCode> for RawAbortCode {
    fn from(value: AbortCode) -> Self {
        RawAbortCode::Valid(value)
    }
}

impl fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawAbortCode::Valid(code) => code.fmt(f),
            RawAbortCode::Unknown(value) => write!(f, "0x{:08X} (unknown abort code)", value),
        }
    }
}

/// Number of data bytes in a block transfer segment
pub const BLOCK_SEGMENT_SIZE: usize = 7;

/// The largest number of segments in one block
pub const MAX_BLOCK_SIZE: u8 = 127;

fn put_address(payload: &mut [u8; 8], index: u16, sub: u8) {
    payload[1..3].copy_from_slice(&index.to_le_bytes());
    payload[3] = sub;
}

fn get_address(value: &[u8]) -> (u16, u8) {
    (u16::from_le_bytes([value[1], value[2]]), value[3])
}

fn get_u32(value: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        value[offset],
        value[offset + 1],
        value[offset + 2],
        value[offset + 3],
    ])
}

fn check_length(value: &[u8]) -> Result<(), ParseError> {
    if value.len() < 8 {
        return Err(ParseError::MalformedLength {
            dlc: value.len() as u8,
        });
    }
    Ok(())
}

/// An SDO request, sent from client to server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoRequest {
    /// Start a download, optionally carrying up to 4 bytes of data (expedited)
    InitiateDownload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size valid flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value when e=1, or the total size when e=0 and s=1
        data: [u8; 4],
    },
    /// One segment of a segmented download
    DownloadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// When set, indicates there are no more segments to be sent
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Start an upload
    InitiateUpload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Request the next segment of a segmented upload
    ReqUploadSegment {
        /// Toggle flag
        t: bool,
    },
    /// Start a block download
    InitiateBlockDownload {
        /// Client CRC supported flag
        cc: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// If s=1, contains the number of bytes to be downloaded
        size: u32,
    },
    /// End a block download
    EndBlockDownload {
        /// Number of unused bytes in the last segment
        n: u8,
        /// CRC of the complete data
        crc: u16,
    },
    /// Start a block upload
    InitiateBlockUpload {
        /// Client CRC supported flag
        cc: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Number of segments per block
        blksize: u8,
        /// Protocol switch threshold. If the object holds no more than this many bytes, the
        /// server may answer with a normal upload instead. 0 disables the switch.
        pst: u8,
    },
    /// Tell the server to start sending the first block of an upload
    StartBlockUpload,
    /// Acknowledge a block received during a block upload
    ConfirmBlock {
        /// Sequence number of the last segment received in order
        ackseq: u8,
        /// Number of segments in the next block
        blksize: u8,
    },
    /// Acknowledge the end of a block upload
    ConfirmBlockUploadEnd,
    /// Abort the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Reason for the abort
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an abort message
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Create a non-expedited initiate download message
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        let data = size.unwrap_or(0).to_le_bytes();

        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data,
        }
    }

    /// Create a download segment message
    ///
    /// # Panics
    ///
    /// Panics if `segment_data` is longer than 7 bytes
    pub fn download_segment(toggle: bool, last_segment: bool, segment_data: &[u8]) -> Self {
        let mut data = [0; 7];
        data[0..segment_data.len()].copy_from_slice(segment_data);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: 7 - segment_data.len() as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an expedited download message
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than 4 bytes
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        SdoRequest::InitiateDownload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create an initiate upload message
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create a request for the next upload segment
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Create an initiate block download message with a known size
    pub fn initiate_block_download(index: u16, sub: u8, crc_supported: bool, size: u32) -> Self {
        SdoRequest::InitiateBlockDownload {
            cc: crc_supported,
            s: true,
            index,
            sub,
            size,
        }
    }

    /// Create an end block download message
    pub fn end_block_download(n: u8, crc: u16) -> Self {
        SdoRequest::EndBlockDownload { n, crc }
    }

    /// Create an initiate block upload message
    pub fn initiate_block_upload(
        index: u16,
        sub: u8,
        crc_supported: bool,
        blksize: u8,
        pst: u8,
    ) -> Self {
        SdoRequest::InitiateBlockUpload {
            cc: crc_supported,
            index,
            sub,
            blksize,
            pst,
        }
    }

    /// Get the frame classification of this message
    pub fn transfer_type(&self) -> TransferType {
        match self {
            SdoRequest::InitiateDownload { e: true, .. } => TransferType::Expedited,
            SdoRequest::InitiateDownload { .. } => TransferType::InitiateDownload,
            SdoRequest::DownloadSegment { .. } => TransferType::SegmentDownload,
            SdoRequest::InitiateUpload { .. } => TransferType::InitiateUpload,
            SdoRequest::ReqUploadSegment { .. } => TransferType::SegmentUpload,
            SdoRequest::InitiateBlockDownload { .. } | SdoRequest::EndBlockDownload { .. } => {
                TransferType::BlockDownload
            }
            SdoRequest::InitiateBlockUpload { .. }
            | SdoRequest::StartBlockUpload
            | SdoRequest::ConfirmBlock { .. }
            | SdoRequest::ConfirmBlockUploadEnd => TransferType::BlockUpload,
            SdoRequest::Abort { .. } => TransferType::Abort,
        }
    }

    /// Serialize the message into the 8 bytes of an SDO frame
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = (ClientCommand::InitiateDownload as u8) << 5
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                put_address(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = (ClientCommand::DownloadSegment as u8) << 5
                    | (t as u8) << 4
                    | (n & 7) << 1
                    | (c as u8);
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                put_address(&mut payload, index, sub);
            }
            SdoRequest::ReqUploadSegment { t } => {
                payload[0] = (ClientCommand::ReqUploadSegment as u8) << 5 | (t as u8) << 4;
            }
            SdoRequest::InitiateBlockDownload {
                cc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] =
                    (ClientCommand::ReqBlockDownload as u8) << 5 | (cc as u8) << 2 | (s as u8) << 1;
                put_address(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoRequest::EndBlockDownload { n, crc } => {
                payload[0] = (ClientCommand::ReqBlockDownload as u8) << 5 | (n & 7) << 2 | 1;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoRequest::InitiateBlockUpload {
                cc,
                index,
                sub,
                blksize,
                pst,
            } => {
                payload[0] = (ClientCommand::ReqBlockUpload as u8) << 5 | (cc as u8) << 2;
                put_address(&mut payload, index, sub);
                payload[4] = blksize;
                payload[5] = pst;
            }
            SdoRequest::StartBlockUpload => {
                payload[0] = (ClientCommand::ReqBlockUpload as u8) << 5 | 3;
            }
            SdoRequest::ConfirmBlock { ackseq, blksize } => {
                payload[0] = (ClientCommand::ReqBlockUpload as u8) << 5 | 2;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoRequest::ConfirmBlockUploadEnd => {
                payload[0] = (ClientCommand::ReqBlockUpload as u8) << 5 | 1;
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                put_address(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = ParseError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        check_length(value)?;
        let command = value[0];
        let ccs: ClientCommand = match (command >> 5).try_into() {
            Ok(ccs) => ccs,
            Err(_) => return UnknownCommandSpecifierSnafu { command }.fail(),
        };

        match ccs {
            ClientCommand::DownloadSegment => {
                let t = (command & (1 << 4)) != 0;
                let n = (command >> 1) & 0x7;
                let c = (command & (1 << 0)) != 0;
                let mut data = [0; 7];
                data.copy_from_slice(&value[1..8]);
                Ok(SdoRequest::DownloadSegment { t, n, c, data })
            }
            ClientCommand::InitiateDownload => {
                let n = (command >> 2) & 0x3;
                let e = (command & (1 << 1)) != 0;
                let s = (command & (1 << 0)) != 0;
                let (index, sub) = get_address(value);
                let mut data = [0; 4];
                data.copy_from_slice(&value[4..8]);
                Ok(SdoRequest::InitiateDownload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ClientCommand::InitiateUpload => {
                let (index, sub) = get_address(value);
                Ok(SdoRequest::InitiateUpload { index, sub })
            }
            ClientCommand::ReqUploadSegment => {
                let t = ((command >> 4) & 1) != 0;
                Ok(SdoRequest::ReqUploadSegment { t })
            }
            ClientCommand::Abort => {
                let (index, sub) = get_address(value);
                let abort_code = get_u32(value, 4);
                Ok(SdoRequest::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
            ClientCommand::ReqBlockUpload => match command & 0x3 {
                0 => {
                    let (index, sub) = get_address(value);
                    Ok(SdoRequest::InitiateBlockUpload {
                        cc: (command & (1 << 2)) != 0,
                        index,
                        sub,
                        blksize: value[4],
                        pst: value[5],
                    })
                }
                1 => Ok(SdoRequest::ConfirmBlockUploadEnd),
                2 => Ok(SdoRequest::ConfirmBlock {
                    ackseq: value[1],
                    blksize: value[2],
                }),
                _ => Ok(SdoRequest::StartBlockUpload),
            },
            ClientCommand::ReqBlockDownload => {
                if (command & 1) == 0 {
                    let (index, sub) = get_address(value);
                    Ok(SdoRequest::InitiateBlockDownload {
                        cc: (command & (1 << 2)) != 0,
                        s: (command & (1 << 1)) != 0,
                        index,
                        sub,
                        size: get_u32(value, 4),
                    })
                } else {
                    Ok(SdoRequest::EndBlockDownload {
                        n: (command >> 2) & 0x7,
                        crc: u16::from_le_bytes([value[1], value[2]]),
                    })
                }
            }
        }
    }
}

/// An SDO response, sent from server to client
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SdoResponse {
    /// Response to an initiate upload
    ConfirmUpload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value if e=1, or size if s=1
        data: [u8; 4],
    },
    /// One segment of a segmented upload
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// When set, this is the last segment
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Response to an initiate download
    ConfirmDownload {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Acknowledge a download segment
    ConfirmDownloadSegment {
        /// Toggle flag, matching the segment being acknowledged
        t: bool,
    },
    /// Response to an initiate block download
    ConfirmBlockDownload {
        /// Server CRC supported flag
        sc: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Number of segments per block the server accepts
        blksize: u8,
    },
    /// Acknowledge a block received during a block download
    ConfirmBlock {
        /// Sequence number of the last segment received in order
        ackseq: u8,
        /// Number of segments in the next block
        blksize: u8,
    },
    /// Acknowledge the end of a block download
    ConfirmBlockDownloadEnd,
    /// Response to an initiate block upload
    ConfirmBlockUpload {
        /// Server CRC supported flag
        sc: bool,
        /// Size flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// If s=1, the number of bytes to be uploaded
        size: u32,
    },
    /// End a block upload
    EndBlockUpload {
        /// Number of unused bytes in the last segment
        n: u8,
        /// CRC of the complete data
        crc: u16,
    },
    /// Abort the transfer
    Abort {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Reason for the abort
        abort_code: u32,
    },
}

impl TryFrom<&[u8]> for SdoResponse {
    type Error = ParseError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        check_length(value)?;
        let command = value[0];
        let scs: ServerCommand = match (command >> 5).try_into() {
            Ok(scs) => scs,
            Err(_) => return UnknownCommandSpecifierSnafu { command }.fail(),
        };

        match scs {
            ServerCommand::SegmentUpload => {
                let t = (command & (1 << 4)) != 0;
                let n = (command >> 1) & 7;
                let c = (command & (1 << 0)) != 0;
                let mut data = [0; 7];
                data.copy_from_slice(&value[1..8]);
                Ok(SdoResponse::UploadSegment { t, n, c, data })
            }
            ServerCommand::SegmentDownload => {
                let t = (command & (1 << 4)) != 0;
                Ok(SdoResponse::ConfirmDownloadSegment { t })
            }
            ServerCommand::Upload => {
                let n = (command >> 2) & 0x3;
                let e = (command & (1 << 1)) != 0;
                let s = (command & (1 << 0)) != 0;
                let (index, sub) = get_address(value);
                let mut data = [0; 4];
                data.copy_from_slice(&value[4..8]);
                Ok(SdoResponse::ConfirmUpload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ServerCommand::Download => {
                let (index, sub) = get_address(value);
                Ok(SdoResponse::ConfirmDownload { index, sub })
            }
            ServerCommand::Abort => {
                let (index, sub) = get_address(value);
                let abort_code = get_u32(value, 4);
                Ok(SdoResponse::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
            ServerCommand::BlockDownload => match command & 0x3 {
                0 => {
                    let (index, sub) = get_address(value);
                    Ok(SdoResponse::ConfirmBlockDownload {
                        sc: (command & (1 << 2)) != 0,
                        index,
                        sub,
                        blksize: value[4],
                    })
                }
                1 => Ok(SdoResponse::ConfirmBlockDownloadEnd),
                2 => Ok(SdoResponse::ConfirmBlock {
                    ackseq: value[1],
                    blksize: value[2],
                }),
                _ => UnknownCommandSpecifierSnafu { command }.fail(),
            },
            ServerCommand::BlockUpload => {
                if (command & 1) == 0 {
                    let (index, sub) = get_address(value);
                    Ok(SdoResponse::ConfirmBlockUpload {
                        sc: (command & (1 << 2)) != 0,
                        s: (command & (1 << 1)) != 0,
                        index,
                        sub,
                        size: get_u32(value, 4),
                    })
                } else {
                    Ok(SdoResponse::EndBlockUpload {
                        n: (command >> 2) & 0x7,
                        crc: u16::from_le_bytes([value[1], value[2]]),
                    })
                }
            }
        }
    }
}

impl SdoResponse {
    /// Create an expedited upload response
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than 4 bytes
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> SdoResponse {
        if data.len() > 4 {
            panic!("Cannot create expedited upload with more than 4 bytes");
        }

        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        SdoResponse::ConfirmUpload {
            index,
            sub,
            e: true,
            s: true,
            n: 4 - data.len() as u8,
            data: msg_data,
        }
    }

    /// Create a response to an initiate upload which starts a segmented upload
    pub fn upload_acknowledge(index: u16, sub: u8, size: Option<u32>) -> SdoResponse {
        SdoResponse::ConfirmUpload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data: size.unwrap_or(0).to_le_bytes(),
        }
    }

    /// Create an upload segment
    pub fn upload_segment(t: bool, c: bool, data: &[u8]) -> SdoResponse {
        let n = (7 - data.len()) as u8;
        let mut buf = [0; 7];
        buf[0..data.len()].copy_from_slice(data);
        SdoResponse::UploadSegment { t, n, c, data: buf }
    }

    /// Create a response to an initiate download
    pub fn download_acknowledge(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create a download segment acknowledgement
    pub fn download_segment_acknowledge(t: bool) -> SdoResponse {
        SdoResponse::ConfirmDownloadSegment { t }
    }

    /// Create a response to an initiate block download
    pub fn block_download_acknowledge(
        crc_supported: bool,
        index: u16,
        sub: u8,
        blksize: u8,
    ) -> SdoResponse {
        SdoResponse::ConfirmBlockDownload {
            sc: crc_supported,
            index,
            sub,
            blksize,
        }
    }

    /// Create a response to an initiate block upload
    pub fn block_upload_acknowledge(
        crc_supported: bool,
        index: u16,
        sub: u8,
        size: Option<u32>,
    ) -> SdoResponse {
        SdoResponse::ConfirmBlockUpload {
            sc: crc_supported,
            s: size.is_some(),
            index,
            sub,
            size: size.unwrap_or(0),
        }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> SdoResponse {
        let abort_code = abort_code as u32;
        SdoResponse::Abort {
            index,
            sub,
            abort_code,
        }
    }

    /// Get the frame classification of this message
    pub fn transfer_type(&self) -> TransferType {
        match self {
            SdoResponse::ConfirmUpload { e: true, .. } => TransferType::Expedited,
            SdoResponse::ConfirmUpload { .. } => TransferType::InitiateUpload,
            SdoResponse::UploadSegment { .. } => TransferType::SegmentUpload,
            SdoResponse::ConfirmDownload { .. } => TransferType::InitiateDownload,
            SdoResponse::ConfirmDownloadSegment { .. } => TransferType::SegmentDownload,
            SdoResponse::ConfirmBlockDownload { .. }
            | SdoResponse::ConfirmBlock { .. }
            | SdoResponse::ConfirmBlockDownloadEnd => TransferType::BlockDownload,
            SdoResponse::ConfirmBlockUpload { .. } | SdoResponse::EndBlockUpload { .. } => {
                TransferType::BlockUpload
            }
            SdoResponse::Abort { .. } => TransferType::Abort,
        }
    }

    /// Serialize the message into the 8 bytes of an SDO frame
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = (ServerCommand::Upload as u8) << 5
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | (s as u8);
                put_address(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = (ServerCommand::Download as u8) << 5;
                put_address(&mut payload, index, sub);
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = (ServerCommand::SegmentUpload as u8) << 5
                    | (t as u8) << 4
                    | (n & 7) << 1
                    | c as u8;
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownloadSegment { t } => {
                payload[0] = (ServerCommand::SegmentDownload as u8) << 5 | (t as u8) << 4;
            }
            SdoResponse::ConfirmBlockDownload {
                sc,
                index,
                sub,
                blksize,
            } => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | (sc as u8) << 2;
                put_address(&mut payload, index, sub);
                payload[4] = blksize;
            }
            SdoResponse::ConfirmBlock { ackseq, blksize } => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | 2;
                payload[1] = ackseq;
                payload[2] = blksize;
            }
            SdoResponse::ConfirmBlockDownloadEnd => {
                payload[0] = (ServerCommand::BlockDownload as u8) << 5 | 1;
            }
            SdoResponse::ConfirmBlockUpload {
                sc,
                s,
                index,
                sub,
                size,
            } => {
                payload[0] =
                    (ServerCommand::BlockUpload as u8) << 5 | (sc as u8) << 2 | (s as u8) << 1;
                put_address(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&size.to_le_bytes());
            }
            SdoResponse::EndBlockUpload { n, crc } => {
                payload[0] = (ServerCommand::BlockUpload as u8) << 5 | (n & 7) << 2 | 1;
                payload[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                put_address(&mut payload, index, sub);
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }
}

/// A data segment of a block transfer
///
/// Sent by the client during block download, and by the server during block upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockSegment {
    /// Set on the last segment of the transfer
    pub c: bool,
    /// Sequence number within the block, 1..=127
    pub seqnum: u8,
    /// Segment data. Unused bytes of the last segment are signalled by the end frame.
    pub data: [u8; BLOCK_SEGMENT_SIZE],
}

impl BlockSegment {
    /// Serialize the segment into the 8 bytes of an SDO frame
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0; 8];
        bytes[0] = ((self.c as u8) << 7) | (self.seqnum & 0x7f);
        bytes[1..8].copy_from_slice(&self.data);
        bytes
    }
}

impl TryFrom<&[u8]> for BlockSegment {
    type Error = ParseError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        check_length(value)?;
        let c = (value[0] & (1 << 7)) != 0;
        let seqnum = value[0] & 0x7f;
        let mut data = [0; BLOCK_SEGMENT_SIZE];
        data.copy_from_slice(&value[1..8]);
        Ok(BlockSegment { c, seqnum, data })
    }
}

#[cfg(test)]
mod tests {
    use assertables::assert_contains;

    use super::*;

    #[test]
    fn test_expedited_download_encoding() {
        let req = SdoRequest::expedited_download(0x2001, 0, &[0x01, 0x02]);
        assert_eq!([0x2B, 0x01, 0x20, 0x00, 0x01, 0x02, 0x00, 0x00], req.to_bytes());

        let req = SdoRequest::expedited_download(0x1017, 0, &[0xE8, 0x03, 0x00, 0x00]);
        assert_eq!(0x23, req.to_bytes()[0]);
        let req = SdoRequest::expedited_download(0x1017, 0, &[0x01]);
        assert_eq!(0x2F, req.to_bytes()[0]);
    }

    #[test]
    fn test_request_command_bytes() {
        assert_eq!(0x40, SdoRequest::initiate_upload(0x1000, 0).to_bytes()[0]);
        assert_eq!(0x60, SdoRequest::upload_segment_request(false).to_bytes()[0]);
        assert_eq!(0x70, SdoRequest::upload_segment_request(true).to_bytes()[0]);
        assert_eq!(
            0x80,
            SdoRequest::abort(0x1000, 0, AbortCode::GeneralError).to_bytes()[0]
        );
        // Last segment, toggle set, 3 bytes used -> n = 4
        assert_eq!(
            0x19,
            SdoRequest::download_segment(true, true, &[1, 2, 3]).to_bytes()[0]
        );
        assert_eq!(
            0xC6,
            SdoRequest::initiate_block_download(0x1000, 0, true, 10).to_bytes()[0]
        );
        assert_eq!(0xC1 | (3 << 2), SdoRequest::end_block_download(3, 0).to_bytes()[0]);
        assert_eq!(
            0xA4,
            SdoRequest::initiate_block_upload(0x1000, 0, true, 127, 0).to_bytes()[0]
        );
        assert_eq!(0xA3, SdoRequest::StartBlockUpload.to_bytes()[0]);
        assert_eq!(
            [0xA2, 5, 127, 0, 0, 0, 0, 0],
            SdoRequest::ConfirmBlock {
                ackseq: 5,
                blksize: 127
            }
            .to_bytes()
        );
        assert_eq!(0xA1, SdoRequest::ConfirmBlockUploadEnd.to_bytes()[0]);
    }

    #[test]
    fn test_request_parse() {
        let requests = [
            SdoRequest::expedited_download(0x2001, 2, &[9, 8, 7]),
            SdoRequest::initiate_download(0x2001, 2, Some(100)),
            SdoRequest::download_segment(false, false, &[1, 2, 3, 4, 5, 6, 7]),
            SdoRequest::initiate_upload(0x3000, 1),
            SdoRequest::upload_segment_request(true),
            SdoRequest::initiate_block_download(0x1000, 1, false, 5000),
            SdoRequest::end_block_download(6, 0xABCD),
            SdoRequest::initiate_block_upload(0x1000, 1, true, 20, 4),
            SdoRequest::StartBlockUpload,
            SdoRequest::ConfirmBlock {
                ackseq: 127,
                blksize: 64,
            },
            SdoRequest::ConfirmBlockUploadEnd,
            SdoRequest::abort(0x1234, 5, AbortCode::CrcError),
        ];
        for req in requests {
            assert_eq!(Ok(req), SdoRequest::try_from(req.to_bytes().as_slice()));
        }
    }

    #[test]
    fn test_response_parse() {
        let responses = [
            SdoResponse::expedited_upload(0x1000, 0, &[1, 2, 3, 4]),
            SdoResponse::upload_acknowledge(0x1000, 0, Some(1000)),
            SdoResponse::upload_segment(true, true, &[1]),
            SdoResponse::download_acknowledge(0x1000, 0),
            SdoResponse::download_segment_acknowledge(false),
            SdoResponse::block_download_acknowledge(true, 0x1000, 0, 127),
            SdoResponse::ConfirmBlock {
                ackseq: 3,
                blksize: 127,
            },
            SdoResponse::ConfirmBlockDownloadEnd,
            SdoResponse::block_upload_acknowledge(true, 0x1000, 0, Some(30)),
            SdoResponse::EndBlockUpload { n: 5, crc: 0x1D0F },
            SdoResponse::abort(0x2000, 1, AbortCode::NoSuchObject),
        ];
        for resp in responses {
            assert_eq!(Ok(resp), SdoResponse::try_from(resp.to_bytes().as_slice()));
        }
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Err(ParseError::MalformedLength { dlc: 4 }),
            SdoResponse::try_from([0x60, 0, 0, 0].as_slice())
        );
        assert_eq!(
            Err(ParseError::UnknownCommandSpecifier { command: 0xE0 }),
            SdoRequest::try_from([0xE0, 0, 0, 0, 0, 0, 0, 0].as_slice())
        );
        assert_eq!(
            Err(ParseError::UnknownCommandSpecifier { command: 0xA3 }),
            SdoResponse::try_from([0xA3, 0, 0, 0, 0, 0, 0, 0].as_slice())
        );
    }

    #[test]
    fn test_abort_response_decoding() {
        let bytes = [0x80, 0x00, 0x20, 0x01, 0x00, 0x00, 0x06, 0x06];
        assert_eq!(
            Ok(SdoResponse::Abort {
                index: 0x2000,
                sub: 1,
                abort_code: 0x0606_0000
            }),
            SdoResponse::try_from(bytes.as_slice())
        );
    }

    #[test]
    fn test_abort_codes() {
        assert_eq!(Ok(AbortCode::NoSuchObject), AbortCode::try_from(0x0602_0000));
        assert_eq!(Ok(AbortCode::NoData), AbortCode::try_from(0x0800_0024));
        assert_eq!(Err(()), AbortCode::try_from(0x1234_5678));

        assert_eq!(
            RawAbortCode::Valid(AbortCode::HardwareError),
            RawAbortCode::from(0x0606_0000)
        );
        let unknown = RawAbortCode::from(0x1234_5678);
        assert_eq!(RawAbortCode::Unknown(0x1234_5678), unknown);
        assert_eq!(0x1234_5678, unknown.raw());

        assert_eq!(
            "0x05030000 (Toggle bit not alternated)",
            AbortCode::ToggleNotAlternated.to_string()
        );
        assert_eq!("0x12345678 (unknown abort code)", unknown.to_string());

        for code in AbortCode::ALL {
            assert_eq!(Ok(code), AbortCode::try_from(code.raw()));
            assert_contains!(code.to_string(), code.description());
        }
    }

    #[test]
    fn test_block_segment() {
        let bytes = [0x81, 1, 2, 3, 4, 5, 6, 7];
        let segment = BlockSegment::try_from(bytes.as_slice()).unwrap();
        assert!(segment.c);
        assert_eq!(1, segment.seqnum);
        assert_eq!([1, 2, 3, 4, 5, 6, 7], segment.data);
        assert_eq!(bytes, segment.to_bytes());
    }
}
