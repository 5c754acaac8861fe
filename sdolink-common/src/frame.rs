//! Frame codec
//!
//! Converts between raw [`CanMessage`]s and [`CanOpenFrame`]s. The 11-bit arbitration ID is split
//! into a 4-bit function code and a 7-bit node ID, and the first data byte is read as an SDO
//! command specifier to classify the frame.
//!
//! Both directions are pure: no state is kept between calls.
//!
//! Block segments are the one kind of SDO frame which cannot be classified without knowing the
//! state of a transfer, because their first byte is a sequence number instead of a command
//! specifier. [`decode`] always classifies by command specifier; a party which is in the middle
//! of a block transfer uses [`decode_block_segment`] instead.
use core::fmt;

use snafu::{ResultExt, Snafu};

use crate::{
    messages::{CanId, CanMessage, MAX_DATA_LENGTH},
    node_id::NodeId,
    sdo::{BlockSegment, SdoRequest, SdoResponse},
    traits::{CanReceiver, TransportError},
};

/// All SDO frames are sent with a fixed DLC of 8
pub const SDO_FRAME_LENGTH: u8 = 8;

/// Function code of server to client SDO frames (COB-ID 0x580 + node)
pub const FUNCTION_CODE_SDO_TX: u8 = 0xB;
/// Function code of client to server SDO frames (COB-ID 0x600 + node)
pub const FUNCTION_CODE_SDO_RX: u8 = 0xC;

/// Errors which can occur while decoding a CAN frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ParseError {
    /// The DLC of the frame is not the fixed SDO frame length
    #[snafu(display("SDO frames must have a DLC of 8, got {dlc}"))]
    MalformedLength {
        /// The DLC of the offending frame
        dlc: u8,
    },
    /// The command byte does not match any SDO command
    #[snafu(display("Unknown SDO command specifier 0x{command:02x}"))]
    UnknownCommandSpecifier {
        /// The first data byte of the frame
        command: u8,
    },
    /// The function code of the arbitration ID is not one of the SDO channels
    #[snafu(display("Function code 0x{function_code:x} is not an SDO channel"))]
    NotSdo {
        /// The function code found in the ID
        function_code: u8,
    },
    /// The frame uses an extended ID
    #[snafu(display("Extended ID 0x{id:08x} does not carry SDO traffic"))]
    ExtendedId {
        /// The raw ID
        id: u32,
    },
    /// The node ID part of the arbitration ID is 0
    #[snafu(display("Node ID {node_id} is not a valid SDO target"))]
    InvalidNodeId {
        /// The node ID found in the ID
        node_id: u8,
    },
}

/// Direction of an SDO frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Request sent by the client, on COB-ID 0x600 + node
    ClientToServer,
    /// Response sent by the server, on COB-ID 0x580 + node
    ServerToClient,
}

impl Direction {
    /// Get the function code used for frames in this direction
    pub fn function_code(&self) -> u8 {
        match self {
            Direction::ClientToServer => FUNCTION_CODE_SDO_RX,
            Direction::ServerToClient => FUNCTION_CODE_SDO_TX,
        }
    }

    fn from_function_code(function_code: u8) -> Result<Self, ParseError> {
        match function_code {
            FUNCTION_CODE_SDO_RX => Ok(Direction::ClientToServer),
            FUNCTION_CODE_SDO_TX => Ok(Direction::ServerToClient),
            _ => NotSdoSnafu { function_code }.fail(),
        }
    }
}

/// Classification of an SDO frame by its command specifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// An initiate frame carrying its data inline (e=1)
    Expedited,
    /// A non-expedited initiate download, or the server's acknowledgement of any initiate
    /// download
    InitiateDownload,
    /// A client initiate upload request, or the server's non-expedited initiate response
    InitiateUpload,
    /// A download segment, or its acknowledgement
    SegmentDownload,
    /// An upload segment, or the client's request for one
    SegmentUpload,
    /// Block download control frame (initiate, ack, or end)
    BlockDownload,
    /// Block upload control frame (initiate, start, ack, or end)
    BlockUpload,
    /// A data segment sent during a block transfer
    BlockSegment,
    /// An SDO abort
    Abort,
}

impl TransferType {
    fn classify(direction: Direction, command: u8) -> Result<Self, ParseError> {
        use TransferType::*;
        let cs = command >> 5;
        let expedited = (command & (1 << 1)) != 0;
        let transfer_type = match (direction, cs) {
            (Direction::ClientToServer, 0) => SegmentDownload,
            (Direction::ClientToServer, 1) if expedited => Expedited,
            (Direction::ClientToServer, 1) => InitiateDownload,
            (Direction::ClientToServer, 2) => InitiateUpload,
            (Direction::ClientToServer, 3) => SegmentUpload,
            (Direction::ClientToServer, 5) => BlockUpload,
            (Direction::ClientToServer, 6) => BlockDownload,
            (Direction::ServerToClient, 0) => SegmentUpload,
            (Direction::ServerToClient, 1) => SegmentDownload,
            (Direction::ServerToClient, 2) if expedited => Expedited,
            (Direction::ServerToClient, 2) => InitiateUpload,
            (Direction::ServerToClient, 3) => InitiateDownload,
            (Direction::ServerToClient, 5) => BlockDownload,
            (Direction::ServerToClient, 6) => BlockUpload,
            (_, 4) => Abort,
            _ => return UnknownCommandSpecifierSnafu { command }.fail(),
        };
        Ok(transfer_type)
    }

    /// Offset of the first data byte in the frame
    fn header_len(&self) -> usize {
        use TransferType::*;
        match self {
            Expedited | InitiateDownload | InitiateUpload | Abort => 4,
            SegmentDownload | SegmentUpload | BlockDownload | BlockUpload | BlockSegment => 1,
        }
    }

    /// Number of data bytes signalled by the command specifier
    fn payload_len(&self, direction: Direction, command: u8) -> u8 {
        use Direction::*;
        use TransferType::*;
        let size_indicated = (command & 1) != 0;
        match (self, direction) {
            (Expedited, _) => {
                if size_indicated {
                    4 - ((command >> 2) & 0x3)
                } else {
                    4
                }
            }
            (InitiateDownload, ClientToServer) | (InitiateUpload, ServerToClient) => {
                if size_indicated {
                    4
                } else {
                    0
                }
            }
            (InitiateDownload, ServerToClient) | (InitiateUpload, ClientToServer) => 0,
            (SegmentDownload, ClientToServer) | (SegmentUpload, ServerToClient) => {
                7 - ((command >> 1) & 0x7)
            }
            (SegmentDownload, ServerToClient) | (SegmentUpload, ClientToServer) => 0,
            (Abort, _) => 4,
            (BlockDownload | BlockUpload | BlockSegment, _) => 7,
        }
    }

    /// Number of leading frame bytes which carry meaning
    fn valid_len(&self, payload_len: u8) -> usize {
        match self {
            TransferType::Abort
            | TransferType::BlockDownload
            | TransferType::BlockUpload
            | TransferType::BlockSegment => MAX_DATA_LENGTH,
            _ => self.header_len() + payload_len as usize,
        }
    }
}

/// A typed CANopen SDO frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanOpenFrame {
    /// Remote transmission request flag of the underlying frame
    pub rtr: bool,
    /// The 4-bit function code from the arbitration ID
    pub function_code: u8,
    /// Classification of the frame based on its command specifier
    pub transfer_type: TransferType,
    /// The server node the frame is addressed to or sent from
    pub node_id: NodeId,
    /// The 8 frame bytes, starting with the command byte. Bytes which carry no meaning for the
    /// transfer type are always zero.
    pub payload: [u8; MAX_DATA_LENGTH],
    /// Number of data bytes signalled by the command specifier (e.g. 4 - n for an expedited
    /// frame, 7 - n for a segment)
    pub payload_len: u8,
}

impl CanOpenFrame {
    fn build(
        direction: Direction,
        node_id: NodeId,
        transfer_type: TransferType,
        mut payload: [u8; 8],
    ) -> Self {
        let payload_len = transfer_type.payload_len(direction, payload[0]);
        // Padding is zeroed, so that frames compare equal regardless of what the sender put there
        payload[transfer_type.valid_len(payload_len)..].fill(0);
        Self {
            rtr: false,
            function_code: direction.function_code(),
            transfer_type,
            node_id,
            payload,
            payload_len,
        }
    }

    /// Create a frame from raw SDO bytes, classifying it by its command specifier
    pub fn new(
        direction: Direction,
        node_id: NodeId,
        payload: [u8; 8],
    ) -> Result<Self, ParseError> {
        let transfer_type = TransferType::classify(direction, payload[0])?;
        Ok(Self::build(direction, node_id, transfer_type, payload))
    }

    /// Create the frame carrying an SDO request to `node_id`
    pub fn from_request(node_id: NodeId, request: SdoRequest) -> Self {
        Self::build(
            Direction::ClientToServer,
            node_id,
            request.transfer_type(),
            request.to_bytes(),
        )
    }

    /// Create the frame carrying an SDO response from `node_id`
    pub fn from_response(node_id: NodeId, response: SdoResponse) -> Self {
        Self::build(
            Direction::ServerToClient,
            node_id,
            response.transfer_type(),
            response.to_bytes(),
        )
    }

    /// Create the frame carrying a block segment
    pub fn from_block_segment(direction: Direction, node_id: NodeId, segment: BlockSegment) -> Self {
        Self::build(
            direction,
            node_id,
            TransferType::BlockSegment,
            segment.to_bytes(),
        )
    }

    /// Get the direction of the frame
    pub fn direction(&self) -> Direction {
        if self.function_code == FUNCTION_CODE_SDO_RX {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        }
    }

    /// Get the COB-ID the frame is sent on
    pub fn cob_id(&self) -> CanId {
        CanId::Std(((self.function_code as u16) << 7) | self.node_id.raw() as u16)
    }

    /// The command specifier byte
    pub fn command(&self) -> u8 {
        self.payload[0]
    }

    /// The data bytes signalled by the command specifier
    pub fn data(&self) -> &[u8] {
        let start = self.transfer_type.header_len();
        &self.payload[start..start + self.payload_len as usize]
    }
}

impl fmt::Display for CanOpenFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CANopen Frame: RTR={} FC=0x{:02x} ID=0x{:02x} [len={}]",
            self.rtr as u8,
            self.function_code,
            self.node_id.raw(),
            self.payload_len
        )?;
        for b in self.payload {
            write!(f, " {:02x}", b)?;
        }
        Ok(())
    }
}

fn split_id(msg: &CanMessage) -> Result<(Direction, NodeId), ParseError> {
    let id = match msg.id() {
        CanId::Std(id) => id,
        CanId::Extended(id) => return ExtendedIdSnafu { id }.fail(),
    };
    let function_code = ((id >> 7) & 0xF) as u8;
    let node_id = (id & 0x7F) as u8;
    let direction = Direction::from_function_code(function_code)?;
    let node_id = NodeId::new(node_id).map_err(|_| ParseError::InvalidNodeId { node_id })?;
    Ok((direction, node_id))
}

fn check_length(msg: &CanMessage) -> Result<(), ParseError> {
    if msg.dlc != SDO_FRAME_LENGTH {
        return MalformedLengthSnafu { dlc: msg.dlc }.fail();
    }
    Ok(())
}

/// Decode a raw CAN frame into a CANopen SDO frame
///
/// The DLC is checked before anything else, so a frame with the wrong length is always reported
/// as [`ParseError::MalformedLength`].
pub fn decode(msg: &CanMessage) -> Result<CanOpenFrame, ParseError> {
    check_length(msg)?;
    let (direction, node_id) = split_id(msg)?;
    let mut frame = CanOpenFrame::new(direction, node_id, msg.data)?;
    frame.rtr = msg.rtr;
    Ok(frame)
}

/// Decode a raw CAN frame known to be a block transfer data segment
pub fn decode_block_segment(msg: &CanMessage) -> Result<CanOpenFrame, ParseError> {
    check_length(msg)?;
    let (direction, node_id) = split_id(msg)?;
    let mut frame = CanOpenFrame::build(direction, node_id, TransferType::BlockSegment, msg.data);
    frame.rtr = msg.rtr;
    Ok(frame)
}

/// Encode a CANopen frame into a raw CAN frame
///
/// The result always has the fixed SDO DLC of 8.
pub fn encode(frame: &CanOpenFrame) -> CanMessage {
    CanMessage {
        data: frame.payload,
        dlc: SDO_FRAME_LENGTH,
        id: frame.cob_id(),
        rtr: frame.rtr,
    }
}

/// Error returned by [`read_frame`]
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum ReadFrameError {
    /// The transport failed
    #[snafu(display("Failed to read CAN frame: {source}"))]
    Read {
        /// The transport error
        source: TransportError,
    },
    /// A frame was read, but it is not a valid SDO frame
    #[snafu(display("Could not parse CAN frame to CANopen frame: {source}"))]
    Parse {
        /// The decode error
        source: ParseError,
    },
}

/// Read one frame from `receiver` without blocking, and decode it
///
/// Returns `Ok(None)` if no frame is available.
pub fn read_frame<R: CanReceiver + ?Sized>(
    receiver: &mut R,
) -> Result<Option<CanOpenFrame>, ReadFrameError> {
    let msg = match receiver.try_recv().context(ReadSnafu)? {
        Some(msg) => msg,
        None => return Ok(None),
    };
    decode(&msg).map(Some).context(ParseSnafu)
}
