//! Common functionality shared among other sdolink crates.
//!
//! This crate contains everything needed to put SDO traffic on a CAN bus and read it back,
//! without any of the transfer state:
//!
//! - [`CanMessage`], the raw CAN frame exchanged with a transport
//! - The [frame codec](frame), converting raw frames to and from [`CanOpenFrame`]s
//! - Typed [SDO messages](sdo) with their bit-exact command specifier encoding
//! - The [transport traits](traits) a CAN driver implements to be used by the client
//!
//! Most users will have no reason to depend on this crate directly, as it is re-exported by
//! `sdolink-client`.
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod frame;
pub mod messages;
pub mod node_id;
pub mod sdo;
pub mod traits;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
mod socketcan;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub use socketcan::{open_socketcan, SocketCanPort};

pub use frame::{
    decode, decode_block_segment, encode, read_frame, CanOpenFrame, Direction, ParseError,
    ReadFrameError, TransferType,
};
pub use messages::{CanId, CanMessage};
pub use node_id::{InvalidNodeIdError, NodeId};
pub use sdo::{AbortCode, RawAbortCode};
pub use traits::{CanReceiver, CanSender, TransportError};
