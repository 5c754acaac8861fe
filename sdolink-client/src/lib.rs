//! A client for reading and writing objects on CANopen nodes via SDO
//!
//! The crate provides:
//!
//! - An [SDO client](SdoClient) performing expedited, segmented and block transfers, with
//!   timeouts, retries and cancellation
//! - A [client configuration](SdoClientConfig) which can be loaded from a TOML file
//! - A [SharedPort] for using one CAN transport from several clients
//!
//! The client is synchronous: each transfer runs to completion on the calling thread, polling
//! the transport until the server responds or the configured timeout expires.
#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod config;
mod error;
mod sdo_client;
mod shared_port;
pub use sdolink_common as common;

pub use config::{ConfigError, SdoClientConfig};
pub use error::SdoClientError;
pub use sdo_client::{CancelHandle, SdoClient, TransferMode};
pub use sdolink_common::sdo::{AbortCode, RawAbortCode};
pub use shared_port::{SharedPort, SharedPortChannel, SharedPortSender};
