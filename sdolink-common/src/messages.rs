//! Raw CAN message representation and the COB-IDs used by SDO traffic
use core::fmt;

use crate::node_id::NodeId;

/// A CAN arbitration ID, either 11-bit standard or 29-bit extended
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CanId {
    /// 29-bit extended identifier
    Extended(u32),
    /// 11-bit standard identifier
    Std(u16),
}

impl CanId {
    /// Create an extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the raw numeric ID
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// True if this is a 29-bit ID
    pub fn is_extended(&self) -> bool {
        match self {
            CanId::Extended(_) => true,
            CanId::Std(_) => false,
        }
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanId::Std(id) => write!(f, "{:03X}", id),
            CanId::Extended(id) => write!(f, "{:08X}", id),
        }
    }
}

/// The maximum number of data bytes in a classic CAN frame
pub const MAX_DATA_LENGTH: usize = 8;

/// The base ID for sending SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// The base ID for sending SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;

/// Get the COB-ID a client uses to send SDO requests to `node`
pub fn sdo_request_id(node: NodeId) -> CanId {
    CanId::Std(SDO_REQ_BASE + node.raw() as u16)
}

/// Get the COB-ID `node` uses to send SDO responses back to the client
pub fn sdo_response_id(node: NodeId) -> CanId {
    CanId::Std(SDO_RESP_BASE + node.raw() as u16)
}

/// A single CAN frame as read from or written to the bus
///
/// `data` always holds 8 bytes; bytes past `dlc` are padding and carry no meaning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanMessage {
    /// The frame payload
    pub data: [u8; MAX_DATA_LENGTH],
    /// Number of valid bytes in `data`
    pub dlc: u8,
    /// Arbitration ID
    pub id: CanId,
    /// Remote transmission request flag
    pub rtr: bool,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
            rtr: false,
        }
    }
}

impl CanMessage {
    /// Create a data frame
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than 8 bytes
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let dlc = data.len() as u8;
        if dlc > MAX_DATA_LENGTH as u8 {
            panic!(
                "Data length exceeds maximum size of {} bytes",
                MAX_DATA_LENGTH
            );
        }
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..dlc as usize].copy_from_slice(data);

        Self {
            id,
            dlc,
            data: buf,
            rtr: false,
        }
    }

    /// Create a remote frame with no data
    pub fn new_rtr(id: CanId) -> Self {
        Self {
            id,
            rtr: true,
            ..Default::default()
        }
    }

    /// Get the arbitration ID
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get the valid data bytes
    pub fn data(&self) -> &[u8] {
        let len = (self.dlc as usize).min(MAX_DATA_LENGTH);
        &self.data[0..len]
    }

    /// True if this is a remote frame
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

impl fmt::Display for CanMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CAN Frame: ID={} DLC={}", self.id, self.dlc)?;
        if self.rtr {
            write!(f, " RTR")?;
        }
        write!(f, " DATA=[")?;
        for (i, b) in self.data().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", b)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdo_cob_ids() {
        let node = NodeId::new(5).unwrap();
        assert_eq!(CanId::Std(0x605), sdo_request_id(node));
        assert_eq!(CanId::Std(0x585), sdo_response_id(node));
    }

    #[test]
    fn test_message_data_is_limited_to_dlc() {
        let msg = CanMessage::new(CanId::std(0x123), &[1, 2, 3]);
        assert_eq!(&[1, 2, 3], msg.data());
        assert_eq!([1, 2, 3, 0, 0, 0, 0, 0], msg.data);
        assert!(!msg.is_rtr());
    }

    #[test]
    fn test_display() {
        let msg = CanMessage::new(CanId::std(0x605), &[0x40, 0x00, 0x20, 0x01]);
        assert_eq!("CAN Frame: ID=605 DLC=4 DATA=[40 00 20 01]", msg.to_string());

        let rtr = CanMessage::new_rtr(CanId::extended(0x1234));
        assert_eq!("CAN Frame: ID=00001234 DLC=0 RTR DATA=[]", rtr.to_string());
    }
}
