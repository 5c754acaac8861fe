use core::fmt;

/// The ID of a configured CANopen node
///
/// Valid node IDs are 1 through 127. Node 0 is reserved for broadcast and cannot be the target
/// of an SDO transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u8);

impl NodeId {
    /// Create a node ID, failing if `value` is outside of 1..=127
    pub fn new(value: u8) -> Result<Self, InvalidNodeIdError> {
        if value > 0 && value < 128 {
            Ok(NodeId(value))
        } else {
            Err(InvalidNodeIdError(value))
        }
    }

    /// Get the ID as a u8
    pub fn raw(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when a value is not a valid node ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidNodeIdError(pub u8);

impl fmt::Display for InvalidNodeIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid node ID {}", self.0)
    }
}
impl core::error::Error for InvalidNodeIdError {}

impl TryFrom<u8> for NodeId {
    type Error = InvalidNodeIdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        NodeId::new(value)
    }
}

impl From<NodeId> for u8 {
    fn from(value: NodeId) -> Self {
        value.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_range() {
        assert_eq!(Err(InvalidNodeIdError(0)), NodeId::new(0));
        assert_eq!(1, NodeId::new(1).unwrap().raw());
        assert_eq!(127, NodeId::new(127).unwrap().raw());
        assert!(NodeId::try_from(128).is_err());
        assert!(NodeId::try_from(255).is_err());
    }
}
