use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

pub const MAX_DATAGRAM_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x4242_4D53;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct DatagramHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
}

impl DatagramHeader {
    pub fn new(sequence: u32, ack: u32, ack_bitfield: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack,
            ack_bitfield,
        }
    }

    pub fn unsequenced() -> Self {
        Self::new(0, 0, 0)
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

/// Delivery class of a payload frame, chosen from the caller's send options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub enum Delivery {
    Unreliable,
    UnreliableSequenced,
    Reliable,
    ReliableSequenced,
    ReliableOrdered,
}

impl Delivery {
    pub fn is_reliable(&self) -> bool {
        matches!(
            self,
            Delivery::Reliable | Delivery::ReliableSequenced | Delivery::ReliableOrdered
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum Frame {
    ConnectRequest {
        salt: u64,
    },
    ConnectAccept {
        salt: u64,
    },
    ConnectRefused,
    Disconnect,
    Keepalive,
    Payload {
        delivery: Delivery,
        channel: u8,
        /// Ordering or sequencing index within the channel.
        index: u32,
        /// Dedup key for reliable frames.
        message_id: u32,
        data: Vec<u8>,
    },
    Unconnected {
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Datagram {
    pub header: DatagramHeader,
    pub frame: Frame,
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

impl Datagram {
    pub fn new(header: DatagramHeader, frame: Frame) -> Self {
        Self { header, frame }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, DatagramError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(DatagramError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, DatagramError> {
        // Socket buffers carry no alignment guarantee.
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(DatagramError::Deserialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn test_payload_datagram_survives_serialization() {
        let datagram = Datagram::new(
            DatagramHeader::new(7, 3, 0b101),
            Frame::Payload {
                delivery: Delivery::ReliableOrdered,
                channel: 2,
                index: 11,
                message_id: 40,
                data: vec![116, 1, 2, 3],
            },
        );

        let bytes = datagram.serialize().unwrap();
        assert!(bytes.len() < MAX_DATAGRAM_SIZE);

        let decoded = Datagram::deserialize(&bytes).unwrap();
        assert!(decoded.header.is_valid());
        assert_eq!(decoded.header, datagram.header);
        assert_eq!(decoded.frame, datagram.frame);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Datagram::deserialize(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).is_err());
    }
}
