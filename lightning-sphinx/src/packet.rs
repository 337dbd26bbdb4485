//! The onion packet record and its exact wire layout.
//!
//! A packet is `version(1) ‖ ephemeral key(33) ‖ encrypted payload ‖ hmac(32)`.
//! All packets of a given payload width are byte-identically sized regardless
//! of the route length, which is what hides the route length from observers.

use secp256k1::PublicKey;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result, MAC_LEN};

/// The only packet version currently defined.
pub const PACKET_VERSION: u8 = 0;

/// A Sphinx onion packet.
///
/// The ephemeral key is kept as raw bytes on purpose: a peer handing us
/// garbage must be rejected during [`peel`](crate::Sphinx::peel), where the
/// rejection carries the hash of the offending packet, not at decode time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionPacket {
    pub version: u8,
    /// Compressed secp256k1 point, serialized.
    pub public_key: [u8; 33],
    /// The encrypted payload region. Its width is fixed per packet category.
    pub payload: Vec<u8>,
    pub hmac: [u8; MAC_LEN],
}

impl OnionPacket {
    /// The serialized size of a packet with the given payload width.
    pub fn packet_len(payload_len: usize) -> usize {
        1 + 33 + payload_len + MAC_LEN
    }

    /// Serializes the packet into its exact wire layout.
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(OnionPacket::packet_len(self.payload.len()));
        bytes.push(self.version);
        bytes.extend_from_slice(&self.public_key);
        bytes.extend_from_slice(&self.payload);
        bytes.extend_from_slice(&self.hmac);
        bytes
    }

    /// Decodes a packet of the given payload width, rejecting any other size.
    pub fn deserialize(bytes: &[u8], payload_len: usize) -> Result<Self> {
        if bytes.len() != OnionPacket::packet_len(payload_len) {
            return Err(Error::BadPacketLength);
        }
        let mut public_key = [0u8; 33];
        public_key.copy_from_slice(&bytes[1..34]);
        let mut hmac = [0u8; MAC_LEN];
        hmac.copy_from_slice(&bytes[34 + payload_len..]);
        Ok(OnionPacket {
            version: bytes[0],
            public_key,
            payload: bytes[34..34 + payload_len].to_vec(),
            hmac,
        })
    }

    /// SHA-256 of the serialized packet, quoted in rejections so the previous
    /// hop knows exactly which packet was refused.
    pub fn sha256(&self) -> [u8; 32] {
        Sha256::digest(self.serialize()).into()
    }
}

/// A shared secret between the originator and one hop.
///
/// All per-hop sub-keys are derived from this value, so it is scrubbed from
/// memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub [u8; 32]);

/// The ordered per-hop secrets the originator keeps after building a packet,
/// each paired with the hop's node key. This is what
/// [`FailurePacket::decrypt`](crate::failure::FailurePacket::decrypt) iterates
/// to attribute a returning failure to the hop that emitted it.
pub type SharedSecrets = Vec<(SharedSecret, PublicKey)>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_roundtrip() {
        let packet = OnionPacket {
            version: PACKET_VERSION,
            public_key: [0x02; 33],
            payload: vec![0x5a; 400],
            hmac: [0x33; MAC_LEN],
        };
        let bytes = packet.serialize();
        assert_eq!(bytes.len(), 466);
        let decoded = OnionPacket::deserialize(&bytes, 400).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_deserialize_rejects_bad_lengths() {
        let bytes = vec![0u8; 466];
        assert!(matches!(
            OnionPacket::deserialize(&bytes, 1300),
            Err(Error::BadPacketLength),
        ));
        assert!(matches!(
            OnionPacket::deserialize(&bytes[..465], 400),
            Err(Error::BadPacketLength),
        ));
    }
}
