//! This crate implements the Sphinx onion format used to route Lightning payments.
//!
//! Sphinx \[1\] is a compact mix format: the payment originator wraps one encrypted
//! routing instruction per hop into a packet of constant size, and every hop can
//! remove exactly one layer. A hop learns its own instruction and the packet to
//! forward, but neither the route length, its position in it, nor the final
//! recipient.
//!
//! The main functionality of this crate is implemented in the [`Sphinx`] struct,
//! which holds the construction parameters and exposes [`Sphinx::create`] and
//! [`Sphinx::peel`]. The matching error-return path (the packets a failing hop
//! sends back so that only the originator can read them) lives in [`failure`].
//!
//! \[1\]: Sphinx: A Compact and Provably Secure Mix Format - George Danezis, Ian
//! Goldberg

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hmac::{Hmac, Mac};
use secp256k1::ecdh;
use secp256k1::{All, PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroize;

pub mod failure;
pub mod packet;

pub use packet::{OnionPacket, SharedSecret, SharedSecrets, PACKET_VERSION};

/// Width of the encrypted payload region in a payment onion.
pub const PAYMENT_PAYLOAD_LEN: usize = 1300;

/// Width of the encrypted payload region in a trampoline onion.
pub const TRAMPOLINE_PAYLOAD_LEN: usize = 400;

/// The maximum number of hops a route may contain.
pub const MAX_HOPS: usize = 20;

/// Size of the per-hop HMAC.
pub const MAC_LEN: usize = 32;

const KEY_RHO: &[u8] = b"rho";
const KEY_MU: &[u8] = b"mu";
const KEY_PAD: &[u8] = b"pad";

type HmacSha256 = Hmac<Sha256>;

/// Main error type for fallible Sphinx operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The route must contain between 1 and [`MAX_HOPS`] hops.
    #[error("The route length is out of bounds")]
    BadPathLength,

    /// A hop payload does not start with a length prefix matching its size.
    #[error("A hop payload is not correctly framed")]
    PayloadFraming,

    /// The per-hop payloads do not fit in the packet.
    #[error("The hop payloads exceed the packet payload width ({0} bytes)")]
    PayloadsTooLarge(usize),

    /// A length prefix was requested from a buffer too short to contain one.
    #[error("The length prefix is truncated")]
    TruncatedLengthPrefix,

    /// A received packet does not have the expected width.
    #[error("The packet has the wrong length")]
    BadPacketLength,

    /// The packet version byte is not zero. Carries the SHA-256 of the packet.
    #[error("The onion version is unknown")]
    InvalidOnionVersion([u8; 32]),

    /// The ephemeral key is not a valid secp256k1 point. Carries the SHA-256
    /// of the packet.
    #[error("The onion ephemeral key is invalid")]
    InvalidOnionKey([u8; 32]),

    /// The packet HMAC does not match. Carries the SHA-256 of the packet.
    #[error("The onion HMAC does not match")]
    InvalidOnionHmac([u8; 32]),

    /// The decrypted per-hop payload overruns the packet. Carries the SHA-256
    /// of the packet.
    #[error("The per-hop payload overruns the packet")]
    InvalidOnionPayload([u8; 32]),

    /// A failure message does not fit in the fixed-size failure packet.
    #[error("The failure message is too large")]
    FailureTooLarge,

    /// A failure packet authenticated correctly but its inner lengths are
    /// inconsistent.
    #[error("The failure packet is malformed")]
    MalformedFailure,

    /// No stored shared secret authenticates the returned failure packet.
    #[error("The failure packet could not be matched to any hop")]
    DecryptionFailed,
}

/// Result type with the error defaulting to [`enum@Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The routing instruction for a single hop, together with the node it is
/// destined for.
///
/// The payload is opaque to the onion layer except for its leading length
/// prefix (see [`peek_payload_length`]), which the construction uses to know
/// where one hop's instruction ends and the next hop's header begins.
pub struct HopPayload {
    /// Public key of the node this payload is for.
    pub pubkey: PublicKey,
    /// The routing instruction bytes, starting with their own length prefix.
    pub payload: Vec<u8>,
}

impl HopPayload {
    /// The space this hop occupies in the packet: the payload plus its
    /// trailing HMAC.
    pub fn len(&self) -> usize {
        self.payload.len() + MAC_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Checks that the payload's declared length matches its actual size.
    fn validate_framing(&self) -> Result<()> {
        match peek_payload_length(&self.payload) {
            Ok(total) if total == self.len() => Ok(()),
            _ => Err(Error::PayloadFraming),
        }
    }
}

/// The result of unwrapping one layer of an onion.
pub struct PeeledPacket {
    /// This hop's routing instruction, without the trailing HMAC.
    pub payload: Vec<u8>,
    /// The shared secret between this hop and the originator. A failing hop
    /// uses it to create or wrap the returning [`failure`] packet.
    pub shared_secret: SharedSecret,
    /// The packet to forward to the next hop. Meaningless when `is_last`.
    pub next_packet: OnionPacket,
    /// Whether this hop is the final recipient.
    pub is_last: bool,
}

/// An ephemeral key and the shared secret a hop will derive from it.
struct HopKeys {
    eph_pubkey: PublicKey,
    secret: SharedSecret,
}

/// A structure to hold Sphinx construction parameters.
///
/// The methods on this object perform the onion operations. The payload width
/// is a construction-time parameter so that payment and trampoline onions flow
/// through the same code path; both sides of a route must of course agree on
/// it.
pub struct Sphinx {
    secp: Secp256k1<All>,
    payload_len: usize,
}

impl Sphinx {
    /// Create a Sphinx instance with the given encrypted-payload width.
    pub fn new(payload_len: usize) -> Self {
        Sphinx {
            secp: Secp256k1::new(),
            payload_len,
        }
    }

    /// The standard payment onion (1300-byte payload region).
    pub fn payment() -> Self {
        Sphinx::new(PAYMENT_PAYLOAD_LEN)
    }

    /// The trampoline onion (400-byte payload region), nested inside payment
    /// onions.
    pub fn trampoline() -> Self {
        Sphinx::new(TRAMPOLINE_PAYLOAD_LEN)
    }

    /// The width of the encrypted payload region.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Computes the ephemeral key and shared secret for each hop.
    ///
    /// The session key is blinded multiplicatively at every hop, so that hop
    /// `i` receives a fresh ephemeral key yet derives the same secret from its
    /// private key alone, without learning its position.
    fn compute_keys<'a, I>(&self, session_key: &SecretKey, pubkeys: I) -> Vec<HopKeys>
    where
        I: Iterator<Item = &'a PublicKey>,
    {
        let mut blinded = *session_key;
        let mut keys = Vec::new();
        for pubkey in pubkeys {
            let eph_pubkey = PublicKey::from_secret_key(&self.secp, &blinded);
            let mut ecdh_secret = ecdh::SharedSecret::new(pubkey, &blinded);
            let secret = SharedSecret(ecdh_secret.secret_bytes());
            ecdh_secret.non_secure_erase();
            let mut blinding = blinding_factor(&eph_pubkey, &secret.0);
            let tweaked = blinded
                .mul_tweak(&Scalar::from_be_bytes(blinding).expect("blinding factor is a hash"))
                .expect("tweaked session key stays in the group");
            blinding.zeroize();
            blinded.non_secure_erase();
            blinded = tweaked;
            keys.push(HopKeys { eph_pubkey, secret });
        }
        blinded.non_secure_erase();
        keys
    }

    /// Computes the filler string.
    ///
    /// The filler is the deterministic tail that every unwrap re-creates: it
    /// simulates, at construction time, the keystream bytes that each
    /// intermediate hop's shift will push past the end of the packet. Without
    /// it the final hop's HMAC could not cover a region the intermediate hops
    /// keep rewriting.
    ///
    /// Takes the payloads and secrets of every hop except the last.
    fn generate_filler(&self, hops: &[HopPayload], keys: &[HopKeys]) -> Vec<u8> {
        let mut filler: Vec<u8> = Vec::new();
        for (hop, hop_keys) in hops.iter().zip(keys.iter()) {
            let mut rho = derive_key(KEY_RHO, &hop_keys.secret.0);
            let mut stream = generate_stream(&rho, self.payload_len + hop.len());
            filler.resize(filler.len() + hop.len(), 0);
            let to_skip = stream.len() - filler.len();
            filler
                .iter_mut()
                .zip(stream.iter().skip(to_skip))
                .for_each(|(x, y)| *x ^= *y);
            rho.zeroize();
            stream.zeroize();
        }
        filler
    }

    /// Returns an onion-encrypted packet for the given route, and the ordered
    /// list of per-hop shared secrets the originator must keep to read a
    /// returning failure packet.
    ///
    /// # Arguments
    ///
    /// * `session_key` - a fresh scalar, never reused across packets.
    /// * `hops` - the route, one payload per hop, in forwarding order.
    /// * `associated_data` - 32 bytes bound into every HMAC (typically the
    ///   payment hash), making the onion invalid outside its payment.
    pub fn create(
        &self,
        session_key: &SecretKey,
        hops: &[HopPayload],
        associated_data: &[u8; 32],
    ) -> Result<(OnionPacket, SharedSecrets)> {
        if hops.is_empty() || hops.len() > MAX_HOPS {
            return Err(Error::BadPathLength);
        }
        let mut total = 0usize;
        for hop in hops {
            hop.validate_framing()?;
            total += hop.len();
        }
        if total > self.payload_len {
            return Err(Error::PayloadsTooLarge(self.payload_len));
        }

        // Step 1: derive the ephemeral key chain and per-hop shared secrets.
        let keys = self.compute_keys(session_key, hops.iter().map(|h| &h.pubkey));

        // Step 2: compute the filler covering every hop but the last.
        let filler = self.generate_filler(&hops[..hops.len() - 1], &keys[..hops.len() - 1]);

        // Step 3: fill the payload region with keystream derived from the
        // session key, so unused space is indistinguishable from ciphertext.
        let mut pad_key = derive_key(KEY_PAD, &session_key.secret_bytes());
        let mut payload = generate_stream(&pad_key, self.payload_len);
        pad_key.zeroize();

        // Step 4: wrap the layers, from the last hop back to the first. Each
        // iteration shifts the region right, inserts this hop's payload and
        // the HMAC of the layer below, encrypts, and authenticates.
        let mut hmac = [0u8; MAC_LEN];
        for (i, (hop, hop_keys)) in hops.iter().zip(keys.iter()).enumerate().rev() {
            let shift = hop.len();
            payload.copy_within(0..self.payload_len - shift, shift);
            payload[..hop.payload.len()].copy_from_slice(&hop.payload);
            payload[hop.payload.len()..shift].copy_from_slice(&hmac);

            let mut rho = derive_key(KEY_RHO, &hop_keys.secret.0);
            let mut stream = generate_stream(&rho, self.payload_len);
            payload
                .iter_mut()
                .zip(stream.iter())
                .for_each(|(x, y)| *x ^= *y);
            rho.zeroize();
            stream.zeroize();

            // The recipient's layer ends with the filler: the upstream XORs
            // will turn it into exactly the tail each hop re-creates.
            if i == hops.len() - 1 && !filler.is_empty() {
                payload[self.payload_len - filler.len()..].copy_from_slice(&filler);
            }

            let mut mu = derive_key(KEY_MU, &hop_keys.secret.0);
            hmac = compute_hmac(&mu, &payload, associated_data);
            mu.zeroize();
        }

        let onion = OnionPacket {
            version: PACKET_VERSION,
            public_key: keys[0].eph_pubkey.serialize(),
            payload,
            hmac,
        };
        let shared_secrets = hops
            .iter()
            .zip(keys)
            .map(|(hop, k)| (k.secret, hop.pubkey))
            .collect();
        Ok((onion, shared_secrets))
    }

    /// Unwraps one layer of an onion with the receiving node's private key.
    ///
    /// On success, returns this hop's payload, the shared secret (kept for a
    /// possible failure return), the packet to forward, and whether this hop
    /// is the final recipient. Failures carry the SHA-256 of the rejected
    /// packet so the previous hop can be told exactly what was refused.
    pub fn peel(
        &self,
        private_key: &SecretKey,
        associated_data: &[u8; 32],
        packet: &OnionPacket,
    ) -> Result<PeeledPacket> {
        if packet.payload.len() != self.payload_len {
            return Err(Error::BadPacketLength);
        }
        if packet.version != PACKET_VERSION {
            return Err(Error::InvalidOnionVersion(packet.sha256()));
        }
        let eph_pubkey = PublicKey::from_slice(&packet.public_key)
            .map_err(|_| Error::InvalidOnionKey(packet.sha256()))?;
        let mut ecdh_secret = ecdh::SharedSecret::new(&eph_pubkey, private_key);
        let shared_secret = SharedSecret(ecdh_secret.secret_bytes());
        ecdh_secret.non_secure_erase();

        let mut mu = derive_key(KEY_MU, &shared_secret.0);
        let expected = compute_hmac(&mu, &packet.payload, associated_data);
        mu.zeroize();
        if expected[..].ct_eq(&packet.hmac[..]).unwrap_u8() == 0 {
            return Err(Error::InvalidOnionHmac(packet.sha256()));
        }

        // Decrypt the region extended by one packet width of zeros: the extra
        // keystream becomes the deterministic tail of the forwarded packet,
        // which is what keeps its width constant.
        let mut rho = derive_key(KEY_RHO, &shared_secret.0);
        let stream = generate_stream(&rho, 2 * self.payload_len);
        rho.zeroize();
        let mut decrypted = vec![0u8; 2 * self.payload_len];
        decrypted[..self.payload_len].copy_from_slice(&packet.payload);
        decrypted
            .iter_mut()
            .zip(stream.iter())
            .for_each(|(x, y)| *x ^= *y);

        let frame = peek_payload_length(&decrypted)
            .map_err(|_| Error::InvalidOnionPayload(packet.sha256()))?;
        if frame > self.payload_len {
            return Err(Error::InvalidOnionPayload(packet.sha256()));
        }

        let payload = decrypted[..frame - MAC_LEN].to_vec();
        let mut next_hmac = [0u8; MAC_LEN];
        next_hmac.copy_from_slice(&decrypted[frame - MAC_LEN..frame]);
        let next_payload = decrypted[frame..frame + self.payload_len].to_vec();

        let mut blinding = blinding_factor(&eph_pubkey, &shared_secret.0);
        let next_eph_pubkey = eph_pubkey
            .mul_tweak(
                &self.secp,
                &Scalar::from_be_bytes(blinding).expect("blinding factor is a hash"),
            )
            .expect("blinded ephemeral key stays on the curve");
        blinding.zeroize();

        let is_last = next_hmac == [0u8; MAC_LEN];
        Ok(PeeledPacket {
            payload,
            shared_secret,
            next_packet: OnionPacket {
                version: PACKET_VERSION,
                public_key: next_eph_pubkey.serialize(),
                payload: next_payload,
                hmac: next_hmac,
            },
            is_last,
        })
    }
}

/// Derives a sub-key from a shared secret, keyed by a fixed label.
pub(crate) fn derive_key(label: &[u8], secret: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(label).expect("HMAC accepts any key length");
    mac.update(secret);
    mac.finalize().into_bytes().into()
}

/// Generates `len` bytes of ChaCha20 keystream under the given key, with an
/// all-zero nonce.
pub(crate) fn generate_stream(key: &[u8; 32], len: usize) -> Vec<u8> {
    let mut cipher = ChaCha20::new(key.into(), &[0u8; 12].into());
    let mut stream = vec![0u8; len];
    cipher.apply_keystream(&mut stream);
    stream
}

/// HMAC-SHA256 over `data ‖ associated_data`.
pub(crate) fn compute_hmac(key: &[u8; 32], data: &[u8], associated_data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.update(associated_data);
    mac.finalize().into_bytes().into()
}

/// The function to generate blinding factors: SHA256(ephemeral key ‖ secret).
fn blinding_factor(eph_pubkey: &PublicKey, secret: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(eph_pubkey.serialize());
    hasher.update(secret);
    hasher.finalize().into()
}

/// Reads the length prefix of a per-hop payload and returns the total frame
/// size: prefix bytes, payload bytes, and the trailing HMAC.
///
/// A leading `0x00` selects the fixed-size legacy frame (65 bytes in total).
/// Any other first byte starts a variable-length integer in the standard
/// 1/3/5/9-byte big-endian prefix form.
pub fn peek_payload_length(bytes: &[u8]) -> Result<usize> {
    let first = *bytes.first().ok_or(Error::TruncatedLengthPrefix)?;
    let (prefix_len, value) = match first {
        // Legacy realm byte: a fixed 32-byte instruction follows.
        0x00 => return Ok(1 + 32 + MAC_LEN),
        0xfd => {
            let b = bytes.get(1..3).ok_or(Error::TruncatedLengthPrefix)?;
            (3, u16::from_be_bytes(b.try_into().unwrap()) as u64)
        }
        0xfe => {
            let b = bytes.get(1..5).ok_or(Error::TruncatedLengthPrefix)?;
            (5, u32::from_be_bytes(b.try_into().unwrap()) as u64)
        }
        0xff => {
            let b = bytes.get(1..9).ok_or(Error::TruncatedLengthPrefix)?;
            (9, u64::from_be_bytes(b.try_into().unwrap()))
        }
        n => (1, n as u64),
    };
    let total = value.saturating_add(prefix_len + MAC_LEN as u64);
    Ok(usize::try_from(total).unwrap_or(usize::MAX))
}
