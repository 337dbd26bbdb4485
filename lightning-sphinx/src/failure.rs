//! Failure onions: the authenticated error packets that travel backward along
//! a payment route.
//!
//! When a hop cannot forward a payment, it builds a fixed-size failure packet
//! keyed to the shared secret it derived while peeling the onion. Every
//! upstream hop adds one more encryption layer with its own shared secret, so
//! an observer on the return path sees only ciphertext of constant width. The
//! originator, who kept the ordered list of shared secrets, strips the layers
//! one by one until a MAC verifies; the layer that verifies identifies the
//! hop that emitted the failure.

use secp256k1::PublicKey;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::packet::{SharedSecret, SharedSecrets};
use crate::{compute_hmac, derive_key, generate_stream, Error, Result, MAC_LEN};

/// Space available for the failure message and its padding, combined.
pub const FAILURE_DATA_LEN: usize = 256;

/// The fixed size of a failure packet:
/// `hmac(32) ‖ len(2) ‖ message ‖ len(2) ‖ padding`.
pub const FAILURE_PACKET_LEN: usize = MAC_LEN + 2 + FAILURE_DATA_LEN + 2;

const KEY_UM: &[u8] = b"um";
const KEY_AMMAG: &[u8] = b"ammag";

// Failure code flags.
const BADONION: u16 = 0x8000;
const PERM: u16 = 0x4000;
const NODE: u16 = 0x2000;

/// A decoded failure message, as carried inside a failure packet.
///
/// Messages are encoded as a big-endian `u16` code followed by code-specific
/// data. Codes this crate does not know are preserved as [`Unknown`] so they
/// survive a decode/encode round trip.
///
/// [`Unknown`]: FailureMessage::Unknown
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureMessage {
    /// The realm byte of the per-hop payload is not understood.
    InvalidRealm,
    /// The processing node is temporarily unable to forward.
    TemporaryNodeFailure,
    /// The processing node refuses to forward.
    PermanentNodeFailure,
    /// The onion version byte was not zero.
    InvalidOnionVersion { sha256: [u8; 32] },
    /// The onion HMAC did not verify.
    InvalidOnionHmac { sha256: [u8; 32] },
    /// The onion ephemeral key was not a valid curve point.
    InvalidOnionKey { sha256: [u8; 32] },
    /// The next hop named in the payload is not a peer of the processing node.
    UnknownNextPeer,
    /// The final node rejected the payment.
    ///
    /// Three encodings are in circulation, captured by [`PaymentDetails`].
    /// Decoding accepts all three; encoding emits exactly the form the value
    /// carries, which is the richest form for that value.
    IncorrectOrUnknownPaymentDetails(PaymentDetails),
    /// A failure code this crate does not recognize, kept verbatim.
    Unknown { code: u16, data: Vec<u8> },
}

/// The data carried by [`IncorrectOrUnknownPaymentDetails`], mirroring its
/// three historical wire encodings. A block height without an amount does not
/// exist on the wire and cannot be represented here.
///
/// [`IncorrectOrUnknownPaymentDetails`]: FailureMessage::IncorrectOrUnknownPaymentDetails
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentDetails {
    /// The original encoding, carrying no data.
    Empty,
    /// The amount offered in the rejected HTLC.
    Amount { htlc_msat: u64 },
    /// Amount and the block height it was rejected at, the current form.
    AmountAndHeight { htlc_msat: u64, height: u32 },
}

impl FailureMessage {
    /// The failure code of this message.
    pub fn code(&self) -> u16 {
        match self {
            FailureMessage::InvalidRealm => PERM | 1,
            FailureMessage::TemporaryNodeFailure => NODE | 2,
            FailureMessage::PermanentNodeFailure => PERM | NODE | 2,
            FailureMessage::InvalidOnionVersion { .. } => BADONION | PERM | 4,
            FailureMessage::InvalidOnionHmac { .. } => BADONION | PERM | 5,
            FailureMessage::InvalidOnionKey { .. } => BADONION | PERM | 6,
            FailureMessage::UnknownNextPeer => PERM | 10,
            FailureMessage::IncorrectOrUnknownPaymentDetails(..) => PERM | 15,
            FailureMessage::Unknown { code, .. } => *code,
        }
    }

    /// Encodes the message as `code(2) ‖ data`.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.code().to_be_bytes().to_vec();
        match self {
            FailureMessage::InvalidOnionVersion { sha256 }
            | FailureMessage::InvalidOnionHmac { sha256 }
            | FailureMessage::InvalidOnionKey { sha256 } => bytes.extend_from_slice(sha256),
            FailureMessage::IncorrectOrUnknownPaymentDetails(details) => match details {
                PaymentDetails::Empty => {}
                PaymentDetails::Amount { htlc_msat } => {
                    bytes.extend_from_slice(&htlc_msat.to_be_bytes());
                }
                PaymentDetails::AmountAndHeight { htlc_msat, height } => {
                    bytes.extend_from_slice(&htlc_msat.to_be_bytes());
                    bytes.extend_from_slice(&height.to_be_bytes());
                }
            },
            FailureMessage::Unknown { data, .. } => bytes.extend_from_slice(data),
            _ => {}
        }
        bytes
    }

    /// Decodes a message from `code(2) ‖ data`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::MalformedFailure);
        }
        let code = u16::from_be_bytes(bytes[..2].try_into().unwrap());
        let data = &bytes[2..];
        let read_sha256 = || -> Result<[u8; 32]> {
            data.try_into().map_err(|_| Error::MalformedFailure)
        };
        let message = match code {
            c if c == PERM | 1 => FailureMessage::InvalidRealm,
            c if c == NODE | 2 => FailureMessage::TemporaryNodeFailure,
            c if c == PERM | NODE | 2 => FailureMessage::PermanentNodeFailure,
            c if c == BADONION | PERM | 4 => FailureMessage::InvalidOnionVersion {
                sha256: read_sha256()?,
            },
            c if c == BADONION | PERM | 5 => FailureMessage::InvalidOnionHmac {
                sha256: read_sha256()?,
            },
            c if c == BADONION | PERM | 6 => FailureMessage::InvalidOnionKey {
                sha256: read_sha256()?,
            },
            c if c == PERM | 10 => FailureMessage::UnknownNextPeer,
            c if c == PERM | 15 => {
                FailureMessage::IncorrectOrUnknownPaymentDetails(match data.len() {
                    0 => PaymentDetails::Empty,
                    8 => PaymentDetails::Amount {
                        htlc_msat: u64::from_be_bytes(data.try_into().unwrap()),
                    },
                    12 => PaymentDetails::AmountAndHeight {
                        htlc_msat: u64::from_be_bytes(data[..8].try_into().unwrap()),
                        height: u32::from_be_bytes(data[8..].try_into().unwrap()),
                    },
                    _ => return Err(Error::MalformedFailure),
                })
            }
            code => FailureMessage::Unknown {
                code,
                data: data.to_vec(),
            },
        };
        Ok(message)
    }
}

/// A failure packet, always [`FAILURE_PACKET_LEN`] bytes on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailurePacket(pub [u8; FAILURE_PACKET_LEN]);

impl FailurePacket {
    /// Builds the failure packet a failing hop sends backward, already
    /// encrypted with that hop's own shared secret.
    pub fn create(shared_secret: &SharedSecret, message: &FailureMessage) -> Result<Self> {
        let encoded = message.encode();
        if encoded.len() > FAILURE_DATA_LEN {
            return Err(Error::FailureTooLarge);
        }
        let pad_len = FAILURE_DATA_LEN - encoded.len();

        let mut packet = [0u8; FAILURE_PACKET_LEN];
        packet[MAC_LEN..MAC_LEN + 2].copy_from_slice(&(encoded.len() as u16).to_be_bytes());
        packet[MAC_LEN + 2..MAC_LEN + 2 + encoded.len()].copy_from_slice(&encoded);
        packet[MAC_LEN + 2 + encoded.len()..MAC_LEN + 4 + encoded.len()]
            .copy_from_slice(&(pad_len as u16).to_be_bytes());
        // The padding itself stays zero; the stream cipher hides it.

        let mut um = derive_key(KEY_UM, &shared_secret.0);
        let mac = compute_hmac(&um, &packet[MAC_LEN..], &[]);
        um.zeroize();
        packet[..MAC_LEN].copy_from_slice(&mac);

        Ok(FailurePacket(packet).wrap(shared_secret))
    }

    /// Adds one encryption layer for an upstream hop. Size is preserved, and
    /// wrapping with the same secret twice cancels out.
    pub fn wrap(&self, shared_secret: &SharedSecret) -> Self {
        let mut ammag = derive_key(KEY_AMMAG, &shared_secret.0);
        let stream = generate_stream(&ammag, FAILURE_PACKET_LEN);
        ammag.zeroize();
        let mut wrapped = self.0;
        wrapped
            .iter_mut()
            .zip(stream.iter())
            .for_each(|(x, y)| *x ^= *y);
        FailurePacket(wrapped)
    }

    /// Strips layers with the originator's stored shared secrets until one of
    /// them authenticates the packet, identifying the failing hop.
    ///
    /// The secrets must be in route order, as returned by
    /// [`Sphinx::create`](crate::Sphinx::create).
    pub fn decrypt(&self, shared_secrets: &SharedSecrets) -> Result<(PublicKey, FailureMessage)> {
        let mut packet = self.clone();
        for (secret, hop_pubkey) in shared_secrets {
            packet = packet.wrap(secret);
            let mut um = derive_key(KEY_UM, &secret.0);
            let mac = compute_hmac(&um, &packet.0[MAC_LEN..], &[]);
            um.zeroize();
            if mac[..].ct_eq(&packet.0[..MAC_LEN]).unwrap_u8() == 1 {
                let message = decode_body(&packet.0[MAC_LEN..])?;
                return Ok((*hop_pubkey, message));
            }
        }
        Err(Error::DecryptionFailed)
    }
}

/// Decodes `len(2) ‖ message ‖ len(2) ‖ padding` once the MAC has verified.
fn decode_body(body: &[u8]) -> Result<FailureMessage> {
    let message_len = u16::from_be_bytes(body[..2].try_into().unwrap()) as usize;
    if message_len > FAILURE_DATA_LEN {
        return Err(Error::MalformedFailure);
    }
    let message = &body[2..2 + message_len];
    let pad_len =
        u16::from_be_bytes(body[2 + message_len..4 + message_len].try_into().unwrap()) as usize;
    if message_len + pad_len != FAILURE_DATA_LEN {
        return Err(Error::MalformedFailure);
    }
    FailureMessage::decode(message)
}
