//! Verification handshake TLV codec.
//!
//! Challenge and response share one symmetric TLV form carrying the
//! noise-key fingerprint, the signing-key fingerprint, and a 32-byte
//! nonce; the response additionally carries a signature of the nonce
//! under the peer's signing key. Payloads are capped at 512 bytes.
//!
//! The core never touches private keys: it moves fingerprints and
//! signatures produced by the identity collaborator.

use super::{Cursor, WireError};

/// TLV type byte for the noise-key fingerprint.
pub const TLV_NOISE_FINGERPRINT: u8 = 0x01;

/// TLV type byte for the signing-key fingerprint.
pub const TLV_SIGNING_FINGERPRINT: u8 = 0x02;

/// TLV type byte for the challenge nonce.
pub const TLV_NONCE: u8 = 0x03;

/// TLV type byte for the nonce signature (response only).
pub const TLV_SIGNATURE: u8 = 0x04;

/// Ceiling on the encoded verification payload.
pub const MAX_VERIFICATION_PAYLOAD: usize = 512;

/// A verification challenge or response.
///
/// A challenge carries no signature; a response signs the challenge nonce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationPayload {
    /// SHA-256 fingerprint of the peer's noise static key.
    pub noise_fingerprint: [u8; 32],
    /// SHA-256 fingerprint of the peer's signing key.
    pub signing_fingerprint: [u8; 32],
    /// Random 32-byte challenge nonce.
    pub nonce: [u8; 32],
    /// Signature of the nonce (response only).
    pub signature: Option<Vec<u8>>,
}

impl VerificationPayload {
    /// Construct a challenge.
    pub fn challenge(
        noise_fingerprint: [u8; 32],
        signing_fingerprint: [u8; 32],
        nonce: [u8; 32],
    ) -> Self {
        Self {
            noise_fingerprint,
            signing_fingerprint,
            nonce,
            signature: None,
        }
    }

    /// Construct a response to a challenge by attaching the nonce signature.
    pub fn respond(challenge: &Self, signature: Vec<u8>) -> Self {
        Self {
            noise_fingerprint: challenge.noise_fingerprint,
            signing_fingerprint: challenge.signing_fingerprint,
            nonce: challenge.nonce,
            signature: Some(signature),
        }
    }

    /// Whether this payload is a response.
    pub fn is_response(&self) -> bool {
        self.signature.is_some()
    }

    /// Serialize to the TLV stream.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let sig_len = self.signature.as_ref().map_or(0, |s| 3 + s.len());
        let mut out = Vec::with_capacity(3 * (3 + 32) + sig_len);

        for (tlv_type, value) in [
            (TLV_NOISE_FINGERPRINT, &self.noise_fingerprint[..]),
            (TLV_SIGNING_FINGERPRINT, &self.signing_fingerprint[..]),
            (TLV_NONCE, &self.nonce[..]),
        ] {
            out.push(tlv_type);
            out.extend_from_slice(&(value.len() as u16).to_be_bytes());
            out.extend_from_slice(value);
        }

        if let Some(sig) = &self.signature {
            out.push(TLV_SIGNATURE);
            out.extend_from_slice(&(sig.len() as u16).to_be_bytes());
            out.extend_from_slice(sig);
        }

        if out.len() > MAX_VERIFICATION_PAYLOAD {
            return Err(WireError::LengthOutOfRange {
                context: "verification payload",
            });
        }
        Ok(out)
    }

    /// Parse a verification payload from a TLV stream.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() > MAX_VERIFICATION_PAYLOAD {
            return Err(WireError::LengthOutOfRange {
                context: "verification payload",
            });
        }

        let mut cursor = Cursor::new(data);
        let mut noise_fingerprint: Option<[u8; 32]> = None;
        let mut signing_fingerprint: Option<[u8; 32]> = None;
        let mut nonce: Option<[u8; 32]> = None;
        let mut signature: Option<Vec<u8>> = None;

        while cursor.remaining() > 0 {
            let tlv_type = cursor.take_u8("tlv type")?;
            let len = cursor.take_u16("tlv length")? as usize;
            let value = cursor.take_slice("tlv value", len)?;

            match tlv_type {
                TLV_NOISE_FINGERPRINT => {
                    noise_fingerprint = Some(fixed_32(TLV_NOISE_FINGERPRINT, value)?);
                }
                TLV_SIGNING_FINGERPRINT => {
                    signing_fingerprint = Some(fixed_32(TLV_SIGNING_FINGERPRINT, value)?);
                }
                TLV_NONCE => {
                    nonce = Some(fixed_32(TLV_NONCE, value)?);
                }
                TLV_SIGNATURE => {
                    signature = Some(value.to_vec());
                }
                // Unknown TLVs are skipped (forward compatibility)
                _ => {}
            }
        }

        Ok(Self {
            noise_fingerprint: noise_fingerprint.ok_or(WireError::MissingTlv(TLV_NOISE_FINGERPRINT))?,
            signing_fingerprint: signing_fingerprint
                .ok_or(WireError::MissingTlv(TLV_SIGNING_FINGERPRINT))?,
            nonce: nonce.ok_or(WireError::MissingTlv(TLV_NONCE))?,
            signature,
        })
    }
}

fn fixed_32(tlv: u8, value: &[u8]) -> Result<[u8; 32], WireError> {
    if value.len() != 32 {
        return Err(WireError::BadTlvValueSize {
            tlv,
            expected: 32,
            got: value.len(),
        });
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(value);
    Ok(out)
}
