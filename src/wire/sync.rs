//! Sync-request TLV codec.
//!
//! Payload of a `REQUEST_SYNC` packet: a Bloom sketch of the sender's
//! seen-set. TLV framing is `type(1) | length(2 BE) | value`:
//!
//! | Type | Value                                 |
//! |------|---------------------------------------|
//! | 0x01 | `m_bytes`, exactly 2 bytes (u16 BE)   |
//! | 0x02 | `k`, exactly 1 byte                   |
//! | 0x03 | filter bits, length must == `m_bytes` |
//!
//! Unknown types are skipped so newer senders can extend the payload.

use super::{Cursor, WireError};

/// TLV type byte for the filter size in bytes.
pub const TLV_M_BYTES: u8 = 0x01;

/// TLV type byte for the hash count.
pub const TLV_K: u8 = 0x02;

/// TLV type byte for the filter bits.
pub const TLV_BITS: u8 = 0x03;

/// A decoded sync request: the requester's Bloom sketch parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncRequest {
    /// Filter size in bytes; `m_bytes * 8` is the bit count.
    pub m_bytes: u16,
    /// Number of hash functions.
    pub k: u8,
    /// Packed filter bits, exactly `m_bytes` long.
    pub bits: Vec<u8>,
}

impl SyncRequest {
    /// Serialize to the TLV stream.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + 2 + 3 + 1 + 3 + self.bits.len());

        out.push(TLV_M_BYTES);
        out.extend_from_slice(&2u16.to_be_bytes());
        out.extend_from_slice(&self.m_bytes.to_be_bytes());

        out.push(TLV_K);
        out.extend_from_slice(&1u16.to_be_bytes());
        out.push(self.k);

        out.push(TLV_BITS);
        out.extend_from_slice(&(self.bits.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.bits);

        out
    }

    /// Parse a sync request from a TLV stream.
    ///
    /// Fails on truncation, on fixed-size values of the wrong length, on a
    /// missing field, or when the bits length disagrees with `m_bytes`.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut cursor = Cursor::new(data);

        let mut m_bytes: Option<u16> = None;
        let mut k: Option<u8> = None;
        let mut bits: Option<Vec<u8>> = None;

        while cursor.remaining() > 0 {
            let tlv_type = cursor.take_u8("tlv type")?;
            let len = cursor.take_u16("tlv length")? as usize;
            let value = cursor.take_slice("tlv value", len)?;

            match tlv_type {
                TLV_M_BYTES => {
                    if len != 2 {
                        return Err(WireError::BadTlvValueSize {
                            tlv: TLV_M_BYTES,
                            expected: 2,
                            got: len,
                        });
                    }
                    m_bytes = Some(u16::from_be_bytes([value[0], value[1]]));
                }
                TLV_K => {
                    if len != 1 {
                        return Err(WireError::BadTlvValueSize {
                            tlv: TLV_K,
                            expected: 1,
                            got: len,
                        });
                    }
                    k = Some(value[0]);
                }
                TLV_BITS => {
                    bits = Some(value.to_vec());
                }
                // Unknown TLVs are skipped (forward compatibility)
                _ => {}
            }
        }

        let m_bytes = m_bytes.ok_or(WireError::MissingTlv(TLV_M_BYTES))?;
        let k = k.ok_or(WireError::MissingTlv(TLV_K))?;
        let bits = bits.ok_or(WireError::MissingTlv(TLV_BITS))?;

        if bits.len() != m_bytes as usize {
            return Err(WireError::BitsLengthMismatch {
                expected: m_bytes as usize,
                got: bits.len(),
            });
        }

        Ok(Self { m_bytes, k, bits })
    }
}
