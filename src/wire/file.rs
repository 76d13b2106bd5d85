//! File packet TLV codec.
//!
//! A file payload is a stream of TLVs, repeated until the end of the
//! buffer:
//!
//! | Type | Name      | Length field | Value            |
//! |------|-----------|--------------|------------------|
//! | 0x01 | FILE_NAME | u16 BE       | UTF-8 name       |
//! | 0x02 | FILE_SIZE | u16 BE       | exactly 4 B, u32 |
//! | 0x03 | MIME_TYPE | u16 BE       | UTF-8 mime       |
//! | 0x04 | CONTENT   | u32 BE       | raw bytes        |
//!
//! The decoder tolerates reordering and missing optional TLVs, and
//! concatenates repeated CONTENT TLVs. Unknown type bytes and lengths that
//! run off the buffer fail decode; so does empty content. The total
//! payload shares the 1 MiB ceiling with voice notes.

use super::{Cursor, WireError, MAX_FILE_PAYLOAD};

/// TLV type byte for the file name.
pub const TLV_FILE_NAME: u8 = 0x01;

/// TLV type byte for the declared file size.
pub const TLV_FILE_SIZE: u8 = 0x02;

/// TLV type byte for the mime type.
pub const TLV_MIME_TYPE: u8 = 0x03;

/// TLV type byte for the content.
pub const TLV_CONTENT: u8 = 0x04;

/// Default file name substituted when the TLV is absent.
pub const DEFAULT_FILE_NAME: &str = "file";

/// Default mime type substituted when the TLV is absent.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Max encoded length of the name and mime strings.
const MAX_STRING_LEN: usize = u16::MAX as usize;

/// A decoded file transfer payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilePacket {
    /// File name, defaulted to `"file"` when absent on the wire.
    pub file_name: String,
    /// Declared size; defaulted to `content.len()` when absent.
    pub file_size: u32,
    /// Mime type, defaulted to `"application/octet-stream"` when absent.
    pub mime_type: String,
    /// File bytes. Never empty after a successful decode.
    pub content: Vec<u8>,
}

impl FilePacket {
    /// Construct a file packet, deriving `file_size` from the content.
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, content: Vec<u8>) -> Self {
        let file_size = content.len() as u32;
        Self {
            file_name: file_name.into(),
            file_size,
            mime_type: mime_type.into(),
            content,
        }
    }

    /// Serialize to the TLV stream.
    ///
    /// Name and mime are silently truncated to 65535 bytes. Fails when the
    /// content is empty or exceeds the 1 MiB ceiling.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.content.is_empty() {
            return Err(WireError::EmptyContent);
        }
        if self.content.len() > MAX_FILE_PAYLOAD {
            return Err(WireError::ContentOversize {
                limit: MAX_FILE_PAYLOAD,
            });
        }

        let name = truncate_utf8(&self.file_name, MAX_STRING_LEN);
        let mime = truncate_utf8(&self.mime_type, MAX_STRING_LEN);

        let mut out =
            Vec::with_capacity(3 + name.len() + 3 + 4 + 3 + mime.len() + 5 + self.content.len());

        out.push(TLV_FILE_NAME);
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name.as_bytes());

        out.push(TLV_FILE_SIZE);
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&self.file_size.to_be_bytes());

        out.push(TLV_MIME_TYPE);
        out.extend_from_slice(&(mime.len() as u16).to_be_bytes());
        out.extend_from_slice(mime.as_bytes());

        out.push(TLV_CONTENT);
        out.extend_from_slice(&(self.content.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.content);

        Ok(out)
    }

    /// Parse a file packet from a TLV stream.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut cursor = Cursor::new(data);

        let mut file_name: Option<String> = None;
        let mut file_size: Option<u32> = None;
        let mut mime_type: Option<String> = None;
        let mut content: Vec<u8> = Vec::new();

        while cursor.remaining() > 0 {
            let tlv_type = cursor.take_u8("tlv type")?;
            match tlv_type {
                TLV_FILE_NAME => {
                    let len = cursor.take_u16("file name length")? as usize;
                    let value = cursor.take_slice("file name", len)?;
                    file_name = Some(String::from_utf8_lossy(value).into_owned());
                }
                TLV_FILE_SIZE => {
                    let len = cursor.take_u16("file size length")? as usize;
                    if len != 4 {
                        return Err(WireError::BadFileSizeValue(len));
                    }
                    file_size = Some(cursor.take_u32("file size")?);
                }
                TLV_MIME_TYPE => {
                    let len = cursor.take_u16("mime length")? as usize;
                    let value = cursor.take_slice("mime type", len)?;
                    mime_type = Some(String::from_utf8_lossy(value).into_owned());
                }
                TLV_CONTENT => {
                    let len = cursor.take_u32("content length")? as usize;
                    let value = cursor.take_slice("content", len)?;
                    // Multiple CONTENT TLVs concatenate
                    content.extend_from_slice(value);
                    if content.len() > MAX_FILE_PAYLOAD {
                        return Err(WireError::ContentOversize {
                            limit: MAX_FILE_PAYLOAD,
                        });
                    }
                }
                other => return Err(WireError::UnknownTlvType(other)),
            }
        }

        if content.is_empty() {
            return Err(WireError::EmptyContent);
        }

        Ok(Self {
            file_name: file_name.unwrap_or_else(|| DEFAULT_FILE_NAME.to_string()),
            file_size: file_size.unwrap_or(content.len() as u32),
            mime_type: mime_type.unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            content,
        })
    }
}

/// Truncate a string to at most `max` bytes on a char boundary.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
