//! Record framing for the commit log.
//!
//! Format of one frame:
//! ```text
//! [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
//! ```

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

const CODEC_VERSION: u8 = 1;

/// Frames larger than this are treated as corruption.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Identifies consolidation commit logs.
pub const MAGIC: [u8; 4] = *b"KCLG";

/// Length of the file header written by [`write_header`].
pub const HEADER_LEN: u64 = 5;

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Serializes one value into a checksummed frame.
///
/// # Errors
///
/// Serialization failures or a payload over the frame limit.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("frame size {} exceeds maximum {MAX_FRAME_SIZE}", data.len()),
        ));
    }
    let len = u32::try_from(data.len())
        .map_err(|_| IoError::new(ErrorKind::InvalidData, "frame length overflow"))?;

    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&checksum(&data).to_le_bytes());
    Ok(out)
}

/// Reads one frame and verifies its checksum.
///
/// Returns the value and the number of bytes consumed.
///
/// # Errors
///
/// `UnexpectedEof` for a truncated frame, `InvalidData` for a bad version,
/// oversized length, checksum mismatch or undecodable payload.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<(T, u64)> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version: {} (expected {CODEC_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("frame size {len} exceeds maximum {MAX_FRAME_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);
    let computed = checksum(&data);
    if stored != computed {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored:08x}, computed={computed:08x}"),
        ));
    }

    let value = serde_json::from_slice(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))?;
    Ok((value, (1 + 4 + len + 4) as u64))
}

/// Writes the file header (magic + version).
///
/// # Errors
///
/// I/O failures.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])
}

/// Reads and validates the file header.
///
/// # Errors
///
/// `InvalidData` if the magic bytes do not match.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    Ok(version[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_length_is_reported() {
        let encoded = encode(&"hello").unwrap();
        let (value, consumed): (String, u64) = decode(&mut Cursor::new(&encoded)).unwrap();
        assert_eq!(value, "hello");
        assert_eq!(consumed, encoded.len() as u64);
    }

    #[test]
    fn test_detects_corruption() {
        let mut encoded = encode(&"consolidated").unwrap();
        encoded[8] ^= 0xFF;
        let err = decode::<String>(&mut Cursor::new(encoded)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_frame_is_eof() {
        let encoded = encode(&"consolidated").unwrap();
        let err = decode::<String>(&mut Cursor::new(&encoded[..encoded.len() - 2])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let mut bad = vec![CODEC_VERSION];
        bad.extend_from_slice(&200_000_000u32.to_le_bytes());
        let err = decode::<String>(&mut Cursor::new(bad)).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_header() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, HEADER_LEN);
        assert_eq!(read_header(&mut Cursor::new(buf)).unwrap(), CODEC_VERSION);
        assert!(read_header(&mut Cursor::new(b"KYRO\x01".to_vec())).is_err());
    }
}
