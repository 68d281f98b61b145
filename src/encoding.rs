//! Binary encoding primitives shared by the WAL and SSTable formats.
//!
//! Three encodings are used on disk:
//!
//! - **Varint**: unsigned LEB128, 1-5 bytes for 32-bit values and 1-10
//!   bytes for 64-bit values.
//! - **Fixed**: little-endian 16/32/64-bit integers.
//! - **Length-prefixed bytes**: a varint length followed by the raw bytes.
//!
//! Checksums are CRC32 (IEEE polynomial). [`crc32_update`] resumes from a
//! finalized checksum with the standard `acc ^ 0xFFFF_FFFF` framing, so an
//! incremental computation reproduces the one-shot result.

use byteorder::{ByteOrder, LittleEndian};

/// Appends a varint-encoded u32.
pub fn put_varint32(dst: &mut Vec<u8>, mut v: u32) {
    while v >= 128 {
        dst.push((v as u8) | 128);
        v >>= 7;
    }
    dst.push(v as u8);
}

/// Appends a varint-encoded u64.
pub fn put_varint64(dst: &mut Vec<u8>, mut v: u64) {
    while v >= 128 {
        dst.push((v as u8) | 128);
        v >>= 7;
    }
    dst.push(v as u8);
}

/// Exact number of bytes `put_varint64` emits for `v`.
pub fn varint_length(mut v: u64) -> usize {
    let mut len = 1;
    while v >= 128 {
        v >>= 7;
        len += 1;
    }
    len
}

/// Decodes a varint u32 from the front of `buf`. Returns the value and
/// the number of bytes consumed, or None on truncation or overflow.
pub fn get_varint32(buf: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    let mut shift = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if shift > 28 {
            return None;
        }
        if byte & 128 != 0 {
            value |= ((byte & 127) as u32) << shift;
        } else {
            value |= (byte as u32) << shift;
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// Decodes a varint u64 from the front of `buf`. Returns the value and
/// the number of bytes consumed, or None on truncation or overflow.
pub fn get_varint64(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if shift > 63 {
            return None;
        }
        if byte & 128 != 0 {
            value |= ((byte & 127) as u64) << shift;
        } else {
            value |= (byte as u64) << shift;
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// Appends a little-endian u16.
pub fn put_fixed16(dst: &mut Vec<u8>, v: u16) {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, v);
    dst.extend_from_slice(&buf);
}

/// Appends a little-endian u32.
pub fn put_fixed32(dst: &mut Vec<u8>, v: u32) {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, v);
    dst.extend_from_slice(&buf);
}

/// Appends a little-endian u64.
pub fn put_fixed64(dst: &mut Vec<u8>, v: u64) {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, v);
    dst.extend_from_slice(&buf);
}

/// Appends a varint length followed by the raw bytes.
pub fn put_length_prefixed(dst: &mut Vec<u8>, bytes: &[u8]) {
    put_varint32(dst, bytes.len() as u32);
    dst.extend_from_slice(bytes);
}

/// Decodes a length-prefixed byte string from the front of `buf`.
/// Returns the bytes and the total number of bytes consumed (prefix
/// included), or None on truncation.
pub fn get_length_prefixed(buf: &[u8]) -> Option<(&[u8], usize)> {
    let (len, prefix) = get_varint32(buf)?;
    let end = prefix.checked_add(len as usize)?;
    if end > buf.len() {
        return None;
    }
    Some((&buf[prefix..end], end))
}

/// One-shot CRC32 (IEEE) of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Continues a CRC32 computation from a finalized checksum `acc`, as if
/// `data` had been appended to the original input.
pub fn crc32_update(acc: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(acc);
    hasher.update(data);
    hasher.finalize()
}
