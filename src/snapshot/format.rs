//! Binary snapshot framing (spec §4.8): `magic|version|arch|flags` followed by an arch-agnostic
//! body. RAM is stored as `uncompressed_len|compressed_len|gzip-equivalent bytes`; device blobs and
//! register maps use a small self-describing `(len|bytes)` encoding so new fields can be added
//! without bumping the format version, the way the debug log's reader stays forward-tolerant of
//! unknown record kinds.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::SnapshotError;

pub const MAGIC: u32 = 0x564D_4353; // "VMCS"
pub const VERSION: u16 = 1;

pub fn write_string(out: &mut Vec<u8>, s: &str) {
    out.write_u32::<LittleEndian>(s.len() as u32).unwrap();
    out.extend_from_slice(s.as_bytes());
}

pub fn read_string(cursor: &mut &[u8]) -> Result<String, SnapshotError> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    if cursor.len() < len {
        return Err(SnapshotError::Truncated);
    }
    let (bytes, rest) = cursor.split_at(len);
    *cursor = rest;
    String::from_utf8(bytes.to_vec()).map_err(|_| SnapshotError::Truncated)
}

pub fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.write_u32::<LittleEndian>(data.len() as u32).unwrap();
    out.extend_from_slice(data);
}

pub fn read_bytes(cursor: &mut &[u8]) -> Result<Vec<u8>, SnapshotError> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    if cursor.len() < len {
        return Err(SnapshotError::Truncated);
    }
    let (bytes, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(bytes.to_vec())
}

pub fn write_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn read_u8(cursor: &mut &[u8]) -> Result<u8, SnapshotError> {
    Ok(cursor.read_u8()?)
}

pub fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.write_u16::<LittleEndian>(v).unwrap();
}

pub fn read_u16(cursor: &mut &[u8]) -> Result<u16, SnapshotError> {
    Ok(cursor.read_u16::<LittleEndian>()?)
}

pub fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.write_u32::<LittleEndian>(v).unwrap();
}

pub fn read_u32(cursor: &mut &[u8]) -> Result<u32, SnapshotError> {
    Ok(cursor.read_u32::<LittleEndian>()?)
}

pub fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.write_u64::<LittleEndian>(v).unwrap();
}

pub fn read_u64(cursor: &mut &[u8]) -> Result<u64, SnapshotError> {
    Ok(cursor.read_u64::<LittleEndian>()?)
}

/// `(idLen|id|dataLen|data)` pairs, used for both per-vCPU register maps and device blobs (spec
/// §4.8's "self-describing reflection encoder").
pub fn write_tagged_blobs(out: &mut Vec<u8>, items: &[(String, Vec<u8>)]) {
    out.write_u32::<LittleEndian>(items.len() as u32).unwrap();
    for (id, data) in items {
        write_string(out, id);
        write_bytes(out, data);
    }
}

pub fn read_tagged_blobs(cursor: &mut &[u8]) -> Result<Vec<(String, Vec<u8>)>, SnapshotError> {
    let count = cursor.read_u32::<LittleEndian>()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = read_string(cursor)?;
        let data = read_bytes(cursor)?;
        out.push((id, data));
    }
    Ok(out)
}

/// Compress `ram` with a gzip-equivalent stream, preceded by `uncompressed_size|compressed_size`.
pub fn write_compressed_ram(out: &mut Vec<u8>, ram: &[u8]) -> Result<(), SnapshotError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(ram)?;
    let compressed = encoder.finish()?;
    out.write_u64::<LittleEndian>(ram.len() as u64).unwrap();
    out.write_u64::<LittleEndian>(compressed.len() as u64).unwrap();
    out.extend_from_slice(&compressed);
    Ok(())
}

pub fn read_compressed_ram(cursor: &mut &[u8]) -> Result<Vec<u8>, SnapshotError> {
    let uncompressed_len = cursor.read_u64::<LittleEndian>()? as usize;
    let compressed_len = cursor.read_u64::<LittleEndian>()? as usize;
    if cursor.len() < compressed_len {
        return Err(SnapshotError::Truncated);
    }
    let (compressed, rest) = cursor.split_at(compressed_len);
    *cursor = rest;
    let mut decoder = GzDecoder::new(compressed);
    let mut ram = vec![0u8; uncompressed_len];
    decoder.read_exact(&mut ram)?;
    Ok(ram)
}
