#![forbid(unsafe_code)]
//! Little-endian field accessors shared by the on-disk layouts.
//!
//! Every persisted struct in the engine is laid out at explicit byte offsets.
//! These helpers decode and encode those fields with bounds checks so that a
//! truncated buffer surfaces as [`StorageError::Corruption`] instead of a panic.

use crate::types::{Result, StorageError};

fn field<const N: usize>(src: &[u8], off: usize) -> Result<[u8; N]> {
    src.get(off..off + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(StorageError::Corruption("field out of bounds"))
}

fn field_mut<const N: usize>(dst: &mut [u8], off: usize) -> Result<&mut [u8]> {
    dst.get_mut(off..off + N)
        .ok_or(StorageError::Invalid("field out of bounds"))
}

/// Reads a `u8` at `off`.
pub fn read_u8(src: &[u8], off: usize) -> Result<u8> {
    Ok(field::<1>(src, off)?[0])
}

/// Reads a little-endian `u16` at `off`.
pub fn read_u16(src: &[u8], off: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(field(src, off)?))
}

/// Reads a little-endian `u32` at `off`.
pub fn read_u32(src: &[u8], off: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(field(src, off)?))
}

/// Reads a little-endian `i32` at `off`.
pub fn read_i32(src: &[u8], off: usize) -> Result<i32> {
    Ok(i32::from_le_bytes(field(src, off)?))
}

/// Reads a little-endian `i64` at `off`.
pub fn read_i64(src: &[u8], off: usize) -> Result<i64> {
    Ok(i64::from_le_bytes(field(src, off)?))
}

/// Reads a little-endian `u64` at `off`.
pub fn read_u64(src: &[u8], off: usize) -> Result<u64> {
    Ok(u64::from_le_bytes(field(src, off)?))
}

/// Writes a `u8` at `off`.
pub fn write_u8(dst: &mut [u8], off: usize, value: u8) -> Result<()> {
    field_mut::<1>(dst, off)?[0] = value;
    Ok(())
}

/// Writes a little-endian `u16` at `off`.
pub fn write_u16(dst: &mut [u8], off: usize, value: u16) -> Result<()> {
    field_mut::<2>(dst, off)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Writes a little-endian `u32` at `off`.
pub fn write_u32(dst: &mut [u8], off: usize, value: u32) -> Result<()> {
    field_mut::<4>(dst, off)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Writes a little-endian `i32` at `off`.
pub fn write_i32(dst: &mut [u8], off: usize, value: i32) -> Result<()> {
    field_mut::<4>(dst, off)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Writes a little-endian `i64` at `off`.
pub fn write_i64(dst: &mut [u8], off: usize, value: i64) -> Result<()> {
    field_mut::<8>(dst, off)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Writes a little-endian `u64` at `off`.
pub fn write_u64(dst: &mut [u8], off: usize, value: u64) -> Result<()> {
    field_mut::<8>(dst, off)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Decodes an optional page number stored as a signed integer (`-1` = none).
pub fn read_page_ref(src: &[u8], off: usize) -> Result<Option<u64>> {
    let raw = read_i64(src, off)?;
    match raw {
        -1 => Ok(None),
        n if n >= 0 => Ok(Some(n as u64)),
        _ => Err(StorageError::Corruption("negative page number")),
    }
}

/// Encodes an optional page number as a signed integer (`-1` = none).
pub fn write_page_ref(dst: &mut [u8], off: usize, value: Option<u64>) -> Result<()> {
    write_i64(dst, off, value.map(|n| n as i64).unwrap_or(-1))
}
