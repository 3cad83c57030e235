//! Primitive notations of the native protocol.
//!
//! All integers are big-endian. Strings are prefixed by an unsigned 16-bit length
//! (`[string]`) or a signed 32-bit one (`[long string]`); byte blobs follow the same
//! scheme (`[short bytes]`, `[bytes]`), where a negative `[bytes]` length encodes
//! null.
use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::FrameError;

pub(crate) fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_u16(s.len() as u16);
    dst.put_slice(s.as_bytes());
}

pub(crate) fn put_long_string(dst: &mut BytesMut, s: &str) {
    dst.put_i32(s.len() as i32);
    dst.put_slice(s.as_bytes());
}

pub(crate) fn put_short_bytes(dst: &mut BytesMut, b: &[u8]) {
    dst.put_u16(b.len() as u16);
    dst.put_slice(b);
}

pub(crate) fn put_bytes(dst: &mut BytesMut, b: Option<&[u8]>) {
    match b {
        Some(b) => {
            dst.put_i32(b.len() as i32);
            dst.put_slice(b);
        }
        None => dst.put_i32(-1),
    }
}

pub(crate) fn put_string_list(dst: &mut BytesMut, list: &[String]) {
    dst.put_u16(list.len() as u16);
    for s in list {
        put_string(dst, s);
    }
}

pub(crate) fn put_string_map(dst: &mut BytesMut, map: &BTreeMap<String, String>) {
    dst.put_u16(map.len() as u16);
    for (k, v) in map {
        put_string(dst, k);
        put_string(dst, v);
    }
}

pub(crate) fn put_string_multimap(dst: &mut BytesMut, map: &BTreeMap<String, Vec<String>>) {
    dst.put_u16(map.len() as u16);
    for (k, v) in map {
        put_string(dst, k);
        put_string_list(dst, v);
    }
}

pub(crate) fn put_values(dst: &mut BytesMut, values: &[Option<Bytes>]) {
    dst.put_u16(values.len() as u16);
    for value in values {
        put_bytes(dst, value.as_deref());
    }
}

fn ensure(buf: &Bytes, n: usize, what: &str) -> Result<(), FrameError> {
    if buf.remaining() < n {
        return Err(FrameError::Body(format!(
            "truncated {what}: need {n} bytes, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut Bytes) -> Result<u8, FrameError> {
    ensure(buf, 1, "byte")?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut Bytes) -> Result<u16, FrameError> {
    ensure(buf, 2, "short")?;
    Ok(buf.get_u16())
}

pub(crate) fn get_i32(buf: &mut Bytes) -> Result<i32, FrameError> {
    ensure(buf, 4, "int")?;
    Ok(buf.get_i32())
}

pub(crate) fn get_i64(buf: &mut Bytes) -> Result<i64, FrameError> {
    ensure(buf, 8, "long")?;
    Ok(buf.get_i64())
}

fn get_utf8(buf: &mut Bytes, len: usize, what: &str) -> Result<String, FrameError> {
    ensure(buf, len, what)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| FrameError::Body(format!("{what}: {e}")))
}

pub(crate) fn get_string(buf: &mut Bytes) -> Result<String, FrameError> {
    let len = get_u16(buf)? as usize;
    get_utf8(buf, len, "string")
}

pub(crate) fn get_long_string(buf: &mut Bytes) -> Result<String, FrameError> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Err(FrameError::Body(format!("negative long string length {len}")));
    }
    get_utf8(buf, len as usize, "long string")
}

pub(crate) fn get_short_bytes(buf: &mut Bytes) -> Result<Bytes, FrameError> {
    let len = get_u16(buf)? as usize;
    ensure(buf, len, "short bytes")?;
    Ok(buf.split_to(len))
}

pub(crate) fn get_bytes(buf: &mut Bytes) -> Result<Option<Bytes>, FrameError> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    ensure(buf, len as usize, "bytes")?;
    Ok(Some(buf.split_to(len as usize)))
}

pub(crate) fn get_string_list(buf: &mut Bytes) -> Result<Vec<String>, FrameError> {
    let n = get_u16(buf)?;
    (0..n).map(|_| get_string(buf)).collect()
}

pub(crate) fn get_string_map(buf: &mut Bytes) -> Result<BTreeMap<String, String>, FrameError> {
    let n = get_u16(buf)?;
    let mut map = BTreeMap::new();
    for _ in 0..n {
        let k = get_string(buf)?;
        let v = get_string(buf)?;
        map.insert(k, v);
    }
    Ok(map)
}

pub(crate) fn get_string_multimap(
    buf: &mut Bytes,
) -> Result<BTreeMap<String, Vec<String>>, FrameError> {
    let n = get_u16(buf)?;
    let mut map = BTreeMap::new();
    for _ in 0..n {
        let k = get_string(buf)?;
        let v = get_string_list(buf)?;
        map.insert(k, v);
    }
    Ok(map)
}

pub(crate) fn get_values(buf: &mut Bytes) -> Result<Vec<Option<Bytes>>, FrameError> {
    let n = get_u16(buf)?;
    (0..n).map(|_| get_bytes(buf)).collect()
}

/// Skip a `[bytes map]`, used for custom payloads this crate does not interpret.
pub(crate) fn skip_bytes_map(buf: &mut Bytes) -> Result<(), FrameError> {
    let n = get_u16(buf)?;
    for _ in 0..n {
        get_string(buf)?;
        get_bytes(buf)?;
    }
    Ok(())
}
