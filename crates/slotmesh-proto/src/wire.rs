//! Checked read/write helpers shared by the codecs.
//!
//! Every read validates the remaining length first so that decoding
//! arbitrary bytes can only ever produce a `ProtoError`, never a panic.

use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

use crate::error::{ProtoError, ProtoResult};

/// Largest string length prefix a decoder will accept. Ids and names on
/// the mesh are short; anything bigger is a framing error.
const MAX_STRING_LEN: i32 = 4096;

pub(crate) fn get_i32(buf: &mut &[u8]) -> ProtoResult<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub(crate) fn get_u8(buf: &mut &[u8]) -> ProtoResult<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_uuid(buf: &mut &[u8]) -> ProtoResult<Uuid> {
    ensure(buf, 16)?;
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

/// Reads a length-prefixed UTF-8 string.
pub(crate) fn get_string(buf: &mut &[u8], field: &'static str) -> ProtoResult<String> {
    let len = get_i32(buf)?;
    if !(0..=MAX_STRING_LEN).contains(&len) {
        return Err(ProtoError::BadLength(len));
    }
    let len = len as usize;
    ensure(buf, len)?;
    let raw = &buf[..len];
    let s = std::str::from_utf8(raw)
        .map_err(|_| ProtoError::BadUtf8 { field })?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

/// Like [`get_string`] but rejects the empty string, for id fields.
pub(crate) fn get_id(buf: &mut &[u8], field: &'static str) -> ProtoResult<String> {
    let s = get_string(buf, field)?;
    if s.is_empty() {
        return Err(ProtoError::Empty { field });
    }
    Ok(s)
}

pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn expect_end(buf: &[u8]) -> ProtoResult<()> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(ProtoError::TrailingBytes(buf.len()))
    }
}

fn ensure(buf: &[u8], wanted: usize) -> ProtoResult<()> {
    if buf.len() < wanted {
        Err(ProtoError::Truncated {
            wanted: wanted - buf.len(),
            remaining: buf.len(),
        })
    } else {
        Ok(())
    }
}
