//! Framing helpers shared by the oracle, the dispatcher and the client
//!
//! Everything here is pure: no I/O, just the byte-level shapes of the
//! messages and the bounds checks applied before any payload is allocated.

use crate::error::{Error, Result};
use crate::protocol::control::{CLOSE_SENTINEL, INIT_DOWNLOAD};
use crate::protocol::{INT_FIELD_LEN, MAX_PATH_LEN};

/// Encode a wire integer (network byte order)
pub fn encode_int(v: i32) -> [u8; INT_FIELD_LEN] {
    v.to_be_bytes()
}

/// Decode a wire integer (network byte order)
pub fn decode_int(raw: [u8; INT_FIELD_LEN]) -> i32 {
    i32::from_be_bytes(raw)
}

/// Leading field of a sign-batch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchHeader {
    Count(usize),
    Close,
}

/// Parse the batch-count field. Rejects negative counts other than the
/// close sentinel and counts above `max_batch`.
pub fn parse_batch_header(raw: [u8; INT_FIELD_LEN], max_batch: usize) -> Result<BatchHeader> {
    let count = decode_int(raw);
    if count == CLOSE_SENTINEL {
        return Ok(BatchHeader::Close);
    }
    if count < 0 {
        return Err(Error::protocol(format!("negative batch count: {count}")));
    }
    let count = count as usize;
    if count > max_batch {
        return Err(Error::protocol(format!(
            "batch too large: {count} elements (max: {max_batch})"
        )));
    }
    Ok(BatchHeader::Count(count))
}

/// Total payload size for `count` elements of `width` bytes
pub fn batch_payload_len(count: usize, width: usize) -> Result<usize> {
    count
        .checked_mul(width)
        .ok_or_else(|| Error::protocol("batch payload length overflows"))
}

/// Validate a chunk-size field against the space the caller has for it
pub fn parse_chunk_size(raw: [u8; INT_FIELD_LEN], capacity: usize) -> Result<usize> {
    let size = decode_int(raw);
    if size < 0 {
        return Err(Error::protocol(format!("negative chunk size: {size}")));
    }
    let size = size as usize;
    if size > capacity {
        return Err(Error::protocol(format!(
            "chunk too large: {size} bytes (room for {capacity})"
        )));
    }
    Ok(size)
}

/// Build a download-init message: indicator | path length | path bytes
pub fn encode_download_init(path: &str) -> Result<Vec<u8>> {
    let bytes = path.as_bytes();
    if bytes.is_empty() {
        return Err(Error::protocol("download path is empty"));
    }
    if bytes.len() > MAX_PATH_LEN {
        return Err(Error::protocol(format!(
            "download path too long: {} bytes (max: {MAX_PATH_LEN})",
            bytes.len()
        )));
    }
    let mut msg = Vec::with_capacity(2 * INT_FIELD_LEN + bytes.len());
    msg.extend_from_slice(&encode_int(INIT_DOWNLOAD));
    msg.extend_from_slice(&encode_int(bytes.len() as i32));
    msg.extend_from_slice(bytes);
    Ok(msg)
}

/// Left-pad a big-endian integer to exactly `width` bytes. Leading zero bytes
/// beyond `width` are stripped; any other overflow is an error, never a
/// truncation.
pub fn pad_to_width(value: &[u8], width: usize) -> Result<Vec<u8>> {
    let first_nonzero = value.iter().position(|&b| b != 0).unwrap_or(value.len());
    let significant = &value[first_nonzero..];
    if significant.len() > width {
        return Err(Error::protocol(format!(
            "value needs {} bytes, element width is {width}",
            significant.len()
        )));
    }
    let mut out = vec![0u8; width];
    out[width - significant.len()..].copy_from_slice(significant);
    Ok(out)
}

/// Build a sign-batch request: count | elements, each padded to `width`
pub fn encode_batch(values: &[Vec<u8>], width: usize) -> Result<Vec<u8>> {
    let count = i32::try_from(values.len())
        .map_err(|_| Error::protocol(format!("batch of {} values", values.len())))?;
    let mut msg = Vec::with_capacity(INT_FIELD_LEN + batch_payload_len(values.len(), width)?);
    msg.extend_from_slice(&encode_int(count));
    for v in values {
        msg.extend_from_slice(&pad_to_width(v, width)?);
    }
    Ok(msg)
}

/// Split a batch payload into its fixed-width elements
pub fn split_batch(payload: &[u8], width: usize) -> Result<Vec<Vec<u8>>> {
    if width == 0 || payload.len() % width != 0 {
        return Err(Error::protocol(format!(
            "batch payload of {} bytes is not a multiple of {width}",
            payload.len()
        )));
    }
    Ok(payload.chunks_exact(width).map(|c| c.to_vec()).collect())
}
