//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode commands and parse replies for the TCP transport, working
//! on an accumulating read buffer so partial frames are simply retried once
//! more bytes arrive.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: `parse_reply` returns `Ok(None)` until a full
//!    frame is buffered and never consumes a partial one.
//! 2. **Buffer Reuse**: Callers own the output/input buffers.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use kvpool_common::{Reply, TransportError};

/// Shortest possible frame: a type byte followed by CRLF.
const MIN_FRAME_LEN: usize = 3;

/// Encodes a RESP2 array command (`name` followed by `args`) into `out`.
pub fn encode_command(name: &str, args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len() + 1);
    out.extend_from_slice(b"\r\n");
    push_bulk(out, name.as_bytes());
    for arg in args {
        push_bulk(out, arg);
    }
}

/// Parses one reply from the front of `buf`.
///
/// Returns the reply and the number of bytes it occupied, or `None` when the
/// buffer does not yet hold a complete frame.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>, TransportError> {
    let (line, mut pos) = match read_line(buf, 0)? {
        Some(found) => found,
        None => return Ok(None),
    };
    if line.is_empty() {
        return Err(protocol("empty line"));
    }

    let reply = match line[0] {
        b'+' => Reply::Simple(line[1..].to_vec()),
        b'-' => Reply::Error(line[1..].to_vec()),
        b':' => Reply::Integer(parse_i64(&line[1..])?),
        b'$' => {
            let len = parse_i64(&line[1..])?;
            if len < 0 {
                Reply::Bulk(None)
            } else {
                let end = usize::try_from(len)
                    .ok()
                    .and_then(|len| pos.checked_add(len))
                    .ok_or_else(|| protocol("bulk length out of range"))?;
                if buf.len() < end.saturating_add(2) {
                    return Ok(None);
                }
                if &buf[end..end + 2] != b"\r\n" {
                    return Err(protocol("bulk string missing CRLF"));
                }
                let data = buf[pos..end].to_vec();
                pos = end + 2;
                Reply::Bulk(Some(data))
            }
        }
        b'*' => {
            let len = usize::try_from(parse_i64(&line[1..])?).unwrap_or(0);
            // Every element takes at least three bytes ("+\r\n"), so a header
            // promising more than the buffer can hold is incomplete. This also
            // bounds the allocation below by what has actually arrived.
            if len > (buf.len() - pos) / MIN_FRAME_LEN {
                return Ok(None);
            }
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                match parse_reply(&buf[pos..])? {
                    Some((item, used)) => {
                        items.push(item);
                        pos += used;
                    }
                    None => return Ok(None),
                }
            }
            Reply::Array(items)
        }
        other => return Err(protocol(format!("unknown frame type {:?}", other as char))),
    };

    Ok(Some((reply, pos)))
}

fn push_bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.push(b'$');
    push_usize(out, data.len());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Finds the CRLF-terminated line starting at `start`.
fn read_line(buf: &[u8], start: usize) -> Result<Option<(&[u8], usize)>, TransportError> {
    let rest = &buf[start..];
    match rest.iter().position(|&b| b == b'\n') {
        Some(idx) => {
            if idx == 0 || rest[idx - 1] != b'\r' {
                return Err(protocol("line not terminated by CRLF"));
            }
            Ok(Some((&rest[..idx - 1], start + idx + 1)))
        }
        None => Ok(None),
    }
}

fn parse_i64(data: &[u8]) -> Result<i64, TransportError> {
    if data.is_empty() {
        return Err(protocol("empty integer"));
    }
    let (negative, digits) = match data[0] {
        b'-' => (true, &data[1..]),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(protocol("empty integer"));
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(protocol("invalid integer"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }

    Ok(if negative { -value } else { value })
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

fn protocol(message: impl Into<String>) -> TransportError {
    TransportError::Protocol(message.into())
}
