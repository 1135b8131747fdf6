//! # RESP2 Framing
//!
//! Purpose: Encode and parse the RESP2 frames exchanged between the driver
//! and cluster nodes, without pulling a protocol crate into either side.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Responses are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Callers provide line/write buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.
//!
//! ## Usage Notes
//!
//! - The driver uses `encode_command` + `read_response` over blocking sockets.
//! - Nodes use `RespParser` over a `BytesMut` fed by an async socket, and the
//!   `reply_*` helpers to build responses.
//! - Node-side failures travel as `-ERR <status code> <message>`; use
//!   `parse_error_reply` to recover the `Status`.

use std::io::{self, BufRead};

use bytes::{Buf, BytesMut};
use thiserror::Error;

use crate::status::Status;

/// Largest bulk string a node accepts in one argument.
pub const MAX_BULK_LEN: usize = 16 * 1024 * 1024;

/// Largest argument count a node accepts in one command.
pub const MAX_ARGS: usize = 1024;

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays.
    Array(Vec<RespValue>),
}

/// Framing failures.
#[derive(Debug, Error)]
pub enum RespError {
    /// Socket failure while reading or writing a frame.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Bytes on the wire are not valid RESP2.
    #[error("protocol error")]
    Protocol,
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
) -> Result<RespValue, RespError> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(RespError::Protocol);
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_bulk_len(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_array_len(reader, len, line_buf)
        }
        _ => Err(RespError::Protocol),
    }
}

fn parse_bulk_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> Result<RespValue, RespError> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    if len as usize > MAX_BULK_LEN {
        return Err(RespError::Protocol);
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data)?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(RespError::Protocol);
    }

    line_buf.clear();
    Ok(RespValue::Bulk(Some(data)))
}

fn parse_array_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> Result<RespValue, RespError> {
    if len <= 0 {
        return Ok(RespValue::Array(Vec::new()));
    }
    if len as usize > MAX_ARGS {
        return Err(RespError::Protocol);
    }

    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        items.push(read_response(reader, line_buf)?);
    }
    Ok(RespValue::Array(items))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> Result<(), RespError> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(RespError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        )));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(RespError::Protocol);
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> Result<i64, RespError> {
    if data.is_empty() {
        return Err(RespError::Protocol);
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }
    if idx == data.len() {
        return Err(RespError::Protocol);
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(RespError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
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

/// Incremental command parser for the node side.
///
/// Frames are only consumed from the buffer once complete, so a partial read
/// leaves the buffer untouched and the caller simply reads more bytes.
#[derive(Debug)]
pub struct RespParser {
    max_bulk_len: usize,
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RespParser {
    pub fn new() -> Self {
        RespParser {
            max_bulk_len: MAX_BULK_LEN,
        }
    }

    /// Parses one command array from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        let mut pos = 0;
        let count = match read_int_line(buf, &mut pos, b'*')? {
            Some(count) => count,
            None => return Ok(None),
        };
        if count < 0 || count as usize > MAX_ARGS {
            return Err(RespError::Protocol);
        }

        let mut args = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = match read_int_line(buf, &mut pos, b'$')? {
                Some(len) => len,
                None => return Ok(None),
            };
            if len < 0 || len as usize > self.max_bulk_len {
                return Err(RespError::Protocol);
            }
            let end = pos + len as usize;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(RespError::Protocol);
            }
            args.push(buf[pos..end].to_vec());
            pos = end + 2;
        }

        buf.advance(pos);
        Ok(Some(args))
    }
}

fn read_int_line(buf: &[u8], pos: &mut usize, prefix: u8) -> Result<Option<i64>, RespError> {
    if *pos >= buf.len() {
        return Ok(None);
    }
    if buf[*pos] != prefix {
        return Err(RespError::Protocol);
    }
    let start = *pos + 1;
    let line_end = match buf[start..].windows(2).position(|w| w == b"\r\n") {
        Some(offset) => start + offset,
        None if buf.len() - start > 20 => return Err(RespError::Protocol),
        None => return Ok(None),
    };
    let value = parse_i64(&buf[start..line_end])?;
    *pos = line_end + 2;
    Ok(Some(value))
}

pub fn reply_simple(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.extend_from_slice(b"+");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Builds `-ERR <code> <message>`.
pub fn reply_error(status: Status, message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 16);
    buf.extend_from_slice(b"-ERR ");
    buf.extend_from_slice(status.code().to_string().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn reply_integer(value: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b":");
    buf.extend_from_slice(value.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn reply_bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 16);
    buf.extend_from_slice(b"$");
    push_usize(&mut buf, data.len());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

pub fn reply_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

/// Builds an array of bulk strings.
pub fn reply_bulk_array(items: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(b'*');
    push_usize(&mut buf, items.len());
    buf.extend_from_slice(b"\r\n");
    for item in items {
        buf.extend_from_slice(&reply_bulk(item));
    }
    buf
}

/// Splits an error payload (`ERR <code> <message>`) into status and message.
///
/// Payloads without a numeric code map to `Status::ServerFailure`.
pub fn parse_error_reply(payload: &[u8]) -> (Status, String) {
    let text = String::from_utf8_lossy(payload);
    let rest = text.strip_prefix("ERR ").unwrap_or(&text);
    let mut parts = rest.splitn(2, ' ');
    let head = parts.next().unwrap_or_default();
    match head.parse::<i32>() {
        Ok(code) => (
            Status::from_code(code),
            parts.next().unwrap_or_default().to_string(),
        ),
        Err(_) => (Status::ServerFailure, rest.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encodes_command() {
        let mut buf = Vec::new();
        encode_command(&[b"GET", b"key"], &mut buf);
        assert_eq!(&buf, b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn parses_bulk_string() {
        let mut reader = Cursor::new(b"$5\r\nhello\r\n".to_vec());
        let mut line = Vec::new();
        let resp = read_response(&mut reader, &mut line).unwrap();
        assert_eq!(resp, RespValue::Bulk(Some(b"hello".to_vec())));
    }

    #[test]
    fn parses_null_bulk_string() {
        let mut reader = Cursor::new(b"$-1\r\n".to_vec());
        let mut line = Vec::new();
        let resp = read_response(&mut reader, &mut line).unwrap();
        assert_eq!(resp, RespValue::Bulk(None));
    }

    #[test]
    fn parses_nested_array() {
        let mut reader = Cursor::new(b"*2\r\n$2\r\nid\r\n:7\r\n".to_vec());
        let mut line = Vec::new();
        let resp = read_response(&mut reader, &mut line).unwrap();
        assert_eq!(
            resp,
            RespValue::Array(vec![RespValue::Bulk(Some(b"id".to_vec())), RespValue::Integer(7)])
        );
    }

    #[test]
    fn eof_is_io_error() {
        let mut reader = Cursor::new(Vec::new());
        let mut line = Vec::new();
        assert!(matches!(
            read_response(&mut reader, &mut line),
            Err(RespError::Io(_))
        ));
    }

    #[test]
    fn parser_waits_for_complete_frame() {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nke"[..]);
        assert_eq!(parser.parse(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 19);

        buf.extend_from_slice(b"y\r\n*1\r\n$4\r\nPING\r\n");
        let first = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(first, vec![b"GET".to_vec(), b"key".to_vec()]);
        let second = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(second, vec![b"PING".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn parser_rejects_garbage() {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from(&b"HELLO\r\n"[..]);
        assert!(matches!(parser.parse(&mut buf), Err(RespError::Protocol)));
    }

    #[test]
    fn error_reply_round_trips_status() {
        let reply = reply_error(Status::FilteredOut, "filtered out");
        assert_eq!(&reply, b"-ERR 27 filtered out\r\n");
        let (status, message) = parse_error_reply(&reply[1..reply.len() - 2]);
        assert_eq!(status, Status::FilteredOut);
        assert_eq!(message, "filtered out");

        let (status, message) = parse_error_reply(b"ERR unknown command");
        assert_eq!(status, Status::ServerFailure);
        assert_eq!(message, "unknown command");
    }
}
