//! §4.7 wire-protocol framing: just enough of the PostgreSQL
//! frontend/backend protocol to pass every message through unmodified
//! except the simple-query message, which is framed, inspected, and
//! (depending on the policy decision) either forwarded or answered
//! with a synthesized error.
//!
//! Grounded on `original_source/chaostrace/db_proxy/proxy_server.py`'s
//! `PostgresProtocol` helpers, reimplemented as a real length-prefixed
//! reader (§10.10) rather than the reference's "peek the first byte of
//! a 64KB recv() chunk" approach — a message can legitimately span
//! more than one TCP segment, and the reference's chunking assumption
//! doesn't hold over a real socket.

use tokio::io::{self, AsyncReadExt};

/// Simple-query message tag (`'Q'`).
pub const QUERY: u8 = b'Q';

/// SQLSTATE used for every statement this proxy blocks, matching the
/// default `code="42000"` (`syntax_error_or_access_rule_violation`) the
/// reference `create_error_response` falls back to.
pub const BLOCKED_SQLSTATE: &str = "42000";

/// One complete tagged backend/frontend message: a one-byte type tag
/// plus its payload (the four-byte length prefix, which includes
/// itself, has already been consumed).
#[derive(Debug)]
pub struct TaggedMessage {
    /// The message's type tag, e.g. `Q` for a simple query.
    pub tag: u8,
    /// Payload bytes, not including the tag or the length prefix.
    pub payload: Vec<u8>,
}

/// Read the connection's very first message: the untagged
/// `StartupMessage` (or `SSLRequest`/`CancelRequest`), which carries
/// only a four-byte length prefix, no type tag. Returns the complete
/// raw bytes (length prefix included) so the caller can relay it
/// byte-for-byte.
pub async fn read_startup_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(reader, &mut len_buf).await? {
        false => return Ok(None),
        true => {}
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 4 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "startup message length shorter than its own prefix"));
    }
    let mut body = vec![0u8; len - 4];
    reader.read_exact(&mut body).await?;
    let mut full = Vec::with_capacity(len);
    full.extend_from_slice(&len_buf);
    full.extend_from_slice(&body);
    Ok(Some(full))
}

/// Read one tagged message (every message after the startup
/// handshake carries a one-byte type tag before its length prefix).
/// Returns `None` on a clean EOF between messages.
pub async fn read_tagged_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> io::Result<Option<TaggedMessage>> {
    let mut tag_buf = [0u8; 1];
    if !read_exact_or_eof(reader, &mut tag_buf).await? {
        return Ok(None);
    }
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 4 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "message length shorter than its own prefix"));
    }
    let mut payload = vec![0u8; len - 4];
    reader.read_exact(&mut payload).await?;
    Ok(Some(TaggedMessage { tag: tag_buf[0], payload }))
}

/// Read into `buf`, returning `Ok(false)` if the stream was already at
/// EOF before any byte was read, and `Ok(true)` once `buf` is full.
async fn read_exact_or_eof<R: AsyncReadExt + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-message"));
        }
        filled += n;
    }
    Ok(true)
}

/// Reassemble a tagged message's original wire bytes (tag + length
/// prefix + payload), for forwarding a message this proxy didn't need
/// to modify.
pub fn reassemble(tag: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 4) as u32;
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.push(tag);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Extract the SQL text from a simple-query message's payload: the
/// string up to (but not including) its trailing NUL terminator.
pub fn parse_simple_query(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Build an `ErrorResponse` ('E') message body carrying `severity`,
/// `sqlstate`, and `message` fields, terminated per §4.7.
pub fn build_error_response(severity: &str, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(b'S');
    body.extend_from_slice(severity.as_bytes());
    body.push(0);
    body.push(b'C');
    body.extend_from_slice(sqlstate.as_bytes());
    body.push(0);
    body.push(b'M');
    body.extend_from_slice(message.as_bytes());
    body.push(0);
    body.push(0);

    let len = (body.len() + 4) as u32;
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(b'E');
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Build a `ReadyForQuery` ('Z') message, `status` being `b'I'` (idle,
/// not in a transaction) in every case this proxy needs.
pub fn build_ready_for_query(status: u8) -> Vec<u8> {
    vec![b'Z', 0, 0, 0, 5, status]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_query_strips_trailing_nul() {
        let mut payload = b"SELECT 1".to_vec();
        payload.push(0);
        assert_eq!(parse_simple_query(&payload), "SELECT 1");
    }

    #[test]
    fn build_error_response_has_correct_length_prefix() {
        let msg = build_error_response("ERROR", BLOCKED_SQLSTATE, "blocked");
        assert_eq!(msg[0], b'E');
        let len = u32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]) as usize;
        assert_eq!(len, msg.len() - 1);
    }

    #[test]
    fn build_ready_for_query_is_six_bytes() {
        let msg = build_ready_for_query(b'I');
        assert_eq!(msg, vec![b'Z', 0, 0, 0, 5, b'I']);
    }

    #[test]
    fn reassemble_round_trips_tag_and_payload() {
        let payload = b"hello\0".to_vec();
        let msg = reassemble(QUERY, &payload);
        assert_eq!(msg[0], QUERY);
        assert_eq!(&msg[5..], payload.as_slice());
    }
}
