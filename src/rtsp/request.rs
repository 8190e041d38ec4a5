use bytes::{Buf, Bytes, BytesMut};

use crate::error::{MediaError, ProtocolFault};

/// Largest request head plus body accepted from a client.
pub const MAX_REQUEST_SIZE: usize = 8 * 1024;

pub const RTSP_VERSION: &str = "RTSP/1.0";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
    GetParameter,
    SetParameter,
    Unknown,
}

impl Method {
    pub fn parse(name: &str) -> Self {
        match name {
            "OPTIONS" => Method::Options,
            "DESCRIBE" => Method::Describe,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "PAUSE" => Method::Pause,
            "TEARDOWN" => Method::Teardown,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            _ => Method::Unknown,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub method_name: String,
    pub uri: String,
    pub version: String,
    headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq").and_then(|v| v.trim().parse().ok())
    }

    /// Session id from the `Session` header, without the `;timeout=` suffix.
    pub fn session_id(&self) -> Option<&str> {
        self.header("Session")
            .map(|v| v.split(';').next().unwrap_or_default().trim())
            .filter(|id| !id.is_empty())
    }

    /// Absolute path of the request URI (`rtsp://host:554/vs0/track1` ->
    /// `/vs0/track1`).
    pub fn path(&self) -> &str {
        uri_path(&self.uri)
    }
}

pub fn uri_path(uri: &str) -> &str {
    let rest = match uri.find("://") {
        Some(pos) => &uri[pos + 3..],
        None => return uri,
    };
    match rest.find('/') {
        Some(pos) => {
            let path = &rest[pos..];
            path.split(['?', '#']).next().unwrap_or(path)
        }
        None => "/",
    }
}

/// Split a media path into its base path and the `trackN` control suffix, if
/// any: `/vs0/track1` -> (`/vs0`, Some(1)).
pub fn split_track(path: &str) -> (&str, Option<u8>) {
    let trimmed = path.trim_end_matches('/');
    if let Some(pos) = trimmed.rfind('/') {
        let last = &trimmed[pos + 1..];
        if let Some(track) = last.strip_prefix("track").and_then(|n| n.parse().ok()) {
            let base = &trimmed[..pos];
            return (if base.is_empty() { "/" } else { base }, Some(track));
        }
    }
    (if trimmed.is_empty() { "/" } else { trimmed }, None)
}

fn bad_request(detail: impl Into<String>) -> MediaError {
    MediaError::protocol(ProtocolFault::BadRequest, detail)
}

/// Frame one request out of `buf`.
///
/// Returns `Ok(None)` while the request is incomplete. Interleaved binary
/// frames (`$` + channel + length) sent by TCP clients are skipped.
pub fn parse(buf: &mut BytesMut) -> Result<Option<Request>, MediaError> {
    skip_interleaved(buf);
    if buf.is_empty() {
        return Ok(None);
    }

    let head_len = match find_head_end(buf) {
        Some(len) => len,
        None if buf.len() > MAX_REQUEST_SIZE => {
            return Err(bad_request("request head too large"));
        }
        None => return Ok(None),
    };

    let head = std::str::from_utf8(&buf[..head_len])
        .map_err(|_| bad_request("request head is not UTF-8"))?;
    let mut lines = head.split("\r\n").filter(|l| !l.is_empty());

    let request_line = lines.next().ok_or_else(|| bad_request("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let (method_name, uri, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v), None) => (m.to_string(), u.to_string(), v.to_string()),
        _ => return Err(bad_request(format!("malformed request line {:?}", request_line))),
    };

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| bad_request(format!("malformed header {:?}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let content_length = match headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("Content-Length"))
    {
        Some((_, value)) => value
            .parse::<usize>()
            .map_err(|_| bad_request("invalid Content-Length"))?,
        None => 0,
    };

    let total = head_len
        .checked_add(content_length)
        .filter(|total| *total <= MAX_REQUEST_SIZE)
        .ok_or_else(|| bad_request("request too large"))?;
    if buf.len() < total {
        return Ok(None);
    }

    let method = Method::parse(&method_name);
    buf.advance(head_len);
    let body = buf.split_to(content_length).freeze();

    Ok(Some(Request {
        method,
        method_name,
        uri,
        version,
        headers,
        body,
    }))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Drop complete interleaved frames at the front of `buf`. Returns how many
/// were dropped; on a PLAYing TCP session these are the client's RTCP
/// receiver reports.
pub fn skip_interleaved(buf: &mut BytesMut) -> usize {
    let mut skipped = 0;
    while buf.len() >= 4 && buf[0] == b'$' {
        let frame_len = 4 + u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < frame_len {
            break;
        }
        buf.advance(frame_len);
        skipped += 1;
    }
    skipped
}
