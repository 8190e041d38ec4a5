use std::fmt::{Display, Formatter, Write as _};

use bytes::{Bytes, BytesMut};

pub const SERVER_NAME: &str = "lite-rtsp";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const SESSION_NOT_FOUND: StatusCode = StatusCode(454);
    pub const METHOD_NOT_VALID_IN_STATE: StatusCode = StatusCode(455);
    pub const UNSUPPORTED_TRANSPORT: StatusCode = StatusCode(461);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);
    pub const VERSION_NOT_SUPPORTED: StatusCode = StatusCode(505);

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn reason(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            408 => "Request Timeout",
            454 => "Session Not Found",
            455 => "Method Not Valid in This State",
            461 => "Unsupported Transport",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            503 => "Service Unavailable",
            505 => "RTSP Version Not Supported",
            _ => "Unknown",
        }
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.0, self.reason())
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Option<(String, Bytes)>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn header(mut self, name: &str, value: impl ToString) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.body = Some((content_type.to_string(), body.into()));
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref().map(|(_, body)| body)
    }

    /// Serialize to wire format. `CSeq` is expected among the headers when the
    /// request carried one.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        // writing into BytesMut cannot fail
        let _ = write!(buf, "RTSP/1.0 {}\r\n", self.status);
        for (name, value) in &self.headers {
            let _ = write!(buf, "{}: {}\r\n", name, value);
        }
        let _ = write!(buf, "Server: {}\r\n", SERVER_NAME);
        match &self.body {
            Some((content_type, body)) => {
                let _ = write!(
                    buf,
                    "Content-Type: {}\r\nContent-Length: {}\r\n\r\n",
                    content_type,
                    body.len()
                );
                buf.extend_from_slice(body);
            }
            None => buf.extend_from_slice(b"\r\n"),
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_without_body() {
        let response = Response::ok()
            .header("CSeq", 3)
            .header("Session", "ABCD;timeout=60");
        let text = String::from_utf8(response.encode().to_vec()).unwrap();
        assert_eq!(
            text,
            "RTSP/1.0 200 OK\r\nCSeq: 3\r\nSession: ABCD;timeout=60\r\nServer: lite-rtsp\r\n\r\n"
        );
    }

    #[test]
    fn test_encode_with_body() {
        let response = Response::ok()
            .header("CSeq", 2)
            .body("application/sdp", "v=0\r\n");
        let text = String::from_utf8(response.encode().to_vec()).unwrap();
        assert!(text.contains("Content-Type: application/sdp\r\n"));
        assert!(text.contains("Content-Length: 5\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn test_status_reason() {
        assert_eq!(StatusCode::UNSUPPORTED_TRANSPORT.to_string(), "461 Unsupported Transport");
        assert!(!StatusCode::SERVICE_UNAVAILABLE.is_success());
    }
}
