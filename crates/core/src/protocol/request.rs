use std::io::{self, BufRead};

use crate::error::{ParseErrorKind, RelayError, Result};

/// A control request from a client.
///
/// Requests use RTSP/HTTP message syntax:
///
/// ```text
/// PLAY rtsp://host:8554/test RTSP/1.0\r\n
/// CSeq: 2\r\n
/// \r\n
/// ```
///
/// Header lookup is case-insensitive.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub version: String,
    /// Headers in arrival order, names as received.
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Parse a complete request head (request line, headers, blank line).
    pub fn parse(raw: &str) -> Result<Self> {
        let parse_error = |kind| RelayError::Parse { kind };
        let mut lines = raw.lines().skip_while(|l| l.trim().is_empty());

        let request_line = lines
            .next()
            .ok_or_else(|| parse_error(ParseErrorKind::EmptyRequest))?;
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(uri), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(parse_error(ParseErrorKind::InvalidRequestLine));
        };
        if !version.starts_with("RTSP/") {
            return Err(parse_error(ParseErrorKind::InvalidRequestLine));
        }

        let headers = lines
            .take_while(|line| !line.is_empty())
            .map(|line| {
                line.split_once(':')
                    .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                    .ok_or_else(|| parse_error(ParseErrorKind::InvalidHeader))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Request {
            method: method.to_ascii_uppercase(),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Sequence number echoed in the response.
    pub fn cseq(&self) -> Option<&str> {
        self.header("CSeq")
    }

    /// Session ID without the `;timeout=` suffix.
    pub fn session_id(&self) -> Option<&str> {
        self.header("Session")
            .and_then(|s| s.split(';').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Read one request head into `buf`, line by line.
///
/// Returns `Ok(true)` once a blank line ends the head and `Ok(false)` if
/// the peer closed the connection. A read timeout surfaces as an error and
/// leaves whatever was read so far in `buf`, so the caller can retry.
pub fn read_head(reader: &mut impl BufRead, buf: &mut String) -> io::Result<bool> {
    loop {
        let start = buf.len();
        if reader.read_line(buf)? == 0 {
            return Ok(false);
        }
        let line = &buf[start..];
        if (line == "\r\n" || line == "\n") && !buf[..start].trim().is_empty() {
            return Ok(true);
        }
        if buf.trim().is_empty() {
            buf.clear();
        }
    }
}
