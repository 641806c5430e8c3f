use crate::error::{Error, ParseErrorKind, Result};

/// A parsed request head (RFC 2326 §6).
///
/// ```text
/// Method SP Request-URI SP Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// ```
///
/// The same shape covers the HTTP GET/POST requests that open an
/// RTSP-over-HTTP tunnel, so the version is not restricted to `RTSP/1.0`.
/// Header lookups are case-insensitive.
#[derive(Debug)]
pub struct RtspRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    /// Headers in arrival order, names as received.
    pub headers: Vec<(String, String)>,
}

impl RtspRequest {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.lines().skip_while(|line| line.trim().is_empty());

        let request_line = lines.next().ok_or(Error::Parse {
            kind: ParseErrorKind::EmptyRequest,
        })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        let &[method, uri, version] = parts.as_slice() else {
            return Err(Error::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        };

        if version != "RTSP/1.0" && !version.starts_with("HTTP/") {
            tracing::warn!(version, "client sent unexpected protocol version");
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or(Error::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(RtspRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// `CSeq` numbers a request; the response must echo it (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Session ID from the `Session` header, without `;timeout=` suffix.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .and_then(|s| s.split(';').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn is_http(&self) -> bool {
        self.version.starts_with("HTTP/")
    }
}
