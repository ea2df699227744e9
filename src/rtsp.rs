//! RTSP wire format: request parsing, response serialization and the
//! interleaved binary frames that can arrive between requests.

use crate::error::{BridgeError, Result};
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub const RTSP_VERSION: &str = "RTSP/1.0";

/// Header block limit, terminator included
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Request body limit
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Value of the `Public` header
pub const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER, SET_PARAMETER";

pub const DEFAULT_TRANSPORT: &str = "RTP/AVP/UDP;unicast;mode=record";

const SERVER: &str = "AirTunes/220.68";

/// Control protocol method
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
    GetParameter,
    SetParameter,
    Unknown(String),
}

impl Method {
    pub fn parse(token: &str) -> Self {
        match token {
            "OPTIONS" => Method::Options,
            "DESCRIBE" => Method::Describe,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "PAUSE" => Method::Pause,
            "TEARDOWN" => Method::Teardown,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            other => Method::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Pause => "PAUSE",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
            Method::Unknown(s) => s,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed control request
#[derive(Debug, Clone)]
pub struct RtspRequest {
    pub method: Method,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspRequest {
    /// Parse a header block (request line plus header lines, no body)
    pub fn parse_head(head: &str) -> Result<Self> {
        let mut lines = head.split("\r\n").flat_map(|l| l.split('\n'));
        let request_line = lines
            .next()
            .ok_or_else(|| BridgeError::ProtocolMalformed("empty request".to_string()))?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        let [method, target, version] = parts.as_slice() else {
            return Err(BridgeError::ProtocolMalformed(format!(
                "bad request line {:?}",
                request_line
            )));
        };
        if !version.starts_with("RTSP/") {
            return Err(BridgeError::ProtocolMalformed(format!(
                "unsupported version {:?}",
                version
            )));
        }
        if !method.bytes().all(|b| b.is_ascii_uppercase() || b == b'_') {
            return Err(BridgeError::ProtocolMalformed(format!(
                "bad method token {:?}",
                method
            )));
        }

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                BridgeError::ProtocolMalformed(format!("bad header line {:?}", line))
            })?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: Method::parse(method),
            target: target.to_string(),
            version: version.to_string(),
            headers,
            body: Vec::new(),
        })
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cseq(&self) -> Option<&str> {
        self.header("CSeq")
    }

    pub fn content_length(&self) -> Result<usize> {
        match self.header("Content-Length") {
            None => Ok(0),
            Some(raw) => {
                let len: usize = raw.parse().map_err(|_| {
                    BridgeError::ProtocolMalformed(format!("bad Content-Length {:?}", raw))
                })?;
                if len > MAX_BODY_BYTES {
                    return Err(BridgeError::ProtocolMalformed(format!(
                        "body of {} bytes exceeds limit",
                        len
                    )));
                }
                Ok(len)
            }
        }
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Control response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspResponse {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspResponse {
    pub fn new(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn not_implemented() -> Self {
        Self::new(501, "Not Implemented")
    }

    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.with_header("Content-Type", content_type)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize with `CSeq` first and `Content-Length` when a body is set
    pub fn to_bytes(&self, cseq: Option<&str>) -> Vec<u8> {
        let mut head = format!("{} {} {}\r\n", RTSP_VERSION, self.status, self.reason);
        if let Some(cseq) = cseq {
            head.push_str(&format!("CSeq: {}\r\n", cseq));
        }
        head.push_str(&format!("Server: {}\r\n", SERVER));
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !self.body.is_empty() {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Anything the client can send on the control connection
#[derive(Debug)]
pub enum Incoming {
    Request(RtspRequest),
    /// `$` framed media: channel and payload
    Interleaved { channel: u8, payload: Vec<u8> },
}

/// Read the next message; `Ok(None)` on a clean EOF between messages
///
/// EOF inside a header block, an oversized block or an unparseable head are
/// all `ProtocolMalformed`.
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Incoming>> {
    // tolerate stray line breaks between messages
    loop {
        let first = reader.fill_buf().await?.first().copied();
        match first {
            None => return Ok(None),
            Some(b'\r') | Some(b'\n') => reader.consume(1),
            Some(_) => break,
        }
    }

    if reader.fill_buf().await?.first() == Some(&b'$') {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        return Ok(Some(Incoming::Interleaved {
            channel: header[1],
            payload,
        }));
    }

    let mut head = Vec::new();
    loop {
        // never pull more than one byte past the limit off the socket
        let budget = (MAX_HEADER_BYTES + 1).saturating_sub(head.len()) as u64;
        let n = (&mut *reader)
            .take(budget)
            .read_until(b'\n', &mut head)
            .await?;
        if head.len() > MAX_HEADER_BYTES {
            return Err(BridgeError::ProtocolMalformed("header block too large".to_string()));
        }
        if n == 0 {
            return Err(BridgeError::ProtocolMalformed(
                "connection closed inside header block".to_string(),
            ));
        }
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
    }

    let text = std::str::from_utf8(&head)
        .map_err(|_| BridgeError::ProtocolMalformed("header block is not UTF-8".to_string()))?;
    let mut request = RtspRequest::parse_head(text.trim_end())?;

    let len = request.content_length()?;
    if len > 0 {
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        request.body = body;
    }
    Ok(Some(Incoming::Request(request)))
}

/// Fixed media description returned for DESCRIBE
pub fn sdp_body() -> String {
    [
        "v=0",
        "o=- 0 0 IN IP4 0.0.0.0",
        "s=AirPlay Stream",
        "c=IN IP4 0.0.0.0",
        "t=0 0",
        "a=tool:alexa-airplay-bridge",
        "m=audio 0 RTP/AVP 96",
        "a=rtpmap:96 L16/44100/2",
        "",
    ]
    .join("\r\n")
}

/// Parse a `text/parameters` body into `(name, value)` pairs
pub fn parse_parameters(body: &str) -> Vec<(String, String)> {
    body.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn read(bytes: &[u8]) -> Result<Option<Incoming>> {
        let mut reader = BufReader::new(bytes);
        read_message(&mut reader).await
    }

    #[test]
    fn parses_request_line_and_headers() {
        let req = RtspRequest::parse_head(
            "SETUP rtsp://10.0.0.5/kitchen RTSP/1.0\r\nCSeq: 3\r\ntransport: RTP/AVP/TCP;interleaved=0-1",
        )
        .unwrap();
        assert_eq!(req.method, Method::Setup);
        assert_eq!(req.target, "rtsp://10.0.0.5/kitchen");
        assert_eq!(req.cseq(), Some("3"));
        assert_eq!(req.header("Transport"), Some("RTP/AVP/TCP;interleaved=0-1"));
    }

    #[test]
    fn rejects_malformed_heads() {
        for head in [
            "GARBAGE",
            "PLAY rtsp://x",
            "PLAY rtsp://x HTTP/1.1",
            "play rtsp://x RTSP/1.0",
            "PLAY rtsp://x RTSP/1.0\r\nno colon here",
        ] {
            assert!(
                matches!(RtspRequest::parse_head(head), Err(BridgeError::ProtocolMalformed(_))),
                "{head:?} should be malformed"
            );
        }
        assert_eq!(
            RtspRequest::parse_head("RECORD * RTSP/1.0").unwrap().method,
            Method::Unknown("RECORD".to_string())
        );
    }

    #[test]
    fn response_echoes_cseq_and_sizes_body() {
        let bytes = RtspResponse::ok()
            .with_body("application/sdp", "v=0\r\n")
            .to_bytes(Some("7"));
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("RTSP/1.0 200 OK\r\nCSeq: 7\r\n"));
        assert!(text.contains("Content-Type: application/sdp\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nv=0\r\n"));
    }

    #[tokio::test]
    async fn reads_request_with_body() {
        let msg = read(b"SET_PARAMETER * RTSP/1.0\r\nCSeq: 9\r\nContent-Length: 13\r\n\r\nvolume: -15.0")
            .await
            .unwrap();
        let Some(Incoming::Request(req)) = msg else {
            panic!("expected a request");
        };
        assert_eq!(req.method, Method::SetParameter);
        assert_eq!(parse_parameters(&req.body_text()), vec![("volume".to_string(), "-15.0".to_string())]);
    }

    #[tokio::test]
    async fn reads_interleaved_frame() {
        let msg = read(&[b'$', 1, 0, 3, 7, 8, 9]).await.unwrap();
        assert!(matches!(
            msg,
            Some(Incoming::Interleaved { channel: 1, ref payload }) if payload == &[7, 8, 9]
        ));
    }

    #[tokio::test]
    async fn eof_handling() {
        assert!(read(b"").await.unwrap().is_none());
        assert!(read(b"\r\n").await.unwrap().is_none());
        assert!(matches!(
            read(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n").await,
            Err(BridgeError::ProtocolMalformed(_))
        ));
    }

    #[tokio::test]
    async fn oversized_header_block_is_malformed() {
        let mut bytes = b"OPTIONS * RTSP/1.0\r\n".to_vec();
        for i in 0..600 {
            bytes.extend_from_slice(format!("X-Pad-{}: {}\r\n", i, "y".repeat(8)).as_bytes());
        }
        bytes.extend_from_slice(b"\r\n");
        assert!(matches!(read(&bytes).await, Err(BridgeError::ProtocolMalformed(_))));
    }

    #[tokio::test]
    async fn endless_request_line_stops_at_header_limit() {
        const SENT: u64 = 4 * 1024 * 1024;
        let mut reader = BufReader::with_capacity(1024, tokio::io::repeat(b'A').take(SENT));
        let msg = read_message(&mut reader).await;
        assert!(matches!(msg, Err(BridgeError::ProtocolMalformed(_))));

        // at most the limit plus one BufReader fill was pulled from the source
        let consumed = SENT - reader.get_ref().limit();
        assert!(
            consumed <= (MAX_HEADER_BYTES + 1 + 1024) as u64,
            "consumed {consumed} bytes"
        );
    }

    #[tokio::test]
    async fn oversized_body_is_malformed() {
        let msg = read(b"SET_PARAMETER * RTSP/1.0\r\nContent-Length: 70000\r\n\r\n").await;
        assert!(matches!(msg, Err(BridgeError::ProtocolMalformed(_))));
    }
}
