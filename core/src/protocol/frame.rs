// Frame codec: text frames exchanged with the backend over the device socket
//
// Layout:
//   COMMAND\n
//   key:value\n   (zero or more, order preserved)
//   \n
//   body\0

use thiserror::Error;

/// Sentinel terminating every frame on the wire.
pub const FRAME_TERMINATOR: char = '\0';

/// Maximum accepted inbound frame: 1 MB.
/// Command payloads are tiny; anything bigger is a misbehaving peer.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol versions offered in the handshake
pub const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

/// Heart-beat offer: send every 10s, expect every 10s
pub const HEART_BEAT: &str = "10000,10000";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown frame command: {0}")]
    UnknownCommand(String),

    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    #[error("Invalid escape sequence in header: {0}")]
    InvalidEscape(String),

    #[error("Invalid content-length: {0}")]
    InvalidContentLength(String),

    #[error("Frame too large: {got} bytes (max {max})")]
    TooLarge { got: usize, max: usize },
}

/// Frame command vocabulary understood by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameCommand {
    Connect,
    Connected,
    Subscribe,
    Send,
    Message,
    Disconnect,
    Error,
}

impl FrameCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Send => "SEND",
            Self::Message => "MESSAGE",
            Self::Disconnect => "DISCONNECT",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        match line {
            "CONNECT" => Some(Self::Connect),
            "CONNECTED" => Some(Self::Connected),
            "SUBSCRIBE" => Some(Self::Subscribe),
            "SEND" => Some(Self::Send),
            "MESSAGE" => Some(Self::Message),
            "DISCONNECT" => Some(Self::Disconnect),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// Handshake frames carry raw header values; all others are escaped.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl std::fmt::Display for FrameCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single protocol frame
///
/// Headers are kept as an ordered list: the backend reads auth headers
/// positionally, and repeated keys resolve to the first occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: FrameCommand,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl Frame {
    pub fn new(command: FrameCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// First value recorded for `key`
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Handshake frame carrying the device credentials
    pub fn connect(device_id: &str, device_token: &str) -> Self {
        Self::new(FrameCommand::Connect)
            .with_header("accept-version", ACCEPT_VERSION)
            .with_header("heart-beat", HEART_BEAT)
            .with_header("X-Device-Id", device_id)
            .with_header("X-Device-Token", device_token)
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(FrameCommand::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
    }

    pub fn send_json(destination: &str, body: impl Into<String>) -> Self {
        Self::new(FrameCommand::Send)
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Self::new(FrameCommand::Disconnect).with_header("receipt", receipt)
    }

    /// Serialize to wire text, terminator included
    pub fn encode(&self) -> String {
        let body_len = self.body.as_ref().map_or(0, |b| b.len());
        let mut out = String::with_capacity(32 + self.headers.len() * 32 + body_len);
        let escape = self.command.escapes_headers();

        out.push_str(self.command.as_str());
        out.push('\n');
        for (key, value) in &self.headers {
            if escape {
                push_escaped(&mut out, key);
                out.push(':');
                push_escaped(&mut out, value);
            } else {
                out.push_str(key);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        if let Some(body) = &self.body {
            out.push_str(body);
        }
        out.push(FRAME_TERMINATOR);
        out
    }

    /// Parse one frame from wire text
    ///
    /// Leading EOLs (heart-beats that arrived glued to a frame) are skipped.
    /// The body ends at `content-length` when that header is present,
    /// otherwise at the first terminator.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                got: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let text = text.trim_start_matches(['\n', '\r']);
        if text.is_empty() || text.starts_with(FRAME_TERMINATOR) {
            return Err(FrameError::Empty);
        }

        let (lines, rest) = split_head(text);
        let mut lines = lines.into_iter();
        let command_line = lines.next().ok_or(FrameError::Empty)?;
        let command = FrameCommand::parse(command_line)
            .ok_or_else(|| FrameError::UnknownCommand(command_line.to_string()))?;

        let mut headers = Vec::new();
        for line in lines {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if command.escapes_headers() {
                headers.push((unescape(key)?, unescape(value)?));
            } else {
                headers.push((key.to_string(), value.to_string()));
            }
        }

        let mut frame = Frame {
            command,
            headers,
            body: None,
        };

        let Some(rest) = rest else {
            return Ok(frame);
        };

        let body = match frame.header("content-length") {
            Some(raw) => {
                let len: usize = raw
                    .trim()
                    .parse()
                    .map_err(|_| FrameError::InvalidContentLength(raw.to_string()))?;
                if len > rest.len() || !rest.is_char_boundary(len) {
                    return Err(FrameError::InvalidContentLength(raw.to_string()));
                }
                &rest[..len]
            }
            None => rest.split(FRAME_TERMINATOR).next().unwrap_or_default(),
        };

        if !body.is_empty() {
            frame.body = Some(body.to_string());
        }
        Ok(frame)
    }
}

/// True for EOL-only heart-beat text
pub fn is_heartbeat(text: &str) -> bool {
    text.chars().all(|c| c == '\n' || c == '\r')
}

/// Split command/header lines from the body.
///
/// Returns `None` for the body when no blank line was found.
fn split_head(text: &str) -> (Vec<&str>, Option<&str>) {
    let mut lines = Vec::new();
    let mut rest = text;
    loop {
        match rest.find('\n') {
            Some(idx) => {
                let line = rest[..idx].trim_end_matches('\r');
                rest = &rest[idx + 1..];
                if line.is_empty() {
                    return (lines, Some(rest));
                }
                lines.push(line);
            }
            None => {
                let line = rest.trim_end_matches(FRAME_TERMINATOR).trim_end_matches('\r');
                if !line.is_empty() {
                    lines.push(line);
                }
                return (lines, None);
            }
        }
    }
}

fn push_escaped(out: &mut String, raw: &str) {
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
}

fn unescape(raw: &str) -> Result<String, FrameError> {
    if !raw.contains('\\') {
        return Ok(raw.to_string());
    }

    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}
