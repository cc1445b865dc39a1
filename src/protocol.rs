//! Wire format for the control stream and the per-client delivered views.
//!
//! One protocol message is exactly one line of self-contained JSON, at most
//! [`MAX_LINE_LEN`] characters. The control stream (the game server's stdio,
//! bridged to us by a side-channel process) interleaves three kinds of lines:
//! addressed-message objects, bare number lines, and sentinel string
//! literals. A message line and the number line that follows it form one
//! atomic server command.

use serde::{Deserialize, Deserializer};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, Take,
};

/// Maximum length of a single protocol line, in characters.
pub const MAX_LINE_LEN: usize = 8100;

/// Byte cap applied while buffering one line. Any line within
/// [`MAX_LINE_LEN`] characters fits (a character is at most four bytes,
/// plus the line terminator), while an unterminated line stops
/// accumulating here instead of growing until memory runs out.
pub const MAX_LINE_BYTES: u64 = MAX_LINE_LEN as u64 * 4 + 2;

/// Reserved addressing key meaning "every active client not explicitly
/// addressed". Also why the empty string is an illegal client identity.
pub const BROADCAST: &str = "";

/// Sentinel ending the init phase. Sent as a JSON string line, so it can
/// never collide with an addressed-message object or a bare-number line.
pub const END_INIT: &str = "END_INIT";

/// Sentinel ending the game.
pub const END_GAME: &str = "END_GAME";

/// Wire value substituted for a client that produced no usable response
/// within a round's deadline.
pub const NO_ANSWER: &str = "no answer";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("control stream closed")]
    Closed,
    #[error("line exceeds {MAX_LINE_LEN} characters ({0})")]
    Oversize(usize),
    #[error("unexpected control line: {0}")]
    Unexpected(String),
}

/// One roster entry: `{"id": ..., "name": ...}`. Ids and names may arrive
/// as numbers and are coerced to strings; extra fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RosterEntry {
    #[serde(deserialize_with = "scalar_string")]
    pub id: String,
    #[serde(deserialize_with = "scalar_string")]
    pub name: String,
}

fn scalar_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// A classified control line.
#[derive(Debug)]
pub enum ControlLine {
    Message(serde_json::Map<String, serde_json::Value>),
    Number(f64),
    EndInit,
    EndGame,
}

/// An atomic instruction from the game server. A `Dispatch` pairs an
/// addressed message with its standalone number line: an advisory
/// processing delay during init, a response deadline during turns.
#[derive(Debug)]
pub enum ServerCommand {
    Dispatch {
        message: serde_json::Map<String, serde_json::Value>,
        seconds: f64,
    },
    EndInit,
    EndGame,
}

/// Classify a parsed control value.
pub fn classify(value: serde_json::Value) -> Result<ControlLine, ProtocolError> {
    match value {
        serde_json::Value::Object(map) => Ok(ControlLine::Message(map)),
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(ControlLine::Number)
            .ok_or_else(|| ProtocolError::Unexpected(format!("unrepresentable number: {}", n))),
        serde_json::Value::String(s) if s == END_INIT => Ok(ControlLine::EndInit),
        serde_json::Value::String(s) if s == END_GAME => Ok(ControlLine::EndGame),
        other => Err(ProtocolError::Unexpected(preview(&other.to_string()))),
    }
}

/// Per-client delivered view of a dispatched message.
pub fn encode_view(payload: &serde_json::Value, seconds: f64) -> String {
    serde_json::json!({ "message": payload, "time": seconds }).to_string()
}

/// Sentinels are forwarded to clients verbatim, as JSON string lines.
pub fn encode_sentinel(sentinel: &str) -> String {
    serde_json::Value::String(sentinel.to_string()).to_string()
}

fn preview(line: &str) -> String {
    line.chars().take(120).collect()
}

/// Line-oriented control connection to the game server.
pub struct ControlChannel {
    reader: Take<BufReader<Box<dyn AsyncRead + Send + Unpin>>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    read_buf: String,
}

impl ControlChannel {
    /// Control channel over our own stdio, for the socat deployment.
    pub fn from_stdio() -> Self {
        Self::from_parts(Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout()))
    }

    pub fn from_parts(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            reader: BufReader::new(reader).take(MAX_LINE_BYTES),
            writer,
            read_buf: String::new(),
        }
    }

    /// Read the next non-empty line, enforcing the size bound.
    async fn next_line(&mut self) -> Result<String, ProtocolError> {
        loop {
            self.read_buf.clear();
            self.reader.set_limit(MAX_LINE_BYTES);
            let bytes = self.reader.read_line(&mut self.read_buf).await?;
            if bytes == 0 {
                return Err(ProtocolError::Closed);
            }
            // The byte cap fired before a newline arrived.
            if !self.read_buf.ends_with('\n') && self.reader.limit() == 0 {
                return Err(ProtocolError::Oversize(self.read_buf.chars().count()));
            }
            let trimmed = self.read_buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            let chars = trimmed.chars().count();
            if chars > MAX_LINE_LEN {
                return Err(ProtocolError::Oversize(chars));
            }
            return Ok(trimmed.to_string());
        }
    }

    /// Read and parse the next control line as a JSON value.
    pub async fn next_value(&mut self) -> Result<serde_json::Value, ProtocolError> {
        let line = self.next_line().await?;
        serde_json::from_str(&line)
            .map_err(|e| ProtocolError::Unexpected(format!("{}: {}", e, preview(&line))))
    }

    /// Read the next server command, pairing a message line with the
    /// number line that follows it.
    pub async fn next_command(&mut self) -> Result<ServerCommand, ProtocolError> {
        match classify(self.next_value().await?)? {
            ControlLine::EndInit => Ok(ServerCommand::EndInit),
            ControlLine::EndGame => Ok(ServerCommand::EndGame),
            ControlLine::Number(n) => Err(ProtocolError::Unexpected(format!(
                "bare number {} without a preceding message",
                n
            ))),
            ControlLine::Message(message) => match classify(self.next_value().await?)? {
                ControlLine::Number(seconds) => Ok(ServerCommand::Dispatch { message, seconds }),
                other => Err(ProtocolError::Unexpected(format!(
                    "expected a number after a message, got {:?}",
                    other
                ))),
            },
        }
    }

    /// Write one JSON line back to the game server.
    pub async fn send_value(&mut self, value: &serde_json::Value) -> Result<(), ProtocolError> {
        let line = value.to_string();
        let chars = line.chars().count();
        if chars > MAX_LINE_LEN {
            return Err(ProtocolError::Oversize(chars));
        }
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}
