//! Line-oriented text protocol.
//!
//! Wire format (one field per line, payloads length-prefixed):
//! ```text
//! CHANGE            ← command line
//! Name:budget       ← Key:value fields, fixed order per command
//! Version:3
//! Cell:A1
//! Length:5          ← exactly 5 payload bytes follow, newlines included
//! =B1*2             ← payload, then an optional line terminator
//! ```
//!
//! Blank lines between frames are ignored. After a frame fails to parse,
//! stray `Key:value` lines are skipped until the next recognised command so
//! that one bad frame yields one `ERROR`. A frame with a payload is always
//! read through its `Length` bytes before its first error is reported, and a
//! command line found where a field belongs starts the next frame.

use std::fmt::Display;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::broadcast::Frame;

pub const DEFAULT_MAX_LINE_LEN: usize = 1024;
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 1024 * 1024;

const NAME: &str = "Name";
const PASSWORD: &str = "Password";
const VERSION: &str = "Version";
const CELL: &str = "Cell";
const LENGTH: &str = "Length";

/// Lines that start a frame in either direction.
const COMMANDS: &[&str] = &[
    "CREATE",
    "JOIN",
    "CHANGE",
    "UNDO",
    "SAVE",
    "LEAVE",
    "CREATE OK",
    "CREATE FAIL",
    "JOIN OK",
    "JOIN FAIL",
    "CHANGE OK",
    "CHANGE WAIT",
    "UPDATE",
    "UNDO OK",
    "UNDO WAIT",
    "UNDO END",
    "SAVE OK",
    "SAVE FAIL",
    "ERROR",
];

/// Size bounds applied while reading frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Longest accepted command or field line, terminator excluded.
    pub max_line_len: usize,
    /// Largest accepted `Length:` payload.
    pub max_payload_len: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_line_len: DEFAULT_MAX_LINE_LEN,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

/// Client → server commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Create { name: String, password: String },
    Join { name: String, password: String },
    Change { name: String, version: u64, cell: String, content: String },
    Undo { name: String, version: u64 },
    Save { name: String },
    Leave { name: String },
}

impl Request {
    /// Command keyword, for logging.
    pub fn command(&self) -> &'static str {
        match self {
            Request::Create { .. } => "CREATE",
            Request::Join { .. } => "JOIN",
            Request::Change { .. } => "CHANGE",
            Request::Undo { .. } => "UNDO",
            Request::Save { .. } => "SAVE",
            Request::Leave { .. } => "LEAVE",
        }
    }

    /// Document the command targets.
    pub fn document(&self) -> &str {
        match self {
            Request::Create { name, .. }
            | Request::Join { name, .. }
            | Request::Change { name, .. }
            | Request::Undo { name, .. }
            | Request::Save { name }
            | Request::Leave { name } => name,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = FrameBuilder::new(self.command());
        match self {
            Request::Create { name, password } | Request::Join { name, password } => {
                out.field(NAME, name).field(PASSWORD, password);
            }
            Request::Change {
                name,
                version,
                cell,
                content,
            } => {
                out.field(NAME, name)
                    .field(VERSION, version)
                    .field(CELL, cell)
                    .payload(content);
            }
            Request::Undo { name, version } => {
                out.field(NAME, name).field(VERSION, version);
            }
            Request::Save { name } | Request::Leave { name } => {
                out.field(NAME, name);
            }
        }
        out.finish()
    }
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    CreateOk { name: String },
    CreateFail { name: String, reason: String },
    /// `snapshot` is the XML-encoded cell set.
    JoinOk { name: String, version: u64, snapshot: String },
    JoinFail { name: String, reason: String },
    ChangeOk { name: String, version: u64 },
    ChangeWait { name: String, version: u64 },
    Update { name: String, version: u64, cell: String, content: String },
    UndoOk { name: String, version: u64, cell: String, content: String },
    UndoWait { name: String, version: u64 },
    UndoEnd { name: String, version: u64 },
    SaveOk { name: String },
    SaveFail { name: String, reason: String },
    Error,
}

impl Response {
    pub fn header(&self) -> &'static str {
        match self {
            Response::CreateOk { .. } => "CREATE OK",
            Response::CreateFail { .. } => "CREATE FAIL",
            Response::JoinOk { .. } => "JOIN OK",
            Response::JoinFail { .. } => "JOIN FAIL",
            Response::ChangeOk { .. } => "CHANGE OK",
            Response::ChangeWait { .. } => "CHANGE WAIT",
            Response::Update { .. } => "UPDATE",
            Response::UndoOk { .. } => "UNDO OK",
            Response::UndoWait { .. } => "UNDO WAIT",
            Response::UndoEnd { .. } => "UNDO END",
            Response::SaveOk { .. } => "SAVE OK",
            Response::SaveFail { .. } => "SAVE FAIL",
            Response::Error => "ERROR",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = FrameBuilder::new(self.header());
        match self {
            Response::CreateOk { name } | Response::SaveOk { name } => {
                out.field(NAME, name);
            }
            Response::CreateFail { name, reason }
            | Response::JoinFail { name, reason }
            | Response::SaveFail { name, reason } => {
                out.field(NAME, name).line(reason);
            }
            Response::JoinOk {
                name,
                version,
                snapshot,
            } => {
                out.field(NAME, name).field(VERSION, version).payload(snapshot);
            }
            Response::ChangeOk { name, version }
            | Response::ChangeWait { name, version }
            | Response::UndoWait { name, version }
            | Response::UndoEnd { name, version } => {
                out.field(NAME, name).field(VERSION, version);
            }
            Response::Update {
                name,
                version,
                cell,
                content,
            }
            | Response::UndoOk {
                name,
                version,
                cell,
                content,
            } => {
                out.field(NAME, name)
                    .field(VERSION, version)
                    .field(CELL, cell)
                    .payload(content);
            }
            Response::Error => {}
        }
        out.finish()
    }

    /// Encode once into a shareable frame.
    pub fn frame(&self) -> Frame {
        Arc::new(self.encode())
    }
}

struct FrameBuilder {
    buf: Vec<u8>,
}

impl FrameBuilder {
    fn new(header: &str) -> Self {
        let mut builder = Self { buf: Vec::with_capacity(64) };
        builder.line(header);
        builder
    }

    fn line(&mut self, text: &str) -> &mut Self {
        self.buf.extend_from_slice(text.as_bytes());
        self.buf.push(b'\n');
        self
    }

    fn field(&mut self, key: &str, value: impl Display) -> &mut Self {
        self.line(&format!("{key}:{value}"))
    }

    fn payload(&mut self, content: &str) -> &mut Self {
        self.field(LENGTH, content.len());
        self.line(content)
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Protocol errors.
///
/// Everything except [`ProtocolError::Truncated`] and [`ProtocolError::Io`]
/// leaves the stream usable for the next frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("expected field {expected}, got {found:?}")]
    MissingField { expected: &'static str, found: String },

    #[error("invalid {field} value {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("payload of {len} bytes exceeds {limit}")]
    PayloadTooLarge { len: u64, limit: usize },

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether the underlying stream can no longer be read.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::Truncated | ProtocolError::Io(_))
    }
}

/// Reads [`Request`]s (server side) or [`Response`]s (client side) from a
/// buffered byte stream.
pub struct FrameReader<R> {
    inner: R,
    limits: FrameLimits,
    resync: bool,
    /// Command line read where a field was expected; it starts the next frame.
    pending: Option<String>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, limits: FrameLimits) -> Self {
        Self {
            inner,
            limits,
            resync: false,
            pending: None,
        }
    }

    /// Next client command, or `None` at a clean end of stream.
    pub async fn next_request(&mut self) -> Result<Option<Request>, ProtocolError> {
        let result = self.read_request().await;
        self.note_failure(&result);
        result
    }

    /// Next server message, or `None` at a clean end of stream.
    pub async fn next_response(&mut self) -> Result<Option<Response>, ProtocolError> {
        let result = self.read_response().await;
        self.note_failure(&result);
        result
    }

    fn note_failure<T>(&mut self, result: &Result<T, ProtocolError>) {
        if let Err(e) = result {
            if !e.is_fatal() {
                self.resync = true;
            }
        }
    }

    async fn read_request(&mut self) -> Result<Option<Request>, ProtocolError> {
        let Some(command) = self.command_line().await? else {
            return Ok(None);
        };

        let request = match command.as_str() {
            "CREATE" | "JOIN" => {
                let name = self.field(NAME).await?;
                let password = self.field(PASSWORD).await?;
                if command == "CREATE" {
                    Request::Create { name, password }
                } else {
                    Request::Join { name, password }
                }
            }
            "CHANGE" => {
                let mut first_error = None;
                let name = self.header_field(NAME, &mut first_error).await?;
                let version = self.header_number(VERSION, &mut first_error).await?;
                let cell = self.header_field(CELL, &mut first_error).await?;
                let content = self.framed_payload(first_error).await?;
                Request::Change {
                    name,
                    version,
                    cell,
                    content,
                }
            }
            "UNDO" => {
                let name = self.field(NAME).await?;
                let version = self.number(VERSION).await?;
                Request::Undo { name, version }
            }
            "SAVE" => Request::Save {
                name: self.field(NAME).await?,
            },
            "LEAVE" => Request::Leave {
                name: self.field(NAME).await?,
            },
            _ => return Err(ProtocolError::UnknownCommand(command)),
        };
        Ok(Some(request))
    }

    async fn read_response(&mut self) -> Result<Option<Response>, ProtocolError> {
        let Some(header) = self.command_line().await? else {
            return Ok(None);
        };

        let response = match header.as_str() {
            "CREATE OK" => Response::CreateOk {
                name: self.field(NAME).await?,
            },
            "CREATE FAIL" => {
                let name = self.field(NAME).await?;
                Response::CreateFail {
                    name,
                    reason: self.reason().await?,
                }
            }
            "JOIN OK" => {
                let mut first_error = None;
                let name = self.header_field(NAME, &mut first_error).await?;
                let version = self.header_number(VERSION, &mut first_error).await?;
                let snapshot = self.framed_payload(first_error).await?;
                Response::JoinOk {
                    name,
                    version,
                    snapshot,
                }
            }
            "JOIN FAIL" => {
                let name = self.field(NAME).await?;
                Response::JoinFail {
                    name,
                    reason: self.reason().await?,
                }
            }
            "CHANGE OK" | "CHANGE WAIT" | "UNDO WAIT" | "UNDO END" => {
                let name = self.field(NAME).await?;
                let version = self.number(VERSION).await?;
                match header.as_str() {
                    "CHANGE OK" => Response::ChangeOk { name, version },
                    "CHANGE WAIT" => Response::ChangeWait { name, version },
                    "UNDO WAIT" => Response::UndoWait { name, version },
                    _ => Response::UndoEnd { name, version },
                }
            }
            "UPDATE" | "UNDO OK" => {
                let mut first_error = None;
                let name = self.header_field(NAME, &mut first_error).await?;
                let version = self.header_number(VERSION, &mut first_error).await?;
                let cell = self.header_field(CELL, &mut first_error).await?;
                let content = self.framed_payload(first_error).await?;
                if header == "UPDATE" {
                    Response::Update {
                        name,
                        version,
                        cell,
                        content,
                    }
                } else {
                    Response::UndoOk {
                        name,
                        version,
                        cell,
                        content,
                    }
                }
            }
            "SAVE OK" => Response::SaveOk {
                name: self.field(NAME).await?,
            },
            "SAVE FAIL" => {
                let name = self.field(NAME).await?;
                Response::SaveFail {
                    name,
                    reason: self.reason().await?,
                }
            }
            "ERROR" => Response::Error,
            _ => return Err(ProtocolError::UnknownCommand(header)),
        };
        Ok(Some(response))
    }

    /// Next non-blank line that can start a frame.
    async fn command_line(&mut self) -> Result<Option<String>, ProtocolError> {
        if let Some(line) = self.pending.take() {
            self.resync = false;
            return Ok(Some(line));
        }
        loop {
            let Some(line) = self.read_line().await? else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if self.resync && is_field_line(line) {
                log::trace!("Skipping stray field line {line:?}");
                continue;
            }
            self.resync = false;
            return Ok(Some(line.to_string()));
        }
    }

    /// `key:value` line. A command line in its place is kept for the next
    /// frame.
    async fn field(&mut self, key: &'static str) -> Result<String, ProtocolError> {
        let line = self.read_line().await?.ok_or(ProtocolError::Truncated)?;
        if let Some((k, value)) = line.split_once(':') {
            if k.trim().eq_ignore_ascii_case(key) {
                return Ok(value.to_string());
            }
        }
        if is_command(line.trim()) {
            self.pending = Some(line.trim().to_string());
        }
        Err(ProtocolError::MissingField {
            expected: key,
            found: line,
        })
    }

    async fn number(&mut self, key: &'static str) -> Result<u64, ProtocolError> {
        let value = self.field(key).await?;
        parse_number(key, value)
    }

    /// Header field of a frame that carries a payload.
    ///
    /// A recoverable error is parked in `first_error` and reading goes on,
    /// so the payload is still consumed and never parsed as commands. Only
    /// a fatal error or a new command line cuts the frame short.
    async fn header_field(
        &mut self,
        key: &'static str,
        first_error: &mut Option<ProtocolError>,
    ) -> Result<String, ProtocolError> {
        match self.field(key).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) if self.pending.is_some() => Err(first_error.take().unwrap_or(e)),
            Err(e) => {
                first_error.get_or_insert(e);
                Ok(String::new())
            }
        }
    }

    /// Numeric header field; parse failures are parked like missing fields.
    async fn header_number(
        &mut self,
        key: &'static str,
        first_error: &mut Option<ProtocolError>,
    ) -> Result<u64, ProtocolError> {
        let value = self.header_field(key, first_error).await?;
        if first_error.is_some() {
            return Ok(0);
        }
        match parse_number(key, value) {
            Ok(n) => Ok(n),
            Err(e) => {
                *first_error = Some(e);
                Ok(0)
            }
        }
    }

    /// Payload that ends a frame, reporting the frame's first header error
    /// once the payload bytes are gone.
    async fn framed_payload(
        &mut self,
        first_error: Option<ProtocolError>,
    ) -> Result<String, ProtocolError> {
        match (first_error, self.payload().await) {
            (_, Err(e)) if e.is_fatal() => Err(e),
            (Some(e), _) => Err(e),
            (None, payload) => payload,
        }
    }

    async fn reason(&mut self) -> Result<String, ProtocolError> {
        self.read_line().await?.ok_or(ProtocolError::Truncated)
    }

    /// `Length:<n>` followed by exactly `n` bytes.
    ///
    /// The line terminator after the payload is left in the stream; the next
    /// `command_line` skips it as a blank line. Waiting for it here would
    /// stall on clients that omit it.
    async fn payload(&mut self) -> Result<String, ProtocolError> {
        let len = self.number(LENGTH).await?;
        if len > self.limits.max_payload_len as u64 {
            self.skip_bytes(len).await?;
            return Err(ProtocolError::PayloadTooLarge {
                len,
                limit: self.limits.max_payload_len,
            });
        }

        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ProtocolError::Truncated
            } else {
                ProtocolError::Io(e)
            }
        })?;
        String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8)
    }

    async fn skip_bytes(&mut self, len: u64) -> Result<(), ProtocolError> {
        let mut limited = (&mut self.inner).take(len);
        let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        if skipped < len {
            return Err(ProtocolError::Truncated);
        }
        Ok(())
    }

    /// One line without its terminator, bounded by `max_line_len`.
    async fn read_line(&mut self) -> Result<Option<String>, ProtocolError> {
        let max = self.limits.max_line_len;
        let limit = max + 2;
        let mut buf = Vec::new();

        let read = (&mut self.inner)
            .take(limit as u64)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b'\n') && read >= limit {
            self.discard_line().await?;
            return Err(ProtocolError::LineTooLong { limit: max });
        }

        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        if buf.len() > max {
            return Err(ProtocolError::LineTooLong { limit: max });
        }
        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Drop input up to and including the next newline.
    async fn discard_line(&mut self) -> Result<(), ProtocolError> {
        loop {
            let (consumed, done) = {
                let buf = self.inner.fill_buf().await?;
                if buf.is_empty() {
                    return Ok(());
                }
                match buf.iter().position(|&b| b == b'\n') {
                    Some(pos) => (pos + 1, true),
                    None => (buf.len(), false),
                }
            };
            self.inner.consume(consumed);
            if done {
                return Ok(());
            }
        }
    }
}

fn is_command(line: &str) -> bool {
    COMMANDS.contains(&line)
}

fn parse_number(key: &'static str, value: String) -> Result<u64, ProtocolError> {
    value
        .trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidNumber { field: key, value })
}

fn is_field_line(line: &str) -> bool {
    line.split_once(':').is_some_and(|(key, _)| {
        !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_')
    })
}
