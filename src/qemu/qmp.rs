//! QMP wire protocol
//!
//! QEMU speaks concatenated JSON objects over a unix socket with no framing.
//! [`QmpDecoder`] splits the byte stream into values and classifies them as
//! events, returns or errors. [`QmpWriter`] writes commands, passing a file
//! descriptor alongside with `SCM_RIGHTS` when the command carries one.

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{self, IoSlice};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

pub const QMP_EVENT_SHUTDOWN: &str = "SHUTDOWN";

/// Wire-level failures
#[derive(Debug, thiserror::Error)]
pub enum QmpWireError {
    #[error("QMP socket error: {0}")]
    Io(#[from] io::Error),

    #[error("QMP decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("QMP connection closed")]
    Eof,

    #[error("unrecognized QMP message: {0}")]
    Unrecognized(String),
}

/// A command sent to QEMU
#[derive(Debug, Clone, Default, Serialize)]
pub struct QmpCommand {
    pub execute: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub arguments: Map<String, Value>,
    /// Descriptor passed with the command via SCM_RIGHTS
    #[serde(skip)]
    pub scm: Option<RawFd>,
}

impl QmpCommand {
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            ..Default::default()
        }
    }

    /// Command with arguments; a non-object `args` is ignored.
    pub fn with_args(execute: impl Into<String>, args: Value) -> Self {
        let arguments = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            execute: execute.into(),
            arguments,
            scm: None,
        }
    }

    /// `human-monitor-command` wrapping an HMP command line
    pub fn hmp(command_line: impl Into<String>) -> Self {
        Self::with_args(
            "human-monitor-command",
            serde_json::json!({ "command-line": command_line.into() }),
        )
    }

    pub fn with_fd(mut self, fd: RawFd) -> Self {
        self.scm = Some(fd);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpTimestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QmpEvent {
    pub event: String,
    #[serde(default)]
    pub timestamp: QmpTimestamp,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl QmpEvent {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        let nanos = u32::try_from(self.timestamp.microseconds.checked_mul(1000)?).ok()?;
        DateTime::from_timestamp(self.timestamp.seconds, nanos)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QmpResult {
    pub ret: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QmpError {
    pub cause: Map<String, Value>,
}

impl QmpError {
    /// Human-readable cause: `desc` when present, else the raw object
    pub fn describe(&self) -> String {
        match self.cause.get("desc").and_then(Value::as_str) {
            Some(desc) => desc.to_string(),
            None => Value::Object(self.cause.clone()).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QmpMessage {
    Event(QmpEvent),
    Return(QmpResult),
    Error(QmpError),
}

impl QmpMessage {
    pub fn from_value(value: Value) -> Result<Self, QmpWireError> {
        let Value::Object(mut obj) = value else {
            return Err(QmpWireError::Unrecognized(value.to_string()));
        };

        if obj.contains_key("event") {
            let event: QmpEvent = serde_json::from_value(Value::Object(obj))?;
            return Ok(Self::Event(event));
        }

        if let Some(ret) = obj.remove("return") {
            let ret = match ret {
                Value::Object(map) => map,
                other => {
                    let mut map = Map::new();
                    map.insert("return".to_string(), other);
                    map
                }
            };
            return Ok(Self::Return(QmpResult { ret }));
        }

        if let Some(err) = obj.remove("error") {
            return match err {
                Value::Object(cause) => Ok(Self::Error(QmpError { cause })),
                other => Err(QmpWireError::Unrecognized(other.to_string())),
            };
        }

        Err(QmpWireError::Unrecognized(Value::Object(obj).to_string()))
    }
}

/// Incremental decoder over the read half of the QMP socket
pub struct QmpDecoder<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> QmpDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub async fn decode(&mut self) -> Result<QmpMessage, QmpWireError> {
        let value = self.decode_value().await?;
        QmpMessage::from_value(value)
    }

    /// Next raw JSON value, used for the greeting banner
    pub async fn decode_value(&mut self) -> Result<Value, QmpWireError> {
        loop {
            if let Some(value) = self.next_value()? {
                return Ok(value);
            }
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(QmpWireError::Eof);
            }
        }
    }

    fn next_value(&mut self) -> Result<Option<Value>, QmpWireError> {
        match self.buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => self.buf.advance(start),
            None => {
                self.buf.clear();
                return Ok(None);
            }
        }

        let (value, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) => (value, stream.byte_offset()),
                Some(Err(e)) if e.is_eof() => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        };
        self.buf.advance(consumed);
        Ok(Some(value))
    }
}

/// Write half of the QMP socket
pub struct QmpWriter {
    half: OwnedWriteHalf,
}

impl QmpWriter {
    pub fn new(half: OwnedWriteHalf) -> Self {
        Self { half }
    }

    pub async fn send(&mut self, command: &QmpCommand) -> Result<(), QmpWireError> {
        let payload = serde_json::to_vec(command)?;
        match command.scm {
            Some(fd) => self.send_with_fd(&payload, fd).await?,
            None => self.half.write_all(&payload).await?,
        }
        Ok(())
    }

    async fn send_with_fd(&mut self, payload: &[u8], fd: RawFd) -> io::Result<()> {
        let sent = {
            let stream: &UnixStream = self.half.as_ref();
            loop {
                stream.writable().await?;
                let attempt = stream.try_io(Interest::WRITABLE, || {
                    let iov = [IoSlice::new(payload)];
                    let fds = [fd];
                    let cmsg = [ControlMessage::ScmRights(&fds)];
                    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
                        .map_err(io::Error::from)
                });
                match attempt {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            }
        };
        // The descriptor rode on the first chunk; the tail is plain data.
        if sent < payload.len() {
            self.half.write_all(&payload[sent..]).await?;
        }
        Ok(())
    }
}

/// An established QMP connection, split for concurrent read and write
pub struct QmpConnection {
    pub decoder: QmpDecoder<OwnedReadHalf>,
    pub writer: QmpWriter,
}

impl QmpConnection {
    pub async fn connect(path: &Path) -> io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            decoder: QmpDecoder::new(read),
            writer: QmpWriter::new(write),
        })
    }
}

impl std::fmt::Debug for QmpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("QmpConnection")
    }
}
