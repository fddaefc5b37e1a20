//! NATS client protocol framing.
//!
//! The protocol is line oriented: a control line terminated by `\r\n`,
//! followed for `MSG`/`HMSG` by a payload of announced length and another
//! `\r\n`. Over WebSocket a single protocol op can span several frames (and
//! one frame can hold several ops), so [`NatsCodec`] decodes incrementally
//! from an accumulating buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Longest control line accepted from the server.
pub const MAX_CONTROL_LINE: usize = 4096;

/// Payload cap used until the server announces its `max_payload`.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

const CRLF: &[u8] = b"\r\n";

// ─────────────────────────────────────────────────────────────────────────────
// Ops
// ─────────────────────────────────────────────────────────────────────────────

/// Fields of the server `INFO` op that the client uses.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    /// Server identifier.
    pub server_id: String,
    /// Server name.
    pub server_name: String,
    /// Server version.
    pub version: String,
    /// Largest payload the server accepts.
    pub max_payload: u64,
    /// Whether credentials are required.
    pub auth_required: bool,
    /// Whether the server supports headers.
    pub headers: bool,
}

/// Fields of the client `CONNECT` op.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectInfo {
    /// Ask the server to acknowledge every op with `+OK`.
    pub verbose: bool,
    /// Strict subject checking.
    pub pedantic: bool,
    /// TLS required by the client.
    pub tls_required: bool,
    /// Client name.
    pub name: String,
    /// Client implementation language.
    pub lang: String,
    /// Client version.
    pub version: String,
    /// Protocol level (1 enables async INFO).
    pub protocol: u8,
    /// Receive own publications.
    pub echo: bool,
    /// Username.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
}

impl ConnectInfo {
    /// Connect options for a verbose, header-less client.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            verbose: true,
            pedantic: false,
            tls_required: false,
            name: name.into(),
            lang: "rust".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            protocol: 1,
            echo: true,
            user: None,
            pass: None,
        }
    }
}

/// Ops the client sends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientOp {
    /// `CONNECT {json}`
    Connect(ConnectInfo),
    /// `SUB <subject> <sid>`
    Sub {
        /// Subject, possibly with wildcards.
        subject: String,
        /// Client-chosen subscription id.
        sid: u64,
    },
    /// `UNSUB <sid>`
    Unsub {
        /// Subscription id.
        sid: u64,
    },
    /// `PING`
    Ping,
    /// `PONG`
    Pong,
}

/// Ops the server sends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerOp {
    /// `INFO {json}`
    Info(Box<ServerInfo>),
    /// `MSG` or `HMSG` (headers are stripped).
    Msg {
        /// Concrete subject.
        subject: String,
        /// Subscription id the message is for.
        sid: u64,
        /// Reply subject, if any.
        reply: Option<String>,
        /// Payload bytes.
        payload: Bytes,
    },
    /// `+OK`
    Ok,
    /// `-ERR '<reason>'`
    Err(String),
    /// `PING`
    Ping,
    /// `PONG`
    Pong,
}

/// Framing violations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A control line exceeded [`MAX_CONTROL_LINE`].
    #[error("control line exceeds {MAX_CONTROL_LINE} bytes")]
    ControlLineTooLong,
    /// Unrecognized op name.
    #[error("unknown op `{0}`")]
    UnknownOp(String),
    /// Arguments of a known op could not be parsed.
    #[error("invalid arguments for {op}: `{line}`")]
    InvalidArgs {
        /// Op name.
        op: &'static str,
        /// The offending line.
        line: String,
    },
    /// A payload length that cannot be framed.
    #[error("payload of {len} bytes exceeds {max}")]
    PayloadTooLarge {
        /// Announced length.
        len: usize,
        /// Cap in force.
        max: usize,
    },
    /// A payload was not followed by `\r\n`.
    #[error("payload not terminated by CRLF")]
    MissingTerminator,
    /// The `INFO` body was not valid JSON.
    #[error("invalid INFO: {0}")]
    Info(#[from] serde_json::Error),
    /// I/O failure (required by the codec traits).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec
// ─────────────────────────────────────────────────────────────────────────────

/// Incremental encoder/decoder for the NATS client protocol.
///
/// `MSG`/`HMSG` lines announcing more than the payload cap are rejected
/// before any payload is buffered.
#[derive(Debug)]
pub struct NatsCodec {
    pending: Option<PendingMsg>,
    max_payload: usize,
}

impl Default for NatsCodec {
    fn default() -> Self {
        Self {
            pending: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

#[derive(Debug)]
struct PendingMsg {
    subject: String,
    sid: u64,
    reply: Option<String>,
    header_len: usize,
    total_len: usize,
}

impl NatsCodec {
    /// Create a codec with no partial state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt the `max_payload` from a server `INFO`. Zero keeps the current cap.
    pub fn set_max_payload(&mut self, max_payload: u64) {
        if max_payload > 0 {
            self.max_payload = usize::try_from(max_payload).unwrap_or(usize::MAX);
        }
    }

    /// Largest payload length accepted in a `MSG`/`HMSG` line.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn take_payload(&mut self, src: &mut BytesMut) -> Result<Option<ServerOp>, ProtocolError> {
        let Some(total_len) = self.pending.as_ref().map(|p| p.total_len) else {
            return Ok(None);
        };
        let Some(frame_len) = total_len.checked_add(CRLF.len()) else {
            self.pending = None;
            return Err(ProtocolError::PayloadTooLarge {
                len: total_len,
                max: self.max_payload,
            });
        };
        if src.len() < frame_len {
            return Ok(None);
        }
        if &src[total_len..frame_len] != CRLF {
            return Err(ProtocolError::MissingTerminator);
        }
        let Some(pending) = self.pending.take() else {
            return Ok(None);
        };
        let mut body = src.split_to(pending.total_len);
        src.advance(CRLF.len());
        body.advance(pending.header_len);
        Ok(Some(ServerOp::Msg {
            subject: pending.subject,
            sid: pending.sid,
            reply: pending.reply,
            payload: body.freeze(),
        }))
    }
}

impl Decoder for NatsCodec {
    type Item = ServerOp;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerOp>, ProtocolError> {
        if self.pending.is_some() {
            return self.take_payload(src);
        }
        let Some(end) = src.windows(CRLF.len()).position(|w| w == CRLF) else {
            if src.len() > MAX_CONTROL_LINE {
                return Err(ProtocolError::ControlLineTooLong);
            }
            return Ok(None);
        };
        if end > MAX_CONTROL_LINE {
            return Err(ProtocolError::ControlLineTooLong);
        }
        let line = src.split_to(end);
        src.advance(CRLF.len());
        let line = String::from_utf8_lossy(&line).into_owned();

        let (op, args) = line
            .split_once([' ', '\t'])
            .map_or((line.as_str(), ""), |(op, args)| (op, args.trim()));
        match op.to_ascii_uppercase().as_str() {
            "MSG" => {
                self.pending = Some(parse_msg_args(args, false, &line, self.max_payload)?);
                self.take_payload(src)
            }
            "HMSG" => {
                self.pending = Some(parse_msg_args(args, true, &line, self.max_payload)?);
                self.take_payload(src)
            }
            "PING" => Ok(Some(ServerOp::Ping)),
            "PONG" => Ok(Some(ServerOp::Pong)),
            "+OK" => Ok(Some(ServerOp::Ok)),
            "-ERR" => Ok(Some(ServerOp::Err(
                args.trim_matches('\'').trim().to_owned(),
            ))),
            "INFO" => Ok(Some(ServerOp::Info(Box::new(serde_json::from_str(args)?)))),
            _ => Err(ProtocolError::UnknownOp(op.to_owned())),
        }
    }
}

fn parse_msg_args(
    args: &str,
    headers: bool,
    line: &str,
    max_payload: usize,
) -> Result<PendingMsg, ProtocolError> {
    let op = if headers { "HMSG" } else { "MSG" };
    let invalid = || ProtocolError::InvalidArgs {
        op,
        line: line.to_owned(),
    };
    let parts: Vec<&str> = args.split_whitespace().collect();
    let sizes = if headers { 2 } else { 1 };
    let (subject, sid, reply, rest) = match parts.len() - sizes.min(parts.len()) {
        2 => (parts[0], parts[1], None, &parts[2..]),
        3 => (parts[0], parts[1], Some(parts[2].to_owned()), &parts[3..]),
        _ => return Err(invalid()),
    };
    let sid = sid.parse().map_err(|_| invalid())?;
    let (header_len, total_len) = if headers {
        let header_len: usize = rest[0].parse().map_err(|_| invalid())?;
        let total_len: usize = rest[1].parse().map_err(|_| invalid())?;
        if header_len > total_len {
            return Err(invalid());
        }
        (header_len, total_len)
    } else {
        (0, rest[0].parse().map_err(|_| invalid())?)
    };
    if total_len > max_payload {
        return Err(invalid());
    }
    Ok(PendingMsg {
        subject: subject.to_owned(),
        sid,
        reply,
        header_len,
        total_len,
    })
}

impl Encoder<ClientOp> for NatsCodec {
    type Error = ProtocolError;

    fn encode(&mut self, op: ClientOp, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match op {
            ClientOp::Connect(info) => {
                dst.put_slice(b"CONNECT ");
                dst.put_slice(&serde_json::to_vec(&info)?);
            }
            ClientOp::Sub { subject, sid } => {
                dst.put_slice(format!("SUB {subject} {sid}").as_bytes());
            }
            ClientOp::Unsub { sid } => {
                dst.put_slice(format!("UNSUB {sid}").as_bytes());
            }
            ClientOp::Ping => dst.put_slice(b"PING"),
            ClientOp::Pong => dst.put_slice(b"PONG"),
        }
        dst.put_slice(CRLF);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
