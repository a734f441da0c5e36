//! Networking primitives.
//!
//! Goals:
//! - Provide the battle RPC surface (`Move`, `State`) as framed messages.
//! - Carry call failures as an explicit `Status`, never as a dropped socket.
//! - Keep serialization explicit and versionable.
//!
//! Every connection starts with `Hello`, which binds the connection to the
//! calling bot. After that the client sends `Call`s. A `State` call turns the
//! connection into a one-way event stream until either side closes it.

use std::{fmt, net::SocketAddr};

use anyhow::Context;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    event::{BotId, StateChangeEvent},
    math::Vector,
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame; anything larger is treated as corruption.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Sets the velocity of the calling bot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MoveRequest {
    pub velocity: Vector,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MoveResponse {}

/// Opens the event stream. Carries no filter yet: every bot is broadcast.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateChangeSubscription {}

/// RPC method invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method")]
pub enum Call {
    Move(MoveRequest),
    State(StateChangeSubscription),
    /// A method this build does not know; answered with `NotImplemented`.
    #[serde(other)]
    Unknown,
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Call::Move(_) => "Move",
            Call::State(_) => "State",
            Call::Unknown => "unknown",
        }
    }
}

/// High-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Connection handshake ───
    Hello { protocol: u32, bot: BotId },
    Welcome { bot: BotId },

    // ─── Client -> server ───
    Call(Call),

    // ─── Server -> client ───
    MoveAck(MoveResponse),
    Event(StateChangeEvent),
    /// The server finished the stream without error.
    EndOfStream,
    /// The call failed; on a stream connection this is the last frame.
    Status(Status),
}

/// Status codes for failed calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    NotImplemented,
    InvalidArgument,
    FailedPrecondition,
    ResourceExhausted,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Code::NotImplemented => "not implemented",
            Code::InvalidArgument => "invalid argument",
            Code::FailedPrecondition => "failed precondition",
            Code::ResourceExhausted => "resource exhausted",
        };
        f.write_str(s)
    }
}

/// Call outcome reported to the caller instead of a result.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unimplemented(method: &str) -> Self {
        Self::new(Code::NotImplemented, format!("method {method} not implemented"))
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let buf = encode_frame(msg)?;
        self.stream.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        self.recv_or_eof()
            .await?
            .context("connection closed by peer")
    }

    /// Like `recv`, but a close between frames yields `None`.
    pub async fn recv_or_eof(&mut self) -> anyhow::Result<Option<NetMsg>> {
        match self.recv_frame().await? {
            Some(payload) => Ok(Some(decode_from_bytes(&payload)?)),
            None => Ok(None),
        }
    }

    /// Reads one raw frame payload. `None` only when the peer closed before
    /// sending any byte of the next frame; a close mid-frame is an error.
    pub async fn recv_frame(&mut self) -> anyhow::Result<Option<BytesMut>> {
        let mut len_buf = [0u8; 4];
        let n = self
            .stream
            .read(&mut len_buf[..1])
            .await
            .context("tcp read len")?;
        if n == 0 {
            return Ok(None);
        }
        self.stream
            .read_exact(&mut len_buf[1..])
            .await
            .context("tcp read len")?;
        let len = u32::from_be_bytes(len_buf) as usize;
        anyhow::ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds limit");
        let mut payload = BytesMut::zeroed(len);
        self.stream
            .read_exact(&mut payload)
            .await
            .context("tcp read payload")?;
        Ok(Some(payload))
    }

    /// Waits until the peer sends more data or closes, without consuming
    /// anything. Returns `true` when the peer closed.
    pub async fn peer_activity(&self) -> anyhow::Result<bool> {
        let mut buf = [0u8; 1];
        let n = self.stream.peek(&mut buf).await.context("tcp peek")?;
        Ok(n == 0)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

fn encode_frame(msg: &NetMsg) -> anyhow::Result<BytesMut> {
    let payload = serde_json::to_vec(msg).context("serialize msg")?;
    anyhow::ensure!(
        payload.len() <= MAX_FRAME_LEN,
        "frame of {} bytes exceeds limit",
        payload.len()
    );
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize msg")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_method_decodes_as_unknown_call() {
        let raw = br#"{"Call":{"method":"Attack","target":"b"}}"#;
        let msg = decode_from_bytes(raw).unwrap();
        assert_eq!(msg, NetMsg::Call(Call::Unknown));
    }

    #[test]
    fn move_call_wire_shape() {
        let msg = NetMsg::Call(Call::Move(MoveRequest {
            velocity: Vector::planar(1.0, 0.0),
        }));
        let frame = encode_frame(&msg).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&frame[4..]).unwrap();
        assert_eq!(json["Call"]["method"], "Move");
        assert_eq!(json["Call"]["velocity"]["x"], 1.0);
    }

    #[test]
    fn status_display_names_code() {
        let status = Status::unimplemented("Move");
        assert_eq!(status.to_string(), "not implemented: method Move not implemented");
    }

    #[tokio::test]
    async fn frames_cross_a_socket_and_eof_is_clean() -> anyhow::Result<()> {
        let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
        let addr = listener.local_addr()?;

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await?;
            let first = conn.recv().await?;
            let second = conn.recv_or_eof().await?;
            Ok::<_, anyhow::Error>((first, second))
        });

        let mut client = ReliableConn::connect(addr).await?;
        let hello = NetMsg::Hello {
            protocol: PROTOCOL_VERSION,
            bot: BotId::new("a"),
        };
        client.send(&hello).await?;
        drop(client);

        let (first, second) = server.await??;
        assert_eq!(first, hello);
        assert_eq!(second, None);
        Ok(())
    }

    #[tokio::test]
    async fn close_inside_length_prefix_is_an_error() -> anyhow::Result<()> {
        let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
        let addr = listener.local_addr()?;

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await?;
            Ok::<_, anyhow::Error>(conn.recv_or_eof().await)
        });

        let mut raw = TcpStream::connect(addr).await?;
        raw.write_all(&[0, 0]).await?;
        drop(raw);

        let result = server.await??;
        assert!(result.is_err(), "truncated header read as {result:?}");
        Ok(())
    }

    #[tokio::test]
    async fn peer_activity_reports_close() -> anyhow::Result<()> {
        let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
        let addr = listener.local_addr()?;
        let client = ReliableConn::connect(addr).await?;
        let (conn, _) = listener.accept().await?;

        drop(client);
        assert!(conn.peer_activity().await?);
        Ok(())
    }
}
