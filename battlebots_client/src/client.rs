//! Client implementation.
//!
//! The client keeps:
//! - A unary connection for `Move` calls, shared behind a lock
//! - One dedicated connection per `State` stream
//!
//! Both connections announce the same bot in their `Hello`, which is how the
//! server knows whose velocity a `Move` changes.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use battlebots_shared::{
    config::BattleConfig,
    event::{BotId, StateChangeEvent},
    math::Vector,
    net::{Call, MoveRequest, NetMsg, ReliableConn, StateChangeSubscription, PROTOCOL_VERSION},
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::runtime::EventSource;

/// Battle RPC client bound to one bot.
pub struct BattleClient {
    addr: SocketAddr,
    bot: BotId,
    unary: Mutex<ReliableConn>,
}

impl BattleClient {
    /// Connects to a server and performs handshake.
    pub async fn connect(addr: SocketAddr, bot: BotId) -> anyhow::Result<Self> {
        info!(server = %addr, bot = %bot, "Connecting to server");
        let unary = open(addr, &bot).await?;
        Ok(Self {
            addr,
            bot,
            unary: Mutex::new(unary),
        })
    }

    pub async fn from_config(cfg: &BattleConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        Self::connect(addr, BotId::new(cfg.bot_id.as_str())).await
    }

    pub fn bot(&self) -> &BotId {
        &self.bot
    }

    /// Sets this bot's velocity.
    pub async fn move_bot(&self, velocity: Vector) -> anyhow::Result<()> {
        let mut conn = self.unary.lock().await;
        conn.send(&NetMsg::Call(Call::Move(MoveRequest { velocity })))
            .await?;
        match conn.recv().await? {
            NetMsg::MoveAck(_) => Ok(()),
            NetMsg::Status(status) => Err(status.into()),
            other => anyhow::bail!("expected MoveAck, got {other:?}"),
        }
    }

    /// Opens a state-change event stream on a fresh connection.
    pub async fn state(&self, sub: StateChangeSubscription) -> anyhow::Result<EventStream> {
        let mut conn = open(self.addr, &self.bot).await?;
        conn.send(&NetMsg::Call(Call::State(sub))).await?;
        debug!(bot = %self.bot, "State stream requested");
        Ok(EventStream { conn })
    }
}

async fn open(addr: SocketAddr, bot: &BotId) -> anyhow::Result<ReliableConn> {
    let mut conn = ReliableConn::connect(addr).await?;
    conn.send(&NetMsg::Hello {
        protocol: PROTOCOL_VERSION,
        bot: bot.clone(),
    })
    .await?;

    match conn.recv().await? {
        NetMsg::Welcome { bot: welcomed } if &welcomed == bot => Ok(conn),
        NetMsg::Welcome { bot: welcomed } => {
            anyhow::bail!("server welcomed {welcomed}, expected {bot}")
        }
        NetMsg::Status(status) => Err(anyhow::Error::new(status).context("handshake rejected")),
        other => anyhow::bail!("expected Welcome, got {other:?}"),
    }
}

/// Server-to-client stream of state-change events.
#[derive(Debug)]
pub struct EventStream {
    conn: ReliableConn,
}

impl EventStream {
    /// Next event; `None` once the server has ended the stream cleanly.
    ///
    /// A `Status` from the server or a connection dropped mid-stream is an
    /// error.
    pub async fn recv(&mut self) -> anyhow::Result<Option<StateChangeEvent>> {
        match self.conn.recv_or_eof().await? {
            Some(NetMsg::Event(event)) => Ok(Some(event)),
            Some(NetMsg::EndOfStream) => Ok(None),
            Some(NetMsg::Status(status)) => Err(status.into()),
            Some(other) => anyhow::bail!("unexpected frame on event stream: {other:?}"),
            None => anyhow::bail!("event stream closed without end marker"),
        }
    }
}

#[async_trait]
impl EventSource for EventStream {
    async fn next_event(&mut self) -> anyhow::Result<Option<StateChangeEvent>> {
        self.recv().await
    }
}

/// Handle controllers use to act on the battle as their bot.
#[derive(Clone)]
pub struct Bot {
    client: Arc<BattleClient>,
}

impl Bot {
    pub fn new(client: Arc<BattleClient>) -> Self {
        Self { client }
    }

    pub fn id(&self) -> &BotId {
        self.client.bot()
    }

    /// Sets this bot's velocity.
    pub async fn move_with(&self, velocity: Vector) -> anyhow::Result<()> {
        self.client.move_bot(velocity).await
    }

    /// Planar shorthand for `move_with`.
    pub async fn move_by(&self, dx: f64, dy: f64) -> anyhow::Result<()> {
        self.move_with(Vector::planar(dx, dy)).await
    }
}
