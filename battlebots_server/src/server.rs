//! Server implementation.
//!
//! Accepts TCP connections and runs one task per connection. A connection is
//! bound to a bot by its `Hello` frame and then moves through
//!
//! ```text
//! Open ──State──▶ Subscribed ──▶ Closed
//!   └──────────── EOF / error ──▶ Closed
//! ```
//!
//! `Move` calls are answered in `Open` and never change the state. A frame
//! that does not decode is answered with `Status(InvalidArgument)` and the
//! connection stays open. Once subscribed the connection only carries events;
//! it ends with `EndOfStream` on shutdown, `Status(ResourceExhausted)` if the
//! subscriber was dropped for falling behind, or as soon as the client closes
//! its side. The subscription is released in every case.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use battlebots_shared::{
    config::BattleConfig,
    event::{BotId, StateChangeEvent},
    net::{
        decode_from_bytes, Call, Code, NetMsg, ReliableConn, ReliableListener, Status,
        PROTOCOL_VERSION,
    },
    shutdown::Shutdown,
};
use tracing::{debug, info, warn};

use crate::{
    battle::{Battle, BattleService},
    broadcast::{SubscriberId, Subscription},
};

/// Per-connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    Subscribed(SubscriberId),
    Closed,
}

struct Connection {
    conn: ReliableConn,
    peer: SocketAddr,
    bot: BotId,
    state: ConnState,
}

/// Bound on the final frame of a connection, which is written after shutdown.
const LAST_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

impl Connection {
    fn advance(&mut self, next: ConnState) {
        debug!(bot = %self.bot, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    /// Writes `msg` unless shutdown comes first. Returns `false` on shutdown;
    /// the frame may then be partially written and the connection is done.
    async fn send(&mut self, msg: &NetMsg, shutdown: &Shutdown) -> anyhow::Result<bool> {
        tokio::select! {
            biased;
            _ = shutdown.canceled() => Ok(false),
            sent = self.conn.send(msg) => sent.map(|()| true),
        }
    }

    /// Writes the closing frame, giving up on a client that stopped reading.
    async fn send_last(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        tokio::time::timeout(LAST_FRAME_TIMEOUT, self.conn.send(msg))
            .await
            .context("client stopped reading")?
    }
}

/// Battle RPC server.
pub struct BattleServer<S> {
    listener: ReliableListener,
    service: Arc<S>,
}

impl<S: BattleService> BattleServer<S> {
    /// Binds the listener for `service`.
    pub async fn bind(addr: SocketAddr, service: Arc<S>) -> anyhow::Result<Self> {
        let listener = ReliableListener::bind(addr).await?;
        Ok(Self { listener, service })
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    /// Accepts connections until `shutdown` is canceled.
    pub async fn serve(self, shutdown: Shutdown) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "Server listening");
        loop {
            let accepted = tokio::select! {
                _ = shutdown.canceled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((conn, peer)) => {
                    tokio::spawn(handle_connection(
                        conn,
                        peer,
                        self.service.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }
        info!("Server stopped accepting");
        Ok(())
    }
}

async fn handle_connection<S: BattleService>(
    mut conn: ReliableConn,
    peer: SocketAddr,
    service: Arc<S>,
    shutdown: Shutdown,
) {
    let bot = match handshake(&mut conn).await {
        Ok(bot) => bot,
        Err(e) => {
            warn!(%peer, error = %e, "Handshake failed");
            return;
        }
    };
    info!(%peer, bot = %bot, "Client connected");

    let mut c = Connection {
        conn,
        peer,
        bot,
        state: ConnState::Open,
    };
    let result = serve_calls(&mut c, service.as_ref(), &shutdown).await;
    c.advance(ConnState::Closed);

    match result {
        Ok(()) => info!(peer = %c.peer, bot = %c.bot, "Client disconnected"),
        Err(e) => warn!(peer = %c.peer, bot = %c.bot, error = %e, "Connection failed"),
    }
}

async fn handshake(conn: &mut ReliableConn) -> anyhow::Result<BotId> {
    match conn.recv().await? {
        NetMsg::Hello { protocol, bot } if protocol == PROTOCOL_VERSION => {
            conn.send(&NetMsg::Welcome { bot: bot.clone() }).await?;
            Ok(bot)
        }
        NetMsg::Hello { protocol, .. } => {
            let status = Status::new(
                Code::FailedPrecondition,
                format!("protocol {protocol} unsupported, server speaks {PROTOCOL_VERSION}"),
            );
            conn.send(&NetMsg::Status(status)).await?;
            anyhow::bail!("client protocol {protocol} unsupported")
        }
        other => anyhow::bail!("expected Hello, got {other:?}"),
    }
}

async fn serve_calls<S: BattleService>(
    c: &mut Connection,
    service: &S,
    shutdown: &Shutdown,
) -> anyhow::Result<()> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.canceled() => return Ok(()),
            frame = c.conn.recv_frame() => frame?,
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        // Frame boundaries survive a bad payload, so the connection stays usable.
        let call = match decode_from_bytes(&frame) {
            Ok(NetMsg::Call(call)) => call,
            Ok(other) => {
                debug!(bot = %c.bot, ?other, "Unexpected frame");
                let status = Status::invalid_argument("expected a call");
                if !c.send(&NetMsg::Status(status), shutdown).await? {
                    return Ok(());
                }
                continue;
            }
            Err(e) => {
                debug!(bot = %c.bot, error = %e, "Undecodable frame");
                let status = Status::invalid_argument(format!("{e:#}"));
                if !c.send(&NetMsg::Status(status), shutdown).await? {
                    return Ok(());
                }
                continue;
            }
        };

        let method = call.method();
        let reply = match call {
            Call::Move(req) => match service.move_bot(&c.bot, req).await {
                Ok(resp) => NetMsg::MoveAck(resp),
                Err(status) => NetMsg::Status(status),
            },
            Call::State(sub) => match service.state(&c.bot, sub).await {
                Ok(subscription) => {
                    c.advance(ConnState::Subscribed(subscription.id()));
                    return stream_events(c, subscription, shutdown).await;
                }
                Err(status) => NetMsg::Status(status),
            },
            Call::Unknown => NetMsg::Status(Status::unimplemented(method)),
        };
        if !c.send(&reply, shutdown).await? {
            return Ok(());
        }
    }
}

enum StreamStep {
    Event(StateChangeEvent),
    Ended,
    Shutdown,
    PeerClosed,
    PeerSent,
}

async fn stream_events(
    c: &mut Connection,
    mut sub: Subscription,
    shutdown: &Shutdown,
) -> anyhow::Result<()> {
    loop {
        let step = tokio::select! {
            _ = shutdown.canceled() => StreamStep::Shutdown,
            next = sub.recv() => match next {
                Some(event) => StreamStep::Event(event),
                None => StreamStep::Ended,
            },
            closed = c.conn.peer_activity() => {
                if closed? { StreamStep::PeerClosed } else { StreamStep::PeerSent }
            }
        };

        match step {
            StreamStep::Event(event) => {
                let sent = c
                    .send(&NetMsg::Event(event), shutdown)
                    .await
                    .context("forward event")?;
                if !sent {
                    return Ok(());
                }
            }
            StreamStep::Ended if sub.overflowed() => {
                let status = Status::resource_exhausted("event stream fell behind");
                return c.send_last(&NetMsg::Status(status)).await;
            }
            StreamStep::Ended | StreamStep::Shutdown => {
                return c.send_last(&NetMsg::EndOfStream).await;
            }
            StreamStep::PeerClosed => {
                debug!(bot = %c.bot, "Stream closed by client");
                return Ok(());
            }
            StreamStep::PeerSent => {
                let status = Status::invalid_argument("stream connections accept no further calls");
                return c.send_last(&NetMsg::Status(status)).await;
            }
        }
    }
}

/// Helper for tests: bind a full battle to an ephemeral port.
pub async fn bind_ephemeral(cfg: BattleConfig) -> anyhow::Result<(BattleServer<Battle>, BattleConfig)> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let battle = Arc::new(Battle::from_config(&cfg));
    let server = BattleServer::bind(addr, battle).await?;

    let mut cfg = cfg;
    cfg.server_addr = server.local_addr()?.to_string();
    Ok((server, cfg))
}
