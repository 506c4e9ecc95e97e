//! Server network layer: WebSocket transport and the tick scheduler.
//!
//! One actor task owns the [`World`]. Connection tasks and moderation tasks
//! talk to it only through [`ServerMessage`]s; the actor interleaves those with
//! four fixed-period timers.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use crate::client_manager::{
    outbound_channel, OutboundReceiver, OutboundSender, SessionHandle, OUTBOUND_QUEUE_FRAMES,
};
use crate::config::ServerConfig;
use crate::moderation::{moderate, ChatJob, ChatOutcome, TextFilter};
use crate::world::World;

/// Primary ticks between two stats log lines.
const STATS_EVERY_TICKS: u64 = 300;

/// How long a requested close frame may take before the socket is dropped anyway.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Messages sent from connection and moderation tasks to the actor
#[derive(Debug)]
pub enum ServerMessage {
    Connected {
        outbound: OutboundSender,
        reply: oneshot::Sender<Option<SessionHandle>>,
    },
    Frame {
        handle: SessionHandle,
        bytes: Vec<u8>,
    },
    Disconnected {
        handle: SessionHandle,
    },
    ChatModerated(ChatOutcome),
    Shutdown,
}

/// Main server coordinating networking and the world actor
pub struct Server<F: TextFilter> {
    listener: TcpListener,
    world: World,
    filter: Arc<F>,
    config: ServerConfig,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl<F: TextFilter> Server<F> {
    pub async fn bind(config: ServerConfig, filter: F) -> io::Result<Self> {
        let listener = TcpListener::bind(config.address()).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            listener,
            world: World::new(config.world()),
            filter: Arc::new(filter),
            config,
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for injecting messages, e.g. [`ServerMessage::Shutdown`].
    pub fn sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Runs the actor loop until a shutdown message arrives.
    pub async fn run(self) -> io::Result<()> {
        let Server {
            listener,
            mut world,
            filter,
            config,
            server_tx,
            mut server_rx,
        } = self;

        let acceptor = spawn_acceptor(listener, server_tx.clone());

        let mut frame = ticker(config.frame_period);
        let mut secondary = ticker(config.secondary_period);
        let mut roster = ticker(config.roster_period);
        let mut cosmetic = ticker(config.cosmetic_period);

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = server_rx.recv() => {
                    match message {
                        Some(ServerMessage::Connected { outbound, reply }) => {
                            let handle = world.on_open(outbound);
                            if reply.send(handle).is_err() {
                                // Connection task died before it learned its id.
                                if let Some(handle) = handle {
                                    world.on_close(handle);
                                }
                            }
                        }
                        Some(ServerMessage::Frame { handle, bytes }) => {
                            if let Some(job) = world.on_message(handle, &bytes) {
                                spawn_moderation(Arc::clone(&filter), job, server_tx.clone());
                            }
                        }
                        Some(ServerMessage::Disconnected { handle }) => {
                            world.on_close(handle);
                        }
                        Some(ServerMessage::ChatModerated(outcome)) => {
                            world.finish_chat(outcome);
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = frame.tick() => {
                    world.primary_tick();

                    let stats = world.stats();
                    if stats.ticks % STATS_EVERY_TICKS == 0 && stats.num_players > 0 {
                        info!(
                            "Tick {}: {} players, last snapshot {} bytes",
                            stats.ticks, stats.num_players, stats.last_snapshot_size
                        );
                    }
                },
                _ = secondary.tick() => world.secondary_tick(),
                _ = roster.tick() => world.roster_tick(),
                _ = cosmetic.tick() => world.cosmetic_tick(),
            }
        }

        acceptor.abort();
        Ok(())
    }
}

fn ticker(period: Duration) -> Interval {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

/// Spawns task that accepts TCP connections and hands each to its own task
fn spawn_acceptor(
    listener: TcpListener,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_connection(stream, addr, server_tx.clone()));
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    })
}

/// Runs a moderation round trip off the actor and posts the result back.
fn spawn_moderation<F: TextFilter>(
    filter: Arc<F>,
    job: ChatJob,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    tokio::spawn(async move {
        let outcome = moderate(filter.as_ref(), job).await;
        if server_tx.send(ServerMessage::ChatModerated(outcome)).is_err() {
            debug!("Moderation finished after shutdown");
        }
    });
}

/// Owns one socket: upgrades it, registers it, then pumps frames both ways.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }

    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut write, mut read) = ws.split();

    let (outbound, OutboundReceiver { mut frames, close }) =
        outbound_channel(OUTBOUND_QUEUE_FRAMES);
    let (reply_tx, reply_rx) = oneshot::channel();
    if server_tx
        .send(ServerMessage::Connected {
            outbound,
            reply: reply_tx,
        })
        .is_err()
    {
        return;
    }

    let handle = match reply_rx.await {
        Ok(Some(handle)) => handle,
        _ => {
            let _ = write.send(Message::Close(None)).await;
            return;
        }
    };
    info!("Session {} connected from {}", handle.id, addr);

    // A close request wins over queued frames and over a send stuck on a
    // peer that stopped reading.
    let mut writer = tokio::spawn(async move {
        let close_requested = tokio::select! {
            _ = pump_frames(&mut write, &mut frames, handle) => false,
            requested = close => requested.is_ok(),
        };
        if close_requested {
            let _ = timeout(CLOSE_GRACE, write.send(Message::Close(None))).await;
        }
    });

    loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(Message::Binary(bytes))) => {
                    if server_tx.send(ServerMessage::Frame { handle, bytes }).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(_))) => {
                    warn!("Dropping text frame from session {}", handle.id);
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Ping and pong are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Read from session {} failed: {}", handle.id, e);
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    writer.abort();
    let _ = server_tx.send(ServerMessage::Disconnected { handle });
    info!("Session {} disconnected", handle.id);
}

/// Forwards queued frames to the socket until the queue or the socket closes.
async fn pump_frames(
    write: &mut WsSink,
    frames: &mut mpsc::Receiver<Vec<u8>>,
    handle: SessionHandle,
) {
    while let Some(bytes) = frames.recv().await {
        if let Err(e) = write.send(Message::Binary(bytes)).await {
            debug!("Write to session {} failed: {}", handle.id, e);
            return;
        }
    }
}
