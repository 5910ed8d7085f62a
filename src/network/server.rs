//! WebSocket Connection Gateway
//!
//! Terminates the wire transport, deserializes inbound events into
//! typed commands, routes them through the room registry and the match
//! state machine, and serializes outbound broadcasts.
//!
//! All room mutation happens under the room's write lock, and every
//! resulting send goes out through unbounded channels before the lock
//! is released, so broadcast order always equals acceptance order. The
//! lock is never held across an await point.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::game::actions::LossClaim;
use crate::game::state::{PlayerSlot, RoomStatus, WinReason};
use crate::game::words::Tier;
use crate::network::protocol::{self, ClientMessage, ReadySummary, ServerMessage};
use crate::network::registry::{LeaveReport, RoomRegistry};
use crate::network::session::{Outbound, SessionMap};
use crate::network::timers::{TimerKind, TimerTable};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How long a disconnected player may return before forfeiting.
    pub disconnect_grace: Duration,
    /// How long a raised shield lasts if nothing hits it.
    pub shield_duration: Duration,
    /// How long an empty room survives before deletion.
    pub empty_room_grace: Duration,
    /// How long a finished room stays queryable.
    pub room_linger: Duration,
    /// Sweep cadence for expired rooms.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".parse().unwrap(),
            max_connections: 1000,
            disconnect_grace: Duration::from_secs(45),
            shield_duration: Duration::from_secs(5),
            empty_room_grace: Duration::from_secs(30),
            room_linger: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let addr = std::env::var("TYPE_ROYALE_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.bind_addr);
        let grace = env_secs("TYPE_ROYALE_GRACE_SECS").unwrap_or(defaults.disconnect_grace);
        let linger = env_secs("TYPE_ROYALE_LINGER_SECS").unwrap_or(defaults.room_linger);
        Self {
            bind_addr: addr,
            disconnect_grace: grace,
            room_linger: linger,
            ..defaults
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Per-connection identity, established by the first event carrying a
/// `userId`. The epoch pins the bind generation: once a newer
/// connection binds the same identity, this one's events are ignored.
#[derive(Debug, Default)]
struct ConnState {
    user_id: Option<String>,
    epoch: u64,
}

/// State shared by every connection task.
struct Shared {
    config: ServerConfig,
    rooms: RoomRegistry,
    sessions: SessionMap,
    timers: TimerTable,
    connections: AtomicUsize,
}

/// The game server.
pub struct GameServer {
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(Shared {
                config,
                rooms: RoomRegistry::new(),
                sessions: SessionMap::new(),
                timers: TimerTable::new(),
                connections: AtomicUsize::new(0),
            }),
            shutdown_tx,
        }
    }

    /// Run the accept loop until shutdown.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        info!("Type Royale server listening on {}", self.shared.config.bind_addr);

        // Background sweep for expired rooms.
        let sweep_shared = self.shared.clone();
        let sweep_handle = tokio::spawn(async move {
            let mut ticker = interval(sweep_shared.config.sweep_interval);
            loop {
                ticker.tick().await;
                Shared::sweep_expired(&sweep_shared).await;
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let live = self.shared.connections.load(Ordering::Relaxed);
                            if live >= self.shared.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            self.spawn_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        sweep_handle.abort();
        Ok(())
    }

    /// Spawn the task pair for one accepted connection.
    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let shared = self.shared.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };
            shared.connections.fetch_add(1, Ordering::Relaxed);
            debug!("Connection established: {}", addr);

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

            // Writer task: drains the outbound queue.
            let writer = tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            let mut conn = ConnState::default();
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match ClientMessage::from_json(&text) {
                                    Ok(event) => {
                                        Shared::handle_message(&shared, event, &mut conn, &tx).await;
                                    }
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = tx.send(ServerMessage::InvalidAction {
                                            message: "Invalid message format".to_string(),
                                        });
                                    }
                                }
                            }
                            // tungstenite answers pings on the shared context.
                            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                debug!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            writer.abort();
            Shared::connection_closed(&shared, &conn).await;
            shared.connections.fetch_sub(1, Ordering::Relaxed);
            debug!("Connection cleaned up: {}", addr);
        });
    }

    /// Signal the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Live connection count.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Live room count.
    pub async fn room_count(&self) -> usize {
        self.shared.rooms.len().await
    }

    /// Known session count.
    pub async fn session_count(&self) -> usize {
        self.shared.sessions.len().await
    }
}

impl Shared {
    /// Route one inbound event.
    async fn handle_message(
        shared: &Arc<Shared>,
        msg: ClientMessage,
        conn: &mut ConnState,
        tx: &Outbound,
    ) {
        match msg {
            ClientMessage::CreateRoom { username, user_id } => {
                Self::handle_create_room(shared, &username, &user_id, conn, tx).await;
            }
            ClientMessage::JoinRoom {
                room_id,
                username,
                user_id,
            } => {
                Self::handle_join_room(shared, &room_id, &username, &user_id, conn, tx).await;
            }
            ClientMessage::RejoinRoom {
                room_id,
                username,
                user_id,
                ..
            } => {
                Self::handle_rejoin_room(shared, &room_id, &username, &user_id, conn, tx).await;
            }
            ClientMessage::PlayerReady { room_id } => {
                Self::handle_player_ready(shared, &room_id, conn, tx).await;
            }
            ClientMessage::SendAttack {
                room_id,
                attack_type,
                typed_word,
            } => {
                Self::handle_send_attack(shared, &room_id, &attack_type, &typed_word, conn, tx)
                    .await;
            }
            ClientMessage::ActivateShield { room_id, typed_word } => {
                Self::handle_activate_shield(shared, &room_id, &typed_word, conn, tx).await;
            }
            ClientMessage::PlayerLose { room_id } => {
                Self::handle_player_lose(shared, &room_id, conn, tx).await;
            }
            ClientMessage::LeaveRoom { room_id } => {
                Self::handle_leave_room(shared, &room_id, conn, tx).await;
            }
        }
    }

    /// Bind this connection to the presented identity. Any prior
    /// connection for the same identity is superseded.
    async fn bind_identity(
        shared: &Arc<Shared>,
        conn: &mut ConnState,
        user_id: &str,
        username: &str,
        tx: &Outbound,
    ) {
        let epoch = shared.sessions.bind(user_id, username, tx.clone()).await;
        conn.user_id = Some(user_id.to_string());
        conn.epoch = epoch;
    }

    /// Identity of this connection, if it is still the current bind.
    /// Superseded connections are ignored without a reply.
    async fn current_user(shared: &Arc<Shared>, conn: &ConnState, tx: &Outbound) -> Option<String> {
        let user_id = match &conn.user_id {
            Some(id) => id.clone(),
            None => {
                let _ = tx.send(ServerMessage::InvalidAction {
                    message: "Identify with create_room, join_room or rejoin_room first"
                        .to_string(),
                });
                return None;
            }
        };
        match shared.sessions.verify(&user_id, conn.epoch).await {
            Ok(()) => Some(user_id),
            Err(e) => {
                debug!(user = %user_id, "ignoring event from superseded connection: {}", e);
                None
            }
        }
    }

    async fn handle_create_room(
        shared: &Arc<Shared>,
        username: &str,
        user_id: &str,
        conn: &mut ConnState,
        tx: &Outbound,
    ) {
        Self::bind_identity(shared, conn, user_id, username, tx).await;
        match shared.rooms.create_room(user_id, username, tx.clone()).await {
            Ok((code, _room)) => {
                shared.sessions.set_room(user_id, Some(code)).await;
            }
            Err(e) => {
                let _ = tx.send(ServerMessage::JoinRoomError {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn handle_join_room(
        shared: &Arc<Shared>,
        room_id: &str,
        username: &str,
        user_id: &str,
        conn: &mut ConnState,
        tx: &Outbound,
    ) {
        Self::bind_identity(shared, conn, user_id, username, tx).await;
        match shared
            .rooms
            .join_room(room_id, user_id, username, tx.clone())
            .await
        {
            Ok((_room, _report)) => {
                shared.sessions.set_room(user_id, Some(room_id.to_string())).await;
            }
            Err(e) => {
                let _ = tx.send(ServerMessage::JoinRoomError {
                    message: e.to_string(),
                });
            }
        }
    }

    /// Reconnection is state-sync, not event-replay: the rejoiner gets
    /// one authoritative snapshot. Replaying the same rejoin any
    /// number of times has no side effect beyond the first.
    async fn handle_rejoin_room(
        shared: &Arc<Shared>,
        room_id: &str,
        username: &str,
        user_id: &str,
        conn: &mut ConnState,
        tx: &Outbound,
    ) {
        Self::bind_identity(shared, conn, user_id, username, tx).await;

        let room = match shared.rooms.get(room_id).await {
            Some(room) => room,
            None => {
                let _ = tx.send(ServerMessage::RejoinFailed {
                    message: "Room no longer exists".to_string(),
                });
                return;
            }
        };

        // A concurrent bind for the same identity wins the race.
        if let Err(e) = shared.sessions.verify(user_id, conn.epoch).await {
            let _ = tx.send(ServerMessage::RejoinFailed {
                message: e.to_string(),
            });
            return;
        }

        let rebound = {
            let mut guard = room.write().await;
            let slot = match guard.state.slot_of(user_id) {
                Some(slot) => slot,
                None => {
                    let _ = tx.send(ServerMessage::RejoinFailed {
                        message: "You are not part of this room".to_string(),
                    });
                    return;
                }
            };
            if guard.state.status == RoomStatus::Finished {
                let _ = tx.send(ServerMessage::RejoinFailed {
                    message: "Match already finished".to_string(),
                });
                return;
            }

            let was_disconnected = guard
                .state
                .player(slot)
                .map(|p| !p.connected)
                .unwrap_or(false);
            if let Some(player) = guard.state.player_mut(slot) {
                player.connected = true;
            }
            guard.bind_sender(slot, tx.clone());

            if let Some(snapshot) = protocol::rejoin_snapshot(&guard.state, &guard.code, slot) {
                let _ = tx.send(snapshot);
            }
            if was_disconnected {
                guard.send_opponent(slot, ServerMessage::PlayerReconnected);
            }
            slot
        };

        shared
            .timers
            .cancel(&(room_id.to_string(), TimerKind::DisconnectGrace(rebound)))
            .await;
        shared.sessions.set_room(user_id, Some(room_id.to_string())).await;
        debug!(room = %room_id, user = %username, "rejoin succeeded");
    }

    async fn handle_player_ready(
        shared: &Arc<Shared>,
        room_id: &str,
        conn: &mut ConnState,
        tx: &Outbound,
    ) {
        let Some(user_id) = Self::current_user(shared, conn, tx).await else {
            return;
        };
        let Some(room) = shared.rooms.get(room_id).await else {
            let _ = tx.send(ServerMessage::InvalidAction {
                message: "Room not found".to_string(),
            });
            return;
        };

        let mut guard = room.write().await;
        match guard.state.mark_ready(&user_id, &mut rand::thread_rng()) {
            Err(e) => {
                let _ = tx.send(ServerMessage::InvalidAction {
                    message: e.to_string(),
                });
            }
            Ok(update) => {
                let players = update
                    .players
                    .iter()
                    .map(|flag| ReadySummary {
                        username: flag.username.clone(),
                        ready: flag.ready,
                    })
                    .collect();
                guard.broadcast(ServerMessage::PlayerReadyUpdate { players });

                if let Some(start) = update.started {
                    let words: Vec<String> =
                        start.words.iter().map(|w| w.to_string()).collect();
                    for idx in 0..guard.state.players.len() {
                        let Some(slot) = PlayerSlot::from_index(idx) else {
                            continue;
                        };
                        let view =
                            protocol::game_state_view(&guard.state, &guard.code, Some(slot));
                        guard.send_to(
                            slot,
                            ServerMessage::GameStart {
                                words: words.clone(),
                                your_player_id: slot,
                                game_state: view,
                            },
                        );
                    }
                    info!(room = %room_id, "match started");
                }
            }
        }
    }

    async fn handle_send_attack(
        shared: &Arc<Shared>,
        room_id: &str,
        attack_type: &str,
        typed_word: &str,
        conn: &mut ConnState,
        tx: &Outbound,
    ) {
        let Some(user_id) = Self::current_user(shared, conn, tx).await else {
            return;
        };
        let Some(room) = shared.rooms.get(room_id).await else {
            let _ = tx.send(ServerMessage::InvalidAction {
                message: "Room not found".to_string(),
            });
            return;
        };

        let mut absorbed_shield = None;
        let mut finished = false;
        {
            let mut guard = room.write().await;
            match guard
                .state
                .submit_attack(&user_id, attack_type, typed_word, &mut rand::thread_rng())
            {
                Err(e) => {
                    // Sender-only: the opponent never learns of failed
                    // attempts.
                    let _ = tx.send(ServerMessage::InvalidAction {
                        message: e.to_string(),
                    });
                }
                Ok(report) => {
                    guard.broadcast(ServerMessage::AttackLaunched {
                        from: report.attacker,
                    });
                    guard.send_to(
                        report.attacker,
                        ServerMessage::WordAssignment {
                            tier: report.tier,
                            word: report.next_word.to_string(),
                        },
                    );
                    guard.send_to(
                        report.target,
                        ServerMessage::ReceiveAttack {
                            blocked: report.blocked.then_some(true),
                            target_hp: report.target_hp,
                        },
                    );
                    guard.broadcast(ServerMessage::AttackImpact {
                        target_player_id: report.target,
                        target_hp: report.target_hp,
                    });

                    if report.blocked {
                        absorbed_shield = Some(report.target);
                    }
                    if report.ended.is_some() {
                        guard.mark_finished();
                        let match_id = guard.match_id.to_string();
                        if let Some(result) = protocol::match_result(&guard.state, &match_id) {
                            guard.broadcast(result);
                        }
                        finished = true;
                        info!(room = %room_id, "match finished");
                    }
                }
            }
        }

        if let Some(slot) = absorbed_shield {
            // The absorbed attack consumed the shield; its expiry
            // timer must not fire later.
            shared
                .timers
                .cancel(&(room_id.to_string(), TimerKind::ShieldExpiry(slot)))
                .await;
        }
        if finished {
            shared.timers.cancel_room(room_id).await;
        }
    }

    async fn handle_activate_shield(
        shared: &Arc<Shared>,
        room_id: &str,
        typed_word: &str,
        conn: &mut ConnState,
        tx: &Outbound,
    ) {
        let Some(user_id) = Self::current_user(shared, conn, tx).await else {
            return;
        };
        let Some(room) = shared.rooms.get(room_id).await else {
            let _ = tx.send(ServerMessage::InvalidAction {
                message: "Room not found".to_string(),
            });
            return;
        };

        let mut raised = None;
        let mut finished = false;
        {
            let mut guard = room.write().await;
            match guard
                .state
                .submit_shield(&user_id, typed_word, &mut rand::thread_rng())
            {
                Err(e) => {
                    let _ = tx.send(ServerMessage::InvalidAction {
                        message: e.to_string(),
                    });
                }
                Ok(report) => {
                    guard.send_opponent(report.slot, ServerMessage::EnemyShieldActive);
                    guard.send_to(report.slot, ServerMessage::ShieldActivated);
                    guard.send_to(
                        report.slot,
                        ServerMessage::WordAssignment {
                            tier: Tier::Shield,
                            word: report.next_word.to_string(),
                        },
                    );
                    if report.ended.is_some() {
                        guard.mark_finished();
                        let match_id = guard.match_id.to_string();
                        if let Some(result) = protocol::match_result(&guard.state, &match_id) {
                            guard.broadcast(result);
                        }
                        finished = true;
                    } else {
                        raised = Some(report.slot);
                    }
                }
            }
        }

        if finished {
            shared.timers.cancel_room(room_id).await;
        }
        if let Some(slot) = raised {
            let timer_shared = shared.clone();
            let timer_room = room_id.to_string();
            shared
                .timers
                .schedule(
                    (room_id.to_string(), TimerKind::ShieldExpiry(slot)),
                    shared.config.shield_duration,
                    async move {
                        if let Some(room) = timer_shared.rooms.get(&timer_room).await {
                            let mut guard = room.write().await;
                            if guard.state.expire_shield(slot) {
                                debug!(room = %timer_room, slot = slot.as_str(), "shield expired");
                            }
                        }
                    },
                )
                .await;
        }
    }

    async fn handle_player_lose(
        shared: &Arc<Shared>,
        room_id: &str,
        conn: &mut ConnState,
        tx: &Outbound,
    ) {
        let Some(user_id) = Self::current_user(shared, conn, tx).await else {
            return;
        };
        let Some(room) = shared.rooms.get(room_id).await else {
            let _ = tx.send(ServerMessage::InvalidAction {
                message: "Room not found".to_string(),
            });
            return;
        };

        let mut finished = false;
        {
            let mut guard = room.write().await;
            match guard.state.claim_loss(&user_id) {
                Err(e) => {
                    let _ = tx.send(ServerMessage::InvalidAction {
                        message: e.to_string(),
                    });
                }
                Ok(LossClaim::AlreadyEnded) => {
                    // Late result delivery, to the asker only.
                    let match_id = guard.match_id.to_string();
                    if let Some(result) = protocol::match_result(&guard.state, &match_id) {
                        let _ = tx.send(result);
                    }
                }
                Ok(LossClaim::Ended(_)) => {
                    guard.mark_finished();
                    let match_id = guard.match_id.to_string();
                    if let Some(result) = protocol::match_result(&guard.state, &match_id) {
                        guard.broadcast(result);
                    }
                    finished = true;
                    info!(room = %room_id, "match finished by loss claim");
                }
            }
        }

        if finished {
            shared.timers.cancel_room(room_id).await;
        }
    }

    async fn handle_leave_room(
        shared: &Arc<Shared>,
        room_id: &str,
        conn: &mut ConnState,
        tx: &Outbound,
    ) {
        let Some(user_id) = Self::current_user(shared, conn, tx).await else {
            return;
        };

        match shared.rooms.leave_room(room_id, &user_id).await {
            Err(e) => {
                let _ = tx.send(ServerMessage::InvalidAction {
                    message: e.to_string(),
                });
                return;
            }
            Ok((_room, LeaveReport::Forfeited(_))) => {
                shared.timers.cancel_room(room_id).await;
            }
            Ok((_room, LeaveReport::Left { now_empty })) => {
                if now_empty {
                    Self::schedule_room_cleanup(shared, room_id).await;
                }
            }
        }

        // Explicit leave destroys the session; the next contact starts
        // fresh.
        shared.sessions.remove(&user_id).await;
        conn.user_id = None;
        conn.epoch = 0;
    }

    /// Delete an empty room once its grace window passes, unless
    /// someone joined in the meantime.
    async fn schedule_room_cleanup(shared: &Arc<Shared>, room_id: &str) {
        let timer_shared = shared.clone();
        let timer_room = room_id.to_string();
        shared
            .timers
            .schedule(
                (room_id.to_string(), TimerKind::RoomCleanup),
                shared.config.empty_room_grace,
                async move {
                    let still_empty = match timer_shared.rooms.get(&timer_room).await {
                        Some(room) => room.read().await.state.is_empty(),
                        None => false,
                    };
                    if still_empty {
                        timer_shared.rooms.remove(&timer_room).await;
                        timer_shared.timers.cancel_room(&timer_room).await;
                        info!(room = %timer_room, "empty room deleted");
                    }
                },
            )
            .await;
    }

    /// Transport disconnect: unbind the session (stale epochs are
    /// no-ops), mark the player disconnected and start the grace
    /// timer. Membership and battle state are untouched.
    async fn connection_closed(shared: &Arc<Shared>, conn: &ConnState) {
        let Some(user_id) = &conn.user_id else {
            return;
        };
        let Some(report) = shared.sessions.unbind(user_id, conn.epoch).await else {
            return;
        };
        let Some(code) = report.room_id else {
            return;
        };
        let Some(room) = shared.rooms.get(&code).await else {
            return;
        };

        let slot = {
            let mut guard = room.write().await;
            let Some(slot) = guard.state.slot_of(user_id) else {
                return;
            };
            if let Some(player) = guard.state.player_mut(slot) {
                player.connected = false;
            }
            guard.clear_sender(slot);
            if guard.state.status == RoomStatus::Playing {
                guard.send_opponent(slot, ServerMessage::PlayerTemporarilyDisconnected);
            }
            slot
        };
        debug!(room = %code, user = %user_id, "player temporarily disconnected");

        let timer_shared = shared.clone();
        let timer_user = user_id.clone();
        let timer_code = code.clone();
        shared
            .timers
            .schedule(
                (code, TimerKind::DisconnectGrace(slot)),
                shared.config.disconnect_grace,
                async move {
                    Shared::grace_expired(timer_shared, timer_code, timer_user).await;
                },
            )
            .await;
    }

    /// The grace window passed without a rebind: the disconnect is now
    /// permanent.
    async fn grace_expired(shared: Arc<Shared>, code: String, user_id: String) {
        let Some(room) = shared.rooms.get(&code).await else {
            return;
        };

        let mut finished = false;
        let mut now_empty = false;
        {
            let mut guard = room.write().await;
            let Some(slot) = guard.state.slot_of(&user_id) else {
                return;
            };
            let still_disconnected = guard
                .state
                .player(slot)
                .map(|p| !p.connected)
                .unwrap_or(false);
            if !still_disconnected {
                return;
            }

            match guard.state.status {
                RoomStatus::Playing => {
                    let username = guard
                        .state
                        .player(slot)
                        .map(|p| p.username.clone())
                        .unwrap_or_default();
                    if guard
                        .state
                        .forfeit(slot, WinReason::OpponentForfeited)
                        .is_some()
                    {
                        guard.mark_finished();
                        guard.broadcast(ServerMessage::PlayerDisconnected {
                            message: format!("{} disconnected", username),
                        });
                        let match_id = guard.match_id.to_string();
                        if let Some(result) = protocol::match_result(&guard.state, &match_id) {
                            guard.broadcast(result);
                        }
                        finished = true;
                        info!(room = %code, user = %user_id, "forfeited after grace window");
                    }
                }
                RoomStatus::Lobby | RoomStatus::Finished => {
                    now_empty = guard.remove_member(&user_id).unwrap_or(false);
                }
            }
        }

        if finished {
            shared.timers.cancel_room(&code).await;
        }
        if now_empty {
            shared.rooms.remove(&code).await;
            shared.timers.cancel_room(&code).await;
            info!(room = %code, "empty room deleted");
        }
        shared.sessions.remove(&user_id).await;
    }

    /// Periodic reclamation of expired rooms and their resources.
    async fn sweep_expired(shared: &Arc<Shared>) {
        let removed = shared
            .rooms
            .sweep(shared.config.empty_room_grace, shared.config.room_linger)
            .await;
        for code in removed {
            shared.timers.cancel_room(&code).await;
            shared.sessions.remove_by_room(&code).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::{MAX_AMMO, MAX_HP};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_shared(grace: Duration, shield: Duration, empty_grace: Duration) -> Arc<Shared> {
        Arc::new(Shared {
            config: ServerConfig {
                disconnect_grace: grace,
                shield_duration: shield,
                empty_room_grace: empty_grace,
                ..ServerConfig::default()
            },
            rooms: RoomRegistry::new(),
            sessions: SessionMap::new(),
            timers: TimerTable::new(),
            connections: AtomicUsize::new(0),
        })
    }

    fn connect() -> (ConnState, Outbound, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnState::default(), tx, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn send(shared: &Arc<Shared>, conn: &mut ConnState, tx: &Outbound, msg: ClientMessage) {
        Shared::handle_message(shared, msg, conn, tx).await;
    }

    /// Create a room as Alice, join as Bob, ready both. Returns the
    /// room code and both connection halves, with queues drained up to
    /// and including `game_start`.
    async fn start_match(
        shared: &Arc<Shared>,
    ) -> (
        String,
        (ConnState, Outbound, UnboundedReceiver<ServerMessage>),
        (ConnState, Outbound, UnboundedReceiver<ServerMessage>),
    ) {
        let (mut alice, alice_tx, mut alice_rx) = connect();
        let (mut bob, bob_tx, mut bob_rx) = connect();

        send(
            shared,
            &mut alice,
            &alice_tx,
            ClientMessage::CreateRoom {
                username: "Alice".into(),
                user_id: "u-alice".into(),
            },
        )
        .await;
        let code = drain(&mut alice_rx)
            .iter()
            .find_map(|m| match m {
                ServerMessage::RoomCreated { room_id } => Some(room_id.clone()),
                _ => None,
            })
            .expect("room_created");

        send(
            shared,
            &mut bob,
            &bob_tx,
            ClientMessage::JoinRoom {
                room_id: code.clone(),
                username: "Bob".into(),
                user_id: "u-bob".into(),
            },
        )
        .await;
        send(
            shared,
            &mut alice,
            &alice_tx,
            ClientMessage::PlayerReady {
                room_id: code.clone(),
            },
        )
        .await;
        send(
            shared,
            &mut bob,
            &bob_tx,
            ClientMessage::PlayerReady {
                room_id: code.clone(),
            },
        )
        .await;

        drain(&mut alice_rx);
        drain(&mut bob_rx);
        (code, (alice, alice_tx, alice_rx), (bob, bob_tx, bob_rx))
    }

    async fn assigned_word(shared: &Arc<Shared>, code: &str, slot: PlayerSlot, tier: Tier) -> String {
        let room = shared.rooms.get(code).await.unwrap();
        let guard = room.read().await;
        guard
            .state
            .player(slot)
            .unwrap()
            .words
            .as_ref()
            .unwrap()
            .get(tier)
            .to_string()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.shield_duration, Duration::from_secs(5));
        assert_eq!(config.disconnect_grace, Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_server_creation_and_shutdown() {
        let server = GameServer::new(ServerConfig::default());
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.room_count().await, 0);
        assert_eq!(server.session_count().await, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_lobby_flow_and_game_start() {
        // Scenario: Alice creates, Bob joins, both ready up.
        let shared = test_shared(
            Duration::from_secs(45),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let (mut alice, alice_tx, mut alice_rx) = connect();
        let (mut bob, bob_tx, mut bob_rx) = connect();

        send(
            &shared,
            &mut alice,
            &alice_tx,
            ClientMessage::CreateRoom {
                username: "Alice".into(),
                user_id: "u-alice".into(),
            },
        )
        .await;
        let code = drain(&mut alice_rx)
            .iter()
            .find_map(|m| match m {
                ServerMessage::RoomCreated { room_id } => Some(room_id.clone()),
                _ => None,
            })
            .unwrap();

        send(
            &shared,
            &mut bob,
            &bob_tx,
            ClientMessage::JoinRoom {
                room_id: code.clone(),
                username: "Bob".into(),
                user_id: "u-bob".into(),
            },
        )
        .await;

        // Both sides see the two-player roster.
        for rx in [&mut alice_rx, &mut bob_rx] {
            assert!(drain(rx).iter().any(|m| matches!(
                m,
                ServerMessage::RoomUpdate { players } if players.len() == 2
            )));
        }

        send(
            &shared,
            &mut alice,
            &alice_tx,
            ClientMessage::PlayerReady {
                room_id: code.clone(),
            },
        )
        .await;
        assert!(drain(&mut alice_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::PlayerReadyUpdate { .. })));

        send(
            &shared,
            &mut bob,
            &bob_tx,
            ClientMessage::PlayerReady {
                room_id: code.clone(),
            },
        )
        .await;

        // game_start reaches both with non-overlapping slot ids.
        let alice_start = drain(&mut alice_rx).into_iter().find_map(|m| match m {
            ServerMessage::GameStart { your_player_id, .. } => Some(your_player_id),
            _ => None,
        });
        let bob_start = drain(&mut bob_rx).into_iter().find_map(|m| match m {
            ServerMessage::GameStart { your_player_id, .. } => Some(your_player_id),
            _ => None,
        });
        assert_eq!(alice_start, Some(PlayerSlot::Player1));
        assert_eq!(bob_start, Some(PlayerSlot::Player2));
    }

    #[tokio::test]
    async fn test_join_unknown_room_reports_error() {
        let shared = test_shared(
            Duration::from_secs(45),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let (mut bob, bob_tx, mut bob_rx) = connect();
        send(
            &shared,
            &mut bob,
            &bob_tx,
            ClientMessage::JoinRoom {
                room_id: "NOSUCH".into(),
                username: "Bob".into(),
                user_id: "u-bob".into(),
            },
        )
        .await;
        assert!(drain(&mut bob_rx).iter().any(|m| matches!(
            m,
            ServerMessage::JoinRoomError { message } if message == "Room not found"
        )));
    }

    #[tokio::test]
    async fn test_attack_broadcasts_absolute_hp() {
        let shared = test_shared(
            Duration::from_secs(45),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let (code, (mut alice, alice_tx, mut alice_rx), (_bob, _bob_tx, mut bob_rx)) =
            start_match(&shared).await;

        let word = assigned_word(&shared, &code, PlayerSlot::Player1, Tier::Hard).await;
        send(
            &shared,
            &mut alice,
            &alice_tx,
            ClientMessage::SendAttack {
                room_id: code.clone(),
                attack_type: "hard".into(),
                typed_word: word,
            },
        )
        .await;

        // Bob gets the authoritative new HP directly.
        let bob_messages = drain(&mut bob_rx);
        assert!(bob_messages.iter().any(|m| matches!(
            m,
            ServerMessage::ReceiveAttack { blocked: None, target_hp: 20 }
        )));
        assert!(bob_messages.iter().any(|m| matches!(
            m,
            ServerMessage::AttackImpact { target_player_id: PlayerSlot::Player2, target_hp: 20 }
        )));

        // Alice sees the impact for the enemy display plus her next
        // hard-tier word.
        let alice_messages = drain(&mut alice_rx);
        assert!(alice_messages.iter().any(|m| matches!(
            m,
            ServerMessage::AttackImpact { target_hp: 20, .. }
        )));
        assert!(alice_messages.iter().any(|m| matches!(
            m,
            ServerMessage::WordAssignment { tier: Tier::Hard, .. }
        )));
    }

    #[tokio::test]
    async fn test_failed_attack_is_invisible_to_opponent() {
        let shared = test_shared(
            Duration::from_secs(45),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let (code, (mut alice, alice_tx, mut alice_rx), (_bob, _bob_tx, mut bob_rx)) =
            start_match(&shared).await;

        send(
            &shared,
            &mut alice,
            &alice_tx,
            ClientMessage::SendAttack {
                room_id: code.clone(),
                attack_type: "hard".into(),
                typed_word: "wrong-word".into(),
            },
        )
        .await;

        assert!(drain(&mut alice_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::InvalidAction { .. })));
        assert!(drain(&mut bob_rx).is_empty());

        // No state was mutated.
        let room = shared.rooms.get(&code).await.unwrap();
        let guard = room.read().await;
        assert_eq!(guard.state.player(PlayerSlot::Player1).unwrap().ammo, MAX_AMMO);
        assert_eq!(guard.state.player(PlayerSlot::Player2).unwrap().hp, MAX_HP);
    }

    #[tokio::test]
    async fn test_shield_absorbs_and_cancels_expiry_timer() {
        // Scenario: Bob shields, Alice's attack is absorbed.
        let shared = test_shared(
            Duration::from_secs(45),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        let (code, (mut alice, alice_tx, mut alice_rx), (mut bob, bob_tx, mut bob_rx)) =
            start_match(&shared).await;

        let shield_word = assigned_word(&shared, &code, PlayerSlot::Player2, Tier::Shield).await;
        send(
            &shared,
            &mut bob,
            &bob_tx,
            ClientMessage::ActivateShield {
                room_id: code.clone(),
                typed_word: shield_word,
            },
        )
        .await;
        assert!(drain(&mut bob_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::ShieldActivated)));
        assert!(drain(&mut alice_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::EnemyShieldActive)));
        assert_eq!(shared.timers.pending_for(&code).await, 1);

        let word = assigned_word(&shared, &code, PlayerSlot::Player1, Tier::Hard).await;
        send(
            &shared,
            &mut alice,
            &alice_tx,
            ClientMessage::SendAttack {
                room_id: code.clone(),
                attack_type: "hard".into(),
                typed_word: word,
            },
        )
        .await;

        // Bob keeps full HP and learns the hit was blocked.
        assert!(drain(&mut bob_rx).iter().any(|m| matches!(
            m,
            ServerMessage::ReceiveAttack { blocked: Some(true), target_hp } if *target_hp == MAX_HP
        )));

        let room = shared.rooms.get(&code).await.unwrap();
        let guard = room.read().await;
        assert!(!guard.state.player(PlayerSlot::Player2).unwrap().shield_active);
        assert_eq!(guard.state.player(PlayerSlot::Player2).unwrap().hp, MAX_HP);
        drop(guard);

        // The absorbed shield's expiry timer is gone.
        assert_eq!(shared.timers.pending_for(&code).await, 0);
    }

    #[tokio::test]
    async fn test_shield_expires_by_timer() {
        let shared = test_shared(
            Duration::from_secs(45),
            Duration::from_millis(30),
            Duration::from_secs(30),
        );
        let (code, _alice, (mut bob, bob_tx, _bob_rx)) = start_match(&shared).await;

        let shield_word = assigned_word(&shared, &code, PlayerSlot::Player2, Tier::Shield).await;
        send(
            &shared,
            &mut bob,
            &bob_tx,
            ClientMessage::ActivateShield {
                room_id: code.clone(),
                typed_word: shield_word,
            },
        )
        .await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        let room = shared.rooms.get(&code).await.unwrap();
        let guard = room.read().await;
        assert!(!guard.state.player(PlayerSlot::Player2).unwrap().shield_active);
        drop(guard);
        assert_eq!(shared.timers.pending_for(&code).await, 0);
    }

    #[tokio::test]
    async fn test_reconnect_within_grace_window() {
        // Scenario: Bob drops, Alice is told, Bob rejoins in time.
        let shared = test_shared(
            Duration::from_secs(45),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let (code, (mut alice, alice_tx, mut alice_rx), (bob, _bob_tx, _bob_rx)) =
            start_match(&shared).await;

        // Damage Bob first so we can check his state survives.
        let word = assigned_word(&shared, &code, PlayerSlot::Player1, Tier::Medium).await;
        send(
            &shared,
            &mut alice,
            &alice_tx,
            ClientMessage::SendAttack {
                room_id: code.clone(),
                attack_type: "medium".into(),
                typed_word: word,
            },
        )
        .await;
        drain(&mut alice_rx);

        Shared::connection_closed(&shared, &bob).await;
        assert!(drain(&mut alice_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::PlayerTemporarilyDisconnected)));
        assert_eq!(shared.timers.pending_for(&code).await, 1);

        // Bob returns on a fresh connection with the same identity.
        let (mut bob2, bob2_tx, mut bob2_rx) = connect();
        send(
            &shared,
            &mut bob2,
            &bob2_tx,
            ClientMessage::RejoinRoom {
                room_id: code.clone(),
                username: "Bob".into(),
                user_id: "u-bob".into(),
                game_status: Some("playing".into()),
            },
        )
        .await;

        let rejoin = drain(&mut bob2_rx);
        let snapshot = rejoin
            .iter()
            .find_map(|m| match m {
                ServerMessage::RejoinSuccess { player_state, .. } => Some(player_state.clone()),
                _ => None,
            })
            .expect("rejoin_success");
        assert_eq!(snapshot.hp, MAX_HP - 35);
        assert_eq!(snapshot.ammo, MAX_AMMO);

        assert!(drain(&mut alice_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::PlayerReconnected)));

        // The grace timer is cancelled and no forfeit ever happens.
        assert_eq!(shared.timers.pending_for(&code).await, 0);
        let room = shared.rooms.get(&code).await.unwrap();
        assert_eq!(room.read().await.state.status, RoomStatus::Playing);
    }

    #[tokio::test]
    async fn test_rejoin_is_idempotent() {
        let shared = test_shared(
            Duration::from_secs(45),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let (code, (_alice, _alice_tx, mut alice_rx), (bob, _bob_tx, _bob_rx)) =
            start_match(&shared).await;

        Shared::connection_closed(&shared, &bob).await;
        drain(&mut alice_rx);

        let (mut bob2, bob2_tx, mut bob2_rx) = connect();
        let mut snapshots = Vec::new();
        for _ in 0..3 {
            send(
                &shared,
                &mut bob2,
                &bob2_tx,
                ClientMessage::RejoinRoom {
                    room_id: code.clone(),
                    username: "Bob".into(),
                    user_id: "u-bob".into(),
                    game_status: Some("playing".into()),
                },
            )
            .await;
            let messages = drain(&mut bob2_rx);
            let snapshot = messages
                .iter()
                .find_map(|m| match m {
                    ServerMessage::RejoinSuccess { player_state, .. } => {
                        Some((player_state.hp, player_state.ammo))
                    }
                    _ => None,
                })
                .expect("rejoin_success");
            snapshots.push(snapshot);
        }
        assert!(snapshots.windows(2).all(|w| w[0] == w[1]));

        // Only the first rejoin notified the opponent.
        let reconnects = drain(&mut alice_rx)
            .iter()
            .filter(|m| matches!(m, ServerMessage::PlayerReconnected))
            .count();
        assert_eq!(reconnects, 1);
    }

    #[tokio::test]
    async fn test_grace_expiry_forfeits_match() {
        // Scenario: Bob never returns; Alice wins by forfeit.
        let shared = test_shared(
            Duration::from_millis(40),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let (code, (_alice, _alice_tx, mut alice_rx), (bob, _bob_tx, _bob_rx)) =
            start_match(&shared).await;

        Shared::connection_closed(&shared, &bob).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let messages = drain(&mut alice_rx);
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::PlayerDisconnected { .. })));
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::MatchResult { winner: PlayerSlot::Player1, reason: WinReason::OpponentForfeited, .. }
        )));

        let room = shared.rooms.get(&code).await.unwrap();
        assert_eq!(room.read().await.state.status, RoomStatus::Finished);
        // Every timer of the room is released.
        assert_eq!(shared.timers.pending_for(&code).await, 0);
        // The vanished player's session is gone; a rejoin now fails.
        let (mut bob2, bob2_tx, mut bob2_rx) = connect();
        send(
            &shared,
            &mut bob2,
            &bob2_tx,
            ClientMessage::RejoinRoom {
                room_id: code.clone(),
                username: "Bob".into(),
                user_id: "u-bob".into(),
                game_status: Some("playing".into()),
            },
        )
        .await;
        assert!(drain(&mut bob2_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::RejoinFailed { .. })));
    }

    #[tokio::test]
    async fn test_superseded_connection_is_ignored() {
        let shared = test_shared(
            Duration::from_secs(45),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let (code, (mut alice, alice_tx, mut alice_rx), (_bob, _bob_tx, mut bob_rx)) =
            start_match(&shared).await;

        // A second connection takes over Alice's identity.
        let (mut alice2, alice2_tx, mut alice2_rx) = connect();
        send(
            &shared,
            &mut alice2,
            &alice2_tx,
            ClientMessage::RejoinRoom {
                room_id: code.clone(),
                username: "Alice".into(),
                user_id: "u-alice".into(),
                game_status: Some("playing".into()),
            },
        )
        .await;
        drain(&mut alice2_rx);
        drain(&mut bob_rx);

        // An attack from the stale connection is dropped silently.
        let word = assigned_word(&shared, &code, PlayerSlot::Player1, Tier::Easy).await;
        send(
            &shared,
            &mut alice,
            &alice_tx,
            ClientMessage::SendAttack {
                room_id: code.clone(),
                attack_type: "easy".into(),
                typed_word: word,
            },
        )
        .await;

        assert!(drain(&mut alice_rx).is_empty());
        assert!(drain(&mut bob_rx).is_empty());
        let room = shared.rooms.get(&code).await.unwrap();
        assert_eq!(room.read().await.state.player(PlayerSlot::Player2).unwrap().hp, MAX_HP);
    }

    #[tokio::test]
    async fn test_player_lose_late_result_delivery() {
        let shared = test_shared(
            Duration::from_secs(45),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let (code, (mut alice, alice_tx, mut alice_rx), (mut bob, bob_tx, mut bob_rx)) =
            start_match(&shared).await;

        send(
            &shared,
            &mut bob,
            &bob_tx,
            ClientMessage::PlayerLose {
                room_id: code.clone(),
            },
        )
        .await;
        assert!(drain(&mut bob_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::MatchResult { winner: PlayerSlot::Player1, .. })));
        assert!(drain(&mut alice_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::MatchResult { .. })));

        // Asking again on the finished room re-delivers to the asker
        // only.
        send(
            &shared,
            &mut alice,
            &alice_tx,
            ClientMessage::PlayerLose {
                room_id: code.clone(),
            },
        )
        .await;
        assert!(drain(&mut alice_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::MatchResult { .. })));
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_leave_empties_room_and_schedules_cleanup() {
        let shared = test_shared(
            Duration::from_secs(45),
            Duration::from_secs(5),
            Duration::from_millis(30),
        );
        let (mut alice, alice_tx, mut alice_rx) = connect();
        send(
            &shared,
            &mut alice,
            &alice_tx,
            ClientMessage::CreateRoom {
                username: "Alice".into(),
                user_id: "u-alice".into(),
            },
        )
        .await;
        let code = drain(&mut alice_rx)
            .iter()
            .find_map(|m| match m {
                ServerMessage::RoomCreated { room_id } => Some(room_id.clone()),
                _ => None,
            })
            .unwrap();

        send(
            &shared,
            &mut alice,
            &alice_tx,
            ClientMessage::LeaveRoom {
                room_id: code.clone(),
            },
        )
        .await;
        assert_eq!(shared.sessions.len().await, 0);
        assert!(shared.rooms.get(&code).await.is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(shared.rooms.get(&code).await.is_none());
        assert_eq!(shared.timers.pending_for(&code).await, 0);
    }
}
