//! Connection driver
//!
//! One task owns the socket, the player and the reconciler. Everything that
//! can happen to a viewer (a frame from the server, a player callback, a
//! user command, a timer) is a branch of the same `select!` loop.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::latency::ClockOffsetTracker;
use crate::player::{PlayerEvent, VideoPlayer};
use crate::reconciler::{Phase, Reaction, ReadinessError, Reconciler, ReconcilerConfig};
use crate::sync::{current_time_ms, ClientMessage, ServerMessage};

use super::{ClientError, SnapshotClient};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server root, e.g. `http://127.0.0.1:3000`
    pub server_url: String,
    pub reconciler: ReconcilerConfig,
    /// Clock offset ping interval
    pub ping_interval: Duration,
    /// Player position sampling interval (local seek detection)
    pub tick_interval: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Fetch `/api/state` while disconnected
    pub http_fallback: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3000".to_string(),
            reconciler: ReconcilerConfig::default(),
            ping_interval: Duration::from_secs(5),
            tick_interval: Duration::from_millis(500),
            reconnect_min: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            http_fallback: true,
        }
    }
}

impl ClientConfig {
    pub fn with_server(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    /// WebSocket endpoint derived from the server root
    pub fn ws_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/ws", base)
    }
}

/// Actions a local user can take
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    Play,
    Pause,
    Seek(f64),
    Load(String),
    Shutdown,
}

/// Snapshot of the client for display
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStatus {
    pub connected: bool,
    pub phase: Phase,
    pub video_id: Option<String>,
    pub position: f64,
    pub playing: bool,
    pub clock_offset_ms: i64,
    pub rtt_ms: Option<u64>,
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            connected: false,
            phase: Phase::Idle,
            video_id: None,
            position: 0.0,
            playing: false,
            clock_offset_ms: 0,
            rtt_ms: None,
        }
    }
}

/// Handle to communicate with the running client
#[derive(Clone)]
pub struct ClientHandle {
    command_tx: mpsc::UnboundedSender<UserCommand>,
    status_rx: watch::Receiver<ClientStatus>,
}

impl ClientHandle {
    pub fn send(&self, command: UserCommand) -> Result<(), ClientError> {
        self.command_tx
            .send(command)
            .map_err(|_| ClientError::Closed)
    }

    pub fn play(&self) -> Result<(), ClientError> {
        self.send(UserCommand::Play)
    }

    pub fn pause(&self) -> Result<(), ClientError> {
        self.send(UserCommand::Pause)
    }

    pub fn seek(&self, position: f64) -> Result<(), ClientError> {
        self.send(UserCommand::Seek(position))
    }

    pub fn load(&self, video_id: &str) -> Result<(), ClientError> {
        self.send(UserCommand::Load(video_id.to_string()))
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(UserCommand::Shutdown);
    }

    pub fn status(&self) -> ClientStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver that changes whenever the status is republished
    pub fn subscribe(&self) -> watch::Receiver<ClientStatus> {
        self.status_rx.clone()
    }
}

/// Jittered exponential reconnect delay
#[derive(Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.attempt = self.attempt.saturating_add(1);
        let ceiling = self.min.saturating_mul(factor).min(self.max);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        ceiling.mul_f64(jitter).max(self.min)
    }
}

type ReadinessWait = Pin<Box<dyn Future<Output = Result<(), ReadinessError>> + Send>>;

/// How a connection ended
enum Exit {
    Disconnected,
    Shutdown,
}

/// Drives one viewer against the sync server
pub struct SyncClient<P: VideoPlayer> {
    config: ClientConfig,
    player: P,
    player_events: mpsc::UnboundedReceiver<PlayerEvent>,
    reconciler: Reconciler,
    clock: ClockOffsetTracker,
    snapshots: Option<SnapshotClient>,
    /// Outstanding wait on the player's readiness signal
    readiness_wait: Option<ReadinessWait>,
    /// The wait above runs past the retry budget
    late_readiness: bool,
    connected: bool,
    status_tx: watch::Sender<ClientStatus>,
}

impl<P: VideoPlayer + 'static> SyncClient<P> {
    pub fn new(
        config: ClientConfig,
        player: P,
        player_events: mpsc::UnboundedReceiver<PlayerEvent>,
    ) -> Result<Self, ClientError> {
        let snapshots = if config.http_fallback {
            Some(SnapshotClient::new(config.server_url.clone())?)
        } else {
            None
        };
        let (status_tx, _) = watch::channel(ClientStatus::default());
        Ok(Self {
            reconciler: Reconciler::new(config.reconciler.clone()),
            config,
            player,
            player_events,
            clock: ClockOffsetTracker::new(),
            snapshots,
            readiness_wait: None,
            late_readiness: false,
            connected: false,
            status_tx,
        })
    }

    /// Spawn the driver and return a handle for communication
    pub fn start(self) -> ClientHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let status_rx = self.status_tx.subscribe();

        tokio::spawn(async move {
            self.run(command_rx).await;
        });

        ClientHandle {
            command_tx,
            status_rx,
        }
    }

    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<UserCommand>) {
        let ws_url = self.config.ws_url();
        let mut backoff = Backoff::new(self.config.reconnect_min, self.config.reconnect_max);

        // The player may already be ready before anything arrives
        if !self.player.is_ready() {
            self.arm_readiness();
        }

        loop {
            match tokio_tungstenite::connect_async(ws_url.as_str()).await {
                Ok((ws, _)) => {
                    info!("Connected to {}", ws_url);
                    backoff.reset();
                    self.connected = true;
                    self.publish_status();
                    match self.run_connection(ws, &mut command_rx).await {
                        Ok(Exit::Shutdown) => break,
                        Ok(Exit::Disconnected) => info!("Disconnected from server"),
                        Err(e) => warn!("Connection error: {}", e),
                    }
                    self.connected = false;
                    self.publish_status();
                }
                Err(e) => warn!("Failed to connect to {}: {}", ws_url, e),
            }

            self.fallback_resync().await;

            let delay = backoff.next_delay();
            debug!("Reconnecting in {:?}", delay);
            if let Exit::Shutdown = self.wait_offline(delay, &mut command_rx).await {
                break;
            }
        }

        info!("Sync client shutting down");
        self.connected = false;
        self.publish_status();
    }

    async fn run_connection<S>(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<S>,
        command_rx: &mut mpsc::UnboundedReceiver<UserCommand>,
    ) -> Result<Exit, ClientError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = ws.split();

        // Pings from the previous socket will never be answered; the
        // reconciler keeps its last offset until a fresh pong arrives
        self.clock.clear();

        // Full handshake on every (re)connect
        send_message(&mut sink, &ClientMessage::RequestInit).await?;

        let mut ping = tokio::time::interval(self.config.ping_interval);
        let mut tick = tokio::time::interval(self.config.tick_interval);

        loop {
            let outbound = tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                        Some(Ok(Message::Close(_))) | None => return Ok(Exit::Disconnected),
                        Some(Ok(_)) => Vec::new(),
                        Some(Err(e)) => return Err(e.into()),
                    }
                }

                Some(event) = self.player_events.recv() => {
                    let reaction = self.reconciler.on_local_change(
                        event.state,
                        event.position,
                        current_time_ms(),
                    );
                    self.apply(reaction)
                }

                command = command_rx.recv() => {
                    match command {
                        Some(UserCommand::Shutdown) | None => {
                            let _ = sink.close().await;
                            return Ok(Exit::Shutdown);
                        }
                        Some(command) => self.handle_user(command),
                    }
                }

                _ = ping.tick() => {
                    vec![ClientMessage::Ping { sent_at_ms: self.clock.create_ping() }]
                }

                _ = tick.tick() => {
                    let reaction = self.reconciler.on_position_tick(
                        self.player.current_time(),
                        self.player.is_playing(),
                        current_time_ms(),
                    );
                    self.apply(reaction)
                }

                outcome = wait_readiness(&mut self.readiness_wait) => {
                    self.handle_readiness(outcome)
                }
            };

            for message in &outbound {
                send_message(&mut sink, message).await?;
            }
            self.publish_status();
        }
    }

    /// Keep the player responsive while waiting to reconnect
    async fn wait_offline(
        &mut self,
        delay: Duration,
        command_rx: &mut mpsc::UnboundedReceiver<UserCommand>,
    ) -> Exit {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            let dropped = tokio::select! {
                _ = &mut sleep => return Exit::Disconnected,

                command = command_rx.recv() => {
                    match command {
                        Some(UserCommand::Shutdown) | None => return Exit::Shutdown,
                        Some(command) => self.handle_user(command),
                    }
                }

                Some(event) = self.player_events.recv() => {
                    let reaction = self.reconciler.on_local_change(
                        event.state,
                        event.position,
                        current_time_ms(),
                    );
                    self.apply(reaction)
                }

                outcome = wait_readiness(&mut self.readiness_wait) => {
                    self.handle_readiness(outcome)
                }
            };

            if !dropped.is_empty() {
                debug!("Offline, dropping {} outbound message(s)", dropped.len());
            }
            self.publish_status();
        }
    }

    fn handle_frame(&mut self, text: &str) -> Vec<ClientMessage> {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping unparseable frame: {}", e);
                return Vec::new();
            }
        };

        if let ServerMessage::Pong {
            ping_sent_at_ms,
            server_time_ms,
        } = message
        {
            if let Some(offset) = self.clock.handle_pong(ping_sent_at_ms, server_time_ms) {
                self.reconciler.set_clock_offset(offset);
            }
            return Vec::new();
        }

        debug!("Received {:?}", message);
        let observation = self.player.observe();
        let reaction = self
            .reconciler
            .on_remote(message, &observation, current_time_ms());
        self.apply(reaction)
    }

    fn handle_user(&mut self, command: UserCommand) -> Vec<ClientMessage> {
        match command {
            // Plain player actions surface again through the player callback
            // or the position tick
            UserCommand::Play => self.player.play(),
            UserCommand::Pause => self.player.pause(),
            UserCommand::Seek(position) => self.player.seek(position),
            UserCommand::Load(video_id) => {
                let observation = self.player.observe();
                let reaction = self
                    .reconciler
                    .load_video(video_id, &observation, current_time_ms());
                return self.apply(reaction);
            }
            UserCommand::Shutdown => {}
        }
        Vec::new()
    }

    fn handle_readiness(&mut self, outcome: Result<(), ReadinessError>) -> Vec<ClientMessage> {
        self.readiness_wait = None;
        match outcome {
            Ok(()) => {
                if self.late_readiness {
                    info!("Player ready after the retry budget, resynchronizing");
                } else {
                    info!("Player ready");
                }
                self.late_readiness = false;
                let observation = self.player.observe();
                let reaction = self
                    .reconciler
                    .on_player_ready(&observation, current_time_ms());
                self.apply(reaction)
            }
            Err(ReadinessError::Exhausted { attempts }) => {
                warn!("Player not ready after {} attempts", attempts);
                self.reconciler.on_readiness_exhausted();
                // Keep listening so a late player can still resync
                let mut watcher = self.player.readiness();
                self.readiness_wait = Some(Box::pin(async move { watcher.ready().await }));
                self.late_readiness = true;
                Vec::new()
            }
            Err(ReadinessError::Closed) => {
                warn!("Player readiness signal closed");
                Vec::new()
            }
        }
    }

    fn arm_readiness(&mut self) {
        if self.readiness_wait.is_some() {
            return;
        }
        let mut watcher = self.player.readiness();
        let attempts = self.config.reconciler.ready_retry_attempts;
        let interval = self.config.reconciler.ready_retry_interval;
        self.readiness_wait = Some(Box::pin(async move {
            watcher.wait_ready(attempts, interval).await
        }));
        self.late_readiness = false;
    }

    /// Run the player commands and hand back what should go on the wire
    fn apply(&mut self, reaction: Reaction) -> Vec<ClientMessage> {
        for command in &reaction.commands {
            debug!("Player command: {:?}", command);
            self.player.execute(command);
        }
        let mut outbound = reaction.outbound;
        if reaction.await_player {
            if self.player.is_ready() {
                // Became ready since it was observed; no wait would fire
                let observation = self.player.observe();
                let follow_up = self
                    .reconciler
                    .on_player_ready(&observation, current_time_ms());
                outbound.extend(self.apply(follow_up));
            } else {
                self.arm_readiness();
            }
        }
        outbound
    }

    /// Position the player from the HTTP snapshot while the socket is down
    async fn fallback_resync(&mut self) {
        let Some(snapshots) = self.snapshots.clone() else {
            return;
        };
        match snapshots.fetch().await {
            Ok(Some(snapshot)) => {
                debug!("Fallback snapshot: {:?}", snapshot);
                // The server extrapolated the position to its own now
                let server_now =
                    (current_time_ms() as i64 + self.clock.offset_ms()).max(0) as u64;
                let message = ServerMessage::Init {
                    video_id: Some(snapshot.video_id),
                    is_playing: snapshot.is_playing,
                    position: snapshot.position,
                    reference_timestamp: server_now,
                };
                let observation = self.player.observe();
                let reaction = self
                    .reconciler
                    .on_remote(message, &observation, current_time_ms());
                self.apply(reaction);
                self.publish_status();
            }
            Ok(None) => {}
            Err(e) => debug!("Fallback snapshot unavailable: {}", e),
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(ClientStatus {
            connected: self.connected,
            phase: self.reconciler.phase(),
            video_id: self.reconciler.current_video_id().map(str::to_string),
            position: self.player.current_time(),
            playing: self.player.is_playing(),
            clock_offset_ms: self.clock.offset_ms(),
            rtt_ms: self.clock.rtt_ms(),
        });
    }
}

async fn wait_readiness(wait: &mut Option<ReadinessWait>) -> Result<(), ReadinessError> {
    match wait.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn send_message<S>(sink: &mut S, message: &ClientMessage) -> Result<(), ClientError>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(message)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}
