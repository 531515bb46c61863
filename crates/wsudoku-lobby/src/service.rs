//! lobby runtime - one task owns every piece of mutable lobby state
//!
//! connectivity events, user commands and network completions all arrive as
//! [`LobbyEvent`]s on a single channel. network calls run in spawned tasks
//! that post their result back; the runtime task is the only writer of the
//! snapshot, peer log and join attempts. subscribers read [`LobbyView`]s
//! from a watch channel.
//!
//! refreshes are serialized: a refresh requested while one is running is
//! coalesced into a single follow-up.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use wsudoku_p2p::{ConnectivityEvent, PeerId, Receipt, Transport};

use crate::announcer::Announcer;
use crate::config::LobbyConfig;
use crate::directory::{refresh_with_backoff, Directory, DirectorySnapshot, DirectoryStatus};
use crate::error::{DirectoryError, LobbyError, Result};
use crate::identity::{derive_id, generate_title, SessionId};
use crate::join::{JoinAttempt, JoinCoordinator, JoinTransition};
use crate::peer_log::PeerLog;
use crate::record::MembershipRecord;

const EVENT_QUEUE: usize = 256;

/// Service context: transport, local identity and config, built once
pub struct Lobby {
    transport: Arc<dyn Transport>,
    local: PeerId,
    config: LobbyConfig,
    announcer: Arc<Announcer>,
    directory: Directory,
    joins: JoinCoordinator,
}

impl Lobby {
    pub fn new(transport: Arc<dyn Transport>, local: PeerId, config: LobbyConfig) -> Self {
        let announcer = Arc::new(Announcer::new(transport.clone(), &config));
        let directory = Directory::new(transport.clone(), &config);
        let joins = JoinCoordinator::new(local.clone(), config.join_confirm_timeout());
        Self {
            transport,
            local,
            config,
            announcer,
            directory,
            joins,
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local
    }
}

/// User intents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Announce a new session; `None` picks a random title
    Create { title: Option<String>, puzzle: Vec<u8> },
    Refresh,
    Join(SessionId),
    Retry(SessionId),
    Abandon(SessionId),
    Leave(SessionId),
    Finish(SessionId),
}

/// What subscribers render
#[derive(Debug, Clone, Default)]
pub struct LobbyView {
    pub status: DirectoryStatus,
    /// Last successful refresh
    pub snapshot: DirectorySnapshot,
    pub connected_peers: usize,
    /// Peers currently linked, by id
    pub peers: Vec<PeerId>,
    pub peer_log: Vec<String>,
    pub joins: Vec<JoinAttempt>,
    /// Last status line
    pub message: Option<String>,
    /// Completed refreshes, successful or not
    pub refreshes: u64,
    pub running: bool,
}

impl LobbyView {
    pub fn join_attempt(&self, session_id: &SessionId) -> Option<&JoinAttempt> {
        self.joins.iter().find(|a| &a.session_id == session_id)
    }
}

#[derive(Debug)]
enum Published {
    Create { session_id: SessionId, title: String },
    Join(SessionId),
    Leave(SessionId),
    Finish(SessionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshMode {
    /// Single attempt, failure goes straight to the view
    Once,
    /// Bounded exponential backoff
    Backoff,
}

enum LobbyEvent {
    Connectivity(ConnectivityEvent),
    Command(Command),
    RefreshDone(std::result::Result<DirectorySnapshot, DirectoryError>),
    Published(Published, Result<Receipt>),
    Shutdown(oneshot::Sender<()>),
}

pub struct LobbyRuntime {
    lobby: Lobby,
    peer_log: PeerLog,
    snapshot: DirectorySnapshot,
    status: DirectoryStatus,
    message: Option<String>,
    refreshes: u64,
    events: mpsc::WeakSender<LobbyEvent>,
    view: watch::Sender<LobbyView>,
    in_flight: JoinSet<()>,
    timers: JoinSet<SessionId>,
    refreshing: bool,
    refresh_pending: Option<RefreshMode>,
    /// join records handed to a task but not yet completed
    publishing: BTreeSet<SessionId>,
    accepting: bool,
    forwarder: Option<JoinHandle<()>>,
}

impl LobbyRuntime {
    /// Start the runtime task; must be called inside a tokio runtime
    pub fn spawn(lobby: Lobby, connectivity: mpsc::UnboundedReceiver<ConnectivityEvent>) -> LobbyHandle {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let (view_tx, view_rx) = watch::channel(LobbyView::default());
        let forwarder = tokio::spawn(forward_connectivity(connectivity, tx.downgrade()));

        let runtime = Self {
            peer_log: PeerLog::new(lobby.config.peer_log_capacity),
            lobby,
            snapshot: DirectorySnapshot::default(),
            status: DirectoryStatus::Unknown,
            message: None,
            refreshes: 0,
            events: tx.downgrade(),
            view: view_tx,
            in_flight: JoinSet::new(),
            timers: JoinSet::new(),
            refreshing: false,
            refresh_pending: None,
            publishing: BTreeSet::new(),
            accepting: true,
            forwarder: Some(forwarder),
        };
        let task = tokio::spawn(runtime.run(rx));

        LobbyHandle { tx, view: view_rx, task }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<LobbyEvent>) {
        info!(peer = %self.lobby.local.short(), "lobby runtime started");
        self.running_view();

        let mut ticker = self.lobby.config.refresh_interval().map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        let ack = loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(LobbyEvent::Shutdown(ack)) => break Some(ack),
                    Some(event) => self.handle(event),
                    None => break None,
                },
                Some(Ok(session_id)) = self.timers.join_next() => self.on_join_deadline(session_id),
                Some(_) = self.in_flight.join_next() => {}
                _ = next_tick(&mut ticker) => {
                    debug!("periodic refresh");
                    self.request_refresh(RefreshMode::Backoff);
                    self.publish_view();
                }
            }
        };

        self.shutdown(rx).await;
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    /// Stop accepting commands, drain in-flight work, then close the transport
    async fn shutdown(&mut self, mut rx: mpsc::Receiver<LobbyEvent>) {
        self.accepting = false;
        self.refresh_pending = None;
        self.timers.abort_all();
        info!(in_flight = self.in_flight.len(), "lobby shutting down");

        while !self.in_flight.is_empty() {
            tokio::select! {
                Some(_) = self.in_flight.join_next() => {}
                Some(event) = rx.recv() => self.handle(event),
            }
        }
        rx.close();
        while let Ok(event) = rx.try_recv() {
            self.handle(event);
        }

        self.lobby.transport.shutdown().await;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        info!("lobby runtime stopped");
        self.view.send_modify(|view| view.running = false);
    }

    fn handle(&mut self, event: LobbyEvent) {
        match event {
            LobbyEvent::Connectivity(event) => {
                info!(peer = %event.peer.short(), connected = event.connected, "connectivity changed");
                self.peer_log.record(&event);
            }
            LobbyEvent::Command(command) => {
                if !self.accepting {
                    warn!(?command, "lobby shutting down, command dropped");
                } else if let Err(e) = self.on_command(command) {
                    self.report(e);
                }
            }
            LobbyEvent::RefreshDone(result) => self.on_refresh(result),
            LobbyEvent::Published(what, result) => self.on_published(what, result),
            LobbyEvent::Shutdown(ack) => {
                let _ = ack.send(());
            }
        }
        self.publish_view();
    }

    fn on_command(&mut self, command: Command) -> Result<()> {
        debug!(?command, "lobby command");
        match command {
            Command::Create { title, puzzle } => {
                let title = title.unwrap_or_else(|| generate_title(&mut rand::thread_rng()));
                let record = self
                    .lobby
                    .announcer
                    .create_session(&title, &self.lobby.local, puzzle)?;
                let session_id = record.session_id().clone();
                self.spawn_publish(Published::Create { session_id, title }, record);
            }
            Command::Refresh => self.request_refresh(RefreshMode::Once),
            Command::Join(session_id) => {
                let session = self
                    .snapshot
                    .get(&session_id)
                    .ok_or_else(|| LobbyError::UnknownSession(session_id.clone()))?;
                if session.contains(&self.lobby.local) {
                    return Err(LobbyError::AlreadyJoined(session_id));
                }
                if self.publishing.contains(&session_id) {
                    return Err(LobbyError::JoinInProgress(session_id));
                }
                self.lobby.joins.request(&session_id)?;
                self.publish_join(session_id)?;
            }
            Command::Retry(session_id) => {
                if self.publishing.contains(&session_id) {
                    return Err(LobbyError::JoinInProgress(session_id));
                }
                self.lobby.joins.retry(&session_id)?;
                self.publish_join(session_id)?;
            }
            Command::Abandon(session_id) => {
                self.lobby
                    .joins
                    .abandon(&session_id)
                    .ok_or_else(|| LobbyError::NoJoinAttempt(session_id.clone()))?;
                self.message = Some(format!("stopped joining {}", session_id.short()));
            }
            Command::Leave(session_id) => {
                self.lobby.joins.abandon(&session_id);
                let record = self.lobby.announcer.announce_leave(&session_id, &self.lobby.local);
                self.spawn_publish(Published::Leave(session_id), record);
            }
            Command::Finish(session_id) => {
                let record = self.lobby.announcer.announce_finish(&session_id, &self.lobby.local);
                self.spawn_publish(Published::Finish(session_id), record);
            }
        }
        Ok(())
    }

    fn publish_join(&mut self, session_id: SessionId) -> Result<()> {
        let record = self.lobby.joins.prepare(&session_id, &self.lobby.announcer)?;
        self.publishing.insert(session_id.clone());
        self.spawn_publish(Published::Join(session_id), record);
        Ok(())
    }

    fn on_published(&mut self, what: Published, result: Result<Receipt>) {
        let receipt = match result {
            Ok(receipt) => receipt,
            Err(e) => {
                if let Published::Join(session_id) = &what {
                    self.publishing.remove(session_id);
                }
                self.report(e);
                return;
            }
        };

        match what {
            Published::Create { session_id, title } => {
                info!(session = %session_id.short(), %title, "session announced");
                self.message = Some(format!("created {}", title));
            }
            Published::Join(session_id) => {
                self.publishing.remove(&session_id);
                if let Err(e) = self.lobby.joins.mark_published(&session_id, receipt, Instant::now()) {
                    // abandoned while the publish was in flight
                    debug!(session = %session_id.short(), "join published for dropped attempt: {}", e);
                } else {
                    let timeout = self.lobby.joins.confirm_timeout();
                    let id = session_id.clone();
                    self.timers.spawn(async move {
                        tokio::time::sleep(timeout).await;
                        id
                    });
                    self.message = Some(format!("joining {}, waiting for confirmation", session_id.short()));
                }
            }
            Published::Leave(session_id) => {
                self.message = Some(format!("left {}", session_id.short()));
            }
            Published::Finish(session_id) => {
                self.message = Some(format!("finished {}", session_id.short()));
            }
        }
        self.request_refresh(RefreshMode::Once);
    }

    fn on_refresh(&mut self, result: std::result::Result<DirectorySnapshot, DirectoryError>) {
        self.refreshing = false;
        self.refreshes += 1;
        match result {
            Ok(snapshot) => {
                self.status = snapshot.status();
                let transitions = self.lobby.joins.observe(&snapshot, Instant::now());
                self.snapshot = snapshot;
                self.apply_transitions(transitions);
            }
            Err(e) => {
                warn!("directory refresh failed: {}", e);
                self.status = DirectoryStatus::Failed(e.to_string());
                self.message = Some(e.to_string());
            }
        }
        if let Some(mode) = self.refresh_pending.take() {
            self.request_refresh(mode);
        }
    }

    fn on_join_deadline(&mut self, session_id: SessionId) {
        debug!(session = %session_id.short(), "join confirm window elapsed");
        let transitions = self.lobby.joins.expire(Instant::now());
        self.apply_transitions(transitions);
        self.publish_view();
    }

    fn apply_transitions(&mut self, transitions: Vec<JoinTransition>) {
        for transition in transitions {
            self.message = Some(match transition {
                JoinTransition::Confirmed(id) => {
                    let label = self.snapshot.get(&id).map_or_else(|| id.short().to_string(), |s| s.label());
                    format!("joined {}", label)
                }
                JoinTransition::TimedOut(id) => format!("join {} not confirmed, retry?", id.short()),
            });
        }
    }

    fn request_refresh(&mut self, mode: RefreshMode) {
        if !self.accepting {
            return;
        }
        if self.refreshing {
            self.refresh_pending = match (self.refresh_pending, mode) {
                (Some(RefreshMode::Backoff), _) | (_, RefreshMode::Backoff) => Some(RefreshMode::Backoff),
                _ => Some(RefreshMode::Once),
            };
            debug!("refresh in flight, coalescing");
            return;
        }

        let directory = self.lobby.directory.clone();
        let policy = self.lobby.config.backoff;
        self.refreshing = self.spawn_task(async move {
            let result = match mode {
                RefreshMode::Once => directory.refresh().await,
                RefreshMode::Backoff => refresh_with_backoff(&directory, &policy).await,
            };
            LobbyEvent::RefreshDone(result)
        });
    }

    fn spawn_publish(&mut self, what: Published, record: MembershipRecord) {
        let announcer = self.lobby.announcer.clone();
        self.spawn_task(async move {
            let result = announcer.publish(&record).await;
            LobbyEvent::Published(what, result)
        });
    }

    /// Run `work` off the event loop and post its result back
    fn spawn_task<F>(&mut self, work: F) -> bool
    where
        F: Future<Output = LobbyEvent> + Send + 'static,
    {
        let Some(tx) = self.events.upgrade() else {
            return false;
        };
        self.in_flight.spawn(async move {
            let event = work.await;
            let _ = tx.send(event).await;
        });
        true
    }

    fn report(&mut self, e: LobbyError) {
        warn!("lobby: {}", e);
        self.message = Some(e.to_string());
    }

    fn running_view(&mut self) {
        self.view.send_modify(|view| view.running = true);
    }

    fn publish_view(&mut self) {
        let view = LobbyView {
            status: self.status.clone(),
            snapshot: self.snapshot.clone(),
            connected_peers: self.peer_log.connected_count(),
            peers: self.peer_log.connected().cloned().collect(),
            peer_log: self.peer_log.entries().map(str::to_string).collect(),
            joins: self.lobby.joins.attempts().cloned().collect(),
            message: self.message.clone(),
            refreshes: self.refreshes,
            running: true,
        };
        self.view.send_replace(view);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn forward_connectivity(
    mut connectivity: mpsc::UnboundedReceiver<ConnectivityEvent>,
    events: mpsc::WeakSender<LobbyEvent>,
) {
    while let Some(event) = connectivity.recv().await {
        let Some(tx) = events.upgrade() else {
            break;
        };
        if tx.send(LobbyEvent::Connectivity(event)).await.is_err() {
            break;
        }
    }
}

/// Handle to a running lobby
pub struct LobbyHandle {
    tx: mpsc::Sender<LobbyEvent>,
    view: watch::Receiver<LobbyView>,
    task: JoinHandle<()>,
}

impl LobbyHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(LobbyEvent::Command(command))
            .await
            .map_err(|_| LobbyError::RuntimeClosed)
    }

    /// Announce a session under `title`, returning its id
    pub async fn create(&self, title: &str, puzzle: Vec<u8>) -> Result<SessionId> {
        let session_id = derive_id(title)?;
        self.send(Command::Create {
            title: Some(title.to_string()),
            puzzle,
        })
        .await?;
        Ok(session_id)
    }

    pub fn view(&self) -> LobbyView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LobbyView> {
        self.view.clone()
    }

    /// Wait until the view satisfies `f`
    pub async fn wait_for(&self, mut f: impl FnMut(&LobbyView) -> bool) -> Result<LobbyView> {
        let mut rx = self.view.clone();
        let view = rx.wait_for(|view| f(view)).await.map_err(|_| LobbyError::RuntimeClosed)?;
        Ok(view.clone())
    }

    /// Ordered shutdown; returns once the transport is closed
    pub async fn shutdown(self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(LobbyEvent::Shutdown(ack_tx))
            .await
            .map_err(|_| LobbyError::RuntimeClosed)?;
        let _ = ack_rx.await;
        drop(self.tx);
        let _ = self.task.await;
        Ok(())
    }
}
