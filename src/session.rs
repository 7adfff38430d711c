//! Shell sessions and the process-wide session registry.
//!
//! A `Session` owns one PTY-attached shell, its scrollback ring, and the set
//! of attached clients. All multiplexing state — client map, insertion
//! order, writer identity, scrollback, broadcast delivery — is serialized
//! behind a single lock so that joining clients observe an atomic boundary
//! between the scrollback snapshot and live output. Client notification
//! hooks are batched during the critical section and dispatched after the
//! lock is released.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::pty::{self, Pty, PtyError, SpawnOptions};
use crate::ring::RingBuffer;

/// Scrollback capacity per session.
pub const DEFAULT_SCROLLBACK: usize = 64 * 1024;

/// Minimum terminal dimensions enforced by the sizing pass.
pub const MIN_COLS: u16 = 40;
pub const MIN_ROWS: u16 = 10;

/// Read size of the PTY broadcast loop.
const PTY_READ_BUF: usize = 32 * 1024;

/// Dimensions a session starts with before any client reports a size.
const INITIAL_COLS: u16 = 80;
const INITIAL_ROWS: u16 = 24;

pub type ClientId = u64;

static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Allocate a client id unique within this process.
pub fn next_client_id() -> ClientId {
    CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// Events delivered to an attached client's sink.
///
/// Per-sink order is FIFO, which preserves PTY-issue order for output and
/// keeps state notifications sequenced with the bytes they follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Raw terminal output (includes the scrollback snapshot at join).
    Output(Bytes),
    /// This client gained or lost write access.
    WriteState(bool),
    /// The shared terminal was resized.
    TerminalSize { cols: u16, rows: u16 },
    /// The number of active (visible) clients changed.
    ClientCount(u16),
}

pub type ClientSink = mpsc::UnboundedSender<ClientEvent>;

struct ClientSeat {
    cols: u16,
    rows: u16,
    #[allow(dead_code)]
    joined_at: Instant,
    sink: ClientSink,
}

impl ClientSeat {
    /// A client reporting (0, 0) is a hidden tab: still attached, but not a
    /// writer candidate and excluded from sizing.
    fn is_active(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

type Notification = (ClientSink, ClientEvent);

fn dispatch(notifications: Vec<Notification>) {
    for (sink, event) in notifications {
        let _ = sink.send(event);
    }
}

/// Everything guarded by the session's single client-set lock.
struct ClientSet {
    clients: HashMap<ClientId, ClientSeat>,
    /// Insertion order, maintained in lockstep with `clients` for
    /// deterministic election tie-breaking.
    order: Vec<ClientId>,
    writer: Option<ClientId>,
    scrollback: RingBuffer,
    broadcast_started: bool,
    closed: bool,
}

impl ClientSet {
    fn new(scrollback_capacity: usize) -> Self {
        Self {
            clients: HashMap::new(),
            order: Vec::new(),
            writer: None,
            scrollback: RingBuffer::new(scrollback_capacity),
            broadcast_started: false,
            closed: false,
        }
    }

    fn active_count(&self) -> u16 {
        self.clients.values().filter(|c| c.is_active()).count() as u16
    }

    /// The sole policy selecting the writer:
    /// 1. a still-active current writer keeps the slot;
    /// 2. otherwise the first active client in insertion order;
    /// 3. otherwise the first client in insertion order;
    /// 4. otherwise nobody.
    fn choose_writer(&self) -> Option<ClientId> {
        if let Some(current) = self.writer {
            if self.clients.get(&current).is_some_and(|c| c.is_active()) {
                return Some(current);
            }
        }
        if let Some(id) = self
            .order
            .iter()
            .copied()
            .find(|id| self.clients.get(id).is_some_and(|c| c.is_active()))
        {
            return Some(id);
        }
        self.order.first().copied()
    }

    /// Re-run the election, queueing write-state notifications for the
    /// demoted and promoted clients when the writer changed.
    fn run_election(&mut self, out: &mut Vec<Notification>) {
        let previous = self.writer;
        let next = self.choose_writer();
        self.writer = next;
        if previous == next {
            return;
        }
        if let Some(seat) = previous.and_then(|id| self.clients.get(&id)) {
            out.push((seat.sink.clone(), ClientEvent::WriteState(false)));
        }
        if let Some(seat) = next.and_then(|id| self.clients.get(&id)) {
            out.push((seat.sink.clone(), ClientEvent::WriteState(true)));
        }
    }

    /// Queue the active-client count to every attached client.
    fn notify_count(&self, out: &mut Vec<Notification>) {
        let count = self.active_count();
        for id in &self.order {
            if let Some(seat) = self.clients.get(id) {
                out.push((seat.sink.clone(), ClientEvent::ClientCount(count)));
            }
        }
    }
}

fn generate_session_id() -> String {
    use rand::Rng;
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("sess-{}", suffix)
}

/// One spawned shell plus the clients multiplexed onto it.
///
/// Cheap to clone; all state is shared behind `Arc`s.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    name: Arc<RwLock<String>>,
    pub created_at: SystemTime,
    pty: Arc<Mutex<Pty>>,
    input_tx: mpsc::Sender<Bytes>,
    last_input: Arc<Mutex<Instant>>,
    clients: Arc<Mutex<ClientSet>>,
    /// PTY reader, taken by the broadcast task on first registration.
    reader_slot: Arc<Mutex<Option<Box<dyn Read + Send>>>>,
    exit_code: Arc<OnceLock<i32>>,
    exited: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("name", &*self.name.read())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn the owning user's login shell in a fresh session.
    pub fn spawn(user_id: &str, name: &str, opts: SpawnOptions) -> Result<Self, PtyError> {
        Self::spawn_with_command(user_id, name, pty::shell_command(&opts))
    }

    /// Spawn a session around an arbitrary command.
    ///
    /// Used by tests and embedders that need deterministic output; the
    /// multiplexing behavior is identical to a shell session.
    pub fn spawn_with_command(
        user_id: &str,
        name: &str,
        cmd: portable_pty::CommandBuilder,
    ) -> Result<Self, PtyError> {
        let mut pty = Pty::spawn(cmd, INITIAL_ROWS, INITIAL_COLS)?;
        let reader = pty.take_reader()?;
        let mut writer = pty.take_writer()?;
        let child = pty.take_child();

        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(64);

        // PTY writer: drains the input channel onto the PTY.
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            while let Some(data) = input_rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        let exit_code = Arc::new(OnceLock::new());
        let exited = CancellationToken::new();
        match child {
            Some(mut child) => {
                let exit_code = Arc::clone(&exit_code);
                let exited = exited.clone();
                tokio::task::spawn_blocking(move || {
                    let code = pty::exit_code(child.wait());
                    tracing::debug!(code, "session child exited");
                    let _ = exit_code.set(code);
                    exited.cancel();
                });
            }
            None => {
                let _ = exit_code.set(-1);
                exited.cancel();
            }
        }

        Ok(Self {
            id: generate_session_id(),
            user_id: user_id.to_string(),
            name: Arc::new(RwLock::new(name.to_string())),
            created_at: SystemTime::now(),
            pty: Arc::new(Mutex::new(pty)),
            input_tx,
            last_input: Arc::new(Mutex::new(Instant::now())),
            clients: Arc::new(Mutex::new(ClientSet::new(DEFAULT_SCROLLBACK))),
            reader_slot: Arc::new(Mutex::new(Some(reader))),
            exit_code,
            exited,
        })
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().clients.len()
    }

    pub fn active_client_count(&self) -> u16 {
        self.clients.lock().active_count()
    }

    pub fn current_writer(&self) -> Option<ClientId> {
        self.clients.lock().writer
    }

    pub fn is_closed(&self) -> bool {
        self.clients.lock().closed
    }

    /// Token cancelled exactly once, when the shell terminates.
    pub fn exit_signal(&self) -> CancellationToken {
        self.exited.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Exit code of the shell, available once the exit signal has fired.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    pub fn last_input_elapsed(&self) -> Duration {
        self.last_input.lock().elapsed()
    }

    /// Working directory of the shell process, for file uploads.
    pub fn working_dir(&self) -> std::io::Result<PathBuf> {
        self.pty.lock().read_cwd()
    }

    /// Forward input bytes to the PTY, refreshing the idle clock.
    ///
    /// Per-client transmission order is preserved by the input channel.
    pub async fn write_input(&self, data: Bytes) {
        *self.last_input.lock() = Instant::now();
        if self.input_tx.send(data).await.is_err() {
            tracing::debug!(session = %self.id, "input dropped, pty writer gone");
        }
    }

    /// Attach a client, delivering the scrollback snapshot atomically.
    ///
    /// Under the client-set lock: the seat is inserted, the writer election
    /// runs, count/write-state notifications are queued, and the snapshot is
    /// pushed into the joining client's sink. The broadcast task takes the
    /// same lock to append output, so the joiner sees every byte exactly
    /// once across the snapshot boundary. Returns false if the session is
    /// closed.
    pub fn register_client(
        &self,
        client_id: ClientId,
        cols: u16,
        rows: u16,
        sink: ClientSink,
    ) -> bool {
        let mut notifications: Vec<Notification> = Vec::new();
        let start_broadcast;
        {
            let mut set = self.clients.lock();
            if set.closed {
                return false;
            }
            set.clients.insert(
                client_id,
                ClientSeat {
                    cols,
                    rows,
                    joined_at: Instant::now(),
                    sink: sink.clone(),
                },
            );
            set.order.push(client_id);
            set.run_election(&mut notifications);
            // The election already notified the joiner if it was promoted.
            if set.writer != Some(client_id) {
                notifications.push((sink.clone(), ClientEvent::WriteState(false)));
            }
            set.notify_count(&mut notifications);

            let snapshot = set.scrollback.snapshot();
            if !snapshot.is_empty() {
                let _ = sink.send(ClientEvent::Output(Bytes::from(snapshot)));
            }

            start_broadcast = !set.broadcast_started;
            set.broadcast_started = true;
        }
        dispatch(notifications);
        if start_broadcast {
            self.start_broadcast();
        }
        self.recalculate_size();
        true
    }

    /// Record a client's reported dimensions, re-running the election when
    /// its activity changed. A tab returning to the foreground re-confirms
    /// its write state, since it may have been promoted or demoted while
    /// hidden.
    pub fn set_activity(&self, client_id: ClientId, cols: u16, rows: u16) {
        let mut notifications: Vec<Notification> = Vec::new();
        {
            let mut set = self.clients.lock();
            let Some(seat) = set.clients.get_mut(&client_id) else {
                return;
            };
            let was_active = seat.is_active();
            seat.cols = cols;
            seat.rows = rows;
            let now_active = seat.is_active();
            let sink = seat.sink.clone();

            if was_active != now_active {
                let previous_writer = set.writer;
                set.run_election(&mut notifications);
                if now_active && set.writer == previous_writer {
                    let is_writer = set.writer == Some(client_id);
                    notifications.push((sink, ClientEvent::WriteState(is_writer)));
                }
                set.notify_count(&mut notifications);
            }
        }
        dispatch(notifications);
        self.recalculate_size();
    }

    /// Detach a client, promoting a successor when the writer left.
    pub fn remove_client(&self, client_id: ClientId) {
        let mut notifications: Vec<Notification> = Vec::new();
        let remaining;
        {
            let mut set = self.clients.lock();
            if set.clients.remove(&client_id).is_none() {
                return;
            }
            set.order.retain(|id| *id != client_id);
            if set.writer == Some(client_id) {
                set.writer = None;
            }
            set.run_election(&mut notifications);
            set.notify_count(&mut notifications);
            remaining = !set.clients.is_empty();
        }
        dispatch(notifications);
        if remaining {
            self.recalculate_size();
        }
    }

    /// Resize the PTY to the minimum dimensions across active clients,
    /// clamped at 40x10 (the tmux strategy: a shell rendered for the
    /// smallest viewport is correct on every viewer). Skipped while no
    /// active client exists; every client is told the resulting size.
    fn recalculate_size(&self) {
        let mut notifications: Vec<Notification> = Vec::new();
        let (cols, rows) = {
            let set = self.clients.lock();
            let mut min_cols = u16::MAX;
            let mut min_rows = u16::MAX;
            let mut any_active = false;
            for seat in set.clients.values() {
                if !seat.is_active() {
                    continue;
                }
                any_active = true;
                min_cols = min_cols.min(seat.cols);
                min_rows = min_rows.min(seat.rows);
            }
            if !any_active {
                return;
            }
            let cols = min_cols.max(MIN_COLS);
            let rows = min_rows.max(MIN_ROWS);
            for id in &set.order {
                if let Some(seat) = set.clients.get(id) {
                    notifications.push((
                        seat.sink.clone(),
                        ClientEvent::TerminalSize { cols, rows },
                    ));
                }
            }
            (cols, rows)
        };
        if let Err(e) = self.pty.lock().resize(cols, rows) {
            tracing::warn!(session = %self.id, ?e, "pty resize failed");
        }
        dispatch(notifications);
    }

    /// Start the PTY output broadcast task. Idempotent by construction: the
    /// reader can only be taken once.
    fn start_broadcast(&self) {
        let Some(mut reader) = self.reader_slot.lock().take() else {
            return;
        };
        let clients = Arc::clone(&self.clients);
        let session_id = self.id.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; PTY_READ_BUF];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        // Scrollback append and fan-out under the same lock
                        // that registration snapshots under.
                        let mut set = clients.lock();
                        set.scrollback.write(&data);
                        for id in &set.order {
                            if let Some(seat) = set.clients.get(id) {
                                if seat.sink.send(ClientEvent::Output(data.clone())).is_err() {
                                    tracing::debug!(
                                        session = %session_id,
                                        client = *id,
                                        "output dropped for departed client"
                                    );
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(session = %session_id, ?e, "pty reader finished");
                        break;
                    }
                }
            }
        });
    }

    /// Tear the session down: no further registrations, the exit signal
    /// fires (code 0 when the shell was still running), and the child is
    /// killed. Idempotent.
    pub fn close(&self) {
        {
            let mut set = self.clients.lock();
            if set.closed {
                return;
            }
            set.closed = true;
        }
        let _ = self.exit_code.set(0);
        self.exited.cancel();
        self.pty.lock().kill();
    }
}

/// Snapshot of a session for list responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    /// Unix seconds.
    pub created_at: u64,
    pub attached: bool,
}

/// Registry lifecycle events, broadcast so streaming connections can tell
/// the owning user's other tabs that the session list changed.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created { user_id: String, id: String },
    Renamed { user_id: String, id: String },
    Destroyed { user_id: String, id: String },
}

impl SessionEvent {
    pub fn user_id(&self) -> &str {
        match self {
            SessionEvent::Created { user_id, .. }
            | SessionEvent::Renamed { user_id, .. }
            | SessionEvent::Destroyed { user_id, .. } => user_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
    #[error(transparent)]
    Spawn(#[from] PtyError),
}

/// Process-wide map of session id to session, scoped by owning user.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    events_tx: broadcast::Sender<SessionEvent>,
    max_sessions: Option<usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_max_sessions(None)
    }

    pub fn with_max_sessions(max_sessions: Option<usize>) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
            max_sessions,
        }
    }

    /// Spawn a login shell for `user_id` and register the session.
    ///
    /// An empty or missing name defaults to `"Session N"`, numbering past
    /// the user's current live sessions.
    pub fn create(
        &self,
        user_id: &str,
        name: Option<String>,
        opts: SpawnOptions,
    ) -> Result<Session, RegistryError> {
        if let Some(max) = self.max_sessions {
            if self.sessions.read().len() >= max {
                return Err(RegistryError::MaxSessionsReached);
            }
        }

        let name = match name.filter(|n| !n.is_empty()) {
            Some(n) => n,
            None => {
                let count = self
                    .sessions
                    .read()
                    .values()
                    .filter(|s| s.user_id == user_id && !s.is_closed())
                    .count();
                format!("Session {}", count + 1)
            }
        };

        let session = Session::spawn(user_id, &name, opts)?;
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        self.watch_exit(session.clone());

        tracing::info!(session = %session.id, user = user_id, name = %session.name(), "session created");
        let _ = self.events_tx.send(SessionEvent::Created {
            user_id: user_id.to_string(),
            id: session.id.clone(),
        });
        Ok(session)
    }

    /// Remove a session from the registry when its shell exits with nobody
    /// attached; with clients attached, the last one to disconnect removes
    /// it instead.
    fn watch_exit(&self, session: Session) {
        let registry = self.clone();
        tokio::spawn(async move {
            session.exit_signal().cancelled().await;
            if session.client_count() == 0 {
                registry.remove(&session.id);
            }
        });
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().get(id).cloned()
    }

    /// Close a session and drop it from the registry.
    pub fn remove(&self, id: &str) -> Option<Session> {
        let removed = self.sessions.write().remove(id);
        if let Some(ref session) = removed {
            session.close();
            tracing::info!(session = %session.id, "session destroyed");
            let _ = self.events_tx.send(SessionEvent::Destroyed {
                user_id: session.user_id.clone(),
                id: session.id.clone(),
            });
        }
        removed
    }

    pub fn rename(&self, id: &str, new_name: &str) -> Result<Session, RegistryError> {
        let session = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        session.set_name(new_name);
        let _ = self.events_tx.send(SessionEvent::Renamed {
            user_id: session.user_id.clone(),
            id: session.id.clone(),
        });
        Ok(session)
    }

    /// Snapshots of the user's live sessions.
    pub fn list_by_user(&self, user_id: &str) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.user_id == user_id && !s.is_closed())
            .map(|s| SessionInfo {
                id: s.id.clone(),
                name: s.name(),
                created_at: s
                    .created_at
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
                attached: s.client_count() > 0,
            })
            .collect()
    }

    pub fn close_all_for_user(&self, user_id: &str) {
        let ids: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.id.clone())
            .collect();
        for id in ids {
            self.remove(&id);
        }
    }

    /// Close sessions whose last input is older than `max_idle`. Returns the
    /// number reaped.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let stale: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.last_input_elapsed() > max_idle)
            .map(|s| s.id.clone())
            .collect();
        for id in &stale {
            tracing::info!(session = %id, "reaping idle session");
            self.remove(id);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session; called on server shutdown.
    pub fn drain(&self) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for id in ids {
            self.remove(&id);
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
