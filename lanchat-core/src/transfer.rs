//! File-transfer sessions: one per offered file, with its state machine and progress accounting.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::identity::PeerCode;
use crate::protocol::file_hash;

/// How long an accepted receive session waits for the sender to connect.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Bytes copied per read/write while streaming a file.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Progress is reported at least this often (in chunks) even when the percent does not move.
pub const NOTIFY_EVERY_CHUNKS: u32 = 250;

/// Opaque handle for a session. The registry owns the session; everyone else holds this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// Offer announced, no answer yet.
    Offered,
    /// Receiver accepted and is listening; sender has not connected yet.
    AcceptedWaiting,
    Connected,
    Transferring,
    Completed,
    Failed,
    /// Receiver declined the offer.
    Rejected,
    Canceled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed
                | TransferState::Failed
                | TransferState::Rejected
                | TransferState::Canceled
        )
    }

    /// Allowed edges of the state machine. Cancel and fail are reachable from every live state.
    pub fn can_become(self, next: TransferState) -> bool {
        use TransferState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Canceled) | (_, Failed) => true,
            (Offered, AcceptedWaiting) | (Offered, Rejected) => true,
            (AcceptedWaiting, Connected) => true,
            (Connected, Transferring) => true,
            (Transferring, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::Offered => "offered",
            TransferState::AcceptedWaiting => "waiting",
            TransferState::Connected => "connected",
            TransferState::Transferring => "transferring",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
            TransferState::Rejected => "rejected",
            TransferState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Percent complete, floored. An empty file is 100% from the start.
pub fn percent_of(transferred: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let p = (transferred as u128 * 100) / total as u128;
    p.min(100) as u8
}

/// Byte and percent accounting for one stream, with a bounded notification rate.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    total: u64,
    transferred: u64,
    percent: u8,
    last_notified: u8,
    chunks_since_notify: u32,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Account for `n` more bytes. Returns true when the listener should be told.
    pub fn record(&mut self, n: u64) -> bool {
        self.transferred = self.transferred.saturating_add(n);
        let percent = percent_of(self.transferred, self.total).max(self.percent);
        self.percent = percent;
        self.chunks_since_notify += 1;
        if percent > self.last_notified || self.chunks_since_notify >= NOTIFY_EVERY_CHUNKS {
            self.last_notified = percent;
            self.chunks_since_notify = 0;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.total);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Percent as last computed; 0 before any bytes moved.
    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.transferred == self.total
    }
}

/// Bytes per wall-clock second, recomputed once a full second has elapsed.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter {
    window_start: Option<Instant>,
    window_bytes: u64,
    bytes_per_sec: u64,
}

impl ByteCounter {
    pub fn reset(&mut self) {
        self.window_start = Some(Instant::now());
        self.window_bytes = 0;
        self.bytes_per_sec = 0;
    }

    pub fn update(&mut self, n: u64) {
        self.update_at(n, Instant::now());
    }

    pub fn update_at(&mut self, n: u64, now: Instant) {
        let start = *self.window_start.get_or_insert(now);
        self.window_bytes += n;
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= Duration::from_secs(1) {
            self.bytes_per_sec = (self.window_bytes as u128 * 1000 / elapsed.as_millis()) as u64;
            self.window_start = Some(now);
            self.window_bytes = 0;
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }
}

/// One transfer attempt of one named file between me and one peer.
#[derive(Debug, Clone)]
pub struct TransferSession {
    id: SessionId,
    peer: PeerCode,
    peer_nick: String,
    direction: Direction,
    /// Name as offered on the wire; the registry key.
    file_name: String,
    /// Source file when sending, destination when receiving.
    path: PathBuf,
    hash: i32,
    /// Receiver's listening port, once known.
    port: Option<u16>,
    state: TransferState,
    progress: Progress,
    speed: ByteCounter,
}

impl TransferSession {
    /// A session for a file I offer to `peer`.
    pub fn outgoing(peer: PeerCode, peer_nick: impl Into<String>, path: impl Into<PathBuf>, size: u64) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let hash = file_hash(&file_name);
        Self::build(peer, peer_nick.into(), Direction::Send, file_name, path, size, hash)
    }

    /// A session for a file `peer` offers me. Saved under `download_dir`; only the final path
    /// component of the offered name is used.
    pub fn incoming(
        peer: PeerCode,
        peer_nick: impl Into<String>,
        file_name: impl Into<String>,
        size: u64,
        hash: i32,
        download_dir: &Path,
    ) -> Self {
        let file_name = file_name.into();
        let local = Path::new(&file_name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "unnamed".into());
        let path = download_dir.join(local);
        Self::build(peer, peer_nick.into(), Direction::Receive, file_name, path, size, hash)
    }

    fn build(
        peer: PeerCode,
        peer_nick: String,
        direction: Direction,
        file_name: String,
        path: PathBuf,
        size: u64,
        hash: i32,
    ) -> Self {
        Self {
            id: SessionId::new(),
            peer,
            peer_nick,
            direction,
            file_name,
            path,
            hash,
            port: None,
            state: TransferState::Offered,
            progress: Progress::new(size),
            speed: ByteCounter::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> PeerCode {
        self.peer
    }

    pub fn peer_nick(&self) -> &str {
        &self.peer_nick
    }

    pub fn set_peer_nick(&mut self, nick: impl Into<String>) {
        self.peer_nick = nick.into();
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Change where a receive session saves its file (collision renaming).
    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    pub fn hash(&self) -> i32 {
        self.hash
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    pub fn size(&self) -> u64 {
        self.progress.total()
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn transferred(&self) -> u64 {
        self.progress.transferred()
    }

    pub fn percent(&self) -> u8 {
        self.progress.percent()
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.speed.bytes_per_sec()
    }

    /// Outgoing and not yet connected: the receiver still holds nothing but (maybe) a listener.
    pub fn is_waiting(&self) -> bool {
        self.direction == Direction::Send
            && matches!(
                self.state,
                TransferState::Offered | TransferState::AcceptedWaiting
            )
    }

    /// An incoming offer the user has not answered.
    pub fn is_undecided(&self) -> bool {
        self.direction == Direction::Receive && self.state == TransferState::Offered
    }

    /// Move to `next`. Fails, changing nothing, when the edge is not allowed.
    pub fn transition(&mut self, next: TransferState) -> Result<(), TransferError> {
        if self.state.is_terminal() {
            return Err(TransferError::AlreadyTerminal(self.state));
        }
        if !self.state.can_become(next) {
            return Err(TransferError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        log::debug!(
            "transfer {} '{}' with {}: {} -> {}",
            self.id,
            self.file_name,
            self.peer,
            self.state,
            next
        );
        if next == TransferState::Transferring {
            self.progress.reset();
            self.speed.reset();
        }
        self.state = next;
        Ok(())
    }

    /// Account for streamed bytes. Returns true when progress should be reported.
    pub fn record(&mut self, n: u64) -> bool {
        self.speed.update(n);
        self.progress.record(n)
    }

    /// The stream ended: Completed only if every byte arrived and nothing canceled it.
    pub fn finish(&mut self) -> Result<TransferState, TransferError> {
        let next = if self.state == TransferState::Transferring && self.progress.is_complete() {
            TransferState::Completed
        } else {
            TransferState::Failed
        };
        self.transition(next)?;
        Ok(next)
    }
}

/// Pick a destination that does not overwrite anything: `name`, else `name.1`, `name.2`, ...
pub fn unique_destination(path: &Path, exists: impl Fn(&Path) -> bool) -> PathBuf {
    if !exists(path) {
        return path.to_path_buf();
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let mut counter = 1u32;
    loop {
        let candidate = parent.join(format!("{name}.{counter}"));
        if !exists(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer already ended ({0})")]
    AlreadyTerminal(TransferState),
    #[error("cannot go from {from} to {to}")]
    InvalidTransition {
        from: TransferState,
        to: TransferState,
    },
}
