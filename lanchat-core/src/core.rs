//! Host-driven API: ChatCore receives messages, ticks and user operations from the host and
//! returns actions (datagrams to send, transfers to start or stop, events to publish).

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::{PeerCode, PeerIdentity};
use crate::presence::{PresenceTable, Topic, DEFAULT_PEER_TIMEOUT_MS};
use crate::protocol::{Body, Message};
use crate::registry::{RegistryError, TransferRegistry};
use crate::transfer::{Direction, SessionId, TransferError, TransferSession, TransferState};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Something the host must do on the core's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send to the whole group.
    Multicast(Message),
    /// Send point-to-point to a peer's private chat port.
    Private { message: Message, addr: SocketAddr },
    /// The receiver accepted: connect to it and stream the file.
    StartSending { session: SessionId, addr: SocketAddr },
    /// Close any sockets held for this session.
    StopTransfer(SessionId),
    /// Publish to front ends.
    Notify(Event),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Announced with a logon.
    Logon,
    /// Answered an expose request.
    Exposed,
    /// First seen through some other message.
    ShowedUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveKind {
    Logoff,
    Timeout,
}

/// Everything a front end can subscribe to.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PeerJoined {
        code: PeerCode,
        nick: String,
        ip: IpAddr,
        kind: JoinKind,
    },
    PeerLeft {
        code: PeerCode,
        nick: String,
        kind: LeaveKind,
    },
    PeerRenamed {
        code: PeerCode,
        old: String,
        new: String,
    },
    PeerAway {
        nick: String,
        message: String,
    },
    PeerBack {
        nick: String,
    },
    Writing {
        nick: String,
        writing: bool,
    },
    TopicChanged(Topic),
    Chat {
        nick: String,
        color: i32,
        text: String,
    },
    PrivateChat {
        code: PeerCode,
        nick: String,
        color: i32,
        text: String,
    },
    /// Someone else held my nick; I now go by `renamed_to`.
    NickConflict {
        contested: String,
        renamed_to: String,
    },
    TransferOffered {
        session: SessionId,
        nick: String,
        file_name: String,
        size: u64,
    },
    /// A session changed state (accepted, connected, or reached a terminal state).
    Transfer {
        session: SessionId,
        direction: Direction,
        nick: String,
        file_name: String,
        state: TransferState,
    },
    TransferProgress {
        session: SessionId,
        percent: u8,
        transferred: u64,
        bytes_per_sec: u64,
    },
    LinkUp {
        silent: bool,
    },
    LinkDown {
        silent: bool,
    },
    /// A recoverable problem the user should hear about.
    Warning(String),
}

fn transfer_event(s: &TransferSession) -> Event {
    Event::Transfer {
        session: s.id(),
        direction: s.direction(),
        nick: s.peer_nick().to_string(),
        file_name: s.file_name().to_string(),
        state: s.state(),
    }
}

/// Main coordinator and the explicit context shared by every component.
pub struct ChatCore {
    presence: PresenceTable,
    topic: Topic,
    transfers: TransferRegistry,
    own_color: i32,
    download_dir: PathBuf,
    peer_timeout_ms: u64,
    logged_on: bool,
}

impl ChatCore {
    pub fn new(me: PeerIdentity, own_color: i32, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            presence: PresenceTable::new(me),
            topic: Topic::default(),
            transfers: TransferRegistry::new(),
            own_color,
            download_dir: download_dir.into(),
            peer_timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
            logged_on: false,
        }
    }

    pub fn set_peer_timeout(&mut self, timeout_ms: u64) {
        self.peer_timeout_ms = timeout_ms;
    }

    pub fn me(&self) -> &PeerIdentity {
        self.presence.me()
    }

    pub fn presence(&self) -> &PresenceTable {
        &self.presence
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn transfers(&self) -> &TransferRegistry {
        &self.transfers
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn is_logged_on(&self) -> bool {
        self.logged_on
    }

    /// A message from me with the given body.
    pub fn message(&self, body: Body) -> Message {
        let me = self.presence.me();
        Message::new(me.code, me.nick.clone(), body)
    }

    pub fn set_private_chat_port(&mut self, port: u16) {
        self.presence.me_mut().private_chat_port = port;
    }

    /// Address of the interface the link is using.
    pub fn set_my_ip(&mut self, ip: Option<IpAddr>) {
        self.presence.me_mut().ip = ip;
    }

    pub fn client_info(&self, now_ms: u64) -> Message {
        let me = self.presence.me();
        self.message(Body::ClientInfo {
            client: me.client.clone(),
            uptime: now_ms.saturating_sub(me.logon_time),
            operating_system: me.operating_system.clone(),
            private_chat_port: me.private_chat_port,
        })
    }

    /// Announcements to make when the link comes up.
    pub fn logon(&mut self, now_ms: u64) -> Vec<Action> {
        let first = !self.logged_on;
        self.logged_on = true;
        self.presence.me_mut().last_activity = now_ms;
        let mut out = Vec::new();
        if first {
            out.push(Action::Multicast(self.message(Body::Logon)));
            out.push(Action::Multicast(self.client_info(now_ms)));
            out.push(Action::Multicast(self.message(Body::Expose)));
            out.push(Action::Multicast(self.message(Body::GetTopic)));
        } else {
            out.push(Action::Multicast(self.message(Body::Expose)));
            out.push(Action::Multicast(self.message(Body::GetTopic)));
            out.push(Action::Multicast(self.client_info(now_ms)));
        }
        out
    }

    /// Goodbye, if we ever said hello.
    pub fn logoff(&mut self) -> Vec<Action> {
        if !std::mem::replace(&mut self.logged_on, false) {
            return vec![];
        }
        vec![Action::Multicast(self.message(Body::Logoff))]
    }

    /// Periodic housekeeping: keepalive and expiry of silent peers.
    pub fn tick(&mut self, now_ms: u64) -> Vec<Action> {
        let mut out = Vec::new();
        if self.logged_on {
            self.presence.me_mut().last_activity = now_ms;
            out.push(Action::Multicast(self.message(Body::Idle)));
        }
        for gone in self.presence.expire(now_ms, self.peer_timeout_ms) {
            log::info!("{} ({}) timed out", gone.nick, gone.code);
            out.extend(self.abandon_transfers(gone.code));
            out.push(Action::Notify(Event::PeerLeft {
                code: gone.code,
                nick: gone.nick,
                kind: LeaveKind::Timeout,
            }));
        }
        out
    }

    /// Handle one decoded datagram from `from`.
    pub fn on_message_received(&mut self, msg: Message, from: IpAddr, now_ms: u64) -> Vec<Action> {
        let my_code = self.presence.my_code();
        if msg.code == my_code {
            return vec![];
        }
        if let Some(target) = msg.body.target() {
            if target != my_code {
                return vec![];
            }
        }

        let mut out = Vec::new();
        if msg.body == Body::Logoff {
            if let Some(gone) = self.presence.remove(msg.code) {
                out.extend(self.abandon_transfers(gone.code));
                out.push(Action::Notify(Event::PeerLeft {
                    code: gone.code,
                    nick: gone.nick,
                    kind: LeaveKind::Logoff,
                }));
            }
            return out;
        }

        if !self.presence.contains(msg.code) {
            let kind = match msg.body {
                Body::Logon => JoinKind::Logon,
                Body::Exposing { .. } => JoinKind::Exposed,
                _ => JoinKind::ShowedUp,
            };
            self.presence
                .add(PeerIdentity::new(msg.code, msg.nick.clone(), Some(from), now_ms));
            out.push(Action::Notify(Event::PeerJoined {
                code: msg.code,
                nick: msg.nick.clone(),
                ip: from,
                kind,
            }));
        }
        // Peers running on this machine share its host name.
        let local_host = {
            let me = self.presence.me();
            (me.ip == Some(from)).then(|| me.host_name.clone()).flatten()
        };
        if let Some(peer) = self.presence.get_mut(msg.code) {
            peer.last_activity = now_ms;
            peer.ip = Some(from);
            if local_host.is_some() {
                peer.host_name = local_host;
            }
        }

        match msg.body {
            Body::Idle | Body::Logoff => {}
            Body::Logon => {
                self.rename_peer(msg.code, &msg.nick, &mut out);
                self.check_nick_collision(&msg.nick, &mut out);
            }
            Body::Expose => {
                let away = self.presence.me().away_message.clone();
                out.push(Action::Multicast(
                    self.message(Body::Exposing { away_message: away }),
                ));
                out.push(Action::Multicast(self.client_info(now_ms)));
            }
            Body::Exposing { away_message } => {
                self.rename_peer(msg.code, &msg.nick, &mut out);
                if let Some(peer) = self.presence.get_mut(msg.code) {
                    peer.away = !away_message.is_empty();
                    peer.away_message = away_message;
                }
            }
            Body::GetTopic => {
                if self.topic.time > 0 {
                    out.push(Action::Multicast(self.topic_message()));
                }
            }
            Body::Topic { set_by, time, text } => {
                if self.topic.update(Topic::new(text, set_by, time)) {
                    out.push(Action::Notify(Event::TopicChanged(self.topic.clone())));
                }
            }
            Body::Away { message } => {
                if let Some(peer) = self.presence.get_mut(msg.code) {
                    peer.away = true;
                    peer.away_message = message.clone();
                }
                out.push(Action::Notify(Event::PeerAway {
                    nick: msg.nick,
                    message,
                }));
            }
            Body::Back => {
                if let Some(peer) = self.presence.get_mut(msg.code) {
                    peer.away = false;
                    peer.away_message.clear();
                }
                out.push(Action::Notify(Event::PeerBack { nick: msg.nick }));
            }
            Body::NickChange => {
                self.check_nick_collision(&msg.nick, &mut out);
                self.rename_peer(msg.code, &msg.nick, &mut out);
            }
            Body::NickConflict { nick } => {
                let me = self.presence.me();
                if nick.to_lowercase() == me.nick.to_lowercase() {
                    let contested = me.nick.clone();
                    let renamed_to = me.code.to_string();
                    log::warn!("nick '{contested}' is held by {}, renaming to {renamed_to}", msg.code);
                    self.presence.me_mut().nick = renamed_to.clone();
                    out.push(Action::Multicast(self.message(Body::NickChange)));
                    out.push(Action::Notify(Event::NickConflict {
                        contested,
                        renamed_to,
                    }));
                }
            }
            Body::WritingStarted | Body::WritingStopped => {
                let writing = msg.body == Body::WritingStarted;
                if let Some(peer) = self.presence.get_mut(msg.code) {
                    peer.writing = writing;
                }
                out.push(Action::Notify(Event::Writing {
                    nick: msg.nick,
                    writing,
                }));
            }
            Body::ClientInfo {
                client,
                uptime,
                operating_system,
                private_chat_port,
            } => {
                if let Some(peer) = self.presence.get_mut(msg.code) {
                    peer.client = client;
                    peer.operating_system = operating_system;
                    peer.logon_time = now_ms.saturating_sub(uptime);
                    peer.private_chat_port = private_chat_port;
                }
            }
            Body::Chat { color, text } => {
                out.push(Action::Notify(Event::Chat {
                    nick: msg.nick,
                    color,
                    text,
                }));
            }
            Body::PrivateChat { color, text, .. } => {
                out.push(Action::Notify(Event::PrivateChat {
                    code: msg.code,
                    nick: msg.nick,
                    color,
                    text,
                }));
            }
            Body::FileOffer {
                size,
                hash,
                file_name,
                ..
            } => {
                let session = TransferSession::incoming(
                    msg.code,
                    msg.nick.clone(),
                    file_name.clone(),
                    size,
                    hash,
                    &self.download_dir,
                );
                match self.transfers.add(session) {
                    Ok(id) => out.push(Action::Notify(Event::TransferOffered {
                        session: id,
                        nick: msg.nick,
                        file_name,
                        size,
                    })),
                    Err(e) => log::warn!("ignoring offer from {}: {e}", msg.code),
                }
            }
            Body::FileAccept {
                port, file_name, ..
            } => self.on_file_accept(msg.code, &file_name, port, from, &mut out),
            Body::FileAbort { file_name, .. } => {
                self.on_file_abort(msg.code, &file_name, &mut out)
            }
            Body::Unrecognized { kind, .. } => {
                log::debug!("unrecognized message type '{kind}' from {}", msg.code);
            }
        }
        out
    }

    fn rename_peer(&mut self, code: PeerCode, nick: &str, out: &mut Vec<Action>) {
        let Some(peer) = self.presence.get_mut(code) else {
            return;
        };
        if peer.nick == nick {
            return;
        }
        let old = std::mem::replace(&mut peer.nick, nick.to_string());
        for id in self.transfers.with_peer(code) {
            if let Some(s) = self.transfers.get_mut(id) {
                s.set_peer_nick(nick);
            }
        }
        out.push(Action::Notify(Event::PeerRenamed {
            code,
            old,
            new: nick.to_string(),
        }));
    }

    /// Tell the group a nick is mine when someone else shows up with it.
    fn check_nick_collision(&self, nick: &str, out: &mut Vec<Action>) {
        let mine = &self.presence.me().nick;
        if nick.to_lowercase() == mine.to_lowercase() {
            out.push(Action::Multicast(
                self.message(Body::NickConflict { nick: mine.clone() }),
            ));
        }
    }

    fn on_file_accept(
        &mut self,
        peer: PeerCode,
        file_name: &str,
        port: u16,
        from: IpAddr,
        out: &mut Vec<Action>,
    ) {
        let Some(id) = self
            .transfers
            .find_directed(peer, file_name, Direction::Send)
            .filter(|s| s.state() == TransferState::Offered)
            .map(|s| s.id())
        else {
            log::debug!("accept for unknown offer '{file_name}' from {peer}");
            return;
        };
        let Some(s) = self.transfers.get_mut(id) else {
            return;
        };
        if s.transition(TransferState::AcceptedWaiting).is_err() {
            return;
        }
        s.set_port(port);
        out.push(Action::Notify(transfer_event(s)));
        out.push(Action::StartSending {
            session: id,
            addr: SocketAddr::new(from, port),
        });
    }

    fn on_file_abort(&mut self, peer: PeerCode, file_name: &str, out: &mut Vec<Action>) {
        let Some(s) = self.transfers.find(peer, file_name) else {
            return;
        };
        let id = s.id();
        let next = match (s.direction(), s.state()) {
            (Direction::Receive, TransferState::Offered) => TransferState::Canceled,
            (Direction::Send, TransferState::Offered) => TransferState::Rejected,
            (Direction::Send, TransferState::AcceptedWaiting) => TransferState::Canceled,
            // Accepted while the sender was canceling: the engine still holds the listener
            // and releases the session once it is closed.
            (Direction::Receive, TransferState::AcceptedWaiting) => {
                if let Some(s) = self.transfers.get_mut(id) {
                    if s.transition(TransferState::Canceled).is_ok() {
                        out.push(Action::StopTransfer(id));
                        out.push(Action::Notify(transfer_event(s)));
                    }
                }
                return;
            }
            _ => return,
        };
        if let Some(mut s) = self.transfers.remove(id) {
            if s.transition(next).is_ok() {
                out.push(Action::StopTransfer(id));
                out.push(Action::Notify(transfer_event(&s)));
            }
        }
    }

    /// Cancel every live transfer with a peer that has gone away.
    fn abandon_transfers(&mut self, peer: PeerCode) -> Vec<Action> {
        let mut out = Vec::new();
        for id in self.transfers.with_peer(peer) {
            let Some(s) = self.transfers.get_mut(id) else {
                continue;
            };
            let has_io = !matches!(s.state(), TransferState::Offered);
            if s.transition(TransferState::Canceled).is_ok() {
                out.push(Action::StopTransfer(id));
                out.push(Action::Notify(transfer_event(s)));
            }
            if !has_io {
                self.transfers.remove(id);
            }
        }
        out
    }

    fn topic_message(&self) -> Message {
        self.message(Body::Topic {
            set_by: self.topic.set_by.clone(),
            time: self.topic.time,
            text: self.topic.text.clone(),
        })
    }

    // User operations. Validation happens in the command module; these only change state.

    pub fn change_topic(&mut self, text: &str, now_ms: u64) -> Message {
        self.topic = Topic::new(text, self.presence.me().nick.clone(), now_ms);
        self.topic_message()
    }

    pub fn go_away(&mut self, message: &str) -> Message {
        let me = self.presence.me_mut();
        me.away = true;
        me.away_message = message.to_string();
        self.message(Body::Away {
            message: message.to_string(),
        })
    }

    pub fn come_back(&mut self) -> Message {
        let me = self.presence.me_mut();
        me.away = false;
        me.away_message.clear();
        self.message(Body::Back)
    }

    pub fn change_nick(&mut self, nick: &str) -> Message {
        self.presence.me_mut().nick = nick.to_string();
        self.message(Body::NickChange)
    }

    pub fn chat_message(&self, text: &str) -> Message {
        self.message(Body::Chat {
            color: self.own_color,
            text: text.to_string(),
        })
    }

    /// A private message and where to send it. None when the peer cannot take private chat.
    pub fn private_message(&self, peer: PeerCode, text: &str) -> Option<(Message, SocketAddr)> {
        let p = self.presence.get(peer)?;
        if !p.can_receive_private_chat() {
            return None;
        }
        let ip = p.ip?;
        let msg = self.message(Body::PrivateChat {
            to: peer,
            color: self.own_color,
            text: text.to_string(),
        });
        Some((msg, SocketAddr::new(ip, p.private_chat_port)))
    }

    /// Register an outgoing offer and build its announcement.
    pub fn offer_file(
        &mut self,
        peer: PeerCode,
        path: &Path,
        size: u64,
    ) -> Result<(SessionId, Message), CoreError> {
        let nick = self
            .presence
            .get(peer)
            .map(|p| p.nick.clone())
            .ok_or(CoreError::UnknownPeer(peer))?;
        let session = TransferSession::outgoing(peer, nick, path, size);
        let body = Body::FileOffer {
            to: peer,
            size,
            hash: session.hash(),
            file_name: session.file_name().to_string(),
        };
        let id = self.transfers.add(session)?;
        Ok((id, self.message(body)))
    }

    /// Point a receive session at a different local file before accepting.
    pub fn set_destination(&mut self, id: SessionId, path: &Path) -> Result<(), CoreError> {
        let s = self.session_mut(id)?;
        s.set_path(path);
        Ok(())
    }

    /// The receiver is listening on `port`: move to waiting and build the accept message.
    pub fn accept_offer(&mut self, id: SessionId, port: u16) -> Result<Message, CoreError> {
        let s = self.session_mut(id)?;
        s.transition(TransferState::AcceptedWaiting)?;
        s.set_port(port);
        let body = Body::FileAccept {
            to: s.peer(),
            port,
            hash: s.hash(),
            file_name: s.file_name().to_string(),
        };
        Ok(self.message(body))
    }

    /// Decline an incoming offer. The sender hears about it through an abort.
    pub fn reject_offer(&mut self, id: SessionId) -> Result<Message, CoreError> {
        let mut s = self.transfers.remove(id).ok_or(CoreError::UnknownSession)?;
        s.transition(TransferState::Rejected)?;
        Ok(self.message(Body::FileAbort {
            to: s.peer(),
            hash: s.hash(),
            file_name: s.file_name().to_string(),
        }))
    }

    /// Cancel from any live state. A sending session that never connected is dropped from the
    /// registry and the receiver is told with exactly one abort.
    pub fn cancel_transfer(&mut self, id: SessionId) -> Result<Vec<Action>, CoreError> {
        let s = self.session_mut(id)?;
        let was_waiting = s.is_waiting();
        let was_undecided = s.is_undecided();
        s.transition(TransferState::Canceled)?;
        let mut out = vec![Action::StopTransfer(id), Action::Notify(transfer_event(s))];
        if was_waiting || was_undecided {
            if let Some(s) = self.transfers.remove(id) {
                if was_waiting {
                    out.push(Action::Multicast(self.message(Body::FileAbort {
                        to: s.peer(),
                        hash: s.hash(),
                        file_name: s.file_name().to_string(),
                    })));
                }
            }
        }
        Ok(out)
    }

    /// Drop an outgoing offer whose announcement never left this host. Nobody is told.
    pub fn withdraw_offer(&mut self, id: SessionId) -> Result<(), CoreError> {
        let s = self.transfers.get(id).ok_or(CoreError::UnknownSession)?;
        if s.direction() != Direction::Send || s.state() != TransferState::Offered {
            return Err(CoreError::NotWithdrawable);
        }
        self.transfers.remove(id);
        Ok(())
    }

    // Engine callbacks.

    pub fn session(&self, id: SessionId) -> Option<&TransferSession> {
        self.transfers.get(id)
    }

    fn session_mut(&mut self, id: SessionId) -> Result<&mut TransferSession, CoreError> {
        self.transfers.get_mut(id).ok_or(CoreError::UnknownSession)
    }

    /// The stream socket is up: Connected, then straight to Transferring.
    pub fn transfer_connected(&mut self, id: SessionId) -> Result<Vec<Action>, CoreError> {
        let s = self.session_mut(id)?;
        s.transition(TransferState::Connected)?;
        let connected = transfer_event(s);
        s.transition(TransferState::Transferring)?;
        Ok(vec![
            Action::Notify(connected),
            Action::Notify(transfer_event(s)),
        ])
    }

    /// Account for streamed bytes. Returns a progress event when one is due.
    /// Errors when the session is gone or no longer transferring, so the stream should stop.
    pub fn transfer_progress(&mut self, id: SessionId, n: u64) -> Result<Option<Action>, CoreError> {
        let s = self.session_mut(id)?;
        if s.state() != TransferState::Transferring {
            return Err(CoreError::Transfer(TransferError::AlreadyTerminal(s.state())));
        }
        if !s.record(n) {
            return Ok(None);
        }
        Ok(Some(Action::Notify(Event::TransferProgress {
            session: id,
            percent: s.percent(),
            transferred: s.transferred(),
            bytes_per_sec: s.bytes_per_sec(),
        })))
    }

    /// The stream ended. Completed or Failed, reported once; nothing if already terminal.
    pub fn transfer_finished(&mut self, id: SessionId) -> Vec<Action> {
        match self.transfers.get_mut(id) {
            Some(s) => match s.finish() {
                Ok(_) => vec![Action::Notify(transfer_event(s))],
                Err(_) => vec![],
            },
            None => vec![],
        }
    }

    /// I/O failure or accept timeout. Reported once; nothing if already terminal.
    pub fn transfer_failed(&mut self, id: SessionId) -> Vec<Action> {
        match self.transfers.get_mut(id) {
            Some(s) => match s.transition(TransferState::Failed) {
                Ok(()) => vec![Action::Notify(transfer_event(s))],
                Err(_) => vec![],
            },
            None => vec![],
        }
    }

    /// The engine is done with this session's sockets; drop it once terminal.
    pub fn release(&mut self, id: SessionId) {
        if self.transfers.get(id).is_some_and(|s| s.is_terminal()) {
            self.transfers.remove(id);
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("no such transfer")]
    UnknownSession,
    #[error("unknown peer {0}")]
    UnknownPeer(PeerCode),
    #[error("only an unanswered outgoing offer can be withdrawn")]
    NotWithdrawable,
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: PeerCode = PeerCode(111);
    const B: PeerCode = PeerCode(222);

    fn ip() -> IpAddr {
        "10.0.0.2".parse().unwrap()
    }

    fn core_as(code: PeerCode, nick: &str) -> ChatCore {
        ChatCore::new(PeerIdentity::me(code, nick, "test", 0), 7, "/dl")
    }

    fn from(code: PeerCode, nick: &str, body: Body) -> Message {
        Message::new(code, nick, body)
    }

    fn multicasts(actions: &[Action]) -> Vec<&Body> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Multicast(m) => Some(&m.body),
                _ => None,
            })
            .collect()
    }

    fn events(actions: &[Action]) -> Vec<&Event> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Notify(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn logon_sequence_then_relogon() {
        let mut c = core_as(A, "Anna");
        let first = c.logon(1000);
        assert!(matches!(
            multicasts(&first)[..],
            [Body::Logon, Body::ClientInfo { .. }, Body::Expose, Body::GetTopic]
        ));
        let again = c.logon(2000);
        assert!(matches!(
            multicasts(&again)[..],
            [Body::Expose, Body::GetTopic, Body::ClientInfo { .. }]
        ));
        assert_eq!(multicasts(&c.logoff()), vec![&Body::Logoff]);
        assert!(c.logoff().is_empty());
    }

    #[test]
    fn own_messages_ignored() {
        let mut c = core_as(A, "Anna");
        let out = c.on_message_received(from(A, "Anna", Body::Idle), ip(), 1);
        assert!(out.is_empty());
        assert_eq!(c.presence().len(), 1);
    }

    #[test]
    fn logon_adds_peer_and_logoff_removes() {
        let mut c = core_as(A, "Anna");
        let out = c.on_message_received(from(B, "Bob", Body::Logon), ip(), 1);
        assert!(matches!(
            events(&out)[..],
            [Event::PeerJoined { kind: JoinKind::Logon, .. }]
        ));
        assert_eq!(c.presence().get(B).unwrap().ip, Some(ip()));
        let out = c.on_message_received(from(B, "Bob", Body::Logoff), ip(), 2);
        assert!(matches!(
            events(&out)[..],
            [Event::PeerLeft { kind: LeaveKind::Logoff, .. }]
        ));
        assert!(!c.presence().contains(B));
        // A logoff from a stranger does not add it.
        assert!(c
            .on_message_received(from(PeerCode(9), "X", Body::Logoff), ip(), 3)
            .is_empty());
        assert!(!c.presence().contains(PeerCode(9)));
    }

    #[test]
    fn unknown_sender_shows_up() {
        let mut c = core_as(A, "Anna");
        let out = c.on_message_received(
            from(B, "Bob", Body::Chat { color: 1, text: "hi".into() }),
            ip(),
            5,
        );
        assert!(matches!(
            events(&out)[..],
            [
                Event::PeerJoined { kind: JoinKind::ShowedUp, .. },
                Event::Chat { .. }
            ]
        ));
    }

    #[test]
    fn expose_is_answered() {
        let mut c = core_as(A, "Anna");
        c.go_away("lunch");
        let out = c.on_message_received(from(B, "Bob", Body::Expose), ip(), 5);
        let sent = multicasts(&out);
        assert_eq!(
            sent[0],
            &Body::Exposing {
                away_message: "lunch".into()
            }
        );
        assert!(matches!(sent[1], Body::ClientInfo { .. }));
    }

    #[test]
    fn exposing_records_away_state() {
        let mut c = core_as(A, "Anna");
        c.on_message_received(
            from(B, "Bob", Body::Exposing { away_message: "brb".into() }),
            ip(),
            5,
        );
        let bob = c.presence().get(B).unwrap();
        assert!(bob.away);
        assert_eq!(bob.away_message, "brb");
    }

    #[test]
    fn topic_query_and_update() {
        let mut c = core_as(A, "Anna");
        assert!(c
            .on_message_received(from(B, "Bob", Body::GetTopic), ip(), 1)
            .iter()
            .all(|a| !matches!(a, Action::Multicast(_))));
        c.change_topic("release", 100);
        let out = c.on_message_received(from(B, "Bob", Body::GetTopic), ip(), 2);
        assert_eq!(
            multicasts(&out),
            vec![&Body::Topic {
                set_by: "Anna".into(),
                time: 100,
                text: "release".into()
            }]
        );
        let newer = Body::Topic {
            set_by: "Bob".into(),
            time: 200,
            text: "party".into(),
        };
        let out = c.on_message_received(from(B, "Bob", newer.clone()), ip(), 3);
        assert_eq!(events(&out).len(), 1);
        assert_eq!(c.topic().text, "party");
        // The same topic again is not a change.
        assert!(events(&c.on_message_received(from(B, "Bob", newer), ip(), 4)).is_empty());
    }

    #[test]
    fn logon_with_my_nick_gets_conflict_notice() {
        let mut c = core_as(A, "Anna");
        let out = c.on_message_received(from(B, "anna", Body::Logon), ip(), 1);
        assert_eq!(
            multicasts(&out),
            vec![&Body::NickConflict { nick: "Anna".into() }]
        );
    }

    #[test]
    fn conflict_notice_renames_me_to_code() {
        let mut c = core_as(A, "Anna");
        let out = c.on_message_received(
            from(B, "Anna", Body::NickConflict { nick: "Anna".into() }),
            ip(),
            1,
        );
        assert_eq!(c.me().nick, "111");
        assert_eq!(multicasts(&out), vec![&Body::NickChange]);
        assert!(events(&out).iter().any(|e| matches!(
            e,
            Event::NickConflict { renamed_to, .. } if renamed_to == "111"
        )));
        // A notice about someone else's nick is ignored.
        let out = c.on_message_received(
            from(B, "Bob", Body::NickConflict { nick: "Carl".into() }),
            ip(),
            2,
        );
        assert!(multicasts(&out).is_empty());
    }

    #[test]
    fn nick_change_renames_peer() {
        let mut c = core_as(A, "Anna");
        c.on_message_received(from(B, "Bob", Body::Logon), ip(), 1);
        let out = c.on_message_received(from(B, "Robert", Body::NickChange), ip(), 2);
        assert!(events(&out).iter().any(|e| matches!(
            e,
            Event::PeerRenamed { old, new, .. } if old == "Bob" && new == "Robert"
        )));
        assert!(c.presence().find_by_nick("robert").is_some());
    }

    #[test]
    fn client_info_updates_peer() {
        let mut c = core_as(A, "Anna");
        c.on_message_received(
            from(
                B,
                "Bob",
                Body::ClientInfo {
                    client: "lanchat v0.1.0".into(),
                    uptime: 4000,
                    operating_system: "Linux".into(),
                    private_chat_port: 50151,
                },
            ),
            ip(),
            10_000,
        );
        let bob = c.presence().get(B).unwrap();
        assert_eq!(bob.logon_time, 6000);
        assert_eq!(bob.private_chat_port, 50151);
        let (msg, addr) = c.private_message(B, "psst").unwrap();
        assert_eq!(addr, SocketAddr::new(ip(), 50151));
        assert_eq!(msg.body.target(), Some(B));
    }

    #[test]
    fn private_chat_needs_port() {
        let mut c = core_as(A, "Anna");
        c.on_message_received(from(B, "Bob", Body::Logon), ip(), 1);
        assert!(c.private_message(B, "x").is_none());
    }

    #[test]
    fn messages_for_other_peers_ignored() {
        let mut c = core_as(A, "Anna");
        let out = c.on_message_received(
            from(
                B,
                "Bob",
                Body::FileOffer {
                    to: PeerCode(333),
                    size: 1,
                    hash: 0,
                    file_name: "x".into(),
                },
            ),
            ip(),
            1,
        );
        assert!(out.is_empty());
        assert!(c.transfers().is_empty());
    }

    #[test]
    fn peer_writing_flag_follows_messages() {
        let mut c = core_as(A, "Anna");
        c.on_message_received(from(B, "Bob", Body::Logon), ip(), 0);
        let out = c.on_message_received(from(B, "Bob", Body::WritingStarted), ip(), 1);
        assert_eq!(
            events(&out),
            vec![&Event::Writing {
                nick: "Bob".into(),
                writing: true
            }]
        );
        assert!(c.presence().get(B).unwrap().writing);
        c.on_message_received(from(B, "Bob", Body::WritingStopped), ip(), 2);
        assert!(!c.presence().get(B).unwrap().writing);
    }

    #[test]
    fn peers_on_this_machine_get_its_host_name() {
        let mut me = PeerIdentity::me(A, "Anna", "test", 0);
        me.host_name = Some("box".into());
        let mut c = ChatCore::new(me, 7, "/dl");
        c.set_my_ip(Some(ip()));
        c.on_message_received(from(B, "Bob", Body::Logon), ip(), 1);
        assert_eq!(c.presence().get(B).unwrap().host_name.as_deref(), Some("box"));
        let elsewhere: IpAddr = "10.0.0.9".parse().unwrap();
        c.on_message_received(from(PeerCode(333), "Carl", Body::Logon), elsewhere, 1);
        assert_eq!(c.presence().get(PeerCode(333)).unwrap().host_name, None);
    }

    #[test]
    fn tick_sends_idle_and_expires() {
        let mut c = core_as(A, "Anna");
        c.set_peer_timeout(1000);
        c.logon(0);
        c.on_message_received(from(B, "Bob", Body::Logon), ip(), 0);
        let out = c.tick(500);
        assert_eq!(multicasts(&out), vec![&Body::Idle]);
        assert!(c.presence().contains(B));
        let out = c.tick(1000);
        assert!(events(&out).iter().any(|e| matches!(
            e,
            Event::PeerLeft { kind: LeaveKind::Timeout, .. }
        )));
        assert!(!c.presence().contains(B));
    }

    fn offer_from_a(c: &mut ChatCore) -> SessionId {
        let out = c.on_message_received(
            from(
                A,
                "Anna",
                Body::FileOffer {
                    to: B,
                    size: 2048,
                    hash: 77,
                    file_name: "notes.txt".into(),
                },
            ),
            ip(),
            1,
        );
        match events(&out).last() {
            Some(Event::TransferOffered { session, .. }) => *session,
            other => panic!("expected offer event, got {other:?}"),
        }
    }

    #[test]
    fn offer_accept_stream_complete_on_both_sides() {
        let mut a = core_as(A, "Anna");
        let mut b = core_as(B, "Bob");
        a.on_message_received(from(B, "Bob", Body::Logon), ip(), 0);

        let (send_id, offer) = a.offer_file(B, Path::new("/home/a/notes.txt"), 2048).unwrap();
        assert!(matches!(
            offer.body,
            Body::FileOffer { to: B, size: 2048, .. }
        ));
        let out = b.on_message_received(offer, ip(), 1);
        let recv_id = match events(&out).last() {
            Some(Event::TransferOffered { session, .. }) => *session,
            _ => panic!("expected offer"),
        };
        assert_eq!(
            b.session(recv_id).unwrap().path(),
            Path::new("/dl/notes.txt")
        );

        let accept = b.accept_offer(recv_id, 9100).unwrap();
        assert_eq!(
            b.session(recv_id).unwrap().state(),
            TransferState::AcceptedWaiting
        );
        let out = a.on_message_received(accept, ip(), 2);
        assert!(out.contains(&Action::StartSending {
            session: send_id,
            addr: SocketAddr::new(ip(), 9100)
        }));

        for (core, id) in [(&mut a, send_id), (&mut b, recv_id)] {
            core.transfer_connected(id).unwrap();
            let mut seen = Vec::new();
            for _ in 0..8 {
                if let Some(Action::Notify(Event::TransferProgress { percent, .. })) =
                    core.transfer_progress(id, 256).unwrap()
                {
                    seen.push(percent);
                }
            }
            assert_eq!(seen, vec![12, 25, 37, 50, 62, 75, 87, 100]);
            let done = core.transfer_finished(id);
            assert!(matches!(
                events(&done)[..],
                [Event::Transfer { state: TransferState::Completed, .. }]
            ));
            assert!(core.transfer_finished(id).is_empty());
            core.release(id);
            assert!(core.transfers().is_empty());
        }
    }

    #[test]
    fn cancel_waiting_send_removes_and_aborts_once() {
        let mut a = core_as(A, "Anna");
        a.on_message_received(from(B, "Bob", Body::Logon), ip(), 0);
        let (id, _) = a.offer_file(B, Path::new("/x/notes.txt"), 10).unwrap();
        let out = a.cancel_transfer(id).unwrap();
        let aborts = multicasts(&out)
            .into_iter()
            .filter(|b| matches!(b, Body::FileAbort { .. }))
            .count();
        assert_eq!(aborts, 1);
        assert!(a.transfers().is_empty());
        assert_eq!(a.cancel_transfer(id), Err(CoreError::UnknownSession));
    }

    #[test]
    fn cancel_transferring_leaves_canceled_not_failed() {
        let mut b = core_as(B, "Bob");
        let id = offer_from_a(&mut b);
        b.accept_offer(id, 9100).unwrap();
        b.transfer_connected(id).unwrap();
        b.transfer_progress(id, 100).unwrap();
        let out = b.cancel_transfer(id).unwrap();
        assert!(out.contains(&Action::StopTransfer(id)));
        assert!(multicasts(&out).is_empty());
        assert_eq!(b.session(id).unwrap().state(), TransferState::Canceled);
        // The engine's own failure report after the sockets close changes nothing.
        assert!(b.transfer_failed(id).is_empty());
        assert!(b.transfer_finished(id).is_empty());
        assert!(b.transfer_progress(id, 1).is_err());
        assert_eq!(b.session(id).unwrap().state(), TransferState::Canceled);
        b.release(id);
        assert!(b.session(id).is_none());
    }

    #[test]
    fn accept_timeout_fails_once() {
        let mut b = core_as(B, "Bob");
        let id = offer_from_a(&mut b);
        b.accept_offer(id, 9100).unwrap();
        let out = b.transfer_failed(id);
        assert!(matches!(
            events(&out)[..],
            [Event::Transfer { state: TransferState::Failed, .. }]
        ));
        assert!(b.transfer_failed(id).is_empty());
    }

    #[test]
    fn reject_sends_abort_and_sender_sees_rejected() {
        let mut a = core_as(A, "Anna");
        let mut b = core_as(B, "Bob");
        a.on_message_received(from(B, "Bob", Body::Logon), ip(), 0);
        let (_, offer) = a.offer_file(B, Path::new("/x/notes.txt"), 10).unwrap();
        b.on_message_received(offer, ip(), 1);
        let id = b.transfers().find(A, "notes.txt").unwrap().id();
        let abort = b.reject_offer(id).unwrap();
        assert!(b.transfers().is_empty());
        let out = a.on_message_received(abort, ip(), 2);
        assert!(matches!(
            events(&out)[..],
            [Event::Transfer { state: TransferState::Rejected, .. }]
        ));
        assert!(a.transfers().is_empty());
    }

    #[test]
    fn sender_abort_cancels_pending_offer() {
        let mut b = core_as(B, "Bob");
        offer_from_a(&mut b);
        let abort = from(
            A,
            "Anna",
            Body::FileAbort {
                to: B,
                hash: 77,
                file_name: "notes.txt".into(),
            },
        );
        let out = b.on_message_received(abort, ip(), 2);
        assert!(matches!(
            events(&out)[..],
            [Event::Transfer { state: TransferState::Canceled, .. }]
        ));
        assert!(b.transfers().is_empty());
    }

    #[test]
    fn abort_crossing_accept_cancels_listening_receive() {
        let mut b = core_as(B, "Bob");
        let id = offer_from_a(&mut b);
        b.accept_offer(id, 9100).unwrap();
        let abort = from(
            A,
            "Anna",
            Body::FileAbort {
                to: B,
                hash: 77,
                file_name: "notes.txt".into(),
            },
        );
        let out = b.on_message_received(abort, ip(), 2);
        assert!(out.contains(&Action::StopTransfer(id)));
        assert!(matches!(
            events(&out)[..],
            [Event::Transfer { state: TransferState::Canceled, .. }]
        ));
        // Kept until the engine has closed the listener.
        assert_eq!(b.session(id).unwrap().state(), TransferState::Canceled);
        assert!(b.transfer_failed(id).is_empty());
        b.release(id);
        assert!(b.transfers().is_empty());
    }

    #[test]
    fn withdrawn_offer_leaves_nothing_behind() {
        let mut a = core_as(A, "Anna");
        a.on_message_received(from(B, "Bob", Body::Logon), ip(), 0);
        let (id, _) = a.offer_file(B, Path::new("/x/notes.txt"), 10).unwrap();
        assert_eq!(a.withdraw_offer(id), Ok(()));
        assert!(a.transfers().is_empty());
        assert_eq!(a.withdraw_offer(id), Err(CoreError::UnknownSession));
        // A fresh offer of the same file is allowed again.
        assert!(a.offer_file(B, Path::new("/x/notes.txt"), 10).is_ok());
    }

    #[test]
    fn only_unanswered_outgoing_offers_can_be_withdrawn() {
        let mut b = core_as(B, "Bob");
        let id = offer_from_a(&mut b);
        assert_eq!(b.withdraw_offer(id), Err(CoreError::NotWithdrawable));
        assert_eq!(b.transfers().len(), 1);
    }

    #[test]
    fn duplicate_offer_ignored() {
        let mut b = core_as(B, "Bob");
        offer_from_a(&mut b);
        let out = b.on_message_received(
            from(
                A,
                "Anna",
                Body::FileOffer {
                    to: B,
                    size: 1,
                    hash: 1,
                    file_name: "notes.txt".into(),
                },
            ),
            ip(),
            3,
        );
        assert!(events(&out).is_empty());
        assert_eq!(b.transfers().len(), 1);
    }

    #[test]
    fn logoff_abandons_transfers() {
        let mut b = core_as(B, "Bob");
        let pending = offer_from_a(&mut b);
        let out = b.on_message_received(from(A, "Anna", Body::Logoff), ip(), 2);
        assert!(out.contains(&Action::StopTransfer(pending)));
        assert!(b.transfers().is_empty());
    }
}
