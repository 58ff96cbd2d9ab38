//! Console front end: reads commands from stdin, carries them out, and prints events as text.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Local};
use lanchat_core::{
    interpret, now_millis, Command, Direction, Disk, Event, JoinKind, LeaveKind, PeerIdentity,
    SessionId, Topic, TransferSession, TransferState,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::messenger::Messenger;

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Console {
    messenger: Arc<Messenger>,
}

impl Console {
    pub fn new(messenger: Arc<Messenger>) -> Self {
        Self { messenger }
    }

    /// Read lines until `/quit` or end of input.
    pub async fn run(&self) -> std::io::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            if self.handle(line).await == Flow::Quit {
                break;
            }
        }
        Ok(())
    }

    pub async fn handle(&self, line: &str) -> Flow {
        let parsed = {
            let core = self.messenger.core();
            interpret(line, &core, &Disk)
        };
        match parsed {
            Ok(cmd) => self.execute(cmd).await,
            Err(e) => {
                say(&e.to_string());
                Flow::Continue
            }
        }
    }

    async fn execute(&self, cmd: Command) -> Flow {
        let m = &self.messenger;
        match cmd {
            Command::Chat(text) => {
                let (msg, me) = {
                    let core = m.core();
                    (core.chat_message(&text), core.me().nick.clone())
                };
                if m.send_group(&msg) {
                    print_line(&format!("<{me}>: {text}"));
                } else {
                    say(&format!("Failed to send message: {text}"));
                }
            }
            Command::ShowTopic => say(&topic_text(m.core().topic())),
            Command::SetTopic(text) => {
                let msg = {
                    let mut core = m.core();
                    if core.topic().text == text {
                        return Flow::Continue;
                    }
                    core.change_topic(&text, now_millis())
                };
                m.send_group(&msg);
                if text.is_empty() {
                    say("You removed the topic");
                } else {
                    say(&format!("You changed the topic to: {text}"));
                }
            }
            Command::Away(message) => {
                let msg = m.core().go_away(&message);
                m.send_group(&msg);
                say(&format!("You went away: {message}"));
            }
            Command::Back => {
                let msg = m.core().come_back();
                m.send_group(&msg);
                say("You came back");
            }
            Command::Nick(nick) => {
                let msg = m.core().change_nick(&nick);
                m.send_group(&msg);
                say(&format!("You changed nick to {nick}"));
            }
            Command::Clear => print!("{CLEAR_SCREEN}"),
            Command::About => println!("{}", about_text()),
            Command::Help => println!("{}", help_text()),
            Command::Whois(code) => {
                let text = m
                    .core()
                    .presence()
                    .get(code)
                    .map(|p| whois_text(p, now_millis()));
                if let Some(text) = text {
                    println!("{text}");
                }
            }
            Command::Users => {
                let peers = m.core().presence().list();
                say(&users_text(&peers));
            }
            Command::Transfers => {
                let sessions = m.core().transfers().list();
                println!("{}", transfers_text(&sessions));
            }
            Command::Msg { peer, text } => {
                let (prepared, nick) = {
                    let core = m.core();
                    let nick = core
                        .presence()
                        .get(peer)
                        .map(|p| p.nick.clone())
                        .unwrap_or_else(|| peer.to_string());
                    (core.private_message(peer, &text), nick)
                };
                match prepared {
                    Some((msg, addr)) if m.send_private(&msg, addr) => {
                        print_line(&format!("<{}> -> {nick}: {text}", m.core().me().nick));
                    }
                    _ => say(&format!("Failed to send private message to {nick}: {text}")),
                }
            }
            Command::Send { peer, path } => self.send_file(peer, &path).await,
            Command::Receive { session, rename_to } => {
                if let Some(new_path) = rename_to {
                    self.rename_destination(session, &new_path);
                }
                self.receive_file(session).await;
            }
            Command::Reject(session) => {
                let (msg, label) = {
                    let mut core = m.core();
                    let label = core.session(session).map(session_label);
                    (core.reject_offer(session), label)
                };
                match msg {
                    Ok(msg) => {
                        m.send_group(&msg);
                        if let Some((file, nick)) = label {
                            say(&format!("You declined to receive {file} from {nick}"));
                        }
                    }
                    Err(e) => log::warn!("reject {session}: {e}"),
                }
            }
            Command::Cancel(session) => {
                let actions = m.core().cancel_transfer(session);
                match actions {
                    Ok(actions) => m.execute(actions),
                    Err(e) => log::warn!("cancel {session}: {e}"),
                }
            }
            Command::Quit => return Flow::Quit,
        }
        Flow::Continue
    }

    async fn send_file(&self, peer: lanchat_core::PeerCode, path: &Path) {
        let m = &self.messenger;
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let nick = m
            .core()
            .presence()
            .get(peer)
            .map(|p| p.nick.clone())
            .unwrap_or_else(|| peer.to_string());
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                log::warn!("{}: {e}", path.display());
                say(&format!("Failed to send file to {nick}: {file}"));
                return;
            }
        };
        let offered = m.core().offer_file(peer, path, size);
        let (id, msg) = match offered {
            Ok(offer) => offer,
            Err(e) => {
                log::warn!("offer of {file} to {nick}: {e}");
                say(&format!("Failed to send file to {nick}: {file}"));
                return;
            }
        };
        if m.send_group(&msg) {
            say(&format!(
                "Trying to send the file {file} [{}] to {nick}",
                format_bytes(size)
            ));
        } else {
            // The offer never left this host.
            if let Err(e) = m.core().withdraw_offer(id) {
                log::warn!("withdrawing the offer of {file}: {e}");
            }
            say(&format!("Failed to send file to {nick}: {file}"));
        }
    }

    fn rename_destination(&self, session: SessionId, new_path: &Path) {
        let mut core = self.messenger.core();
        let Some(file) = core.session(session).map(|s| s.file_name().to_string()) else {
            return;
        };
        let new_name = new_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        say(&format!(
            "/receive - file '{file}' already exists - renaming to '{new_name}'"
        ));
        if let Err(e) = core.set_destination(session, new_path) {
            log::warn!("rename {session}: {e}");
        }
    }

    async fn receive_file(&self, session: SessionId) {
        let m = &self.messenger;
        let Some((file, nick)) = m.core().session(session).map(session_label) else {
            return;
        };
        let failed = || say(&format!("Failed to accept file transfer from {nick}: {file}"));
        let port = match m.engine().start_receiving(session).await {
            Ok(port) => port,
            Err(e) => {
                log::error!("{e}");
                let actions = {
                    let mut core = m.core();
                    let actions = core.transfer_failed(session);
                    core.release(session);
                    actions
                };
                m.execute(actions);
                failed();
                return;
            }
        };
        let accepted = m.core().accept_offer(session, port);
        match accepted {
            Ok(msg) if m.send_group(&msg) => {
                say(&format!("Receiving {file} from {nick}, waiting for connection"));
            }
            other => {
                if let Err(e) = other {
                    log::warn!("accept {session}: {e}");
                }
                let actions = m.core().transfer_failed(session);
                m.engine().stop(session);
                m.execute(actions);
                failed();
            }
        }
    }
}

/// Print every event that has a text form until the bus goes away.
pub async fn render_events(mut rx: UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        let Some(text) = render_event(&event) else {
            continue;
        };
        match event {
            Event::Chat { .. } | Event::PrivateChat { .. } => print_line(&text),
            _ => say(&text),
        }
    }
}

fn stamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

fn print_line(text: &str) {
    println!("[{}] {text}", stamp());
}

fn say(text: &str) {
    println!("[{}] *** {text}", stamp());
}

fn session_label(s: &TransferSession) -> (String, String) {
    (s.file_name().to_string(), s.peer_nick().to_string())
}

pub fn render_event(event: &Event) -> Option<String> {
    let text = match event {
        Event::PeerJoined { nick, ip, kind, .. } => match kind {
            JoinKind::Logon => format!("{nick} logged on from {ip}"),
            JoinKind::ShowedUp => format!("{nick} showed up unexpectedly from {ip}"),
            JoinKind::Exposed => return None,
        },
        Event::PeerLeft { nick, kind, .. } => match kind {
            LeaveKind::Logoff => format!("{nick} logged off"),
            LeaveKind::Timeout => format!("{nick} timed out"),
        },
        Event::PeerRenamed { old, new, .. } => format!("{old} changed nick to {new}"),
        Event::PeerAway { nick, message } => format!("{nick} went away: {message}"),
        Event::PeerBack { nick } => format!("{nick} came back"),
        Event::Writing { .. } | Event::TransferProgress { .. } => return None,
        Event::TopicChanged(topic) if topic.is_set() => {
            format!("{} changed the topic to: {}", topic.set_by, topic.text)
        }
        Event::TopicChanged(topic) => format!("{} removed the topic", topic.set_by),
        Event::Chat { nick, text, .. } => format!("<{nick}>: {text}"),
        Event::PrivateChat { nick, text, .. } => format!("<{nick}> (private): {text}"),
        Event::NickConflict {
            contested,
            renamed_to,
        } => format!("Nick crash! '{contested}' is in use by someone else, your nick is now {renamed_to}"),
        Event::TransferOffered {
            nick,
            file_name,
            size,
            ..
        } => format!(
            "{nick} is trying to send the file {file_name} [{}]. Type /receive {nick} {file_name} or /reject {nick} {file_name}",
            format_bytes(*size)
        ),
        Event::Transfer {
            direction,
            nick,
            file_name,
            state,
            ..
        } => return transfer_text(*direction, nick, file_name, *state),
        Event::LinkUp { silent: true } | Event::LinkDown { silent: true } => return None,
        Event::LinkUp { silent: false } => "You are connected to the network".to_string(),
        Event::LinkDown { silent: false } => "You lost contact with the network".to_string(),
        Event::Warning(text) => text.clone(),
    };
    Some(text)
}

fn transfer_text(
    direction: Direction,
    nick: &str,
    file: &str,
    state: TransferState,
) -> Option<String> {
    use Direction::{Receive, Send};
    use TransferState::*;
    let text = match (direction, state) {
        (Send, AcceptedWaiting) => format!("{nick} accepted sending of {file}"),
        (Send, Transferring) => format!("Sending {file} to {nick}"),
        (Receive, Transferring) => format!("Receiving {file} from {nick}"),
        (Send, Completed) => format!("{file} successfully sent to {nick}"),
        (Receive, Completed) => format!("Successfully received {file} from {nick}"),
        (Send, Failed) => format!("Failed to send {file} to {nick}"),
        (Receive, Failed) => format!("Failed to receive {file} from {nick}"),
        (Send, Rejected) => format!("{nick} aborted reception of {file}"),
        (Send, Canceled) => format!("The sending of {file} to {nick} was cancelled"),
        (Receive, Canceled) => format!("The reception of {file} from {nick} was cancelled"),
        _ => return None,
    };
    Some(text)
}

/// `Topic is: <text> (set by <nick> at <time>)`, or that there is none.
pub fn topic_text(topic: &Topic) -> String {
    if !topic.is_set() {
        return "No topic set".to_string();
    }
    let when = DateTime::from_timestamp_millis(topic.time as i64)
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S, %d. %b. %y").to_string())
        .unwrap_or_default();
    format!("Topic is: {} (set by {} at {when})", topic.text, topic.set_by)
}

pub fn users_text(peers: &[PeerIdentity]) -> String {
    let nicks: Vec<&str> = peers.iter().map(|p| p.nick.as_str()).collect();
    format!("Users: {}", nicks.join(", "))
}

pub fn whois_text(p: &PeerIdentity, now_ms: u64) -> String {
    let mut out = format!("/whois - {}:\n", p.nick);
    let ip = p.ip.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".into());
    out.push_str(&format!("IP address: {ip}\n"));
    if let Some(host) = &p.host_name {
        out.push_str(&format!("Host name: {host}\n"));
    }
    out.push_str(&format!("Client: {}\n", p.client));
    out.push_str(&format!("Operating System: {}\n", p.operating_system));
    out.push_str(&format!(
        "Online: {}",
        format_duration(now_ms.saturating_sub(p.logon_time))
    ));
    if p.away {
        out.push_str(&format!("\nAway message: {}", p.away_message));
    }
    out
}

pub fn transfers_text(sessions: &[TransferSession]) -> String {
    let live: Vec<&TransferSession> = sessions.iter().filter(|s| !s.is_terminal()).collect();
    if live.is_empty() {
        return "File transfers: no active file transfers".to_string();
    }
    let mut out = String::from("File transfers:");
    for (direction, title, preposition) in [
        (Direction::Send, "Sending", "to"),
        (Direction::Receive, "Receiving", "from"),
    ] {
        let group: Vec<_> = live.iter().filter(|s| s.direction() == direction).collect();
        if group.is_empty() {
            continue;
        }
        out.push_str(&format!("\n- {title}:"));
        for s in group {
            out.push_str(&format!(
                "\n  {} [{}] ({}%, {}/s) {preposition} {}",
                s.file_name(),
                format_bytes(s.size()),
                s.percent(),
                format_bytes(s.bytes_per_sec()),
                s.peer_nick()
            ));
        }
    }
    out
}

pub fn help_text() -> String {
    [
        "lanchat commands:",
        "/about - information about lanchat",
        "/away <away message> - set status to away",
        "/back - set status to not away",
        "/cancel <nick> <file> - cancel an ongoing file transfer with a user",
        "/clear - clear all the text from the screen",
        "/help - show this help message",
        "/msg <nick> <msg> - send a private message to a user",
        "/nick <new nick> - change your nick name",
        "/quit - quit from the chat",
        "/receive <nick> <file> - accept a file transfer request from a user",
        "/reject <nick> <file> - reject a file transfer request from a user",
        "/send <nick> <file> - send a file to a user",
        "/topic <optional new topic> - prints the current topic, or changes the topic",
        "/transfers - shows a list of all file transfers and their status",
        "/users - show the user list",
        "/whois <nick> - show information about a user",
        "//<text> - send the text as a normal message, with a single slash",
    ]
    .join("\n")
}

pub fn about_text() -> String {
    format!(
        "Information about lanchat-console v{}:\nServerless chat for the local network, with private messages and file transfers.\nNo servers, no accounts: peers find each other through IP multicast.",
        env!("CARGO_PKG_VERSION")
    )
}

/// Human readable size: bytes below 1 KB, then KB, MB, GB with two decimals.
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{bytes} bytes")
    } else if b < KB * KB {
        format!("{:.2}KB", b / KB)
    } else if b < KB * KB * KB {
        format!("{:.2}MB", b / (KB * KB))
    } else {
        format!("{:.2}GB", b / (KB * KB * KB))
    }
}

/// `hh:mm:ss`, prefixed with the day count once it passes a day.
pub fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    let (days, rest) = (secs / 86_400, secs % 86_400);
    let clock = format!("{:02}:{:02}:{:02}", rest / 3600, rest % 3600 / 60, rest % 60);
    match days {
        0 => clock,
        1 => format!("1 day, {clock}"),
        n => format!("{n} days, {clock}"),
    }
}
