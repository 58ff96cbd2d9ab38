//! Command interpreter: turns a typed line into a validated [`Command`].
//!
//! Validation reads the core but never changes it; executing the command is the host's job.
//! Every failure is a [`CommandError`] whose `Display` is the text shown to the user.

use std::path::{Path, PathBuf};

use crate::core::ChatCore;
use crate::identity::{is_valid_nick, PeerCode, PeerIdentity};
use crate::transfer::{unique_destination, Direction, SessionId};

/// A line the user typed, parsed and checked against current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain chat text (also `//text`, sent as `/text`).
    Chat(String),
    ShowTopic,
    /// New topic, already trimmed. Empty removes the topic.
    SetTopic(String),
    Away(String),
    Back,
    Clear,
    About,
    Help,
    Whois(PeerCode),
    Send {
        peer: PeerCode,
        path: PathBuf,
    },
    Receive {
        session: SessionId,
        /// Set when the default destination exists and the file must be saved elsewhere.
        rename_to: Option<PathBuf>,
    },
    Reject(SessionId),
    Cancel(SessionId),
    Msg {
        peer: PeerCode,
        text: String,
    },
    Nick(String),
    Users,
    Transfers,
    Quit,
}

/// Filesystem queries the interpreter needs; swapped out in tests.
pub trait FileCheck {
    fn is_file(&self, path: &Path) -> bool;
    fn exists(&self, path: &Path) -> bool;
}

/// The real filesystem.
pub struct Disk;

impl FileCheck for Disk {
    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("/{cmd} - missing {usage}")]
    MissingArgument {
        cmd: &'static str,
        usage: &'static str,
    },
    #[error("/{cmd} - no such user '{nick}'")]
    NoSuchUser { cmd: &'static str, nick: String },
    #[error("/{cmd} - no point in doing that!")]
    Pointless { cmd: &'static str },
    #[error("/send - no such file '{0}'")]
    NoSuchFile(String),
    #[error("/send - already sending '{file}' to {nick}")]
    AlreadySending { file: String, nick: String },
    #[error("/{cmd} - no such file '{file}' offered by {nick}")]
    NotOffered {
        cmd: &'static str,
        file: String,
        nick: String,
    },
    #[error("/{cmd} - already receiving '{file}' from {nick}")]
    AlreadyReceiving {
        cmd: &'static str,
        file: String,
        nick: String,
    },
    #[error("/cancel - no such file transfer of '{file}' with {nick}")]
    NoSuchTransfer { file: String, nick: String },
    #[error("/cancel - transfer of '{file}' from {nick} has not started yet")]
    NotStarted { file: String, nick: String },
    #[error("/away - you are already away: '{0}'")]
    AlreadyAway(String),
    #[error("/back - you are not away")]
    NotAway,
    #[error("/nick - '{0}' is in use by someone else")]
    NickInUse(String),
    #[error("/nick - '{0}' is not a valid nick name. (1-10 letters)")]
    InvalidNick(String),
    #[error("/nick - you are already called '{0}'")]
    SameNick(String),
    #[error("/msg - {0} can't receive private chat messages")]
    NoPrivateChat(String),
    #[error("Unknown command '{0}'. Type /help for a list of commands")]
    Unknown(String),
}

/// Parse and validate one line of input.
pub fn interpret(
    line: &str,
    core: &ChatCore,
    files: &impl FileCheck,
) -> Result<Command, CommandError> {
    let Some(directive) = line.strip_prefix('/') else {
        return Ok(Command::Chat(line.to_string()));
    };
    if directive.starts_with('/') {
        return Ok(Command::Chat(directive.to_string()));
    }
    let (name, args) = match directive.find(char::is_whitespace) {
        Some(i) => (&directive[..i], &directive[i..]),
        None => (directive, ""),
    };
    let ctx = Ctx { core, files };
    match name {
        "topic" if args.is_empty() => Ok(Command::ShowTopic),
        "topic" => Ok(Command::SetTopic(args.trim().to_string())),
        "away" => ctx.away(args),
        "back" if core.me().away => Ok(Command::Back),
        "back" => Err(CommandError::NotAway),
        "clear" => Ok(Command::Clear),
        "about" => Ok(Command::About),
        "help" => Ok(Command::Help),
        "whois" => ctx.whois(args),
        "send" => ctx.send(args),
        "receive" => ctx.receive(args),
        "reject" => ctx.reject(args),
        "cancel" => ctx.cancel(args),
        "msg" => ctx.msg(args),
        "nick" => ctx.nick(args),
        "users" => Ok(Command::Users),
        "transfers" => Ok(Command::Transfers),
        "quit" => Ok(Command::Quit),
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

/// First word and the remaining words joined by single spaces.
fn split_target(args: &str) -> Option<(&str, String)> {
    let mut words = args.split_whitespace();
    let first = words.next()?;
    let rest = words.collect::<Vec<_>>().join(" ");
    Some((first, rest))
}

struct Ctx<'a, F> {
    core: &'a ChatCore,
    files: &'a F,
}

impl<F: FileCheck> Ctx<'_, F> {
    /// `<nick> <rest>`, both required, naming a peer other than me.
    fn peer_and_rest(
        &self,
        cmd: &'static str,
        usage: &'static str,
        args: &str,
    ) -> Result<(&PeerIdentity, String), CommandError> {
        let missing = CommandError::MissingArgument { cmd, usage };
        let (nick, rest) = split_target(args).ok_or(missing.clone())?;
        if rest.is_empty() {
            return Err(missing);
        }
        let peer = self.peer(cmd, nick)?;
        if peer.is_me {
            return Err(CommandError::Pointless { cmd });
        }
        Ok((peer, rest))
    }

    fn peer(&self, cmd: &'static str, nick: &str) -> Result<&PeerIdentity, CommandError> {
        self.core
            .presence()
            .find_by_nick(nick)
            .ok_or_else(|| CommandError::NoSuchUser {
                cmd,
                nick: nick.to_string(),
            })
    }

    fn away(&self, args: &str) -> Result<Command, CommandError> {
        let me = self.core.me();
        if me.away {
            return Err(CommandError::AlreadyAway(me.away_message.clone()));
        }
        let message = args.trim();
        if message.is_empty() {
            return Err(CommandError::MissingArgument {
                cmd: "away",
                usage: "argument <away message>",
            });
        }
        Ok(Command::Away(message.to_string()))
    }

    fn whois(&self, args: &str) -> Result<Command, CommandError> {
        let (nick, _) = split_target(args).ok_or(CommandError::MissingArgument {
            cmd: "whois",
            usage: "argument <nick>",
        })?;
        Ok(Command::Whois(self.peer("whois", nick)?.code))
    }

    fn send(&self, args: &str) -> Result<Command, CommandError> {
        let (peer, file) = self.peer_and_rest("send", "arguments <nick> <file>", args)?;
        let path = PathBuf::from(&file);
        if !self.files.is_file(&path) {
            return Err(CommandError::NoSuchFile(file));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(file);
        if let Some(live) = self.core.transfers().find(peer.code, &name) {
            return Err(match live.direction() {
                Direction::Send => CommandError::AlreadySending {
                    file: name,
                    nick: peer.nick.clone(),
                },
                Direction::Receive => CommandError::AlreadyReceiving {
                    cmd: "send",
                    file: name,
                    nick: peer.nick.clone(),
                },
            });
        }
        Ok(Command::Send {
            peer: peer.code,
            path,
        })
    }

    /// The incoming offer named by `/receive` or `/reject`, still undecided.
    fn undecided_offer(
        &self,
        cmd: &'static str,
        args: &str,
    ) -> Result<SessionId, CommandError> {
        let (peer, file) = self.peer_and_rest(cmd, "arguments <nick> <file>", args)?;
        let offer = self
            .core
            .transfers()
            .find_directed(peer.code, &file, Direction::Receive)
            .ok_or_else(|| CommandError::NotOffered {
                cmd,
                file: file.clone(),
                nick: peer.nick.clone(),
            })?;
        if !offer.is_undecided() {
            return Err(CommandError::AlreadyReceiving {
                cmd,
                file,
                nick: peer.nick.clone(),
            });
        }
        Ok(offer.id())
    }

    fn receive(&self, args: &str) -> Result<Command, CommandError> {
        let session = self.undecided_offer("receive", args)?;
        // A path is taken on disk or by another transfer still writing to it.
        let taken = |p: &Path| self.files.exists(p) || self.core.transfers().receiving_into(p);
        let rename_to = self.core.session(session).and_then(|s| {
            let path = s.path();
            taken(path).then(|| unique_destination(path, taken))
        });
        Ok(Command::Receive { session, rename_to })
    }

    fn reject(&self, args: &str) -> Result<Command, CommandError> {
        Ok(Command::Reject(self.undecided_offer("reject", args)?))
    }

    fn cancel(&self, args: &str) -> Result<Command, CommandError> {
        let (peer, file) = self.peer_and_rest("cancel", "arguments <nick> <file>", args)?;
        let session = self.core.transfers().find(peer.code, &file).ok_or_else(|| {
            CommandError::NoSuchTransfer {
                file: file.clone(),
                nick: peer.nick.clone(),
            }
        })?;
        if session.is_undecided() {
            return Err(CommandError::NotStarted {
                file,
                nick: peer.nick.clone(),
            });
        }
        Ok(Command::Cancel(session.id()))
    }

    fn msg(&self, args: &str) -> Result<Command, CommandError> {
        let (peer, text) = self.peer_and_rest("msg", "arguments <nick> <msg>", args)?;
        if !peer.can_receive_private_chat() {
            return Err(CommandError::NoPrivateChat(peer.nick.clone()));
        }
        Ok(Command::Msg {
            peer: peer.code,
            text,
        })
    }

    fn nick(&self, args: &str) -> Result<Command, CommandError> {
        let (nick, _) = split_target(args).ok_or(CommandError::MissingArgument {
            cmd: "nick",
            usage: "argument <nick>",
        })?;
        if nick == self.core.me().nick {
            return Err(CommandError::SameNick(nick.to_string()));
        }
        if self.core.presence().is_nick_in_use(nick) {
            return Err(CommandError::NickInUse(nick.to_string()));
        }
        if !is_valid_nick(nick) {
            return Err(CommandError::InvalidNick(nick.to_string()));
        }
        Ok(Command::Nick(nick.to_string()))
    }
}
