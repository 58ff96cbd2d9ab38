//! LAN chat protocol and session logic.
//! Host-driven: no I/O; host passes datagrams, ticks and commands and receives actions.

pub mod command;
pub mod core;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod transfer;
pub mod wire;

pub use command::{interpret, Command, CommandError, Disk, FileCheck};
pub use core::{now_millis, Action, ChatCore, CoreError, Event, JoinKind, LeaveKind};
pub use identity::{default_nick, is_valid_nick, PeerCode, PeerIdentity, Profile};
pub use presence::{PresenceTable, Topic};
pub use protocol::{Body, Message, PACKET_SIZE};
pub use registry::{RegistryError, TransferRegistry};
pub use transfer::{Direction, SessionId, TransferError, TransferSession, TransferState};
pub use wire::{decode, encode, DecodeError};
