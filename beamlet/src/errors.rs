// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Error types for the node runtime and the distribution layer

use std::fmt::Display;
use std::sync::Arc;

use crate::term::{Pid, Term};

/// Represents a process body's internal processing error
pub type ProcessFault = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Protocol errors are always fatal to the one connection they occur on, never
/// to the node
#[derive(Debug)]
pub enum ProtocolErr {
    /// The underlying socket failed
    Io(std::io::Error),
    /// A handshake frame carried a tag which isn't valid in the current state
    UnexpectedTag(u8),
    /// A frame was truncated or otherwise couldn't be parsed
    Malformed(&'static str),
    /// The peer's challenge digest didn't match ours. The cookies differ
    DigestMismatch,
    /// The peer doesn't speak a protocol version we support
    UnsupportedVersion(u16),
    /// The peer refused the connection with the given status
    Rejected(String),
    /// Another connection to the same peer won the simultaneous connect
    LostRace,
    /// The handshake didn't complete within the configured time
    Timeout,
    /// The peer sent no frame (data or heartbeat) within the liveness window
    PeerUnresponsive,
    /// A term couldn't be decoded from the wire
    Decode(eetf::DecodeError),
    /// A term couldn't be encoded for the wire
    Encode(eetf::EncodeError),
    /// The connection has already been closed
    Closed,
}

impl std::error::Error for ProtocolErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(inner) => Some(inner),
            Self::Decode(inner) => Some(inner),
            Self::Encode(inner) => Some(inner),
            _ => None,
        }
    }
}

impl Display for ProtocolErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error on distribution channel '{err}'"),
            Self::UnexpectedTag(tag) => {
                write!(f, "Unexpected message tag '{}' ({tag})", *tag as char)
            }
            Self::Malformed(what) => write!(f, "Malformed frame: {what}"),
            Self::DigestMismatch => write!(f, "Challenge digest mismatch, check the cookies"),
            Self::UnsupportedVersion(version) => {
                write!(f, "Unsupported distribution version {version}")
            }
            Self::Rejected(status) => write!(f, "Peer rejected the connection with '{status}'"),
            Self::LostRace => write!(f, "Simultaneous connect lost to the peer's connection"),
            Self::Timeout => write!(f, "Handshake timed out"),
            Self::PeerUnresponsive => write!(f, "Peer stopped sending heartbeats"),
            Self::Decode(err) => write!(f, "Failed to decode term '{err}'"),
            Self::Encode(err) => write!(f, "Failed to encode term '{err}'"),
            Self::Closed => write!(f, "Connection closed"),
        }
    }
}

impl From<std::io::Error> for ProtocolErr {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<eetf::DecodeError> for ProtocolErr {
    fn from(value: eetf::DecodeError) -> Self {
        Self::Decode(value)
    }
}

impl From<eetf::EncodeError> for ProtocolErr {
    fn from(value: eetf::EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<crate::concurrency::Timeout> for ProtocolErr {
    fn from(_: crate::concurrency::Timeout) -> Self {
        Self::Timeout
    }
}

/// Errors talking to the port-mapper daemon
#[derive(Debug)]
pub enum NameServiceErr {
    /// The daemon couldn't be reached, or the socket failed mid-request
    Io(std::io::Error),
    /// The daemon refused our registration (e.g. the name is taken)
    RegistrationRejected(u8),
    /// The daemon doesn't know the requested node
    LookupFailed {
        /// The short node name which was looked up
        name: String,
        /// The daemon's result code
        code: u8,
    },
    /// A response with an opcode we didn't ask for
    UnexpectedOpcode(u8),
    /// A response which was truncated or otherwise unparseable
    Malformed(&'static str),
    /// A node name which isn't of the form `name@host`
    InvalidNodeName(String),
}

impl std::error::Error for NameServiceErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(inner) => Some(inner),
            _ => None,
        }
    }
}

impl Display for NameServiceErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "Name service I/O error '{err}'"),
            Self::RegistrationRejected(code) => {
                write!(f, "Name service rejected the registration (result {code})")
            }
            Self::LookupFailed { name, code } => {
                write!(f, "Name service lookup of '{name}' failed (result {code})")
            }
            Self::UnexpectedOpcode(op) => write!(f, "Unexpected name service opcode {op}"),
            Self::Malformed(what) => write!(f, "Malformed name service response: {what}"),
            Self::InvalidNodeName(name) => write!(f, "Invalid node name '{name}'"),
        }
    }
}

impl From<std::io::Error> for NameServiceErr {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// The outcome of a failed connection attempt. It is shared between every caller
/// awaiting the same attempt, so it's cheap to clone
#[derive(Debug, Clone)]
pub enum ConnectErr {
    /// Resolving the peer failed
    NameService(Arc<NameServiceErr>),
    /// The TCP connect or the handshake failed
    Protocol(Arc<ProtocolErr>),
    /// The distribution layer was shut down, or was never started
    NotDistributed,
}

impl ConnectErr {
    /// Returns [true] if this attempt was abandoned in favor of the peer's own
    /// simultaneous connection
    pub fn is_lost_race(&self) -> bool {
        matches!(self, Self::Protocol(inner) if matches!(inner.as_ref(), ProtocolErr::LostRace))
    }
}

impl std::error::Error for ConnectErr {}

impl Display for ConnectErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NameService(err) => write!(f, "{err}"),
            Self::Protocol(err) => write!(f, "{err}"),
            Self::NotDistributed => write!(f, "Node is not distributed"),
        }
    }
}

impl From<NameServiceErr> for ConnectErr {
    fn from(value: NameServiceErr) -> Self {
        Self::NameService(Arc::new(value))
    }
}

impl From<ProtocolErr> for ConnectErr {
    fn from(value: ProtocolErr) -> Self {
        Self::Protocol(Arc::new(value))
    }
}

impl From<std::io::Error> for ConnectErr {
    fn from(value: std::io::Error) -> Self {
        Self::Protocol(Arc::new(ProtocolErr::Io(value)))
    }
}

/// Spawn errors starting a process
#[derive(Debug)]
pub enum SpawnErr {
    /// The name is already registered to another live process
    AlreadyRegistered(String),
}

impl std::error::Error for SpawnErr {}

impl Display for SpawnErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRegistered(name) => {
                write!(f, "Process '{name}' is already registered on this node")
            }
        }
    }
}

/// Errors from the name registry
#[derive(Debug)]
pub enum RegistryErr {
    /// The name is already registered to another live process
    AlreadyRegistered(String),
    /// The process already has a registered name
    AlreadyNamed(Pid, String),
    /// No such live local process
    NoProcess(Pid),
}

impl std::error::Error for RegistryErr {}

impl Display for RegistryErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRegistered(name) => {
                write!(f, "Process '{name}' is already registered on this node")
            }
            Self::AlreadyNamed(pid, name) => write!(f, "{pid} is already registered as '{name}'"),
            Self::NoProcess(pid) => write!(f, "{pid} is not a live local process"),
        }
    }
}

/// A `receive` found no matching message within its timeout. The mailbox is
/// left exactly as it was
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveTimeout;

impl std::error::Error for ReceiveTimeout {}

impl Display for ReceiveTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "receive timed out")
    }
}

/// Failures of a synchronous `gen_server` call
#[derive(Debug, Clone, PartialEq)]
pub enum CallErr {
    /// No reply arrived in time
    Timeout,
    /// The server terminated (or never existed) before replying. Contains the
    /// exit reason from the DOWN notification
    Down(Term),
}

impl std::error::Error for CallErr {}

impl Display for CallErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "call timed out"),
            Self::Down(reason) => write!(f, "server down with reason {reason:?}"),
        }
    }
}

/// Node startup failures. Any of these prevents the node from joining the mesh
#[derive(Debug)]
pub enum StartupErr {
    /// The credential file couldn't be read
    Cookie(std::path::PathBuf, std::io::Error),
    /// The credential file exists but holds no cookie
    EmptyCookie(std::path::PathBuf),
    /// The listening socket couldn't be bound
    Bind(std::io::Error),
    /// Registration with the port-mapper daemon failed
    NameService(NameServiceErr),
    /// The process registry rejected one of the node's built-in processes
    Spawn(SpawnErr),
}

impl std::error::Error for StartupErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cookie(_, inner) => Some(inner),
            Self::Bind(inner) => Some(inner),
            Self::NameService(inner) => Some(inner),
            Self::Spawn(inner) => Some(inner),
            Self::EmptyCookie(_) => None,
        }
    }
}

impl Display for StartupErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cookie(path, err) => {
                write!(f, "Failed to read cookie file {} '{err}'", path.display())
            }
            Self::EmptyCookie(path) => write!(f, "Cookie file {} is empty", path.display()),
            Self::Bind(err) => write!(f, "Failed to bind the distribution listener '{err}'"),
            Self::NameService(err) => write!(f, "{err}"),
            Self::Spawn(err) => write!(f, "{err}"),
        }
    }
}

impl From<NameServiceErr> for StartupErr {
    fn from(value: NameServiceErr) -> Self {
        Self::NameService(value)
    }
}

impl From<SpawnErr> for StartupErr {
    fn from(value: SpawnErr) -> Self {
        Self::Spawn(value)
    }
}
