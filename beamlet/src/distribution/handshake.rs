// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Define's a node's authentication process between peers. Definition
//! can be found in [Erlang's handshake](https://www.erlang.org/doc/apps/erts/erl_dist_protocol.html)
//!
//! Handshake frames carry a 2-byte big-endian length. Which message a tag
//! denotes depends on who sent it (`'n'`/`'N'` are names from a client but
//! challenges from a server), so decoding is split by [Role].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::flags::DistributionFlags;
use super::hash::{challenge_digest, Digest, DIGEST_BYTES};
use crate::errors::ProtocolErr;

/// Which end of the handshake a message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The connecting side
    Client,
    /// The accepting side
    Server,
}

/// The server's verdict on an incoming connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Continue
    Ok,
    /// Continue, and abandon our own in-flight attempt to the same peer
    OkSimultaneous,
    /// Abort, our own in-flight attempt to the same peer wins
    Nok,
    /// Abort, the peer isn't allowed to connect
    NotAllowed,
    /// A connection to the peer already exists. The client decides whether
    /// to continue
    Alive,
}

impl SessionStatus {
    /// The status as written on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::OkSimultaneous => "ok_simultaneous",
            Self::Nok => "nok",
            Self::NotAllowed => "not_allowed",
            Self::Alive => "alive",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "ok_simultaneous" => Some(Self::OkSimultaneous),
            "nok" => Some(Self::Nok),
            "not_allowed" => Some(Self::NotAllowed),
            "alive" => Some(Self::Alive),
            _ => None,
        }
    }
}

/// What a completed handshake learned about the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerName {
    /// The peer's full node name
    pub name: String,
    /// The peer's capability flags
    pub flags: DistributionFlags,
    /// The peer's creation (0 if a version 5 peer never sent one)
    pub creation: u32,
    /// The negotiated distribution version
    pub version: u16,
}

/// A handshake frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// `'n'` from a client: the legacy (version 5) name
    NameV5 {
        /// The protocol version
        version: u16,
        /// The client's flags (low half only)
        flags: DistributionFlags,
        /// The client's full node name
        name: String,
    },
    /// `'N'` from a client: the version 6 name
    Name {
        /// The client's flags
        flags: DistributionFlags,
        /// The client's creation
        creation: u32,
        /// The client's full node name
        name: String,
    },
    /// `'s'` in either direction
    Status(String),
    /// `'n'` from a server: the legacy (version 5) challenge
    ChallengeV5 {
        /// The protocol version
        version: u16,
        /// The server's flags (low half only)
        flags: DistributionFlags,
        /// The server's challenge
        challenge: u32,
        /// The server's full node name
        name: String,
    },
    /// `'N'` from a server: the version 6 challenge
    Challenge {
        /// The server's flags
        flags: DistributionFlags,
        /// The server's challenge
        challenge: u32,
        /// The server's creation
        creation: u32,
        /// The server's full node name
        name: String,
    },
    /// `'c'` from a client which sent a legacy name but got a version 6 challenge
    Complement {
        /// The high half of the client's flags
        flags_high: u32,
        /// The client's creation
        creation: u32,
    },
    /// `'r'` from a client
    ChallengeReply {
        /// The client's own challenge
        challenge: u32,
        /// The digest of the server's challenge
        digest: Digest,
    },
    /// `'a'` from a server
    Ack {
        /// The digest of the client's challenge
        digest: Digest,
    },
}

fn ensure(buf: &Bytes, len: usize) -> Result<(), ProtocolErr> {
    if buf.remaining() < len {
        Err(ProtocolErr::Malformed("truncated handshake message"))
    } else {
        Ok(())
    }
}

fn get_string(buf: &mut Bytes, len: usize) -> Result<String, ProtocolErr> {
    ensure(buf, len)?;
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolErr::Malformed("name is not utf-8"))
}

fn get_digest(buf: &mut Bytes) -> Result<Digest, ProtocolErr> {
    ensure(buf, DIGEST_BYTES)?;
    let mut digest = [0u8; DIGEST_BYTES];
    buf.copy_to_slice(&mut digest);
    Ok(digest)
}

impl HandshakeMessage {
    /// The message's tag byte
    pub fn tag(&self) -> u8 {
        match self {
            Self::NameV5 { .. } | Self::ChallengeV5 { .. } => b'n',
            Self::Name { .. } | Self::Challenge { .. } => b'N',
            Self::Status(_) => b's',
            Self::Complement { .. } => b'c',
            Self::ChallengeReply { .. } => b'r',
            Self::Ack { .. } => b'a',
        }
    }

    /// Encode the message body (without the length prefix)
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(self.tag());
        match self {
            Self::NameV5 {
                version,
                flags,
                name,
            } => {
                buf.put_u16(*version);
                buf.put_u32(flags.low());
                buf.put_slice(name.as_bytes());
            }
            Self::Name {
                flags,
                creation,
                name,
            } => {
                buf.put_u64(flags.0);
                buf.put_u32(*creation);
                buf.put_u16(name.len() as u16);
                buf.put_slice(name.as_bytes());
            }
            Self::Status(status) => buf.put_slice(status.as_bytes()),
            Self::ChallengeV5 {
                version,
                flags,
                challenge,
                name,
            } => {
                buf.put_u16(*version);
                buf.put_u32(flags.low());
                buf.put_u32(*challenge);
                buf.put_slice(name.as_bytes());
            }
            Self::Challenge {
                flags,
                challenge,
                creation,
                name,
            } => {
                buf.put_u64(flags.0);
                buf.put_u32(*challenge);
                buf.put_u32(*creation);
                buf.put_u16(name.len() as u16);
                buf.put_slice(name.as_bytes());
            }
            Self::Complement {
                flags_high,
                creation,
            } => {
                buf.put_u32(*flags_high);
                buf.put_u32(*creation);
            }
            Self::ChallengeReply { challenge, digest } => {
                buf.put_u32(*challenge);
                buf.put_slice(digest);
            }
            Self::Ack { digest } => buf.put_slice(digest),
        }
        buf
    }

    /// Decode a message body sent by `from`
    pub fn decode(from: Role, mut buf: Bytes) -> Result<Self, ProtocolErr> {
        ensure(&buf, 1)?;
        let tag = buf.get_u8();
        let msg = match (from, tag) {
            (_, b's') => {
                let len = buf.remaining();
                Self::Status(get_string(&mut buf, len)?)
            }
            (Role::Client, b'n') => {
                ensure(&buf, 6)?;
                let version = buf.get_u16();
                let flags = DistributionFlags(buf.get_u32() as u64);
                let len = buf.remaining();
                Self::NameV5 {
                    version,
                    flags,
                    name: get_string(&mut buf, len)?,
                }
            }
            (Role::Client, b'N') => {
                ensure(&buf, 14)?;
                let flags = DistributionFlags(buf.get_u64());
                let creation = buf.get_u32();
                let len = buf.get_u16() as usize;
                Self::Name {
                    flags,
                    creation,
                    name: get_string(&mut buf, len)?,
                }
            }
            (Role::Client, b'c') => {
                ensure(&buf, 8)?;
                Self::Complement {
                    flags_high: buf.get_u32(),
                    creation: buf.get_u32(),
                }
            }
            (Role::Client, b'r') => {
                ensure(&buf, 4)?;
                let challenge = buf.get_u32();
                Self::ChallengeReply {
                    challenge,
                    digest: get_digest(&mut buf)?,
                }
            }
            (Role::Server, b'n') => {
                ensure(&buf, 10)?;
                let version = buf.get_u16();
                let flags = DistributionFlags(buf.get_u32() as u64);
                let challenge = buf.get_u32();
                let len = buf.remaining();
                Self::ChallengeV5 {
                    version,
                    flags,
                    challenge,
                    name: get_string(&mut buf, len)?,
                }
            }
            (Role::Server, b'N') => {
                ensure(&buf, 18)?;
                let flags = DistributionFlags(buf.get_u64());
                let challenge = buf.get_u32();
                let creation = buf.get_u32();
                let len = buf.get_u16() as usize;
                Self::Challenge {
                    flags,
                    challenge,
                    creation,
                    name: get_string(&mut buf, len)?,
                }
            }
            (Role::Server, b'a') => Self::Ack {
                digest: get_digest(&mut buf)?,
            },
            (_, other) => return Err(ProtocolErr::UnexpectedTag(other)),
        };
        Ok(msg)
    }
}

/// Write one length-prefixed handshake frame
pub async fn write_message<W>(writer: &mut W, msg: &HandshakeMessage) -> Result<(), ProtocolErr>
where
    W: AsyncWrite + Unpin,
{
    let body = msg.encode();
    let mut frame = BytesMut::with_capacity(2 + body.len());
    frame.put_u16(body.len() as u16);
    frame.put_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed handshake frame sent by `from`
pub async fn read_message<R>(reader: &mut R, from: Role) -> Result<HandshakeMessage, ProtocolErr>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await? as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    HandshakeMessage::decode(from, Bytes::from(body))
}

/// Why a handshake state machine closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// A message arrived which isn't valid in the current state
    UnexpectedMessage(u8),
    /// The peer's digest didn't match
    DigestMismatch,
    /// The server refused us with this status
    Rejected(String),
    /// The server told us our own in-flight connection loses
    LostRace,
    /// The client declined to continue after an `alive` status
    Declined,
}

impl From<Failure> for ProtocolErr {
    fn from(value: Failure) -> Self {
        match value {
            Failure::UnexpectedMessage(tag) => Self::UnexpectedTag(tag),
            Failure::DigestMismatch => Self::DigestMismatch,
            Failure::Rejected(status) => Self::Rejected(status),
            Failure::LostRace => Self::LostRace,
            Failure::Declined => Self::Rejected("false".to_string()),
        }
    }
}

/// Server authentication FSM
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerHandshake {
    /// (1) Client initiates handshake by sending their name
    WaitingOnPeerName,

    /// (2) We have the peer name and must reply with a [SessionStatus]
    HavePeerName(PeerName),

    /// (2B) We replied `alive`, so we wait on the client's `true`/`false`
    WaitingOnClientStatus(PeerName),

    /// (3) Waiting on the client's reply to our challenge.
    ///
    /// Arguments are the peer, the challenge we sent and the digest we expect back
    WaitingOnChallengeReply(PeerName, u32, Digest),

    /// (4) We verified the client's digest. Argument is the digest of the
    /// client's challenge to send back in the ack
    Ok(PeerName, Digest),

    /// Close
    Close(Failure),
}

impl ServerHandshake {
    /// Initialize the FSM state
    pub fn init() -> Self {
        Self::WaitingOnPeerName
    }

    /// Pick a challenge and move on to waiting for the client's reply
    pub fn start_challenge(&self, cookie: &'_ str) -> Self {
        match self {
            Self::HavePeerName(peer) | Self::WaitingOnClientStatus(peer) => {
                let challenge = rand::thread_rng().next_u32();
                let digest = challenge_digest(cookie, challenge);
                Self::WaitingOnChallengeReply(peer.clone(), challenge, digest)
            }
            _ => Self::Close(Failure::UnexpectedMessage(b's')),
        }
    }

    /// Apply our own status decision to a freshly named peer
    pub fn with_status(&self, status: SessionStatus, cookie: &'_ str) -> Self {
        match (self, status) {
            (Self::HavePeerName(_), SessionStatus::Ok | SessionStatus::OkSimultaneous) => {
                self.start_challenge(cookie)
            }
            (Self::HavePeerName(peer), SessionStatus::Alive) => {
                Self::WaitingOnClientStatus(peer.clone())
            }
            (_, status) => Self::Close(Failure::Rejected(status.as_str().to_string())),
        }
    }

    /// Implement the FSM state transitions
    pub fn next(&self, msg: HandshakeMessage, cookie: &'_ str) -> Self {
        let tag = msg.tag();
        match (self, msg) {
            (Self::WaitingOnPeerName, HandshakeMessage::Name { flags, creation, name }) => {
                return Self::HavePeerName(PeerName {
                    name,
                    flags,
                    creation,
                    version: 6,
                });
            }
            (Self::WaitingOnPeerName, HandshakeMessage::NameV5 { flags, name, .. }) => {
                return Self::HavePeerName(PeerName {
                    name,
                    flags,
                    creation: 0,
                    version: 5,
                });
            }
            (Self::WaitingOnClientStatus(_), HandshakeMessage::Status(status)) => {
                // client says whether to replace the existing connection
                return match status.as_str() {
                    "true" | "ok" => self.start_challenge(cookie),
                    _ => Self::Close(Failure::Declined),
                };
            }
            (
                Self::WaitingOnChallengeReply(peer, challenge, expected),
                HandshakeMessage::Complement {
                    flags_high,
                    creation,
                },
            ) => {
                let mut peer = peer.clone();
                peer.flags = DistributionFlags::from_halves(flags_high, peer.flags.low());
                peer.creation = creation;
                return Self::WaitingOnChallengeReply(peer, *challenge, *expected);
            }
            (
                Self::WaitingOnChallengeReply(peer, _, expected),
                HandshakeMessage::ChallengeReply { challenge, digest },
            ) => {
                if *expected == digest {
                    let reply_digest = challenge_digest(cookie, challenge);
                    return Self::Ok(peer.clone(), reply_digest);
                } else {
                    // digest's don't match!
                    return Self::Close(Failure::DigestMismatch);
                }
            }
            _ => {}
        }
        // received an out-of-order message. The node can't be trusted
        Self::Close(Failure::UnexpectedMessage(tag))
    }
}

/// Client authentication FSM
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientHandshake {
    /// (1) After the client has sent its name it waits for the server's status.
    /// Argument is whether the legacy `'n'` name was sent
    WaitingForServerStatus(bool),

    /// (2) We've potentially replied to an `alive` status. Either way we're
    /// waiting for the server's challenge.
    ///
    /// Arguments are whether the legacy name was sent and the server's status
    WaitingForServerChallenge(bool, SessionStatus),

    /// (3) We've sent our challenge reply and wait on the server's ack.
    ///
    /// Arguments are the peer, the server's challenge digest reply, our
    /// challenge, the digest we expect back, and whether a complement must be
    /// sent before the reply
    WaitingForServerChallengeAck(PeerName, Digest, u32, Digest, bool),

    /// (4) We've validated the server's digest. The channel is open
    Ok(PeerName),

    /// Close
    Close(Failure),
}

impl ClientHandshake {
    /// Initialize the FSM state
    pub fn init(sent_legacy_name: bool) -> Self {
        Self::WaitingForServerStatus(sent_legacy_name)
    }

    /// Implement the client FSM transitions
    pub fn next(&self, msg: HandshakeMessage, cookie: &'_ str) -> Self {
        let tag = msg.tag();
        match (self, msg) {
            (Self::WaitingForServerStatus(legacy), HandshakeMessage::Status(status)) => {
                return match SessionStatus::parse(&status) {
                    Some(
                        s @ (SessionStatus::Ok | SessionStatus::OkSimultaneous | SessionStatus::Alive),
                    ) => Self::WaitingForServerChallenge(*legacy, s),
                    Some(SessionStatus::Nok) => Self::Close(Failure::LostRace),
                    _ => Self::Close(Failure::Rejected(status)),
                };
            }
            (
                Self::WaitingForServerChallenge(legacy, _),
                HandshakeMessage::Challenge {
                    flags,
                    challenge,
                    creation,
                    name,
                },
            ) => {
                let peer = PeerName {
                    name,
                    flags,
                    creation,
                    version: 6,
                };
                return Self::reply_to(peer, challenge, *legacy, cookie);
            }
            (
                Self::WaitingForServerChallenge(_, _),
                HandshakeMessage::ChallengeV5 {
                    flags,
                    challenge,
                    name,
                    ..
                },
            ) => {
                let peer = PeerName {
                    name,
                    flags,
                    creation: 0,
                    version: 5,
                };
                return Self::reply_to(peer, challenge, false, cookie);
            }
            (
                Self::WaitingForServerChallengeAck(peer, _, _, expected, _),
                HandshakeMessage::Ack { digest },
            ) => {
                if *expected == digest {
                    return Self::Ok(peer.clone());
                } else {
                    return Self::Close(Failure::DigestMismatch);
                }
            }
            _ => {}
        }
        // received an out-of-order message. The node can't be trusted
        Self::Close(Failure::UnexpectedMessage(tag))
    }

    fn reply_to(peer: PeerName, server_challenge: u32, complement: bool, cookie: &str) -> Self {
        let server_digest = challenge_digest(cookie, server_challenge);
        let challenge = rand::thread_rng().next_u32();
        let expected_digest = challenge_digest(cookie, challenge);
        Self::WaitingForServerChallengeAck(
            peer,
            server_digest,
            challenge,
            expected_digest,
            complement,
        )
    }
}

/// Who we are, as presented during a handshake
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// Our full node name
    pub name: String,
    /// Our capability flags
    pub flags: DistributionFlags,
    /// Our creation
    pub creation: u32,
    /// The shared cookie
    pub cookie: String,
}

fn out_of_order() -> ProtocolErr {
    ProtocolErr::Malformed("handshake state out of order")
}

/// Drive the accepting side of a handshake to completion. `check_peer` decides
/// the status we reply to the peer's name with
pub async fn run_server<S, F>(
    stream: &mut S,
    local: &LocalIdentity,
    check_peer: F,
) -> Result<PeerName, ProtocolErr>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(&str) -> SessionStatus,
{
    let cookie = local.cookie.as_str();
    let mut fsm = ServerHandshake::init().next(read_message(stream, Role::Client).await?, cookie);
    let peer = match &fsm {
        ServerHandshake::HavePeerName(peer) => peer.clone(),
        ServerHandshake::Close(failure) => return Err(failure.clone().into()),
        _ => return Err(out_of_order()),
    };
    if peer.version < super::epmd::LOWEST_VERSION {
        return Err(ProtocolErr::UnsupportedVersion(peer.version));
    }

    let status = check_peer(&peer.name);
    log::debug!("Handshake with '{}': replying '{}'", peer.name, status.as_str());
    write_message(stream, &HandshakeMessage::Status(status.as_str().to_string())).await?;
    fsm = fsm.with_status(status, cookie);
    if let ServerHandshake::WaitingOnClientStatus(_) = &fsm {
        fsm = fsm.next(read_message(stream, Role::Client).await?, cookie);
    }

    let challenge = match &fsm {
        ServerHandshake::WaitingOnChallengeReply(_, challenge, _) => *challenge,
        ServerHandshake::Close(failure) => return Err(failure.clone().into()),
        _ => return Err(out_of_order()),
    };
    let challenge_msg = if peer.version >= 6 || peer.flags.contains(DistributionFlags::HANDSHAKE_23) {
        HandshakeMessage::Challenge {
            flags: local.flags,
            challenge,
            creation: local.creation,
            name: local.name.clone(),
        }
    } else {
        HandshakeMessage::ChallengeV5 {
            version: super::epmd::LOWEST_VERSION,
            flags: local.flags,
            challenge,
            name: local.name.clone(),
        }
    };
    write_message(stream, &challenge_msg).await?;

    let mut complemented = false;
    loop {
        let msg = read_message(stream, Role::Client).await?;
        if matches!(msg, HandshakeMessage::Complement { .. }) {
            if complemented {
                return Err(ProtocolErr::UnexpectedTag(b'c'));
            }
            complemented = true;
        }
        fsm = fsm.next(msg, cookie);
        match &fsm {
            ServerHandshake::WaitingOnChallengeReply(..) => continue,
            ServerHandshake::Ok(peer, digest) => {
                write_message(stream, &HandshakeMessage::Ack { digest: *digest }).await?;
                return Ok(peer.clone());
            }
            ServerHandshake::Close(failure) => return Err(failure.clone().into()),
            _ => return Err(out_of_order()),
        }
    }
}

/// Drive the connecting side of a handshake to completion. `peer_versions`
/// is the `(lowest, highest)` version range the peer published
pub async fn run_client<S>(
    stream: &mut S,
    local: &LocalIdentity,
    peer_versions: (u16, u16),
) -> Result<PeerName, ProtocolErr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (lowest, highest) = peer_versions;
    if highest < super::epmd::LOWEST_VERSION || lowest > super::epmd::HIGHEST_VERSION {
        return Err(ProtocolErr::UnsupportedVersion(highest));
    }
    let cookie = local.cookie.as_str();
    let legacy = highest < 6;
    let name_msg = if legacy {
        HandshakeMessage::NameV5 {
            version: super::epmd::LOWEST_VERSION,
            flags: local.flags,
            name: local.name.clone(),
        }
    } else {
        HandshakeMessage::Name {
            flags: local.flags,
            creation: local.creation,
            name: local.name.clone(),
        }
    };
    write_message(stream, &name_msg).await?;

    let mut fsm = ClientHandshake::init(legacy).next(read_message(stream, Role::Server).await?, cookie);
    match &fsm {
        ClientHandshake::WaitingForServerChallenge(_, SessionStatus::Alive) => {
            // we have no live connection to them, so the old one is stale
            write_message(stream, &HandshakeMessage::Status("true".to_string())).await?;
        }
        ClientHandshake::WaitingForServerChallenge(..) => {}
        ClientHandshake::Close(failure) => return Err(failure.clone().into()),
        _ => return Err(out_of_order()),
    }

    fsm = fsm.next(read_message(stream, Role::Server).await?, cookie);
    match &fsm {
        ClientHandshake::WaitingForServerChallengeAck(_, digest, challenge, _, complement) => {
            if *complement {
                let complement = HandshakeMessage::Complement {
                    flags_high: local.flags.high(),
                    creation: local.creation,
                };
                write_message(stream, &complement).await?;
            }
            let reply = HandshakeMessage::ChallengeReply {
                challenge: *challenge,
                digest: *digest,
            };
            write_message(stream, &reply).await?;
        }
        ClientHandshake::Close(failure) => return Err(failure.clone().into()),
        _ => return Err(out_of_order()),
    }

    match fsm.next(read_message(stream, Role::Server).await?, cookie) {
        ClientHandshake::Ok(peer) => Ok(peer),
        ClientHandshake::Close(failure) => Err(failure.into()),
        _ => Err(out_of_order()),
    }
}
