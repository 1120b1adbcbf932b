// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! An authenticated connection to a peer node
//!
//! After the handshake the socket is split. A single writer task owns the write
//! half, so every frame is written whole; it also emits a heartbeat (a
//! zero-length frame) whenever the heartbeat interval elapses. A reader task owns
//! the read half, decodes dispatch frames and forwards them to the node. If no
//! frame at all arrives within the liveness timeout the connection is torn down.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::handshake::PeerName;
use super::Distribution;
use crate::concurrency::{self, Duration, MpscUnboundedReceiver, MpscUnboundedSender};
use crate::errors::ProtocolErr;
use crate::node::control::ControlMessage;
use crate::term::Term;

/// The sub-protocol tag of a dispatch frame
pub const DISPATCH_TAG: u8 = b'p';

/// A decoded dispatch frame, on its way to the node
#[derive(Debug)]
pub struct InboundFrame {
    /// The peer node which sent it
    pub peer: Arc<str>,
    /// The decoded control message
    pub control: ControlMessage,
    /// The still-encoded payload term (empty when there's none)
    pub payload: Bytes,
}

/// See the module-level documentation
#[derive(Debug)]
pub struct Connection {
    id: u64,
    peer: PeerName,
    peer_node: Arc<str>,
    outbound: MpscUnboundedSender<Bytes>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Connection {
    /// The id of this connection, unique within the node
    pub fn id(&self) -> u64 {
        self.id
    }

    /// What the handshake learned about the peer
    pub fn peer(&self) -> &PeerName {
        &self.peer
    }

    /// Returns [true] once the connection has been torn down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear down the connection. Idempotent
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::info!("Closing connection {} to '{}'", self.id, self.peer.name);
            self.shutdown.send_replace(true);
        }
    }

    /// Send one dispatch frame: the control message followed by the payload
    /// term, if any
    pub fn send(&self, control: &ControlMessage, payload: Option<&Term>) -> Result<(), ProtocolErr> {
        if self.is_closed() {
            return Err(ProtocolErr::Closed);
        }
        let frame = encode_dispatch_frame(control, payload)?;
        log::trace!("SEND -> '{}' {control:?}", self.peer.name);
        self.outbound.send(frame).map_err(|_| ProtocolErr::Closed)
    }

    /// Start the reader and writer tasks over an authenticated socket
    pub(crate) fn start(
        dist: &Arc<Distribution>,
        stream: TcpStream,
        peer: PeerName,
    ) -> Arc<Connection> {
        let (read, write) = stream.into_split();
        let (tx, rx) = concurrency::mpsc_unbounded();
        let (shutdown, _) = watch::channel(false);
        let conn = Arc::new(Connection {
            id: dist.next_connection_id(),
            peer_node: Arc::from(peer.name.as_str()),
            peer,
            outbound: tx,
            closed: AtomicBool::new(false),
            shutdown,
        });
        log::info!("Connection {} to '{}' established", conn.id, conn.peer.name);

        let writer = SessionWriter {
            conn: Arc::downgrade(&conn),
            stream: write,
            frames: rx,
            shutdown: conn.shutdown.subscribe(),
            heartbeat: dist.heartbeat_interval(),
        };
        let reader = SessionReader {
            conn: Arc::downgrade(&conn),
            dist: Arc::downgrade(dist),
            stream: read,
            peer: conn.peer_node.clone(),
            inbound: dist.inbound_sender(),
            shutdown: conn.shutdown.subscribe(),
            liveness: dist.liveness_timeout(),
        };
        concurrency::spawn(writer.run());
        concurrency::spawn(reader.run());
        conn
    }
}

/// Encode `[len:4]['p'][control][payload]`
pub(crate) fn encode_dispatch_frame(
    control: &ControlMessage,
    payload: Option<&Term>,
) -> Result<Bytes, ProtocolErr> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u32(0);
    buf.put_u8(DISPATCH_TAG);
    let mut writer = buf.writer();
    control.to_term().encode(&mut writer)?;
    if let Some(payload) = payload {
        payload.encode(&mut writer)?;
    }
    let mut buf = writer.into_inner();
    let len = (buf.len() - 4) as u32;
    buf[..4].copy_from_slice(&len.to_be_bytes());
    Ok(buf.freeze())
}

/// Decode the body of a non-empty frame. Returns [None] for sub-protocols we
/// don't speak
pub(crate) fn decode_frame(
    peer: &Arc<str>,
    body: Bytes,
) -> Result<Option<InboundFrame>, ProtocolErr> {
    match body.first() {
        Some(&DISPATCH_TAG) => {
            let mut cursor = Cursor::new(&body[1..]);
            let control = Term::decode(&mut cursor)?;
            let consumed = 1 + cursor.position() as usize;
            let control = ControlMessage::decode(&control)?;
            let payload = body.slice(consumed..);
            if control.has_payload() && payload.is_empty() {
                return Err(ProtocolErr::Malformed("dispatch frame is missing its payload"));
            }
            Ok(Some(InboundFrame {
                peer: peer.clone(),
                control,
                payload,
            }))
        }
        Some(tag) => {
            log::warn!(
                "Ignoring frame with unknown sub-protocol tag {tag} from '{peer}' ({} bytes)",
                body.len()
            );
            Ok(None)
        }
        None => Err(ProtocolErr::Malformed("empty frame body")),
    }
}

struct SessionWriter {
    conn: Weak<Connection>,
    stream: OwnedWriteHalf,
    frames: MpscUnboundedReceiver<Bytes>,
    shutdown: watch::Receiver<bool>,
    heartbeat: Duration,
}

impl SessionWriter {
    async fn run(mut self) {
        let mut tick = concurrency::interval(self.heartbeat);
        let result: Result<(), std::io::Error> = async {
            loop {
                tokio::select! {
                    frame = self.frames.recv() => match frame {
                        Some(frame) => self.stream.write_all(&frame).await?,
                        None => break,
                    },
                    _ = tick.tick() => {
                        log::trace!("Heartbeat");
                        self.stream.write_all(&[0u8; 4]).await?;
                    }
                    _ = self.shutdown.changed() => break,
                }
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            log_io_error("write", &err);
        }
        let _ = self.stream.shutdown().await;
        if let Some(conn) = self.conn.upgrade() {
            conn.close();
        }
    }
}

struct SessionReader {
    conn: Weak<Connection>,
    dist: Weak<Distribution>,
    stream: OwnedReadHalf,
    peer: Arc<str>,
    inbound: MpscUnboundedSender<InboundFrame>,
    shutdown: watch::Receiver<bool>,
    liveness: Duration,
}

/// Read one frame body. Heartbeats come back as an empty body
async fn read_frame(stream: &mut OwnedReadHalf) -> Result<Bytes, ProtocolErr> {
    let len = stream.read_u32().await? as usize;
    if len == 0 {
        return Ok(Bytes::new());
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

impl SessionReader {
    async fn run(mut self) {
        let result = loop {
            let read = tokio::select! {
                read = concurrency::timeout(self.liveness, read_frame(&mut self.stream)) => read,
                _ = self.shutdown.changed() => break Ok(()),
            };
            let body = match read {
                Ok(Ok(body)) => body,
                Ok(Err(err)) => break Err(err),
                Err(_) => break Err(ProtocolErr::PeerUnresponsive),
            };
            if body.is_empty() {
                continue;
            }
            match decode_frame(&self.peer, body) {
                Ok(Some(frame)) => {
                    log::trace!("RECEIVE <- '{}' {:?}", self.peer, frame.control);
                    if self.inbound.send(frame).is_err() {
                        // the node is gone
                        break Ok(());
                    }
                }
                Ok(None) => {}
                Err(err) => break Err(err),
            }
        };

        match result {
            Ok(()) => {}
            Err(ProtocolErr::Io(err)) => log_io_error("read", &err),
            Err(err) => log::error!("Connection to '{}' failed: {err}", self.peer),
        }
        if let Some(conn) = self.conn.upgrade() {
            conn.close();
            if let Some(dist) = self.dist.upgrade() {
                dist.remove_connection(&conn);
            }
        }
    }
}

fn log_io_error(op: &str, err: &std::io::Error) {
    match err.kind() {
        // ordinary peer disconnects
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::BrokenPipe => {
            log::debug!("Connection {op} ended: {err}");
        }
        _ => log::error!("Connection {op} error: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::control::Subject;
    use crate::term::{self, Pid, Reference};

    fn pid(node: &str, id: u32) -> Pid {
        Pid {
            node: Arc::from(node),
            id,
            serial: 0,
            creation: 1,
        }
    }

    #[test]
    fn dispatch_frame_splits_control_and_payload() {
        let control = ControlMessage::SendSender {
            from: pid("a@h", 1),
            to: pid("b@h", 2),
        };
        let payload = term::tuple(vec![term::atom("hello"), term::int(7)]);
        let frame = encode_dispatch_frame(&control, Some(&payload)).expect("Failed to encode");

        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(frame.len() - 4, len);
        assert_eq!(DISPATCH_TAG, frame[4]);

        let peer: Arc<str> = Arc::from("a@h");
        let inbound = decode_frame(&peer, frame.slice(4..))
            .expect("Failed to decode")
            .expect("Not a dispatch frame");
        assert_eq!(control, inbound.control);
        let decoded = Term::decode(&inbound.payload[..]).expect("Failed to decode payload");
        assert_eq!(payload, decoded);
    }

    #[test]
    fn payloadless_control_has_nothing_after_it() {
        let control = ControlMessage::DemonitorP {
            from: pid("a@h", 1),
            to: Subject::Name("svc".to_string()),
            reference: Reference {
                node: Arc::from("a@h"),
                creation: 1,
                id: vec![1, 2, 3],
            },
        };
        let frame = encode_dispatch_frame(&control, None).expect("Failed to encode");
        let inbound = decode_frame(&Arc::from("a@h"), frame.slice(4..))
            .expect("Failed to decode")
            .expect("Not a dispatch frame");
        assert!(inbound.payload.is_empty());
        assert_eq!(control, inbound.control);
    }

    #[test]
    fn unknown_sub_protocols_are_skipped() {
        let body = Bytes::from_static(&[b'q', 1, 2, 3]);
        assert!(decode_frame(&Arc::from("a@h"), body)
            .expect("Unknown tags aren't errors")
            .is_none());
    }

    #[test]
    fn truncated_dispatch_is_an_error() {
        let body = Bytes::from_static(&[DISPATCH_TAG, 131, 104]);
        assert!(decode_frame(&Arc::from("a@h"), body).is_err());
    }
}
