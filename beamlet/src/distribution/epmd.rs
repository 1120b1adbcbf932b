// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Client for the port-mapper daemon (`epmd`). Definition can be found in
//! [Erlang's distribution protocol](https://www.erlang.org/doc/apps/erts/erl_dist_protocol.html)
//!
//! Requests and responses are framed with a 2-byte big-endian length.
//! Registration (`ALIVE2`) keeps its socket open for the lifetime of the node,
//! since the daemon unregisters the name when that socket closes. Lookups
//! (`PORT_PLEASE2`) use a fresh socket which the daemon closes after replying.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::errors::NameServiceErr;

/// The daemon's well-known port
pub const EPMD_PORT: u16 = 4369;

const ALIVE2_X_RESP: u8 = 118;
const PORT2_RESP: u8 = 119;
const ALIVE2_REQ: u8 = 120;
const ALIVE2_RESP: u8 = 121;
const PORT_PLEASE2_REQ: u8 = 122;

/// Node type advertised for a hidden node
pub const HIDDEN_NODE: u8 = 72;
/// Node type advertised for a normal node
pub const NORMAL_NODE: u8 = 77;
/// Protocol id for TCP/IPv4
pub const PROTOCOL_TCP: u8 = 0;
/// The lowest distribution version we speak
pub const LOWEST_VERSION: u16 = 5;
/// The highest distribution version we speak
pub const HIGHEST_VERSION: u16 = 6;

/// Split a full `name@host` node name into its two halves
pub fn split_node_name(full: &str) -> Result<(&str, &str), NameServiceErr> {
    match full.split_once('@') {
        Some((name, host)) if !name.is_empty() && !host.is_empty() => Ok((name, host)),
        _ => Err(NameServiceErr::InvalidNodeName(full.to_string())),
    }
}

/// An accepted registration. Dropping it closes the socket, which
/// unregisters the node
#[derive(Debug)]
pub struct Registration {
    /// The creation assigned by the daemon
    pub creation: u32,
    _stream: TcpStream,
}

/// A node as published by the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    /// The node's distribution listening port
    pub port: u16,
    /// [HIDDEN_NODE] or [NORMAL_NODE]
    pub node_type: u8,
    /// The transport protocol id
    pub protocol: u8,
    /// The highest distribution version the node speaks
    pub highest_version: u16,
    /// The lowest distribution version the node speaks
    pub lowest_version: u16,
    /// The node's short name
    pub name: String,
    /// Extra data published by the node
    pub extra: Vec<u8>,
}

/// A client of one host's daemon
#[derive(Debug, Clone)]
pub struct EpmdClient {
    host: String,
    port: u16,
}

impl EpmdClient {
    /// Create a client for the daemon at `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    async fn connect(&self) -> Result<TcpStream, NameServiceErr> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Register `name` (the short node name) as listening on `listen_port`
    pub async fn register(
        &self,
        name: &str,
        listen_port: u16,
    ) -> Result<Registration, NameServiceErr> {
        let mut stream = self.connect().await?;
        stream.write_all(&encode_alive2(name, listen_port)).await?;

        let op = stream.read_u8().await?;
        let result = stream.read_u8().await?;
        if op != ALIVE2_RESP && op != ALIVE2_X_RESP {
            return Err(NameServiceErr::UnexpectedOpcode(op));
        }
        if result != 0 {
            return Err(NameServiceErr::RegistrationRejected(result));
        }
        let creation = if op == ALIVE2_X_RESP {
            stream.read_u32().await?
        } else {
            stream.read_u16().await? as u32
        };
        log::info!(
            "Registered '{name}' on port {listen_port} with the name service at {}:{} (creation {creation})",
            self.host,
            self.port
        );
        Ok(Registration {
            creation,
            _stream: stream,
        })
    }

    /// Resolve the short node name `name` to its published entry
    pub async fn lookup(&self, name: &str) -> Result<NodeEntry, NameServiceErr> {
        let mut stream = self.connect().await?;
        stream.write_all(&encode_port_please2(name)).await?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        let entry = decode_port2_response(name, &response)?;
        log::debug!(
            "Resolved '{name}' at {} to port {} (versions {}-{})",
            self.host,
            entry.port,
            entry.lowest_version,
            entry.highest_version
        );
        Ok(entry)
    }
}

fn frame2(body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(2 + body.len());
    buf.put_u16(body.len() as u16);
    buf.put_slice(body);
    buf
}

pub(crate) fn encode_alive2(name: &str, listen_port: u16) -> BytesMut {
    let mut body = BytesMut::with_capacity(13 + name.len());
    body.put_u8(ALIVE2_REQ);
    body.put_u16(listen_port);
    body.put_u8(HIDDEN_NODE);
    body.put_u8(PROTOCOL_TCP);
    body.put_u16(HIGHEST_VERSION);
    body.put_u16(LOWEST_VERSION);
    body.put_u16(name.len() as u16);
    body.put_slice(name.as_bytes());
    // no extra data
    body.put_u16(0);
    frame2(&body)
}

pub(crate) fn encode_port_please2(name: &str) -> BytesMut {
    let mut body = BytesMut::with_capacity(1 + name.len());
    body.put_u8(PORT_PLEASE2_REQ);
    body.put_slice(name.as_bytes());
    frame2(&body)
}

fn ensure(buf: &[u8], len: usize) -> Result<(), NameServiceErr> {
    if buf.remaining() < len {
        Err(NameServiceErr::Malformed("truncated PORT2_RESP"))
    } else {
        Ok(())
    }
}

pub(crate) fn decode_port2_response(name: &str, mut buf: &[u8]) -> Result<NodeEntry, NameServiceErr> {
    ensure(buf, 2)?;
    let op = buf.get_u8();
    if op != PORT2_RESP {
        return Err(NameServiceErr::UnexpectedOpcode(op));
    }
    let code = buf.get_u8();
    if code != 0 {
        return Err(NameServiceErr::LookupFailed {
            name: name.to_string(),
            code,
        });
    }
    ensure(buf, 10)?;
    let port = buf.get_u16();
    let node_type = buf.get_u8();
    let protocol = buf.get_u8();
    let highest_version = buf.get_u16();
    let lowest_version = buf.get_u16();
    let name_len = buf.get_u16() as usize;
    ensure(buf, name_len)?;
    let node_name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
    buf.advance(name_len);
    let extra = if buf.remaining() >= 2 {
        let extra_len = buf.get_u16() as usize;
        ensure(buf, extra_len)?;
        buf[..extra_len].to_vec()
    } else {
        Vec::new()
    };
    Ok(NodeEntry {
        port,
        node_type,
        protocol,
        highest_version,
        lowest_version,
        name: node_name,
        extra,
    })
}
