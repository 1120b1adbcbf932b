// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Node configuration

use std::path::PathBuf;

use crate::concurrency::Duration;
use crate::distribution::epmd::EPMD_PORT;
use crate::errors::StartupErr;

/// Where the shared authentication cookie comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieSource {
    /// Read once at startup from this file and trimmed. A missing or empty
    /// file is a fatal startup error
    File(PathBuf),
    /// Use this value verbatim
    Value(String),
}

impl CookieSource {
    /// The per-user credential file, `$HOME/.erlang.cookie`
    pub fn default_file() -> Self {
        let home = std::env::var_os("HOME").unwrap_or_default();
        Self::File(PathBuf::from(home).join(".erlang.cookie"))
    }

    /// Resolve the cookie
    pub fn load(&self) -> Result<String, StartupErr> {
        match self {
            Self::Value(cookie) => Ok(cookie.clone()),
            Self::File(path) => {
                let contents = std::fs::read_to_string(path)
                    .map_err(|err| StartupErr::Cookie(path.clone(), err))?;
                let cookie = contents.trim();
                if cookie.is_empty() {
                    Err(StartupErr::EmptyCookie(path.clone()))
                } else {
                    Ok(cookie.to_string())
                }
            }
        }
    }
}

/// Configuration for [crate::Node::start]
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// The short node name (the part before the `@`)
    pub name: String,
    /// The host part of the node name
    pub hostname: String,
    /// The authentication cookie
    pub cookie: CookieSource,
    /// Where the local port-mapper daemon listens
    pub epmd_host: String,
    /// The port-mapper daemon's port
    pub epmd_port: u16,
    /// The distribution listener's port. 0 picks an ephemeral port
    pub listen_port: u16,
    /// How often an idle connection sends a heartbeat
    pub heartbeat_interval: Duration,
    /// How long a connection may go without receiving any frame before it's
    /// considered dead
    pub liveness_timeout: Duration,
    /// How long a handshake may take
    pub handshake_timeout: Duration,
}

impl NodeConfig {
    /// The default heartbeat interval
    pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

    /// Create a configuration for `name@hostname` with defaults for everything
    /// else
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            cookie: CookieSource::default_file(),
            epmd_host: "127.0.0.1".to_string(),
            epmd_port: EPMD_PORT,
            listen_port: 0,
            heartbeat_interval: Self::DEFAULT_HEARTBEAT,
            liveness_timeout: Self::DEFAULT_HEARTBEAT * 2,
            handshake_timeout: Duration::from_secs(5),
        }
    }

    /// The full `name@hostname` node name
    pub fn node_name(&self) -> String {
        format!("{}@{}", self.name, self.hostname)
    }

    /// Use a literal cookie
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = CookieSource::Value(cookie.into());
        self
    }

    /// Read the cookie from this file
    pub fn with_cookie_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookie = CookieSource::File(path.into());
        self
    }

    /// Talk to the port-mapper daemon at `host:port`
    pub fn with_epmd(mut self, host: impl Into<String>, port: u16) -> Self {
        self.epmd_host = host.into();
        self.epmd_port = port;
        self
    }

    /// Set the heartbeat interval. The liveness timeout becomes twice the
    /// interval
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.liveness_timeout = interval * 2;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Listen on a fixed port
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }
}
