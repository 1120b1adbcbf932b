// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! `beamlet`: join an [Erlang distribution](https://www.erlang.org/doc/apps/erts/erl_dist_protocol.html)
//! mesh as a hidden node, with lightweight processes and selective-receive mailboxes.
//!
//! ## Installation
//!
//! Install `beamlet` by adding the following to your Cargo.toml dependencies
//!
//! ```toml
//! [dependencies]
//! beamlet = "0.1"
//! ```
//!
//! ## Getting started
//!
//! A node registers with the local port-mapper daemon (`epmd`), accepts and
//! opens authenticated connections to peer nodes on demand, and hosts
//! processes which can message any process in the mesh, by pid, by registered
//! name or by alias.
//!
//! ```rust,no_run
//! use beamlet::term::{self, Destination, Term};
//! use beamlet::{Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = NodeConfig::new("hidden", "localhost").with_cookie("monster");
//!     let node = Node::start(config).await.expect("Failed to start the node");
//!
//!     node.spawn(None, |mut ctx| async move {
//!         let me: Term = ctx.self_pid().into();
//!         // ask the `echo` process on another node to send "hi" back
//!         ctx.send(
//!             Destination::remote("echo", "peer@localhost"),
//!             term::tuple(vec![me, term::binary("hi")]),
//!         );
//!         let reply = ctx.receive().await;
//!         println!("Got {reply:?}");
//!         Ok(())
//!     })
//!     .expect("Failed to spawn");
//! }
//! ```
//!
//! ## Layout
//!
//! * [distribution] speaks the wire: the `epmd` client, the handshake, the
//!   framed connections and the per-peer connection table.
//! * [node] owns the process registry and routes messages locally or onto the
//!   wire.
//! * [process] holds the mailbox and the [ProcessContext] each process body
//!   receives.
//! * [gen_server] and [net_kernel] are built from the above.

#![warn(unused_imports)]
#![warn(unsafe_code)]
#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// only the benches use it
#[cfg(test)]
use criterion as _;

pub mod concurrency;
pub mod config;
pub mod distribution;
pub mod errors;
pub mod gen_server;
pub mod net_kernel;
pub mod node;
pub mod process;
pub mod term;

pub use config::{CookieSource, NodeConfig};
pub use errors::{
    CallErr, ConnectErr, NameServiceErr, ProcessFault, ProtocolErr, ReceiveTimeout, RegistryErr,
    SpawnErr, StartupErr,
};
pub use node::Node;
pub use process::{ExitReason, ProcessContext};
pub use term::{Destination, Pid, Reference, Term};
