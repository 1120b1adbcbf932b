// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Processes are the unit of concurrency. Each one is a cooperative task with
//! a private [Mailbox], which only suspends at an explicit receive point.
//!
//! A process body is an async closure handed a [ProcessContext], which is the
//! process's explicit handle on its own identity, its mailbox, and the owning
//! [Node]. When the body returns (or fails, or panics) every monitor receives a
//! DOWN notification carrying the [ExitReason] and the process is removed from
//! the node's registry.
//!
//! ```rust
//! use beamlet::Node;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let node = Node::new_local("doc@localhost");
//! let pid = node
//!     .spawn(Some("echo"), |mut ctx| async move {
//!         let _msg = ctx.receive().await;
//!         Ok(())
//!     })
//!     .expect("Failed to spawn the process");
//! node.send(None, "echo", beamlet::term::atom("hi"));
//! # let _ = pid;
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::concurrency::Duration;
use crate::errors::{ProcessFault, ReceiveTimeout, SpawnErr};
use crate::node::Node;
use crate::term::{self, Destination, Pid, Reference, Term};

pub mod mailbox;

pub use mailbox::{Mailbox, Matcher};

#[cfg(test)]
mod tests;

/// Convert a caught panic payload into a printable message
pub(crate) fn get_panic_string(e: Box<dyn std::any::Any + Send>) -> String {
    match e.downcast::<String>() {
        Ok(v) => *v,
        Err(e) => match e.downcast::<&str>() {
            Ok(v) => v.to_string(),
            _ => "Unknown panic occurred which couldn't be coerced to a string".to_string(),
        },
    }
}

/// Why a process terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The body returned `Ok(())`
    Normal,
    /// The monitored process never existed (or was already gone)
    NoProc,
    /// The peer node could not be reached
    NoConnection,
    /// The body returned an error
    Error(String),
    /// The body panicked
    Panic(String),
}

impl ExitReason {
    /// The reason as carried in a DOWN message
    pub fn to_term(&self) -> Term {
        match self {
            Self::Normal => term::atom("normal"),
            Self::NoProc => term::atom("noproc"),
            Self::NoConnection => term::atom("noconnection"),
            Self::Error(msg) => term::tuple(vec![term::atom("error"), term::binary(msg.as_bytes())]),
            Self::Panic(msg) => term::tuple(vec![term::atom("panic"), term::binary(msg.as_bytes())]),
        }
    }
}

/// Build the `{'DOWN', Ref, process, Item, Reason}` notification
pub(crate) fn down_message(reference: &Reference, item: Term, reason: Term) -> Term {
    term::tuple(vec![
        term::atom("DOWN"),
        reference.into(),
        term::atom("process"),
        item,
        reason,
    ])
}

/// A monitor held on a process
#[derive(Debug, Clone)]
pub(crate) struct Monitor {
    /// Who gets notified
    pub(crate) origin: Pid,
    /// Set if the monitor was established by registered name rather than pid
    pub(crate) by_name: Option<String>,
}

/// A live process entry, as held by the node's registry
pub struct Process {
    pid: Pid,
    name: Mutex<Option<String>>,
    mailbox: Mailbox,
    /// [None] once the process has exited
    monitored_by: Mutex<Option<HashMap<Reference, Monitor>>>,
    aliases: Mutex<Vec<Reference>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Process {
    pub(crate) fn new(pid: Pid, name: Option<String>) -> Self {
        Self {
            pid,
            name: Mutex::new(name),
            mailbox: Mailbox::new(),
            monitored_by: Mutex::new(Some(HashMap::new())),
            aliases: Mutex::new(Vec::new()),
        }
    }

    /// The process's identity
    pub fn pid(&self) -> &Pid {
        &self.pid
    }

    /// The process's registered name, if any
    pub fn name(&self) -> Option<String> {
        lock(&self.name).clone()
    }

    pub(crate) fn set_name(&self, name: Option<String>) -> Option<String> {
        std::mem::replace(&mut *lock(&self.name), name)
    }

    /// The process's mailbox
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Deliver a message to this process
    pub fn post(&self, message: Term) {
        self.mailbox.post(message);
    }

    /// Record a monitor. Returns [false] if the process has already exited,
    /// in which case the monitor must resolve as `noproc`
    pub(crate) fn add_monitored_by(&self, reference: Reference, monitor: Monitor) -> bool {
        match lock(&self.monitored_by).as_mut() {
            Some(monitors) => {
                monitors.insert(reference, monitor);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_monitored_by(&self, reference: &Reference) -> Option<Monitor> {
        lock(&self.monitored_by)
            .as_mut()
            .and_then(|monitors| monitors.remove(reference))
    }

    /// Take every monitor and refuse new ones
    pub(crate) fn take_monitors(&self) -> Vec<(Reference, Monitor)> {
        lock(&self.monitored_by)
            .take()
            .map(|monitors| monitors.into_iter().collect())
            .unwrap_or_default()
    }

    /// The number of monitors currently held on this process
    pub fn monitor_count(&self) -> usize {
        lock(&self.monitored_by).as_ref().map_or(0, HashMap::len)
    }

    pub(crate) fn add_alias(&self, reference: Reference) {
        lock(&self.aliases).push(reference);
    }

    pub(crate) fn remove_alias(&self, reference: &Reference) {
        lock(&self.aliases).retain(|r| r != reference);
    }

    pub(crate) fn take_aliases(&self) -> Vec<Reference> {
        std::mem::take(&mut *lock(&self.aliases))
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Process<{name} {}>", self.pid),
            None => write!(f, "Process<{}>", self.pid),
        }
    }
}

/// A process's handle on itself and its node, passed to the process body
pub struct ProcessContext {
    node: Node,
    process: Arc<Process>,
}

impl ProcessContext {
    pub(crate) fn new(node: Node, process: Arc<Process>) -> Self {
        Self { node, process }
    }

    /// This process's pid
    pub fn self_pid(&self) -> &Pid {
        self.process.pid()
    }

    /// The node this process lives on
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Send a message, with this process as the sender
    pub fn send(&self, to: impl Into<Destination>, message: Term) {
        self.node.send(Some(self.process.pid()), to, message);
    }

    /// Wait for the next message, whatever it is
    pub async fn receive(&mut self) -> Term {
        loop {
            if let Ok(message) = self.process.mailbox.take(Box::new(|_| true), None).await {
                return message;
            }
        }
    }

    /// Wait up to `timeout` for the next message
    pub async fn receive_timeout(&mut self, timeout: Duration) -> Result<Term, ReceiveTimeout> {
        self.process
            .mailbox
            .take(Box::new(|_| true), Some(timeout))
            .await
    }

    /// Selective receive: wait for the first message satisfying `matcher`. Other
    /// messages stay in the mailbox in arrival order
    pub async fn receive_match<F>(
        &mut self,
        matcher: F,
        timeout: Option<Duration>,
    ) -> Result<Term, ReceiveTimeout>
    where
        F: Fn(&Term) -> bool + Send + 'static,
    {
        self.process.mailbox.take(Box::new(matcher), timeout).await
    }

    /// Spawn a new process on this node
    pub fn spawn<F, Fut>(&self, name: Option<&str>, body: F) -> Result<Pid, SpawnErr>
    where
        F: FnOnce(ProcessContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ProcessFault>> + Send + 'static,
    {
        self.node.spawn(name, body)
    }

    /// Monitor `target`. A DOWN message tagged with the returned reference is
    /// delivered when the target terminates
    pub fn monitor(&self, target: impl Into<Destination>) -> Reference {
        self.node.monitor(self.process.pid(), &target.into(), None)
    }

    /// Remove a monitor. No DOWN is delivered for it afterwards. Unknown (or
    /// already resolved) references are ignored
    pub fn demonitor(&self, reference: &Reference) {
        if let Some(target) = self.node.monitor_target(reference) {
            self.node.demonitor(self.process.pid(), &target, reference);
        }
    }

    /// Create an alias for this process. Messages sent to the alias reach it
    /// until [ProcessContext::unalias] is called or the process exits
    pub fn alias(&self) -> Reference {
        self.node.alias_process(&self.process)
    }

    /// Deactivate an alias created by [ProcessContext::alias]
    pub fn unalias(&self, reference: &Reference) {
        self.node.unalias(reference);
    }

    /// Create a fresh unique reference
    pub fn make_ref(&self) -> Reference {
        self.node.make_ref()
    }
}
