// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The node owns every local process and routes every message.
//!
//! Three indices are kept, each a concurrent map so spawn, register and exit
//! are mutually exclusive per key:
//!
//! 1. pid -> process
//! 2. registered name -> process
//! 3. reference -> what the reference stands for (an alias of a local process,
//!    or a monitor a local process holds)
//!
//! Sends to local destinations are a direct mailbox post. Sends to remote
//! destinations are translated into the matching [ControlMessage] and handed to
//! the [Distribution] manager, which connects to the peer on first use. Inbound
//! control messages from peers come back through [Node::handle_control_message].
//!
//! Delivery is best-effort: a message for a destination which doesn't exist is
//! dropped with a diagnostic log, never an error.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use dashmap::mapref::entry::Entry::{Occupied, Vacant};
use dashmap::DashMap;
use futures::FutureExt;

use crate::concurrency::{self, JoinHandle};
use crate::config::NodeConfig;
use crate::distribution::Distribution;
use crate::errors::{ProcessFault, RegistryErr, SpawnErr, StartupErr};
use crate::process::{down_message, get_panic_string, ExitReason, Monitor, Process, ProcessContext};
use crate::term::{Destination, Pid, Reference, Term};

pub mod control;

#[cfg(test)]
mod tests;

use control::{ControlMessage, Subject};

/// Pid ids wrap into the serial past this value
const MAX_PID_ID: u64 = 0x7fff_ffff;

/// What an entry of the reference index stands for
#[derive(Debug)]
enum RefEntry {
    /// An active alias of a local process
    Alias(Arc<Process>),
    /// A monitor held by a local process
    Monitor { origin: Pid, target: Destination },
}

struct NodeInner {
    name: Arc<str>,
    creation: u32,
    next_id: AtomicU64,
    /// Stands in as the sender of messages sent from outside any process
    system: Pid,

    by_pid: DashMap<Pid, Arc<Process>>,
    by_name: DashMap<String, Arc<Process>>,
    by_ref: DashMap<Reference, RefEntry>,

    dist: Option<Arc<Distribution>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// A handle on a node. Cheap to clone; every clone refers to the same node
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.inner.name)
            .field("creation", &self.inner.creation)
            .field("processes", &self.inner.by_pid.len())
            .finish()
    }
}

impl Node {
    fn build(name: &str, creation: u32, dist: Option<Arc<Distribution>>) -> Self {
        let name: Arc<str> = Arc::from(name);
        let system = Pid {
            node: name.clone(),
            id: 0,
            serial: 0,
            creation,
        };
        Self {
            inner: Arc::new(NodeInner {
                name,
                creation,
                next_id: AtomicU64::new(1),
                system,
                by_pid: DashMap::new(),
                by_name: DashMap::new(),
                by_ref: DashMap::new(),
                dist,
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Create a node which isn't part of any distribution mesh. Remote sends
    /// are dropped and remote monitors resolve as `noconnection`
    pub fn new_local(full_name: &str) -> Self {
        Self::build(full_name, 0, None)
    }

    /// Start a distributed node: load the cookie, bind the listener, register
    /// with the name service, start routing inbound traffic and spawn
    /// `net_kernel`
    pub async fn start(config: NodeConfig) -> Result<Self, StartupErr> {
        let cookie = config.cookie.load()?;
        let (tx, mut rx) = concurrency::mpsc_unbounded();
        let dist = Distribution::listen(&config, cookie, tx).await?;
        let name = dist.node_name().to_string();
        let creation = dist.creation();
        let node = Self::build(&name, creation, Some(dist));

        let weak = Arc::downgrade(&node.inner);
        let handle = concurrency::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Node { inner }.handle_control_message(&frame.peer, frame.control, frame.payload);
            }
        });
        *node
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        crate::net_kernel::start(&node)?;
        log::info!(
            "Node '{}' started (creation {})",
            node.inner.name,
            node.inner.creation
        );
        Ok(node)
    }

    /// The full `name@host` node name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The creation assigned by the name service (0 for a local-only node)
    pub fn creation(&self) -> u32 {
        self.inner.creation
    }

    /// The distribution manager, if this node is distributed
    pub fn distribution(&self) -> Option<&Arc<Distribution>> {
        self.inner.dist.as_ref()
    }

    /// The peers this node has a live connection to
    pub fn connected_nodes(&self) -> Vec<String> {
        self.inner
            .dist
            .as_ref()
            .map(|dist| dist.connected_nodes())
            .unwrap_or_default()
    }

    /// Every live local process
    pub fn processes(&self) -> Vec<Pid> {
        self.inner.by_pid.iter().map(|e| e.key().clone()).collect()
    }

    /// Every registered name
    pub fn registered(&self) -> Vec<String> {
        self.inner.by_name.iter().map(|e| e.key().clone()).collect()
    }

    /// The live local process registered as `name`
    pub fn whereis(&self, name: &str) -> Option<Pid> {
        self.inner.by_name.get(name).map(|e| e.value().pid().clone())
    }

    /// Create a fresh reference owned by this node
    pub fn make_ref(&self) -> Reference {
        Reference::new_random(self.inner.name.clone(), self.inner.creation)
    }

    fn is_local(&self, node: &str) -> bool {
        *self.inner.name == *node
    }

    fn next_pid(&self) -> Pid {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        Pid {
            node: self.inner.name.clone(),
            id: (n % MAX_PID_ID) as u32,
            serial: (n / MAX_PID_ID) as u32,
            creation: self.inner.creation,
        }
    }

    /// Spawn a process running `body`, optionally registered as `name`.
    ///
    /// The process is indexed before this returns, so it's immediately
    /// addressable. When `body` completes, returns an error or panics, every
    /// monitor gets a DOWN carrying the matching [ExitReason] and the process
    /// is removed from all indices.
    pub fn spawn<F, Fut>(&self, name: Option<&str>, body: F) -> Result<Pid, SpawnErr>
    where
        F: FnOnce(ProcessContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ProcessFault>> + Send + 'static,
    {
        let pid = self.next_pid();
        let process = Arc::new(Process::new(pid.clone(), name.map(str::to_string)));
        if let Some(name) = name {
            match self.inner.by_name.entry(name.to_string()) {
                Occupied(_) => return Err(SpawnErr::AlreadyRegistered(name.to_string())),
                Vacant(vacancy) => {
                    vacancy.insert(process.clone());
                }
            }
        }
        self.inner.by_pid.insert(pid.clone(), process.clone());
        log::debug!("Spawned {process:?}");

        let ctx = ProcessContext::new(self.clone(), process.clone());
        let node = self.clone();
        concurrency::spawn(async move {
            let result = AssertUnwindSafe(async move { body(ctx).await })
                .catch_unwind()
                .await;
            let reason = match result {
                Ok(Ok(())) => ExitReason::Normal,
                Ok(Err(fault)) => {
                    log::warn!("{process:?} failed: {fault}");
                    ExitReason::Error(fault.to_string())
                }
                Err(panic) => {
                    let msg = get_panic_string(panic);
                    log::error!("{process:?} panicked: {msg}");
                    ExitReason::Panic(msg)
                }
            };
            node.exit_process(&process, reason);
        });
        Ok(pid)
    }

    fn exit_process(&self, process: &Arc<Process>, reason: ExitReason) {
        let pid = process.pid();
        log::debug!("{process:?} exited: {reason:?}");

        self.inner.by_pid.remove(pid);
        if let Some(name) = process.name() {
            self.inner
                .by_name
                .remove_if(&name, |_, registered| Arc::ptr_eq(registered, process));
        }
        for alias in process.take_aliases() {
            self.inner.by_ref.remove(&alias);
        }
        // monitors this process held on others are moot now
        self.inner
            .by_ref
            .retain(|_, entry| !matches!(entry, RefEntry::Monitor { origin, .. } if origin == pid));

        let reason = reason.to_term();
        for (reference, monitor) in process.take_monitors() {
            let subject = match monitor.by_name {
                Some(name) => Subject::Name(name),
                None => Subject::Pid(pid.clone()),
            };
            self.notify_down(&monitor.origin, &reference, &subject, reason.clone());
        }
    }

    /// Register a live local process under `name`
    pub fn register(&self, name: &str, pid: &Pid) -> Result<(), RegistryErr> {
        let process = self
            .lookup_pid(pid)
            .ok_or_else(|| RegistryErr::NoProcess(pid.clone()))?;
        if let Some(existing) = process.name() {
            return Err(RegistryErr::AlreadyNamed(pid.clone(), existing));
        }
        match self.inner.by_name.entry(name.to_string()) {
            Occupied(_) => return Err(RegistryErr::AlreadyRegistered(name.to_string())),
            Vacant(vacancy) => {
                process.set_name(Some(name.to_string()));
                vacancy.insert(process.clone());
            }
        }
        // lost a race with the process exiting
        if !self.inner.by_pid.contains_key(pid) {
            self.inner
                .by_name
                .remove_if(name, |_, registered| Arc::ptr_eq(registered, &process));
            return Err(RegistryErr::NoProcess(pid.clone()));
        }
        Ok(())
    }

    /// Remove a name registration, returning the pid it pointed to
    pub fn unregister(&self, name: &str) -> Option<Pid> {
        self.inner.by_name.remove(name).map(|(_, process)| {
            process.set_name(None);
            process.pid().clone()
        })
    }

    fn lookup_pid(&self, pid: &Pid) -> Option<Arc<Process>> {
        self.inner.by_pid.get(pid).map(|e| e.value().clone())
    }

    /// Resolve a destination owned by this node
    fn lookup(&self, dest: &Destination) -> Option<Arc<Process>> {
        match dest {
            Destination::Pid(pid) => self.lookup_pid(pid),
            Destination::Alias(alias) => match self.inner.by_ref.get(alias)?.value() {
                RefEntry::Alias(process) => Some(process.clone()),
                RefEntry::Monitor { .. } => None,
            },
            Destination::Name(name) | Destination::Remote { name, .. } => {
                self.inner.by_name.get(name).map(|e| e.value().clone())
            }
        }
    }

    /// The owning node of `dest`, if that's another node
    fn remote_owner<'a>(&self, dest: &'a Destination) -> Option<&'a str> {
        let node: &str = match dest {
            Destination::Pid(pid) => &pid.node,
            Destination::Alias(alias) => &alias.node,
            Destination::Name(_) => return None,
            Destination::Remote { node, .. } => node,
        };
        (!self.is_local(node)).then_some(node)
    }

    fn deliver(&self, dest: &Destination, message: Term) {
        match self.lookup(dest) {
            Some(process) => process.post(message),
            None => log::debug!("No process {dest}, dropping message"),
        }
    }

    fn dispatch(&self, node: &str, control: ControlMessage, payload: Option<Term>) {
        match &self.inner.dist {
            Some(dist) => dist.dispatch(node, control, payload),
            None => log::warn!("'{}' isn't distributed, dropping {control:?} to '{node}'", self.inner.name),
        }
    }

    /// Send `message` to `to`. `sender` identifies the sending process for
    /// remote sends; [None] sends on behalf of the node itself.
    ///
    /// Fire-and-forget: unknown destinations are dropped with a log.
    pub fn send(&self, sender: Option<&Pid>, to: impl Into<Destination>, message: Term) {
        let to = to.into();
        let Some(node) = self.remote_owner(&to) else {
            self.deliver(&to, message);
            return;
        };
        let from = || sender.cloned().unwrap_or_else(|| self.inner.system.clone());
        let control = match &to {
            Destination::Pid(pid) => match sender {
                Some(from) => ControlMessage::SendSender {
                    from: from.clone(),
                    to: pid.clone(),
                },
                None => ControlMessage::Send { to: pid.clone() },
            },
            Destination::Alias(alias) => ControlMessage::AliasSend {
                from: from(),
                alias: alias.clone(),
            },
            Destination::Name(name) | Destination::Remote { name, .. } => ControlMessage::RegSend {
                from: from(),
                to_name: name.clone(),
            },
        };
        self.dispatch(node, control, Some(message));
    }

    /// Have `origin` monitor `target`. `existing` supplies the reference when
    /// re-issuing a monitor requested by a peer; otherwise a fresh one is made.
    ///
    /// A local target which doesn't exist resolves immediately with a `noproc`
    /// DOWN. A remote target is monitored through a `MONITOR_P` to its node.
    pub fn monitor(&self, origin: &Pid, target: &Destination, existing: Option<Reference>) -> Reference {
        let reference = existing.unwrap_or_else(|| self.make_ref());
        if self.is_local(&origin.node) {
            self.inner.by_ref.insert(
                reference.clone(),
                RefEntry::Monitor {
                    origin: origin.clone(),
                    target: target.clone(),
                },
            );
        }

        let subject = match target {
            Destination::Pid(pid) => Subject::Pid(pid.clone()),
            Destination::Name(name) | Destination::Remote { name, .. } => Subject::Name(name.clone()),
            Destination::Alias(alias) => {
                // aliases can be sent to, not monitored
                self.deliver_down(origin, &reference, alias.into(), ExitReason::NoProc.to_term());
                return reference;
            }
        };

        if let Some(node) = self.remote_owner(target) {
            if self.inner.dist.is_none() {
                self.notify_down(origin, &reference, &subject, ExitReason::NoConnection.to_term());
            } else {
                let control = ControlMessage::MonitorP {
                    from: origin.clone(),
                    to: subject,
                    reference: reference.clone(),
                };
                self.dispatch(node, control, None);
            }
            return reference;
        }

        let monitor = Monitor {
            origin: origin.clone(),
            by_name: match &subject {
                Subject::Name(name) => Some(name.clone()),
                Subject::Pid(_) => None,
            },
        };
        match self.lookup(target) {
            Some(process) if process.add_monitored_by(reference.clone(), monitor) => {}
            _ => self.notify_down(origin, &reference, &subject, ExitReason::NoProc.to_term()),
        }
        reference
    }

    /// Remove a monitor set up with [Node::monitor]. No DOWN is delivered for
    /// it afterwards
    pub fn demonitor(&self, origin: &Pid, target: &Destination, reference: &Reference) {
        self.inner
            .by_ref
            .remove_if(reference, |_, entry| matches!(entry, RefEntry::Monitor { .. }));

        let subject = match target {
            Destination::Pid(pid) => Subject::Pid(pid.clone()),
            Destination::Name(name) | Destination::Remote { name, .. } => Subject::Name(name.clone()),
            Destination::Alias(_) => return,
        };
        match self.remote_owner(target) {
            Some(node) => {
                let control = ControlMessage::DemonitorP {
                    from: origin.clone(),
                    to: subject,
                    reference: reference.clone(),
                };
                self.dispatch(node, control, None);
            }
            None => {
                if let Some(process) = self.lookup(target) {
                    process.remove_monitored_by(reference);
                }
            }
        }
    }

    /// The target of a monitor held by a local process
    pub(crate) fn monitor_target(&self, reference: &Reference) -> Option<Destination> {
        match self.inner.by_ref.get(reference)?.value() {
            RefEntry::Monitor { target, .. } => Some(target.clone()),
            RefEntry::Alias(_) => None,
        }
    }

    /// Tell `origin` that `subject` (a process of this node) is down
    fn notify_down(&self, origin: &Pid, reference: &Reference, subject: &Subject, reason: Term) {
        if self.is_local(&origin.node) {
            let item = subject.down_item(&self.inner.name);
            self.deliver_down(origin, reference, item, reason);
        } else {
            let control = ControlMessage::MonitorPExit {
                from: subject.clone(),
                to: origin.clone(),
                reference: reference.clone(),
                reason,
            };
            self.dispatch(&origin.node, control, None);
        }
    }

    /// Post a DOWN to `origin`, resolving its monitor. A monitor which was
    /// removed (or never existed) gets nothing
    fn deliver_down(&self, origin: &Pid, reference: &Reference, item: Term, reason: Term) {
        let resolved = self.inner.by_ref.remove_if(reference, |_, entry| {
            matches!(entry, RefEntry::Monitor { origin: owner, .. } if owner == origin)
        });
        if resolved.is_none() {
            log::debug!("No live monitor {reference} for {origin}, dropping DOWN");
            return;
        }
        match self.lookup_pid(origin) {
            Some(process) => process.post(down_message(reference, item, reason)),
            None => log::debug!("Monitoring process {origin} is gone, dropping DOWN"),
        }
    }

    pub(crate) fn alias_process(&self, process: &Arc<Process>) -> Reference {
        let reference = self.make_ref();
        process.add_alias(reference.clone());
        self.inner
            .by_ref
            .insert(reference.clone(), RefEntry::Alias(process.clone()));
        reference
    }

    /// Create an alias for the live local process `pid`
    pub fn alias(&self, pid: &Pid) -> Option<Reference> {
        self.lookup_pid(pid)
            .map(|process| self.alias_process(&process))
    }

    /// Deactivate an alias. Later sends to it are dropped
    pub fn unalias(&self, reference: &Reference) {
        if let Some((_, RefEntry::Alias(process))) = self
            .inner
            .by_ref
            .remove_if(reference, |_, entry| matches!(entry, RefEntry::Alias(_)))
        {
            process.remove_alias(reference);
        }
    }

    /// Apply one control message received from `peer`. The payload is only
    /// decoded for message-carrying opcodes. Unsupported opcodes are logged
    /// and ignored
    pub(crate) fn handle_control_message(&self, peer: &str, control: ControlMessage, payload: Bytes) {
        let dest = match control {
            ControlMessage::Send { to } | ControlMessage::SendSender { to, .. } => Destination::Pid(to),
            ControlMessage::RegSend { to_name, .. } => Destination::Name(to_name),
            ControlMessage::AliasSend { alias, .. } => Destination::Alias(alias),
            ControlMessage::MonitorP {
                from,
                to,
                reference,
            } => {
                self.monitor(&from, &subject_destination(to), Some(reference));
                return;
            }
            ControlMessage::DemonitorP { to, reference, .. } => {
                if let Some(process) = self.lookup(&subject_destination(to)) {
                    process.remove_monitored_by(&reference);
                }
                return;
            }
            ControlMessage::MonitorPExit {
                from,
                to,
                reference,
                reason,
            } => {
                self.deliver_down(&to, &reference, from.down_item(peer), reason);
                return;
            }
            ControlMessage::Unsupported(op) => {
                log::debug!("Ignoring unsupported control opcode {op} from '{peer}'");
                return;
            }
        };
        match Term::decode(&payload[..]) {
            Ok(message) => self.deliver(&dest, message),
            Err(err) => log::warn!("Dropping undecodable payload from '{peer}' for {dest}: {err}"),
        }
    }

    /// Stop the distribution listener, close every connection and drop the
    /// name-service registration. Local processes keep running
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        if let Some(dist) = &self.inner.dist {
            dist.shutdown();
        }
    }
}

fn subject_destination(subject: Subject) -> Destination {
    match subject {
        Subject::Pid(pid) => Destination::Pid(pid),
        Subject::Name(name) => Destination::Name(name),
    }
}
