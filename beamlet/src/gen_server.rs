// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! `gen_server`-style request/reply on top of process mailboxes.
//!
//! There are 2 kinds of requests, `cast` and `call`, and their definition comes from the
//! standard [Erlang `gen_server`](https://www.erlang.org/doc/man/gen_server.html).
//! A `cast` is a send without waiting on a reply while a `call` waits for the
//! server's reply. The wire shapes match the host runtime's, so a [GenServer]
//! here can serve callers on real peer nodes and vice versa:
//!
//! * call: `{'$gen_call', {CallerPid, Tag}, Request}`, answered with `{Tag, Reply}`
//! * cast: `{'$gen_cast', Request}`
//!
//! Everything else a server receives is handed to [GenServer::handle_info].
//!
//! ```rust
//! use beamlet::gen_server::{self, Caller, GenServer};
//! use beamlet::term::{self, Term};
//! use beamlet::{Node, ProcessContext, ProcessFault};
//!
//! struct Counter;
//!
//! #[async_trait::async_trait]
//! impl GenServer for Counter {
//!     type State = i32;
//!
//!     async fn init(&self, _ctx: &mut ProcessContext) -> Result<i32, ProcessFault> {
//!         Ok(0)
//!     }
//!
//!     async fn handle_call(
//!         &self,
//!         _ctx: &mut ProcessContext,
//!         _request: Term,
//!         _from: &Caller,
//!         state: &mut i32,
//!     ) -> Result<Option<Term>, ProcessFault> {
//!         *state += 1;
//!         Ok(Some(term::int(*state)))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let node = Node::new_local("doc@localhost");
//! gen_server::start(&node, Some("counter"), Counter).expect("Failed to start the counter");
//! # }
//! ```

use crate::concurrency::Duration;
use crate::errors::{CallErr, ProcessFault, SpawnErr};
use crate::node::Node;
use crate::process::ProcessContext;
use crate::term::{self, Destination, Pid, Term};

const GEN_CALL: &str = "$gen_call";
const GEN_CAST: &str = "$gen_cast";

/// Who sent a call, and the tag its reply must carry
#[derive(Debug, Clone, PartialEq)]
pub struct Caller {
    /// The calling process
    pub pid: Pid,
    /// The opaque reply tag. Either a reference, or `[alias | Ref]` when the
    /// caller wants the reply sent to an alias
    pub tag: Term,
}

impl Caller {
    fn from_term(from: &Term) -> Option<Self> {
        match term::as_tuple(from)? {
            [Term::Pid(pid), tag] => Some(Self {
                pid: pid.into(),
                tag: tag.clone(),
            }),
            _ => None,
        }
    }

    /// Where the reply goes: the alias inside an `[alias | Ref]` tag, or the
    /// calling pid
    fn reply_destination(&self) -> Destination {
        if let Term::ImproperList(list) = &self.tag {
            if let ([alias], Term::Reference(reference)) = (list.elements.as_slice(), &*list.last) {
                if term::is_atom(alias, "alias") {
                    return Destination::Alias((&**reference).into());
                }
            }
        }
        Destination::Pid(self.pid.clone())
    }
}

enum Request {
    Call(Caller, Term),
    Cast(Term),
    Info(Term),
}

impl Request {
    fn classify(message: Term) -> Self {
        let parsed = match term::as_tuple(&message) {
            Some([kind, from, request]) if term::is_atom(kind, GEN_CALL) => {
                Caller::from_term(from).map(|caller| Self::Call(caller, request.clone()))
            }
            Some([kind, request]) if term::is_atom(kind, GEN_CAST) => Some(Self::Cast(request.clone())),
            _ => None,
        };
        parsed.unwrap_or(Self::Info(message))
    }
}

/// A request/reply server. Every handler runs inside the server's process, with
/// its [ProcessContext]. Returning an error from any handler terminates the
/// server, and its monitors get a DOWN with the error.
#[async_trait::async_trait]
pub trait GenServer: Sized + Send + Sync + 'static {
    /// The state the server threads through its handlers
    type State: Send + 'static;

    /// Invoked once, inside the new process, before any request is handled.
    /// Returns the initial state
    async fn init(&self, ctx: &mut ProcessContext) -> Result<Self::State, ProcessFault>;

    /// Handle a call. Return `Some(reply)` to answer immediately, or [None] to
    /// answer later with [reply]
    #[allow(unused_variables)]
    async fn handle_call(
        &self,
        ctx: &mut ProcessContext,
        request: Term,
        from: &Caller,
        state: &mut Self::State,
    ) -> Result<Option<Term>, ProcessFault> {
        log::warn!("{} got an unexpected call {request:?}", ctx.self_pid());
        Ok(None)
    }

    /// Handle a cast
    #[allow(unused_variables)]
    async fn handle_cast(
        &self,
        ctx: &mut ProcessContext,
        request: Term,
        state: &mut Self::State,
    ) -> Result<(), ProcessFault> {
        Ok(())
    }

    /// Handle any other message
    #[allow(unused_variables)]
    async fn handle_info(
        &self,
        ctx: &mut ProcessContext,
        message: Term,
        state: &mut Self::State,
    ) -> Result<(), ProcessFault> {
        Ok(())
    }
}

/// Spawn `server` on `node`, optionally registered as `name`
pub fn start<G: GenServer>(node: &Node, name: Option<&str>, server: G) -> Result<Pid, SpawnErr> {
    node.spawn(name, move |ctx| serve(server, ctx))
}

async fn serve<G: GenServer>(server: G, mut ctx: ProcessContext) -> Result<(), ProcessFault> {
    let mut state = server.init(&mut ctx).await?;
    loop {
        match Request::classify(ctx.receive().await) {
            Request::Call(caller, request) => {
                if let Some(answer) = server
                    .handle_call(&mut ctx, request, &caller, &mut state)
                    .await?
                {
                    reply(&ctx, &caller, answer);
                }
            }
            Request::Cast(request) => server.handle_cast(&mut ctx, request, &mut state).await?,
            Request::Info(message) => server.handle_info(&mut ctx, message, &mut state).await?,
        }
    }
}

/// Answer a call
pub fn reply(ctx: &ProcessContext, to: &Caller, answer: Term) {
    ctx.send(to.reply_destination(), term::tuple(vec![to.tag.clone(), answer]));
}

/// Send `request` to `server` without waiting for anything
pub fn cast(ctx: &ProcessContext, server: impl Into<Destination>, request: Term) {
    ctx.send(server, term::tuple(vec![term::atom(GEN_CAST), request]));
}

/// Send `request` to `server` and wait up to `timeout` (forever with [None])
/// for its reply.
///
/// The server is monitored for the duration of the call, so a server which
/// doesn't exist or dies before replying fails the call with [CallErr::Down]
/// rather than a timeout. The monitor is removed in every case, and a DOWN
/// which raced the reply is flushed from the mailbox.
pub async fn call(
    ctx: &mut ProcessContext,
    server: impl Into<Destination>,
    request: Term,
    timeout: Option<Duration>,
) -> Result<Term, CallErr> {
    let server = server.into();
    let reference = ctx.monitor(server.clone());
    let tag: Term = (&reference).into();
    let from = term::tuple(vec![ctx.self_pid().into(), tag.clone()]);
    ctx.send(
        server,
        term::tuple(vec![term::atom(GEN_CALL), from, request]),
    );

    let result = ctx
        .receive_match(answers(tag.clone()), timeout)
        .await;
    ctx.demonitor(&reference);
    let _ = ctx
        .receive_match(answers(tag), Some(Duration::ZERO))
        .await;

    let message = result.map_err(|_| CallErr::Timeout)?;
    match term::as_tuple(&message) {
        Some([_, answer]) => Ok(answer.clone()),
        Some([.., reason]) => Err(CallErr::Down(reason.clone())),
        _ => Err(CallErr::Timeout),
    }
}

/// Matches the reply `{Tag, Reply}` or the monitor's `{'DOWN', Tag, process, _, _}`
fn answers(tag: Term) -> impl Fn(&Term) -> bool + Send + 'static {
    move |message| match term::as_tuple(message) {
        Some([t, _]) => *t == tag,
        Some([down, t, _, _, _]) => *t == tag && term::is_atom(down, "DOWN"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency;

    struct Counter;

    #[async_trait::async_trait]
    impl GenServer for Counter {
        type State = i32;

        async fn init(&self, _ctx: &mut ProcessContext) -> Result<i32, ProcessFault> {
            Ok(0)
        }

        async fn handle_call(
            &self,
            _ctx: &mut ProcessContext,
            request: Term,
            _from: &Caller,
            state: &mut i32,
        ) -> Result<Option<Term>, ProcessFault> {
            if term::is_atom(&request, "get") {
                Ok(Some(term::int(*state)))
            } else if term::is_atom(&request, "crash") {
                Err("asked to crash".into())
            } else {
                // never answered
                Ok(None)
            }
        }

        async fn handle_cast(
            &self,
            _ctx: &mut ProcessContext,
            request: Term,
            state: &mut i32,
        ) -> Result<(), ProcessFault> {
            if term::is_atom(&request, "incr") {
                *state += 1;
            }
            Ok(())
        }
    }

    /// Run `f` inside a client process and hand back its output
    async fn as_client<F, Fut, T>(node: &Node, f: F) -> T
    where
        F: FnOnce(ProcessContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = concurrency::oneshot();
        node.spawn(None, move |ctx| async move {
            let _ = tx.send(f(ctx).await);
            Ok(())
        })
        .expect("Failed to spawn the client");
        rx.await.expect("The client failed")
    }

    #[crate::concurrency::test]
    async fn cast_then_call() {
        let node = Node::new_local("gen@localhost");
        start(&node, Some("counter"), Counter).expect("Failed to start");

        let got = as_client(&node, |mut ctx| async move {
            cast(&ctx, "counter", term::atom("incr"));
            cast(&ctx, "counter", term::atom("incr"));
            call(&mut ctx, "counter", term::atom("get"), Some(Duration::from_secs(1))).await
        })
        .await;
        assert_eq!(Ok(term::int(2)), got);
    }

    #[crate::concurrency::test]
    async fn call_to_nobody_is_down_noproc() {
        let node = Node::new_local("gen@localhost");
        let got = as_client(&node, |mut ctx| async move {
            call(&mut ctx, "nobody", term::atom("get"), Some(Duration::from_secs(1))).await
        })
        .await;
        assert_eq!(Err(CallErr::Down(term::atom("noproc"))), got);
    }

    #[crate::concurrency::test]
    async fn server_crash_fails_the_call() {
        let node = Node::new_local("gen@localhost");
        start(&node, Some("counter"), Counter).expect("Failed to start");
        let got = as_client(&node, |mut ctx| async move {
            call(&mut ctx, "counter", term::atom("crash"), Some(Duration::from_secs(1))).await
        })
        .await;
        assert!(matches!(got, Err(CallErr::Down(reason)) if reason != term::atom("noproc")));
        assert_eq!(None, node.whereis("counter"));
    }

    #[crate::concurrency::test]
    async fn unanswered_call_times_out_and_cleans_up() {
        let node = Node::new_local("gen@localhost");
        let server = start(&node, None, Counter).expect("Failed to start");
        let (got, leftovers) = as_client(&node, move |mut ctx| async move {
            let got = call(
                &mut ctx,
                &server,
                term::atom("ignored"),
                Some(Duration::from_millis(50)),
            )
            .await;
            let leftovers = ctx.receive_timeout(Duration::from_millis(50)).await;
            (got, leftovers)
        })
        .await;
        assert_eq!(Err(CallErr::Timeout), got);
        assert!(leftovers.is_err());
    }

    #[test]
    fn alias_tags_reply_to_the_alias() {
        let node = Node::new_local("gen@localhost");
        let reference = node.make_ref();
        let pid = Pid {
            node: std::sync::Arc::from("gen@localhost"),
            id: 1,
            serial: 0,
            creation: 0,
        };
        let tag = Term::ImproperList(eetf::ImproperList {
            elements: vec![term::atom("alias")],
            last: Box::new((&reference).into()),
        });
        let caller = Caller::from_term(&term::tuple(vec![(&pid).into(), tag]))
            .expect("Valid caller");
        assert_eq!(Destination::Alias(reference.clone()), caller.reply_destination());

        let plain = Caller::from_term(&term::tuple(vec![(&pid).into(), (&reference).into()]))
            .expect("Valid caller");
        assert_eq!(Destination::Pid(pid), plain.reply_destination());
    }

    #[test]
    fn requests_are_classified() {
        let pid = Pid {
            node: std::sync::Arc::from("gen@localhost"),
            id: 1,
            serial: 0,
            creation: 0,
        };
        let call = term::tuple(vec![
            term::atom(GEN_CALL),
            term::tuple(vec![(&pid).into(), term::int(1)]),
            term::atom("req"),
        ]);
        assert!(matches!(Request::classify(call), Request::Call(c, _) if c.pid == pid));
        let cast = term::tuple(vec![term::atom(GEN_CAST), term::atom("req")]);
        assert!(matches!(Request::classify(cast), Request::Cast(_)));
        // a malformed call is just info
        let bad = term::tuple(vec![term::atom(GEN_CALL), term::int(1), term::atom("req")]);
        assert!(matches!(Request::classify(bad), Request::Info(_)));
    }
}
