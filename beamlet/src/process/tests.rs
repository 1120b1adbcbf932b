// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

use std::collections::HashSet;
use std::sync::Arc;

use super::*;
use crate::concurrency::{self, Instant};
use crate::term::{self, Term};

fn is_int(value: i32) -> impl Fn(&Term) -> bool + Send + 'static {
    move |t| *t == term::int(value)
}

// ============== Mailbox ============== //

#[crate::concurrency::test]
async fn stored_messages_come_out_in_order() {
    let mailbox = Mailbox::new();
    for i in 0..5 {
        mailbox.post(term::int(i));
    }
    for i in 0..5 {
        let msg = mailbox
            .take(Box::new(|_| true), None)
            .await
            .expect("Mailbox had messages");
        assert_eq!(term::int(i), msg);
    }
    assert!(mailbox.is_empty());
}

#[crate::concurrency::test]
async fn selective_take_preserves_the_rest() {
    let mailbox = Mailbox::new();
    for i in 0..5 {
        mailbox.post(term::int(i));
    }
    let msg = mailbox
        .take(Box::new(is_int(3)), None)
        .await
        .expect("3 is in the mailbox");
    assert_eq!(term::int(3), msg);
    assert_eq!(
        vec![term::int(0), term::int(1), term::int(2), term::int(4)],
        mailbox.snapshot()
    );
}

#[crate::concurrency::test]
async fn timed_out_take_leaves_the_mailbox_alone() {
    let mailbox = Mailbox::new();
    mailbox.post(term::atom("a"));
    mailbox.post(term::atom("b"));

    let timeout = Duration::from_millis(50);
    let started = Instant::now();
    let result = mailbox.take(Box::new(is_int(1)), Some(timeout)).await;
    assert_eq!(Err(ReceiveTimeout), result);
    assert!(started.elapsed() >= timeout);
    assert_eq!(vec![term::atom("a"), term::atom("b")], mailbox.snapshot());

    // and nothing was left armed: a later match goes to storage
    mailbox.post(term::int(1));
    assert_eq!(3, mailbox.len());
}

#[crate::concurrency::test]
async fn zero_timeout_only_scans() {
    let mailbox = Mailbox::new();
    mailbox.post(term::int(7));
    assert_eq!(
        Ok(term::int(7)),
        mailbox.take(Box::new(is_int(7)), Some(Duration::ZERO)).await
    );
    assert_eq!(
        Err(ReceiveTimeout),
        mailbox.take(Box::new(is_int(7)), Some(Duration::ZERO)).await
    );
}

#[crate::concurrency::test]
async fn waiting_taker_gets_the_first_match_directly() {
    let mailbox = Arc::new(Mailbox::new());
    let waiter = {
        let mailbox = mailbox.clone();
        concurrency::spawn(async move { mailbox.take(Box::new(is_int(2)), None).await })
    };
    // let the waiter arm
    concurrency::sleep(Duration::from_millis(10)).await;

    mailbox.post(term::int(1));
    mailbox.post(term::int(2));
    mailbox.post(term::int(2));

    let got = waiter.await.expect("Waiter panicked");
    assert_eq!(Ok(term::int(2)), got);
    // the non-matching message and the second match were stored
    assert_eq!(vec![term::int(1), term::int(2)], mailbox.snapshot());
}

#[crate::concurrency::test]
async fn dropped_take_disarms() {
    let mailbox = Arc::new(Mailbox::new());
    let waiter = {
        let mailbox = mailbox.clone();
        concurrency::spawn(async move { mailbox.take(Box::new(|_| true), None).await })
    };
    concurrency::sleep(Duration::from_millis(10)).await;
    waiter.abort();
    let _ = waiter.await;

    mailbox.post(term::atom("kept"));
    assert_eq!(vec![term::atom("kept")], mailbox.snapshot());
}

// ============== Processes ============== //

#[crate::concurrency::test]
async fn pids_are_unique() {
    let node = Node::new_local("test@localhost");
    let mut seen = HashSet::new();
    for _ in 0..100 {
        let pid = node
            .spawn(None, |_ctx| async move { Ok(()) })
            .expect("Failed to spawn");
        assert!(pid.is_local_to("test@localhost"));
        assert!(seen.insert(pid));
    }
}

#[crate::concurrency::test]
async fn messages_from_one_sender_arrive_in_order() {
    let node = Node::new_local("test@localhost");
    let (tx, rx) = concurrency::oneshot();
    let receiver = node
        .spawn(None, |mut ctx| async move {
            let mut got = Vec::new();
            for _ in 0..10 {
                got.push(ctx.receive().await);
            }
            let _ = tx.send(got);
            Ok(())
        })
        .expect("Failed to spawn the receiver");

    node.spawn(None, move |ctx| async move {
        for i in 0..10 {
            ctx.send(&receiver, term::int(i));
        }
        Ok(())
    })
    .expect("Failed to spawn the sender");

    let got = rx.await.expect("Receiver failed");
    assert_eq!((0..10).map(term::int).collect::<Vec<_>>(), got);
}

async fn down_reason_of<F, Fut>(node: &Node, body: F) -> Term
where
    F: FnOnce(ProcessContext) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), ProcessFault>> + Send + 'static,
{
    let (go_tx, go_rx) = concurrency::oneshot::<()>();
    let target = node
        .spawn(None, move |ctx| async move {
            let _ = go_rx.await;
            body(ctx).await
        })
        .expect("Failed to spawn the target");

    let (tx, rx) = concurrency::oneshot();
    node.spawn(None, move |mut ctx| async move {
        let reference = ctx.monitor(&target);
        let _ = go_tx.send(());
        let down = ctx.receive().await;
        let _ = tx.send((reference, target, down));
        Ok(())
    })
    .expect("Failed to spawn the monitor");

    let (reference, target, down) = rx.await.expect("Monitoring process failed");
    let elements = term::as_tuple(&down).expect("DOWN is a tuple");
    assert!(term::is_atom(&elements[0], "DOWN"));
    assert_eq!(Term::from(&reference), elements[1]);
    assert!(term::is_atom(&elements[2], "process"));
    assert_eq!(Term::from(&target), elements[3]);
    elements[4].clone()
}

#[crate::concurrency::test]
async fn down_on_normal_exit() {
    let node = Node::new_local("test@localhost");
    let reason = down_reason_of(&node, |_ctx| async move { Ok(()) }).await;
    assert_eq!(term::atom("normal"), reason);
}

#[crate::concurrency::test]
async fn down_on_error() {
    let node = Node::new_local("test@localhost");
    let reason = down_reason_of(&node, |_ctx| async move { Err("boom".into()) }).await;
    assert_eq!(ExitReason::Error("boom".to_string()).to_term(), reason);
}

async fn explode() -> Result<(), ProcessFault> {
    panic!("Boom!")
}

#[crate::concurrency::test]
async fn down_on_panic() {
    let node = Node::new_local("test@localhost");
    let reason = down_reason_of(&node, |_ctx| explode()).await;
    assert_eq!(ExitReason::Panic("Boom!".to_string()).to_term(), reason);
}

#[crate::concurrency::test]
async fn exited_processes_leave_the_registry() {
    let node = Node::new_local("test@localhost");
    let (go_tx, go_rx) = concurrency::oneshot::<()>();
    let pid = node
        .spawn(Some("short-lived"), |_ctx| async move {
            let _ = go_rx.await;
            Ok(())
        })
        .expect("Failed to spawn");
    assert_eq!(Some(pid.clone()), node.whereis("short-lived"));
    assert!(node.processes().contains(&pid));

    let _ = go_tx.send(());
    let deadline = Instant::now() + Duration::from_secs(1);
    while node.processes().contains(&pid) && Instant::now() < deadline {
        concurrency::sleep(Duration::from_millis(5)).await;
    }
    assert!(!node.processes().contains(&pid));
    assert_eq!(None, node.whereis("short-lived"));
}

#[crate::concurrency::test]
async fn demonitor_suppresses_down() {
    let node = Node::new_local("test@localhost");
    let (stop_tx, stop_rx) = concurrency::oneshot::<()>();
    let target = node
        .spawn(None, |_ctx| async move {
            let _ = stop_rx.await;
            Ok(())
        })
        .expect("Failed to spawn the target");

    let (tx, rx) = concurrency::oneshot();
    node.spawn(None, move |mut ctx| async move {
        let reference = ctx.monitor(&target);
        ctx.demonitor(&reference);
        let _ = stop_tx.send(());
        let got = ctx.receive_timeout(Duration::from_millis(100)).await;
        let _ = tx.send(got);
        Ok(())
    })
    .expect("Failed to spawn the monitor");

    assert_eq!(Err(ReceiveTimeout), rx.await.expect("Monitor failed"));
}

#[crate::concurrency::test]
async fn monitoring_nothing_is_noproc() {
    let node = Node::new_local("test@localhost");
    let (tx, rx) = concurrency::oneshot();
    node.spawn(None, |mut ctx| async move {
        let reference = ctx.monitor("nobody");
        let down = ctx.receive().await;
        let _ = tx.send((reference, down));
        Ok(())
    })
    .expect("Failed to spawn");

    let (reference, down) = rx.await.expect("Monitor failed");
    let expected = down_message(
        &reference,
        term::tuple(vec![term::atom("nobody"), term::atom("test@localhost")]),
        term::atom("noproc"),
    );
    assert_eq!(expected, down);
}

#[crate::concurrency::test]
async fn aliases_route_until_deactivated() {
    let node = Node::new_local("test@localhost");
    let (alias_tx, alias_rx) = concurrency::oneshot();
    let (tx, rx) = concurrency::oneshot();
    node.spawn(None, |mut ctx| async move {
        let alias = ctx.alias();
        let _ = alias_tx.send(alias.clone());
        let first = ctx.receive().await;
        ctx.unalias(&alias);
        let second = ctx.receive_timeout(Duration::from_millis(100)).await;
        let _ = tx.send((first, second));
        Ok(())
    })
    .expect("Failed to spawn");

    let alias = alias_rx.await.expect("No alias");
    node.send(None, alias.clone(), term::atom("one"));
    // give the process time to deactivate the alias
    concurrency::sleep(Duration::from_millis(20)).await;
    node.send(None, alias, term::atom("two"));

    let (first, second) = rx.await.expect("Process failed");
    assert_eq!(term::atom("one"), first);
    assert_eq!(Err(ReceiveTimeout), second);
}

#[crate::concurrency::test]
async fn selective_receive_in_a_process() {
    let node = Node::new_local("test@localhost");
    let (tx, rx) = concurrency::oneshot();
    let pid = node
        .spawn(None, |mut ctx| async move {
            let wanted = ctx
                .receive_match(|t| term::is_atom(t, "wanted"), Some(Duration::from_secs(1)))
                .await?;
            let next = ctx.receive().await;
            let _ = tx.send((wanted, next));
            Ok(())
        })
        .expect("Failed to spawn");

    node.send(None, &pid, term::atom("other"));
    node.send(None, &pid, term::atom("wanted"));

    let (wanted, next) = rx.await.expect("Process failed");
    assert_eq!(term::atom("wanted"), wanted);
    assert_eq!(term::atom("other"), next);
}
