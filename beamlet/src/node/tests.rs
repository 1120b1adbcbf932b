// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

use super::*;
use crate::concurrency::{self, Duration, OneshotReceiver};
use crate::errors::ReceiveTimeout;
use crate::term;

const NODE: &str = "registry@localhost";
const PEER: &str = "peer@localhost";

fn peer_pid(id: u32) -> Pid {
    Pid {
        node: Arc::from(PEER),
        id,
        serial: 0,
        creation: 2,
    }
}

fn encode(t: &Term) -> Bytes {
    let mut buf = Vec::new();
    t.encode(&mut buf).expect("Failed to encode");
    Bytes::from(buf)
}

/// Spawn a process which reports the first message it receives (or a timeout)
fn spawn_inbox(node: &Node, name: Option<&str>) -> (Pid, OneshotReceiver<Result<Term, ReceiveTimeout>>) {
    let (tx, rx) = concurrency::oneshot();
    let pid = node
        .spawn(name, |mut ctx| async move {
            let got = ctx.receive_timeout(Duration::from_millis(500)).await;
            let _ = tx.send(got);
            Ok(())
        })
        .expect("Failed to spawn");
    (pid, rx)
}

#[crate::concurrency::test]
async fn duplicate_names_are_rejected() {
    let node = Node::new_local(NODE);
    let (first, _rx) = spawn_inbox(&node, Some("svc"));
    let second = node.spawn(Some("svc"), |_ctx| async move { Ok(()) });
    assert!(matches!(second, Err(SpawnErr::AlreadyRegistered(name)) if name == "svc"));
    assert_eq!(Some(first), node.whereis("svc"));
}

#[crate::concurrency::test]
async fn register_and_unregister() {
    let node = Node::new_local(NODE);
    let (a, _rx_a) = spawn_inbox(&node, None);
    let (b, _rx_b) = spawn_inbox(&node, None);

    node.register("a", &a).expect("Failed to register");
    assert_eq!(Some(a.clone()), node.whereis("a"));
    assert!(matches!(
        node.register("a", &b),
        Err(RegistryErr::AlreadyRegistered(_))
    ));
    assert!(matches!(
        node.register("other", &a),
        Err(RegistryErr::AlreadyNamed(_, name)) if name == "a"
    ));
    assert_eq!(vec!["a".to_string()], node.registered());

    assert_eq!(Some(a.clone()), node.unregister("a"));
    assert_eq!(None, node.whereis("a"));
    assert_eq!(None, node.unregister("a"));
    node.register("b", &b).expect("Failed to register");
    node.register("a-again", &a).expect("Names are reusable after unregister");
}

#[crate::concurrency::test]
async fn registering_a_dead_pid_fails() {
    let node = Node::new_local(NODE);
    let ghost = Pid {
        node: Arc::from(NODE),
        id: 999,
        serial: 0,
        creation: 0,
    };
    assert!(matches!(
        node.register("ghost", &ghost),
        Err(RegistryErr::NoProcess(_))
    ));
}

#[crate::concurrency::test]
async fn sends_by_name() {
    let node = Node::new_local(NODE);
    let (_pid, rx) = spawn_inbox(&node, Some("inbox"));
    node.send(None, "inbox", term::atom("hello"));
    assert_eq!(Ok(term::atom("hello")), rx.await.expect("Process failed"));
}

#[crate::concurrency::test]
async fn remote_shaped_sends_to_ourselves_stay_local() {
    let node = Node::new_local(NODE);
    let (_pid, rx) = spawn_inbox(&node, Some("inbox"));
    node.send(None, Destination::remote("inbox", NODE), term::atom("hello"));
    assert_eq!(Ok(term::atom("hello")), rx.await.expect("Process failed"));
}

#[crate::concurrency::test]
async fn unroutable_sends_are_dropped() {
    let node = Node::new_local(NODE);
    node.send(None, "nobody", term::atom("lost"));
    // no distribution, so remote sends go nowhere either
    node.send(None, &peer_pid(1), term::atom("lost"));
    node.send(None, Destination::remote("svc", PEER), term::atom("lost"));
    assert!(node.processes().is_empty());
}

#[crate::concurrency::test]
async fn inbound_sends_are_delivered() {
    let node = Node::new_local(NODE);
    let (pid, rx) = spawn_inbox(&node, None);
    let payload = term::tuple(vec![term::atom("from_peer"), term::int(1)]);
    node.handle_control_message(
        PEER,
        ControlMessage::SendSender {
            from: peer_pid(1),
            to: pid,
        },
        encode(&payload),
    );
    assert_eq!(Ok(payload), rx.await.expect("Process failed"));
}

#[crate::concurrency::test]
async fn inbound_reg_send_and_alias_send() {
    let node = Node::new_local(NODE);
    let (_pid, by_name) = spawn_inbox(&node, Some("svc"));
    node.handle_control_message(
        PEER,
        ControlMessage::RegSend {
            from: peer_pid(1),
            to_name: "svc".to_string(),
        },
        encode(&term::atom("by_name")),
    );
    assert_eq!(Ok(term::atom("by_name")), by_name.await.expect("Process failed"));

    let (pid, by_alias) = spawn_inbox(&node, None);
    let alias = node.alias(&pid).expect("Process is alive");
    node.handle_control_message(
        PEER,
        ControlMessage::AliasSend {
            from: peer_pid(1),
            alias,
        },
        encode(&term::atom("by_alias")),
    );
    assert_eq!(Ok(term::atom("by_alias")), by_alias.await.expect("Process failed"));
}

#[crate::concurrency::test]
async fn bad_payloads_and_unknown_opcodes_are_ignored() {
    let node = Node::new_local(NODE);
    let (pid, rx) = spawn_inbox(&node, None);
    node.handle_control_message(
        PEER,
        ControlMessage::Send { to: pid.clone() },
        Bytes::from_static(&[131, 255]),
    );
    node.handle_control_message(PEER, ControlMessage::Unsupported(29), Bytes::new());
    assert_eq!(Err(ReceiveTimeout), rx.await.expect("Process failed"));
}

/// The bookkeeping [Node::monitor] leaves behind once its `MONITOR_P` is on
/// the wire to `PEER`
fn remote_monitor(node: &Node, origin: &Pid, target: &Destination) -> Reference {
    let reference = node.make_ref();
    node.inner.by_ref.insert(
        reference.clone(),
        RefEntry::Monitor {
            origin: origin.clone(),
            target: target.clone(),
        },
    );
    reference
}

fn monitor_exit(to: &Pid, reference: &Reference) -> ControlMessage {
    ControlMessage::MonitorPExit {
        from: Subject::Name("svc".to_string()),
        to: to.clone(),
        reference: reference.clone(),
        reason: term::atom("killed"),
    }
}

#[crate::concurrency::test]
async fn inbound_monitor_exit_becomes_down() {
    let node = Node::new_local(NODE);
    let (pid, rx) = spawn_inbox(&node, None);
    let reference = remote_monitor(&node, &pid, &Destination::remote("svc", PEER));
    node.handle_control_message(PEER, monitor_exit(&pid, &reference), Bytes::new());
    let expected = down_message(
        &reference,
        term::tuple(vec![term::atom("svc"), term::atom(PEER)]),
        term::atom("killed"),
    );
    assert_eq!(Ok(expected), rx.await.expect("Process failed"));
    assert_eq!(None, node.monitor_target(&reference));
}

#[crate::concurrency::test]
async fn monitor_exit_after_demonitor_is_dropped() {
    let node = Node::new_local(NODE);
    let (pid, rx) = spawn_inbox(&node, None);
    let target = Destination::remote("svc", PEER);
    let reference = remote_monitor(&node, &pid, &target);
    node.demonitor(&pid, &target, &reference);

    // the peer wrote its exit before it saw our DEMONITOR_P
    node.handle_control_message(PEER, monitor_exit(&pid, &reference), Bytes::new());
    assert_eq!(Err(ReceiveTimeout), rx.await.expect("Process failed"));
}

#[crate::concurrency::test]
async fn monitor_exit_for_an_unknown_reference_is_dropped() {
    let node = Node::new_local(NODE);
    let (pid, rx) = spawn_inbox(&node, None);
    let (other, _other_rx) = spawn_inbox(&node, None);
    let stranger = node.make_ref();
    node.handle_control_message(PEER, monitor_exit(&pid, &stranger), Bytes::new());

    // a live monitor, but held by someone else
    let theirs = remote_monitor(&node, &other, &Destination::remote("svc", PEER));
    node.handle_control_message(PEER, monitor_exit(&pid, &theirs), Bytes::new());
    assert_eq!(Err(ReceiveTimeout), rx.await.expect("Process failed"));
    assert!(node.monitor_target(&theirs).is_some());
}

#[crate::concurrency::test]
async fn inbound_monitor_and_demonitor_are_recorded() {
    let node = Node::new_local(NODE);
    let (pid, _rx) = spawn_inbox(&node, Some("svc"));
    let process = node.lookup_pid(&pid).expect("Process is alive");
    let reference = node.make_ref();

    node.handle_control_message(
        PEER,
        ControlMessage::MonitorP {
            from: peer_pid(1),
            to: Subject::Name("svc".to_string()),
            reference: reference.clone(),
        },
        Bytes::new(),
    );
    assert_eq!(1, process.monitor_count());

    node.handle_control_message(
        PEER,
        ControlMessage::DemonitorP {
            from: peer_pid(1),
            to: Subject::Pid(pid),
            reference,
        },
        Bytes::new(),
    );
    assert_eq!(0, process.monitor_count());
}

#[crate::concurrency::test]
async fn monitoring_a_remote_process_without_distribution_is_noconnection() {
    let node = Node::new_local(NODE);
    let (tx, rx) = concurrency::oneshot();
    node.spawn(None, |mut ctx| async move {
        ctx.monitor(&peer_pid(7));
        let down = ctx.receive_timeout(Duration::from_millis(500)).await;
        let _ = tx.send(down);
        Ok(())
    })
    .expect("Failed to spawn");
    let down = rx.await.expect("Process failed").expect("No DOWN arrived");
    let elements = term::as_tuple(&down).expect("DOWN is a tuple");
    assert_eq!(Term::from(&peer_pid(7)), elements[3]);
    assert!(term::is_atom(&elements[4], "noconnection"));
}
