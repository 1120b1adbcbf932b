// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Interop scenarios against real peers

use std::time::Duration;

use beamlet::term::{self, Destination, Term};
use beamlet::{Node, NodeConfig};

const ECHO: &str = "echo";

/// Run with
///
/// ```bash
/// RUST_LOG=debug cargo run -p beamlet_playground -- echo --name hidden
/// ```
///
/// then from an `erl -sname peer` shell: `{echo, 'hidden@localhost'} ! {self(), hi}, flush().`
pub(crate) async fn run_echo(config: NodeConfig) -> Result<(), String> {
    let node = Node::start(config).await.map_err(|err| err.to_string())?;

    node.spawn(Some(ECHO), |mut ctx| async move {
        loop {
            let message = ctx.receive().await;
            if term::is_atom(&message, "stop") {
                break;
            }
            match term::as_tuple(&message) {
                Some([from, payload]) => match Destination::from_term(from) {
                    Some(reply_to) => {
                        log::info!("Echoing {payload:?} to {reply_to:?}");
                        ctx.send(reply_to, payload.clone());
                    }
                    None => log::warn!("Can't reply to {from:?}"),
                },
                _ => log::warn!("Ignoring {message:?}"),
            }
        }
        log::info!("echo stopped");
        Ok(())
    })
    .map_err(|err| err.to_string())?;

    log::info!("{} is echoing, Ctrl-C to stop", node.name());
    tokio::signal::ctrl_c()
        .await
        .map_err(|err| format!("Failed to wait for Ctrl-C: {err}"))?;

    log::warn!("Terminating echo node");
    node.shutdown();
    Ok(())
}

/// Run with
///
/// ```bash
/// RUST_LOG=debug cargo run -p beamlet_playground -- ping --name pinger --peer hidden@localhost
/// ```
pub(crate) async fn run_ping(
    config: NodeConfig,
    peer: &str,
    message: &str,
    timeout: Duration,
) -> Result<(), String> {
    let node = Node::start(config).await.map_err(|err| err.to_string())?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    let peer = peer.to_string();
    let payload = term::binary(message.as_bytes());
    node.spawn(None, move |mut ctx| async move {
        let me: Term = ctx.self_pid().into();
        ctx.send(
            Destination::remote(ECHO, peer),
            term::tuple(vec![me, payload]),
        );
        let _ = tx.send(ctx.receive_timeout(timeout).await);
        Ok(())
    })
    .map_err(|err| err.to_string())?;

    let outcome = rx
        .await
        .map_err(|_| "The ping process exited early".to_string());
    node.shutdown();

    match outcome? {
        Ok(reply) => {
            println!("{reply:?}");
            Ok(())
        }
        Err(err) => Err(format!("No reply within {timeout:?}: {err}")),
    }
}
