// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

#[macro_use]
extern crate criterion;

use beamlet::process::Mailbox;
use beamlet::term;
use beamlet::Node;
use criterion::BatchSize;
use criterion::Criterion;

fn post_then_receive(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    for size in [100, 10000] {
        let id = format!("Posting then receiving {size} messages");
        c.bench_function(&id, |b| {
            b.iter_batched(
                || {
                    let mailbox = Mailbox::new();
                    for i in 0..size {
                        mailbox.post(term::int(i));
                    }
                    mailbox
                },
                |mailbox| {
                    runtime.block_on(async move {
                        for _ in 0..size {
                            mailbox.take(Box::new(|_| true), None).await.unwrap();
                        }
                    })
                },
                BatchSize::PerIteration,
            );
        });
    }
}

fn selective_receive(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    for size in [100, 1000] {
        let id = format!("Selecting the last of {size} stored messages");
        c.bench_function(&id, |b| {
            b.iter_batched(
                || {
                    let mailbox = Mailbox::new();
                    for i in 0..size {
                        mailbox.post(term::int(i));
                    }
                    mailbox
                },
                |mailbox| {
                    runtime.block_on(async move {
                        let last = term::int(size - 1);
                        mailbox
                            .take(Box::new(move |t| *t == last), None)
                            .await
                            .unwrap()
                    })
                },
                BatchSize::PerIteration,
            );
        });
    }
}

fn process_messages(c: &mut Criterion) {
    const NUM_MSGS: i32 = 100000;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let id = format!("Waiting on {NUM_MSGS} messages to be processed");
    c.bench_function(&id, |b| {
        b.iter_batched(
            || {
                runtime.block_on(async move {
                    let node = Node::new_local("bench@localhost");
                    let (tx, rx) = tokio::sync::oneshot::channel();
                    let pid = node
                        .spawn(None, |mut ctx| async move {
                            for _ in 0..NUM_MSGS {
                                let _ = ctx.receive().await;
                            }
                            let _ = tx.send(());
                            Ok(())
                        })
                        .unwrap();
                    (node, pid, rx)
                })
            },
            |(node, pid, rx)| {
                runtime.block_on(async move {
                    for i in 0..NUM_MSGS {
                        node.send(None, &pid, term::int(i));
                    }
                    rx.await.unwrap();
                })
            },
            BatchSize::PerIteration,
        );
    });
}

criterion_group!(
    mailbox,
    post_then_receive,
    selective_receive,
    process_messages
);
criterion_main!(mailbox);
