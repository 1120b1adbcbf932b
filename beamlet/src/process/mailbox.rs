// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! A process's inbound queue with selective, timeout-capable consumption.
//!
//! Messages are stored in arrival order. A take either removes the first stored
//! message which satisfies its matcher, or arms a "taker" which intercepts the
//! first future message satisfying the matcher. Intercepted messages never
//! enter storage.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::concurrency::{self, Duration, OneshotReceiver, OneshotSender};
use crate::errors::ReceiveTimeout;
use crate::term::Term;

/// A message predicate used by selective receive
pub type Matcher = Box<dyn Fn(&Term) -> bool + Send + 'static>;

struct Taker {
    id: u64,
    matcher: Matcher,
    reply: OneshotSender<Term>,
}

#[derive(Default)]
struct MailboxInner {
    messages: VecDeque<Term>,
    takers: Vec<Taker>,
    next_taker: u64,
}

/// See the module-level documentation
#[derive(Default)]
pub struct Mailbox {
    inner: Mutex<MailboxInner>,
}

impl Mailbox {
    /// Create a new, empty mailbox
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MailboxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a message. An armed taker whose matcher accepts it receives it
    /// directly; otherwise it's appended to storage
    pub fn post(&self, message: Term) {
        let mut inner = self.lock();
        let mut message = message;
        let mut idx = 0;
        while idx < inner.takers.len() {
            if (inner.takers[idx].matcher)(&message) {
                let taker = inner.takers.remove(idx);
                match taker.reply.send(message) {
                    Ok(()) => return,
                    // the waiting receive was dropped; keep looking
                    Err(returned) => message = returned,
                }
            } else {
                idx += 1;
            }
        }
        inner.messages.push_back(message);
    }

    /// Remove and return the first message satisfying `matcher`, waiting up to
    /// `timeout` (forever if [None]) for one to arrive.
    ///
    /// On timeout the mailbox is left unchanged
    pub async fn take(
        &self,
        matcher: Matcher,
        timeout: Option<Duration>,
    ) -> Result<Term, ReceiveTimeout> {
        let (id, rx) = {
            let mut inner = self.lock();
            if let Some(pos) = inner.messages.iter().position(|m| matcher(m)) {
                if let Some(message) = inner.messages.remove(pos) {
                    return Ok(message);
                }
            }
            if timeout == Some(Duration::ZERO) {
                return Err(ReceiveTimeout);
            }
            let (tx, rx) = concurrency::oneshot();
            let id = inner.next_taker;
            inner.next_taker += 1;
            inner.takers.push(Taker {
                id,
                matcher,
                reply: tx,
            });
            (id, rx)
        };

        let mut pending = PendingTake {
            mailbox: self,
            id,
            rx,
            settled: false,
        };
        let result = match timeout {
            None => (&mut pending.rx).await.map_err(|_| ReceiveTimeout),
            Some(dur) => match concurrency::timeout(dur, &mut pending.rx).await {
                Ok(received) => received.map_err(|_| ReceiveTimeout),
                Err(_) => {
                    // A message may have been handed over between the timer firing
                    // and the revoke. If the taker is gone, it has.
                    if self.revoke(id) {
                        Err(ReceiveTimeout)
                    } else {
                        pending.rx.try_recv().map_err(|_| ReceiveTimeout)
                    }
                }
            },
        };
        pending.settled = true;
        result
    }

    /// Remove an armed taker. Returns [true] if it was still armed
    fn revoke(&self, id: u64) -> bool {
        let mut inner = self.lock();
        if let Some(pos) = inner.takers.iter().position(|t| t.id == id) {
            inner.takers.remove(pos);
            true
        } else {
            false
        }
    }

    /// The number of stored (not yet received) messages
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    /// Returns [true] if no messages are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the stored messages, in arrival order
    pub fn snapshot(&self) -> Vec<Term> {
        self.lock().messages.iter().cloned().collect()
    }
}

/// An armed taker whose receive is still outstanding. If the receiving future is
/// dropped mid-wait, the taker is revoked and any message already handed to it is
/// posted back so it isn't lost
struct PendingTake<'a> {
    mailbox: &'a Mailbox,
    id: u64,
    rx: OneshotReceiver<Term>,
    settled: bool,
}

impl Drop for PendingTake<'_> {
    fn drop(&mut self) {
        if self.settled || self.mailbox.revoke(self.id) {
            return;
        }
        if let Ok(message) = self.rx.try_recv() {
            self.mailbox.post(message);
        }
    }
}
