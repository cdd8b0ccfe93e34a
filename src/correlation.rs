//! Request/reply correlation: sequence number allocation and the pending
//! reply queue.
//!
//! Sequence numbers are allocated per connection by the side that sends the
//! request; correlation is always by explicit number carried in the reply's
//! `reply_to` field, never by counter parity between the two peers.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use crate::protocol::frame::{Envelope, REQUEST};

/// Wrapping `u16` counter that never yields the [`REQUEST`] sentinel.
#[derive(Debug, Default)]
pub struct SeqCounter(AtomicU16);

impl SeqCounter {
    pub fn new() -> SeqCounter {
        SeqCounter(AtomicU16::new(0))
    }

    pub fn next(&self) -> u16 {
        loop {
            let v = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if v != REQUEST {
                return v;
            }
        }
    }
}

/// How long [`ReplyQueue::await_reply`] is willing to wait.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReplyTimeout {
    /// Return immediately with whatever is already queued.
    Poll,
    /// Block until the reply arrives or the connection closes.
    Forever,
    /// Block at most this long.
    After(Duration),
}

#[derive(Default)]
struct QueueState {
    messages: Vec<Envelope>,
    closed: bool,
}

/// Queue of reply frames waiting to be claimed by their requester.
///
/// The reader task pushes every inbound reply; callers that sent a request
/// wait here for the frame whose `reply_to` matches their sequence number.
/// A matched reply is removed from the queue, so it is claimed exactly once;
/// replies for other waiters stay queued untouched.
#[derive(Default)]
pub struct ReplyQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ReplyQueue {
    pub fn new() -> ReplyQueue {
        ReplyQueue::default()
    }

    pub fn push(&self, env: Envelope) {
        let mut state = self.state.lock().expect("reply queue poisoned");
        if state.closed {
            warn!(
                "discarding reply to #{} received after connection close",
                env.reply_to
            );
            return;
        }
        state.messages.push(env);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Fails all current and future waiters. Called on connection teardown.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("reply queue poisoned");
        state.closed = true;
        state.messages.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("reply queue poisoned").closed
    }

    /// Waits for the reply to request `seq`. Returns `None` when the timeout
    /// elapses, on [`ReplyTimeout::Poll`] with nothing queued, or once the
    /// queue is closed.
    pub async fn await_reply(&self, seq: u16, timeout: ReplyTimeout) -> Option<Envelope> {
        let deadline = match timeout {
            ReplyTimeout::After(d) => Some(Instant::now() + d),
            _ => None,
        };

        loop {
            // Register for wakeups before checking the queue, otherwise a
            // push between check and wait would be lost.
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock().expect("reply queue poisoned");
                if let Some(idx) = state.messages.iter().position(|m| m.reply_to == seq) {
                    return Some(state.messages.remove(idx));
                }
                if state.closed {
                    return None;
                }
            }

            match timeout {
                ReplyTimeout::Poll => return None,
                ReplyTimeout::Forever => notified.await,
                ReplyTimeout::After(_) => {
                    let deadline = deadline.expect("deadline set for After");
                    let remaining = deadline.checked_duration_since(Instant::now());
                    let Some(remaining) = remaining else {
                        return None;
                    };
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        // One final check: the reply may have raced the timer
                        let mut state = self.state.lock().expect("reply queue poisoned");
                        return state
                            .messages
                            .iter()
                            .position(|m| m.reply_to == seq)
                            .map(|idx| state.messages.remove(idx));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::protocol::message::Message;

    use super::*;

    fn reply(reply_to: u16) -> Envelope {
        Envelope::reply(100 + reply_to, reply_to, Message::Ping)
    }

    #[test]
    fn test_seq_counter_skips_request_sentinel() {
        let counter = SeqCounter::new();
        assert_eq!(counter.next(), 1);
        // Jump close to the wrap point
        counter.0.store(u16::MAX - 1, Ordering::Relaxed);
        assert_eq!(counter.next(), u16::MAX);
        assert_eq!(counter.next(), 1, "0 is never allocated");
    }

    #[tokio::test]
    async fn test_poll_returns_queued_reply_and_consumes_it() {
        let queue = ReplyQueue::new();
        queue.push(reply(5));
        assert!(queue.await_reply(5, ReplyTimeout::Poll).await.is_some());
        assert!(queue.await_reply(5, ReplyTimeout::Poll).await.is_none());
    }

    #[tokio::test]
    async fn test_poll_without_match_returns_none() {
        let queue = ReplyQueue::new();
        queue.push(reply(5));
        assert!(queue.await_reply(6, ReplyTimeout::Poll).await.is_none());
        // The unmatched reply stays queued for its own waiter
        assert!(queue.await_reply(5, ReplyTimeout::Poll).await.is_some());
    }

    #[tokio::test]
    async fn test_forever_blocks_until_reply_arrives() {
        let queue = Arc::new(ReplyQueue::new());
        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                queue.push(reply(9));
            })
        };
        let env = queue.await_reply(9, ReplyTimeout::Forever).await.unwrap();
        assert_eq!(env.reply_to, 9);
        pusher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_times_out() {
        let queue = ReplyQueue::new();
        let got = queue
            .await_reply(1, ReplyTimeout::After(Duration::from_millis(50)))
            .await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_bounded_wait_returns_early_on_match() {
        let queue = Arc::new(ReplyQueue::new());
        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                queue.push(reply(3));
            })
        };
        let got = queue
            .await_reply(3, ReplyTimeout::After(Duration::from_secs(10)))
            .await;
        assert!(got.is_some());
        pusher.await.unwrap();
    }

    #[tokio::test]
    async fn test_each_reply_claimed_by_exactly_one_waiter() {
        let queue = Arc::new(ReplyQueue::new());
        let mut waiters = Vec::new();
        for seq in 1..=8u16 {
            let queue = queue.clone();
            waiters.push(tokio::spawn(async move {
                queue.await_reply(seq, ReplyTimeout::Forever).await
            }));
        }
        for seq in (1..=8u16).rev() {
            queue.push(reply(seq));
        }
        for (i, waiter) in waiters.into_iter().enumerate() {
            let env = waiter.await.unwrap().expect("every waiter gets its reply");
            assert_eq!(env.reply_to, (i + 1) as u16);
        }
        // Nothing left over
        assert!(queue.state.lock().unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_close_unblocks_waiters() {
        let queue = Arc::new(ReplyQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.await_reply(1, ReplyTimeout::Forever).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert!(waiter.await.unwrap().is_none());
        // Waiting on a closed queue fails fast
        assert!(queue.await_reply(2, ReplyTimeout::Forever).await.is_none());
    }
}
