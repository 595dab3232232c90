//! Per-guild readout queue
//!
//! Bounded FIFO of pending utterances with a single consumer (the guild's
//! playback driver). The utterance being played has already been dequeued, so
//! overflow only ever displaces entries that have not started.

use crate::error::{ReadoutError, Result};
use crate::types::{GuildId, Utterance};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::Notify;

/// What happens when an utterance arrives at a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest pending utterance and admit the new one
    #[default]
    DropOldest,
    /// Keep the backlog and refuse the new utterance with `QueueFull`
    RejectNewest,
}

/// Successful admission
#[derive(Debug)]
pub enum Admission {
    /// Appended without loss
    Queued,
    /// Appended after evicting the oldest pending utterance
    Displaced(Utterance),
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<Utterance>,
    closed: bool,
}

/// Ordered, bounded queue of pending utterances for one guild
#[derive(Debug)]
pub struct ReadoutQueue {
    guild_id: GuildId,
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ReadoutQueue {
    /// Create an open queue. A zero capacity is raised to 1.
    pub fn new(guild_id: GuildId, capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            guild_id,
            capacity,
            policy,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append an utterance in submission order.
    ///
    /// Fails with `SessionClosed` after `close()`, and with `QueueFull` when
    /// full under `RejectNewest`.
    pub fn enqueue(&self, utterance: Utterance) -> Result<Admission> {
        let admission = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ReadoutError::SessionClosed(self.guild_id));
            }
            let admission = if state.items.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::RejectNewest => {
                        return Err(ReadoutError::QueueFull {
                            guild_id: self.guild_id,
                            capacity: self.capacity,
                        });
                    }
                    OverflowPolicy::DropOldest => match state.items.pop_front() {
                        Some(oldest) => Admission::Displaced(oldest),
                        None => Admission::Queued,
                    },
                }
            } else {
                Admission::Queued
            };
            state.items.push_back(utterance);
            admission
        };
        self.notify.notify_one();
        Ok(admission)
    }

    /// Wait for the next utterance. Returns `None` once the queue is closed,
    /// even if utterances were pending at that moment.
    pub async fn dequeue_blocking(&self) -> Option<Utterance> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(next) = state.items.pop_front() {
                    return Some(next);
                }
            }

            notified.await;
        }
    }

    /// Close the queue, discarding pending utterances and waking the consumer.
    /// Idempotent; returns how many utterances were discarded by this call.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            state.closed = true;
            let n = state.items.len();
            state.items.clear();
            n
        };
        self.notify.notify_waiters();
        // a consumer that has not registered yet picks up the stored permit
        self.notify.notify_one();
        discarded
    }

    /// Pending utterances (never more than `capacity`)
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Active overflow policy
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Whether `close()` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Guild this queue belongs to
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Texts of pending utterances, oldest first
    pub fn pending_texts(&self) -> Vec<String> {
        self.state
            .lock()
            .items
            .iter()
            .map(|u| u.text().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{UserId, VoiceParams};
    use std::sync::Arc;
    use std::time::Duration;

    fn utterance(text: &str) -> Utterance {
        Utterance::new(GuildId(1), UserId(9), text, VoiceParams::default(), 100).unwrap()
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_freshest() {
        let queue = ReadoutQueue::new(GuildId(1), 3, OverflowPolicy::DropOldest);
        for text in ["A", "B", "C"] {
            assert!(matches!(queue.enqueue(utterance(text)).unwrap(), Admission::Queued));
        }

        match queue.enqueue(utterance("D")).unwrap() {
            Admission::Displaced(dropped) => assert_eq!(dropped.text(), "A"),
            Admission::Queued => panic!("expected A to be displaced"),
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pending_texts(), vec!["B", "C", "D"]);

        let order = [
            queue.dequeue_blocking().await.unwrap(),
            queue.dequeue_blocking().await.unwrap(),
            queue.dequeue_blocking().await.unwrap(),
        ];
        let texts: Vec<_> = order.iter().map(|u| u.text()).collect();
        assert_eq!(texts, vec!["B", "C", "D"]);
    }

    #[tokio::test]
    async fn test_reject_newest_keeps_backlog() {
        let queue = ReadoutQueue::new(GuildId(5), 2, OverflowPolicy::RejectNewest);
        queue.enqueue(utterance("A")).unwrap();
        queue.enqueue(utterance("B")).unwrap();

        let err = queue.enqueue(utterance("C")).unwrap_err();
        assert!(matches!(
            err,
            ReadoutError::QueueFull {
                guild_id: GuildId(5),
                capacity: 2
            }
        ));
        assert_eq!(queue.pending_texts(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded_under_burst() {
        let queue = ReadoutQueue::new(GuildId(1), 4, OverflowPolicy::DropOldest);
        for i in 0..50 {
            queue.enqueue(utterance(&format!("m{}", i))).unwrap();
            assert!(queue.len() <= 4);
        }
        assert_eq!(queue.pending_texts(), vec!["m46", "m47", "m48", "m49"]);
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(ReadoutQueue::new(GuildId(1), 3, OverflowPolicy::DropOldest));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue_blocking().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(utterance("hello")).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().text(), "hello");
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_consumer_and_discards() {
        let queue = Arc::new(ReadoutQueue::new(GuildId(1), 3, OverflowPolicy::DropOldest));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue_blocking().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(queue.close(), 0);
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());

        // idempotent, and closed queues refuse new work
        assert_eq!(queue.close(), 0);
        assert!(matches!(
            queue.enqueue(utterance("late")),
            Err(ReadoutError::SessionClosed(GuildId(1)))
        ));
    }

    #[tokio::test]
    async fn test_close_discards_pending() {
        let queue = ReadoutQueue::new(GuildId(1), 3, OverflowPolicy::DropOldest);
        queue.enqueue(utterance("A")).unwrap();
        queue.enqueue(utterance("B")).unwrap();

        assert_eq!(queue.close(), 2);
        assert!(queue.is_empty());
        assert!(queue.dequeue_blocking().await.is_none());
    }
}
