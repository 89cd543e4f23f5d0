//! Per-job event fan-out to push-channel subscribers.
//!
//! Every subscriber gets its own bounded buffer. Publishing never blocks:
//! a subscriber whose buffer is full is disconnected rather than allowed to
//! stall the pipeline. Subscribers attaching after the terminal transition
//! receive that terminal status and then the channel closes.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::engine::job::JobStatus;

/// A frame on a job's push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A status transition, including the terminal one.
    StatusUpdate { status: JobStatus },
    /// A log line forwarded from the job's sandbox (best-effort).
    Log { message: String },
}

/// Fan-out point for one job.
pub struct Broadcaster {
    capacity: usize,
    senders: Vec<mpsc::Sender<JobEvent>>,
    terminal: Option<JobStatus>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            senders: Vec::new(),
            terminal: None,
        }
    }

    /// Attach a subscriber. After the terminal transition the receiver
    /// yields exactly the terminal status and then ends.
    pub fn subscribe(&mut self) -> mpsc::Receiver<JobEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        match self.terminal {
            Some(status) => {
                // Send succeeds: the buffer is freshly created. Dropping tx
                // closes the channel right after the replayed frame.
                let _ = tx.try_send(JobEvent::StatusUpdate { status });
            }
            None => self.senders.push(tx),
        }
        rx
    }

    /// Deliver an event to every subscriber, dropping laggards.
    pub fn publish(&mut self, event: JobEvent) {
        self.senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("dropping slow push-channel subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Deliver the terminal status and close every subscriber channel.
    /// Buffered frames drain before receivers observe the end of stream.
    pub fn publish_terminal(&mut self, status: JobStatus) {
        self.publish(JobEvent::StatusUpdate { status });
        self.terminal = Some(status);
        self.senders.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.len()
    }
}

/// A one-shot channel carrying only a terminal status, for subscribers
/// that attach once the job is no longer in the engine's active view.
pub fn terminal_replay(status: JobStatus, capacity: usize) -> mpsc::Receiver<JobEvent> {
    let mut broadcaster = Broadcaster::new(capacity);
    broadcaster.terminal = Some(status);
    broadcaster.subscribe()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let mut b = Broadcaster::new(8);
        let mut rx1 = b.subscribe();
        let mut rx2 = b.subscribe();

        b.publish(JobEvent::Log {
            message: "hello".to_string(),
        });

        for rx in [&mut rx1, &mut rx2] {
            let event = rx.recv().await.unwrap();
            assert_eq!(
                event,
                JobEvent::Log {
                    message: "hello".to_string()
                }
            );
        }
    }

    #[tokio::test]
    async fn laggard_is_disconnected_not_blocked() {
        let mut b = Broadcaster::new(2);
        let mut slow = b.subscribe();
        let mut fast = b.subscribe();

        for i in 0..3 {
            b.publish(JobEvent::Log {
                message: format!("line {i}"),
            });
            // The fast subscriber keeps draining.
            assert!(fast.recv().await.is_some());
        }

        // The slow one got the first two frames, then was dropped.
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_none());
        assert_eq!(b.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn terminal_closes_channels_after_drain() {
        let mut b = Broadcaster::new(8);
        let mut rx = b.subscribe();

        b.publish(JobEvent::StatusUpdate {
            status: JobStatus::Building,
        });
        b.publish_terminal(JobStatus::Completed);

        assert_eq!(
            rx.recv().await.unwrap(),
            JobEvent::StatusUpdate {
                status: JobStatus::Building
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            JobEvent::StatusUpdate {
                status: JobStatus::Completed
            }
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn late_subscriber_gets_terminal_replay() {
        let mut b = Broadcaster::new(8);
        b.publish_terminal(JobStatus::Failed);

        let mut rx = b.subscribe();
        assert_eq!(
            rx.recv().await.unwrap(),
            JobEvent::StatusUpdate {
                status: JobStatus::Failed
            }
        );
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn event_wire_shape() {
        let json = serde_json::to_value(JobEvent::StatusUpdate {
            status: JobStatus::AwaitingApproval,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "status_update", "status": "awaiting_approval"})
        );

        let json = serde_json::to_value(JobEvent::Log {
            message: "cargo test".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "log", "message": "cargo test"}));
    }
}
