//! Broadcast-style event bus for job lifecycle events, built on flume
//! channels.
//!
//! Each `subscribe` call creates a receiver that sees every event published
//! afterwards. Disconnected subscribers are pruned on publish. Listeners
//! (e.g. a notification subsystem) consume these without coupling to the
//! queue internals.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use ws_core::types::Job;

/// A job lifecycle event with a snapshot of the job at that moment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Queued { job: Job },
    Started { job: Job },
    Completed { job: Job },
    Failed { job: Job },
    Cancelled { job: Job },
}

impl JobEvent {
    pub fn job(&self) -> &Job {
        match self {
            JobEvent::Queued { job }
            | JobEvent::Started { job }
            | JobEvent::Completed { job }
            | JobEvent::Failed { job }
            | JobEvent::Cancelled { job } => job,
        }
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<JobEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<JobEvent> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("event bus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish an event to all current subscribers, pruning dead ones.
    pub fn publish(&self, event: JobEvent) {
        let mut senders = self.inner.lock().expect("event bus lock poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("event bus lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use ws_core::types::{ExecutionTrigger, SyncOptions};

    fn job() -> Job {
        Job::new(Uuid::new_v4(), SyncOptions::default(), ExecutionTrigger::Api)
    }

    #[test]
    fn subscribers_see_events_published_after_subscribe() {
        let bus = EventBus::new();
        bus.publish(JobEvent::Queued { job: job() }); // no one listening yet

        let rx = bus.subscribe();
        let sent = job();
        bus.publish(JobEvent::Started { job: sent.clone() });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.job().id, sent.id);
        assert!(matches!(event, JobEvent::Started { .. }));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        bus.publish(JobEvent::Queued { job: job() });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
