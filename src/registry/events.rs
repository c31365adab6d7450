use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::model::RegistryEvent;

/// Events buffered per watcher before new ones are dropped
pub const WATCH_QUEUE_CAPACITY: usize = 100;

struct Watcher {
    id: u64,
    token: CancellationToken,
    tx: mpsc::Sender<RegistryEvent>,
}

/// Fan-out of registry events to subscribers.
///
/// Delivery is at-most-once and best-effort: a watcher whose queue is full
/// misses that event, and publishing never waits on a slow consumer. Each
/// watcher's sender lives only here, so removing the entry closes the
/// receiving end exactly once.
#[derive(Default)]
pub(crate) struct Watchers {
    next_id: u64,
    watchers: Vec<Watcher>,
}

impl Watchers {
    pub(crate) fn subscribe(
        &mut self,
        token: CancellationToken,
    ) -> (u64, mpsc::Sender<RegistryEvent>, mpsc::Receiver<RegistryEvent>) {
        let (tx, rx) = mpsc::channel(WATCH_QUEUE_CAPACITY);
        let id = self.next_id;
        self.next_id += 1;
        self.watchers.push(Watcher {
            id,
            token,
            tx: tx.clone(),
        });
        (id, tx, rx)
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let before = self.watchers.len();
        self.watchers.retain(|w| w.id != id);
        before != self.watchers.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.watchers.len()
    }

    /// Push `event` to every live watcher, returning how many accepted it
    pub(crate) fn publish(&mut self, event: &RegistryEvent) -> usize {
        self.watchers
            .retain(|w| !w.token.is_cancelled() && !w.tx.is_closed());

        let mut delivered = 0;
        for watcher in &self.watchers {
            match watcher.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(
                        watcher = watcher.id,
                        service = %event.service.id,
                        "Watcher queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }
}
