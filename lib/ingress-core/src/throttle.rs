//! Event coalescing between the watch and the recompute loop
//!
//! The watch pushes into an [`EventSlot`] through a forwarder task. The slot holds at
//! most one event: a new event replaces the pending one, so a slow recompute sees one
//! notification for a whole burst of changes.

use crate::store::{EventStream, ResourceEvent};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct SlotState {
    pending: Option<ResourceEvent>,
    closed: bool,
}

/// Single-slot mailbox
#[derive(Default)]
pub struct EventSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl EventSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `event`, returning the pending event it replaced
    pub async fn put(&self, event: ResourceEvent) -> Option<ResourceEvent> {
        let replaced = self.state.lock().await.pending.replace(event);
        self.notify.notify_one();
        replaced
    }

    /// Mark the source as gone. Pending events are still delivered.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_one();
    }

    /// Wait for the next event. `None` once the slot is closed and drained.
    pub async fn take(&self) -> Option<ResourceEvent> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(event) = state.pending.take() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            // A notification sent since the check is kept as a permit
            self.notify.notified().await;
        }
    }
}

/// Move events from the watch into `slot` until the watch ends or `cancel` fires
pub fn spawn_forwarder(
    mut events: EventStream,
    slot: Arc<EventSlot>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(replaced) = slot.put(event).await {
                            debug!("Dropping pending {} event, superseded by {}", replaced, event);
                        }
                    }
                    None => break,
                },
            }
        }
        slot.close().await;
        debug!("Event forwarder stopped");
    })
}
