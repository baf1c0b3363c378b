//! Tokio-backed timers for a chain runner.

use crossbeam::channel::Sender;
use quorumstate_core::{ChainEvent, TimerId, TimerScheduler};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Spawns a tokio sleep per armed timer; on expiry the timer's event is
/// pushed into the chain's timer channel.
///
/// Re-arming a timer replaces the previous one. Dropping the manager aborts
/// every pending timer.
pub struct TimerManager {
    handle: tokio::runtime::Handle,
    timer_tx: Sender<ChainEvent>,
    active: HashMap<TimerId, JoinHandle<()>>,
}

impl TimerManager {
    pub fn new(handle: tokio::runtime::Handle, timer_tx: Sender<ChainEvent>) -> Self {
        Self {
            handle,
            timer_tx,
            active: HashMap::new(),
        }
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.active.get(&id).is_some_and(|h| !h.is_finished())
    }
}

impl TimerScheduler for TimerManager {
    fn set_timer(&mut self, id: TimerId, duration: Duration) {
        if let Some(handle) = self.active.remove(&id) {
            handle.abort();
        }
        let timer_tx = self.timer_tx.clone();
        let handle = self.handle.spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = timer_tx.send(id.into_event());
        });
        self.active.insert(id, handle);
    }

    fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.active.remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        for (_, handle) in self.active.drain() {
            handle.abort();
        }
    }
}
