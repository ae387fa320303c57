//! Table listeners notified after invalidation.
//!
//! A listener registered with a zero batch delay is dispatched through the connector's
//! [`Executor`] on every update, never on the notifying thread. A listener with a positive
//! delay is coalesced: the first update opens a window of that length, later updates inside
//! the window are absorbed, and one dispatch happens once the window has elapsed. Each table
//! runs one batching thread while it has batched listeners.
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

use log::{debug, error};

use crate::{ClientError, connector::Executor};

use super::TableInfo;

pub trait TableListener: Send + Sync {
    fn table_updated(&self, table: &TableInfo);
}

impl<F: Fn(&TableInfo) + Send + Sync> TableListener for F {
    fn table_updated(&self, table: &TableInfo) {
        self(table)
    }
}

struct Entry {
    listener: Arc<dyn TableListener>,
    delay: Duration,
    pending_since: Option<Instant>,
}

impl Entry {
    fn batched(&self) -> bool {
        !self.delay.is_zero()
    }
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    batcher: bool,
    closed: bool,
}

pub(crate) struct Listeners {
    info: TableInfo,
    executor: Arc<dyn Executor>,
    state: Mutex<State>,
    wake: Condvar,
}

fn same_listener(a: &Arc<dyn TableListener>, b: &Arc<dyn TableListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

fn dispatch(listener: &dyn TableListener, info: &TableInfo) {
    if catch_unwind(AssertUnwindSafe(|| listener.table_updated(info))).is_err() {
        error!("listener on table {} panicked", info.name);
    }
}

impl Listeners {
    pub(crate) fn new(info: TableInfo, executor: Arc<dyn Executor>) -> Arc<Self> {
        Arc::new(Self {
            info,
            executor,
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(
        self: &Arc<Self>,
        listener: Arc<dyn TableListener>,
        delay: Duration,
    ) -> Result<(), ClientError> {
        let mut state = self.lock();
        if !delay.is_zero() && !state.batcher {
            let this = Arc::clone(self);
            thread::Builder::new()
                .name(format!("hcrpc-batch-{}", self.info.name))
                .spawn(move || this.run_batcher())?;
            state.batcher = true;
            debug!("started batching thread for table {}", self.info.name);
        }
        state.entries.push(Entry {
            listener,
            delay,
            pending_since: None,
        });
        Ok(())
    }

    /// Removes every registration of `listener`.
    pub(crate) fn remove(&self, listener: &Arc<dyn TableListener>) {
        let mut state = self.lock();
        state.entries.retain(|e| !same_listener(&e.listener, listener));
        self.wake.notify_all();
    }

    pub(crate) fn has_listeners(&self) -> bool {
        !self.lock().entries.is_empty()
    }

    pub(crate) fn batcher_running(&self) -> bool {
        self.lock().batcher
    }

    /// Fires immediate listeners and opens batch windows for batched ones.
    pub(crate) fn table_updated(&self) {
        let now = Instant::now();
        let mut immediate = Vec::new();
        let mut opened = false;
        {
            let mut state = self.lock();
            for entry in state.entries.iter_mut() {
                if !entry.batched() {
                    immediate.push(entry.listener.clone());
                } else if entry.pending_since.is_none() {
                    entry.pending_since = Some(now);
                    opened = true;
                }
            }
            if opened {
                self.wake.notify_all();
            }
        }

        for listener in immediate {
            let info = self.info;
            self.executor
                .execute(Box::new(move || dispatch(listener.as_ref(), &info)));
        }
    }

    /// Stops the batching thread regardless of registrations.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.wake.notify_all();
    }

    fn run_batcher(self: Arc<Self>) {
        let mut state = self.lock();
        loop {
            if state.closed || !state.entries.iter().any(Entry::batched) {
                state.batcher = false;
                debug!("stopping batching thread for table {}", self.info.name);
                return;
            }

            let now = Instant::now();
            let mut due = Vec::new();
            let mut next: Option<Instant> = None;
            for entry in state.entries.iter_mut().filter(|e| e.batched()) {
                let Some(since) = entry.pending_since else {
                    continue;
                };
                let deadline = since + entry.delay;
                if deadline <= now {
                    entry.pending_since = None;
                    due.push(entry.listener.clone());
                } else {
                    next = Some(next.map_or(deadline, |n| n.min(deadline)));
                }
            }

            if !due.is_empty() {
                drop(state);
                for listener in due {
                    dispatch(listener.as_ref(), &self.info);
                }
                state = self.lock();
                continue;
            }

            state = match next {
                Some(deadline) => {
                    self.wake
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.wake.wait(state).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}
