//! Load and progress listeners driven by a streamed fetch.
//!
//! Callbacks run on the fetching thread while the connection is held, so they must be
//! quick. The registry is not locked during a callback; a listener added from inside one
//! is first called for the next event.
use std::{
    any::Any,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::TableInfo;

/// Caller state threaded through the callbacks of one load listener registration.
pub type LoadParam = Option<Box<dyn Any + Send>>;

pub trait TableLoadListener<R>: Send + Sync {
    fn load_started(&self, table: &TableInfo, param: LoadParam) -> LoadParam;

    fn row_loaded(&self, table: &TableInfo, row: &R, index: usize, param: LoadParam) -> LoadParam;

    fn load_completed(&self, table: &TableInfo, param: LoadParam) -> LoadParam;
}

/// Receives progress ticks scaled to `0..=scale()` during a streamed fetch.
pub trait ProgressListener: Send + Sync {
    fn scale(&self) -> u32;

    fn progress_changed(&self, position: u32, scale: u32);
}

struct LoadEntry<R> {
    listener: Arc<dyn TableLoadListener<R>>,
    param: Arc<Mutex<LoadParam>>,
}

fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct LoadListeners<R> {
    load: Mutex<Vec<LoadEntry<R>>>,
    progress: Mutex<Vec<Arc<dyn ProgressListener>>>,
}

impl<R> Default for LoadListeners<R> {
    fn default() -> Self {
        Self {
            load: Mutex::new(Vec::new()),
            progress: Mutex::new(Vec::new()),
        }
    }
}

impl<R> LoadListeners<R> {
    pub(crate) fn add_load(&self, listener: Arc<dyn TableLoadListener<R>>, param: LoadParam) {
        lock(&self.load).push(LoadEntry {
            listener,
            param: Arc::new(Mutex::new(param)),
        });
    }

    pub(crate) fn remove_load(&self, listener: &Arc<dyn TableLoadListener<R>>) {
        lock(&self.load).retain(|e| !same(&e.listener, listener));
    }

    pub(crate) fn add_progress(&self, listener: Arc<dyn ProgressListener>) {
        lock(&self.progress).push(listener);
    }

    pub(crate) fn remove_progress(&self, listener: &Arc<dyn ProgressListener>) {
        lock(&self.progress).retain(|l| !same(l, listener));
    }

    pub(crate) fn wants_progress(&self) -> bool {
        !lock(&self.progress).is_empty()
    }

    fn each(&self, mut f: impl FnMut(&dyn TableLoadListener<R>, LoadParam) -> LoadParam) {
        let entries = lock(&self.load)
            .iter()
            .map(|e| (e.listener.clone(), e.param.clone()))
            .collect::<Vec<_>>();
        for (listener, slot) in entries {
            let param = lock(&slot).take();
            let param = f(listener.as_ref(), param);
            *lock(&slot) = param;
        }
    }

    pub(crate) fn started(&self, table: &TableInfo) {
        self.each(|l, p| l.load_started(table, p));
    }

    pub(crate) fn row_loaded(&self, table: &TableInfo, row: &R, index: usize) {
        self.each(|l, p| l.row_loaded(table, row, index, p));
    }

    pub(crate) fn completed(&self, table: &TableInfo) {
        self.each(|l, p| l.load_completed(table, p));
    }

    /// Snapshot of the progress listeners for one fetch.
    pub(crate) fn progress(&self) -> Progress {
        Progress {
            listeners: lock(&self.progress)
                .iter()
                .map(|l| (l.clone(), None))
                .collect(),
            total: None,
        }
    }
}

/// Progress state of one streamed fetch; emits a tick only when a position changes.
pub(crate) struct Progress {
    listeners: Vec<(Arc<dyn ProgressListener>, Option<u32>)>,
    total: Option<usize>,
}

impl Progress {
    pub(crate) fn set_total(&mut self, total: usize) {
        self.total = Some(total);
        self.report(0);
    }

    pub(crate) fn advance(&mut self, done: usize) {
        self.report(done);
    }

    pub(crate) fn finish(&mut self) {
        for (listener, last) in self.listeners.iter_mut() {
            let scale = listener.scale();
            if *last != Some(scale) {
                *last = Some(scale);
                listener.progress_changed(scale, scale);
            }
        }
    }

    fn report(&mut self, done: usize) {
        let Some(total) = self.total else {
            return;
        };
        for (listener, last) in self.listeners.iter_mut() {
            let scale = listener.scale();
            let position = if total == 0 {
                scale
            } else {
                ((done.min(total) as u64 * scale as u64) / total as u64) as u32
            };
            if *last != Some(position) {
                *last = Some(position);
                listener.progress_changed(position, scale);
            }
        }
    }
}
