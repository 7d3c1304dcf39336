use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::call::AsyncCall;
use crate::error::{Error, Result};
use crate::util::lock_unpoisoned;

const DEFAULT_MAX_REQUESTS: usize = 64;
const DEFAULT_MAX_REQUESTS_PER_HOST: usize = 5;

/// How long an idle worker thread lingers before exiting.
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

type Job = Box<dyn FnOnce() + Send>;

struct PoolState {
    queue: VecDeque<Job>,
    idle: usize,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// An unbounded grow-on-demand thread pool. Threads that sit idle past
/// [`WORKER_IDLE_TIMEOUT`] exit, so a quiet client holds no threads.
pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    idle: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    pub(crate) fn execute(&self, job: Job) {
        let spawn_worker = {
            let mut state = lock_unpoisoned(&self.shared.state);
            state.queue.push_back(job);
            if state.idle > 0 {
                self.shared.available.notify_one();
                false
            } else {
                true
            }
        };
        if spawn_worker {
            self.spawn_worker();
        }
    }

    fn spawn_worker(&self) {
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("httpcall-worker".to_owned())
            .spawn(move || worker_loop(&shared));
        if let Err(error) = spawned {
            warn!(error = %error, "failed to spawn worker thread");
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    let mut state = lock_unpoisoned(&shared.state);
    loop {
        if let Some(job) = state.queue.pop_front() {
            drop(state);
            job();
            state = lock_unpoisoned(&shared.state);
            continue;
        }
        state.idle += 1;
        let (guard, timeout) = match shared.available.wait_timeout(state, WORKER_IDLE_TIMEOUT) {
            Ok(woken) => woken,
            Err(poisoned) => poisoned.into_inner(),
        };
        state = guard;
        state.idle -= 1;
        if state.queue.is_empty() && timeout.timed_out() {
            return;
        }
    }
}

struct DispatcherInner {
    max_requests: usize,
    max_requests_per_host: usize,
    ready_async: VecDeque<Arc<AsyncCall>>,
    running_async: Vec<Arc<AsyncCall>>,
    running_sync: Vec<Arc<crate::call::SyncToken>>,
}

impl DispatcherInner {
    fn running_for_host(&self, host: &str) -> usize {
        self.running_async
            .iter()
            .filter(|call| call.host() == host)
            .count()
    }

    fn running_count(&self) -> usize {
        self.running_async.len() + self.running_sync.len()
    }
}

/// Admission control for asynchronous calls: a global cap and a per-host
/// cap, with queued calls promoted in FIFO order except that a call whose
/// host is saturated is skipped rather than blocking the calls behind it.
pub struct Dispatcher {
    inner: Mutex<DispatcherInner>,
    pool: WorkerPool,
    idle_callback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DispatcherInner {
                max_requests: DEFAULT_MAX_REQUESTS,
                max_requests_per_host: DEFAULT_MAX_REQUESTS_PER_HOST,
                ready_async: VecDeque::new(),
                running_async: Vec::new(),
                running_sync: Vec::new(),
            }),
            pool: WorkerPool::new(),
            idle_callback: Mutex::new(None),
        }
    }

    pub fn max_requests(&self) -> usize {
        lock_unpoisoned(&self.inner).max_requests
    }

    pub fn max_requests_per_host(&self) -> usize {
        lock_unpoisoned(&self.inner).max_requests_per_host
    }

    /// Raising the cap promotes immediately; lowering never interrupts
    /// calls already running.
    pub fn set_max_requests(&self, max_requests: usize) -> Result<()> {
        if max_requests == 0 {
            return Err(Error::InvalidLimit { value: max_requests });
        }
        lock_unpoisoned(&self.inner).max_requests = max_requests;
        self.promote();
        Ok(())
    }

    pub fn set_max_requests_per_host(&self, max_requests_per_host: usize) -> Result<()> {
        if max_requests_per_host == 0 {
            return Err(Error::InvalidLimit {
                value: max_requests_per_host,
            });
        }
        lock_unpoisoned(&self.inner).max_requests_per_host = max_requests_per_host;
        self.promote();
        Ok(())
    }

    /// Invoked each time the number of in-flight calls (sync and async)
    /// returns to zero.
    pub fn set_idle_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *lock_unpoisoned(&self.idle_callback) = Some(Box::new(callback));
    }

    pub fn queued_count(&self) -> usize {
        lock_unpoisoned(&self.inner).ready_async.len()
    }

    pub fn running_count(&self) -> usize {
        lock_unpoisoned(&self.inner).running_count()
    }

    pub(crate) fn enqueue(&self, call: Arc<AsyncCall>) {
        lock_unpoisoned(&self.inner).ready_async.push_back(call);
        self.promote();
    }

    /// Moves every eligible queued call to running and hands it to the
    /// worker pool. A queued call is eligible while the global cap has room
    /// and its host is below the per-host cap; ineligible calls are skipped
    /// in place, preserving their queue position.
    fn promote(&self) {
        let promoted: Vec<Arc<AsyncCall>> = {
            let mut inner = lock_unpoisoned(&self.inner);
            let mut promoted = Vec::new();
            let mut index = 0;
            while index < inner.ready_async.len() {
                if inner.running_async.len() >= inner.max_requests {
                    break;
                }
                let host = inner.ready_async[index].host().to_owned();
                if inner.running_for_host(&host) >= inner.max_requests_per_host {
                    index += 1;
                    continue;
                }
                let call = inner
                    .ready_async
                    .remove(index)
                    .unwrap_or_else(|| unreachable!("index bounded by len"));
                inner.running_async.push(Arc::clone(&call));
                promoted.push(call);
            }
            promoted
        };
        for call in promoted {
            self.pool.execute(Box::new(move || call.run()));
        }
    }

    /// Removes a still-queued call so it can complete as canceled without
    /// ever occupying a slot. False when the call already left the queue.
    pub(crate) fn remove_queued(&self, call: &Arc<AsyncCall>) -> bool {
        let removed = {
            let mut inner = lock_unpoisoned(&self.inner);
            let before = inner.ready_async.len();
            inner.ready_async.retain(|queued| !Arc::ptr_eq(queued, call));
            inner.ready_async.len() != before
        };
        if removed {
            let canceled = Arc::clone(call);
            self.pool.execute(Box::new(move || canceled.finish_canceled()));
        }
        removed
    }

    pub(crate) fn finished_async(&self, call: &Arc<AsyncCall>) {
        let idle = {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.running_async.retain(|running| !Arc::ptr_eq(running, call));
            inner.running_count() == 0 && inner.ready_async.is_empty()
        };
        self.promote();
        if idle {
            self.notify_idle();
        }
    }

    pub(crate) fn executed(&self, token: Arc<crate::call::SyncToken>) {
        lock_unpoisoned(&self.inner).running_sync.push(token);
    }

    pub(crate) fn finished_sync(&self, token: &Arc<crate::call::SyncToken>) {
        let idle = {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.running_sync.retain(|running| !Arc::ptr_eq(running, token));
            inner.running_count() == 0 && inner.ready_async.is_empty()
        };
        if idle {
            self.notify_idle();
        }
    }

    /// Cancels every call: queued, running asynchronously, and running
    /// synchronously on a caller's thread.
    pub fn cancel_all(&self) {
        let (queued, running, running_sync) = {
            let inner = lock_unpoisoned(&self.inner);
            (
                inner.ready_async.iter().cloned().collect::<Vec<_>>(),
                inner.running_async.clone(),
                inner.running_sync.clone(),
            )
        };
        for call in queued.iter().chain(running.iter()) {
            call.cancel();
        }
        for token in &running_sync {
            token.cancel();
        }
        // Queued calls also leave the queue, per cancel semantics.
        for call in &queued {
            self.remove_queued(call);
        }
    }

    fn notify_idle(&self) {
        if let Some(callback) = lock_unpoisoned(&self.idle_callback).as_ref() {
            callback();
        }
    }
}
