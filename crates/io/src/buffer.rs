use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

/// Byte staging area for one channel of a connection.
///
/// Bytes pulled off the socket are appended with [`write`](Self::write) and
/// consumed in exact amounts with [`read`](Self::read). A reader can block in
/// [`wait`](Self::wait) until enough bytes arrived.
#[derive(Debug, Default)]
pub struct CycleBuffer {
    inner: Mutex<Inner>,
    ready: Condvar,
}

#[derive(Debug, Default)]
struct Inner {
    data: VecDeque<u8>,
    // Bumped by `wake` so waiters return without new data.
    wakeups: u64,
}

impl CycleBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer which can hold `capacity` bytes without
    /// reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: VecDeque::with_capacity(capacity),
                wakeups: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Returns the number of staged bytes.
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    /// Returns `true` if no bytes are staged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `data` and wakes up waiting readers.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        self.lock().data.extend(data);
        self.ready.notify_all();
    }

    /// Fills `out` completely if enough bytes are staged.
    ///
    /// Returns `false` and leaves the buffer untouched otherwise.
    pub fn read(&self, out: &mut [u8]) -> bool {
        let mut inner = self.lock();
        if inner.data.len() < out.len() {
            return false;
        }

        let n = out.len();
        for (dst, src) in out.iter_mut().zip(inner.data.drain(..n)) {
            *dst = src;
        }

        true
    }

    /// Copies up to `out.len()` staged bytes into `out` without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let inner = self.lock();
        let n = out.len().min(inner.data.len());
        for (dst, src) in out.iter_mut().zip(inner.data.iter()) {
            *dst = *src;
        }
        n
    }

    /// Blocks until at least `n` bytes are staged, the deadline passes or
    /// [`wake`](Self::wake) is called.
    ///
    /// Returns `true` if `n` bytes are available.
    pub fn wait(&self, n: usize, deadline: Option<Instant>) -> bool {
        let inner = self.lock();
        let start = inner.wakeups;
        let pending = |inner: &mut Inner| inner.data.len() < n && inner.wakeups == start;

        let inner = match deadline {
            None => self
                .ready
                .wait_while(inner, pending)
                .unwrap_or_else(PoisonError::into_inner),
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                self.ready
                    .wait_timeout_while(inner, timeout, pending)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };

        inner.data.len() >= n
    }

    /// Wakes up all threads blocked in [`wait`](Self::wait).
    pub fn wake(&self) {
        self.lock().wakeups += 1;
        self.ready.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
