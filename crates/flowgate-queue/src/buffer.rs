use std::sync::Mutex as StdMutex;

use flowgate_sync::Signal;
use flowgate_time::{Duration, Timer};

struct State<T> {
    buf: Vec<Option<T>>,
    head: usize,
    tail: usize,
    count: usize,
    closed: bool,
    capacity: usize,
    mask: usize,
}

/// A fixed-capacity MPMC ring buffer with synchronous `try_*` operations
/// and timed async operations, closeable from either side.
///
/// The backing store is rounded up to the next power of two so index
/// arithmetic can use a mask instead of a modulo; `capacity` (the value
/// the caller asked for) is tracked separately and is what `count` is
/// bounded by.
pub struct CircularBuffer<T> {
    state: StdMutex<State<T>>,
    read_sig: Signal,
    write_sig: Signal,
}

fn next_pow2(n: usize) -> usize {
    n.max(2).next_power_of_two()
}

impl<T> CircularBuffer<T> {
    /// Creates a buffer that holds at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let size = next_pow2(capacity);
        let mut buf = Vec::with_capacity(size);
        buf.resize_with(size, || None);
        Self {
            state: StdMutex::new(State {
                buf,
                head: 0,
                tail: 0,
                count: 0,
                closed: false,
                capacity: capacity.max(1),
                mask: size - 1,
            }),
            read_sig: Signal::new(),
            write_sig: Signal::new(),
        }
    }

    /// Items currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().count
    }

    /// True if no items are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The capacity this buffer was created with.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().capacity
    }

    /// True once [`CircularBuffer::close`] has been called and the buffer
    /// has fully drained.
    #[must_use]
    pub fn finished(&self) -> bool {
        let s = self.state.lock().unwrap();
        s.closed && s.count == 0
    }

    /// Closes the buffer. Idempotent; wakes every suspended reader and
    /// writer so none of them block forever on a buffer that will never
    /// receive more data or free more space.
    pub fn close(&self) {
        {
            let mut s = self.state.lock().unwrap();
            if s.closed {
                return;
            }
            s.closed = true;
        }
        self.read_sig.notify_all();
        self.write_sig.notify_all();
    }

    fn push(s: &mut State<T>, v: T) {
        let idx = s.tail;
        s.buf[idx] = Some(v);
        s.tail = (s.tail + 1) & s.mask;
        s.count += 1;
    }

    fn pop(s: &mut State<T>) -> Option<T> {
        if s.count == 0 {
            return None;
        }
        let idx = s.head;
        let v = s.buf[idx].take();
        s.head = (s.head + 1) & s.mask;
        s.count -= 1;
        v
    }

    /// Adds one item without suspending. Fails (returns `false`) if the
    /// buffer is closed or full.
    pub fn try_add(&self, v: T) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.closed || s.count >= s.capacity {
            return false;
        }
        Self::push(&mut s, v);
        drop(s);
        self.read_sig.notify_one();
        true
    }

    /// Adds as many leading items of `vs` as currently fit, preserving
    /// order. Returns the number accepted.
    pub fn try_add_range(&self, vs: Vec<T>) -> usize {
        let mut s = self.state.lock().unwrap();
        if s.closed {
            return 0;
        }
        let room = s.capacity - s.count;
        let n = room.min(vs.len());
        let mut it = vs.into_iter();
        for v in (&mut it).take(n) {
            Self::push(&mut s, v);
        }
        drop(s);
        for _ in 0..n {
            self.read_sig.notify_one();
        }
        n
    }

    /// Adds one item, suspending until space frees up, the buffer closes,
    /// or `timeout` elapses.
    ///
    /// Returns `false` if the buffer was or became closed, or if
    /// `timeout` elapsed first.
    pub async fn add(&self, v: T, timeout: Option<Duration>) -> bool {
        let mut item = Some(v);
        let timer = Timer::start();
        loop {
            {
                let mut s = self.state.lock().unwrap();
                if s.closed {
                    return false;
                }
                if s.count < s.capacity {
                    Self::push(&mut s, item.take().unwrap());
                    drop(s);
                    self.read_sig.notify_one();
                    return true;
                }
            }
            let remaining = match remaining_timeout(timeout, &timer) {
                Some(r) => r,
                None => return false,
            };
            self.write_sig.wait(remaining).await;
        }
    }

    /// Adds as many leading items of `items` as fit, waiting until at
    /// least `min_values` can be accepted or `timeout` elapses.
    ///
    /// Returns `0` if fewer than `min_values` could be accepted before
    /// the deadline (nothing is added in that case); otherwise returns
    /// the number actually accepted, which may be less than
    /// `items.len()`.
    pub async fn add_range(
        &self,
        mut items: Vec<T>,
        min_values: usize,
        timeout: Option<Duration>,
    ) -> usize {
        if items.is_empty() {
            return 0;
        }
        let min_values = min_values.max(1).min(items.len());
        let timer = Timer::start();
        loop {
            {
                let mut s = self.state.lock().unwrap();
                if s.closed {
                    return 0;
                }
                let room = s.capacity - s.count;
                if room >= min_values {
                    let n = room.min(items.len());
                    for v in items.drain(0..n) {
                        Self::push(&mut s, v);
                    }
                    drop(s);
                    for _ in 0..n {
                        self.read_sig.notify_one();
                    }
                    return n;
                }
            }
            let remaining = match remaining_timeout(timeout, &timer) {
                Some(r) => r,
                None => return 0,
            };
            self.write_sig.wait(remaining).await;
        }
    }

    /// Removes one item without suspending.
    pub fn try_remove(&self) -> Option<T> {
        let mut s = self.state.lock().unwrap();
        let v = Self::pop(&mut s);
        let became_finished = s.closed && s.count == 0;
        drop(s);
        if v.is_some() {
            self.write_sig.notify_one();
        }
        if became_finished {
            self.read_sig.notify_all();
        }
        v
    }

    /// Removes up to `max_values` items without suspending, in FIFO order.
    pub fn try_remove_range(&self, max_values: usize) -> Vec<T> {
        let mut s = self.state.lock().unwrap();
        let n = max_values.min(s.count);
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(Self::pop(&mut s).expect("count tracked correctly"));
        }
        let became_finished = s.closed && s.count == 0;
        drop(s);
        for _ in 0..n {
            self.write_sig.notify_one();
        }
        if became_finished {
            self.read_sig.notify_all();
        }
        out
    }

    /// Removes one item, suspending until one is available, the buffer
    /// finishes, or `timeout` elapses.
    pub async fn remove(&self, timeout: Option<Duration>) -> Option<T> {
        let timer = Timer::start();
        loop {
            if let Some(v) = self.try_remove() {
                return Some(v);
            }
            if self.finished() {
                return None;
            }
            let remaining = match remaining_timeout(timeout, &timer) {
                Some(r) => r,
                None => return None,
            };
            self.read_sig.wait(remaining).await;
        }
    }

    /// Removes between `min_values` and `max_values` (default:
    /// unbounded) items, suspending until `min_values` are available,
    /// the buffer finishes, or `timeout` elapses.
    pub async fn remove_range(
        &self,
        min_values: usize,
        max_values: Option<usize>,
        timeout: Option<Duration>,
    ) -> Vec<T> {
        let min_values = min_values.max(1);
        let timer = Timer::start();
        loop {
            {
                let s = self.state.lock().unwrap();
                let available = s.count;
                let finished = s.closed && s.count == 0;
                if available >= min_values || finished || (s.closed && available > 0) {
                    drop(s);
                    let cap = max_values.unwrap_or(usize::MAX);
                    return self.try_remove_range(cap);
                }
            }
            let remaining = match remaining_timeout(timeout, &timer) {
                Some(r) => r,
                None => return Vec::new(),
            };
            self.read_sig.wait(remaining).await;
        }
    }
}

fn remaining_timeout(timeout: Option<Duration>, timer: &Timer) -> Option<Option<Duration>> {
    match timeout {
        None => Some(None),
        Some(total) => {
            let left = total - timer.elapsed();
            if left.as_micros() <= 0 {
                None
            } else {
                Some(Some(left))
            }
        }
    }
}
