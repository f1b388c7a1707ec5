//! Arena sink (spec.md §4.C): a single-sender, multi-producer fixed-size
//! allocation arena. Producers reserve a span, write into it, then commit
//! (partially or fully) or drop the handle to discard; the single consumer
//! pulls committed spans in FIFO order and must consume them to reclaim
//! space. Grounded in `daemon/agents/perf/async_buffer_builder.h`'s
//! reserve/commit/consume handle trio, reimplemented with
//! `std::sync::{Mutex, Condvar}` rather than that header's continuation
//! style, since the blocking contract ("request queues until space becomes
//! available") maps directly onto a condition variable.

use std::collections::VecDeque;
use std::slice;
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Fail, Eq, PartialEq)]
pub enum ArenaError {
    #[fail(display = "requested span of {} bytes exceeds the arena's capacity of {}", requested, capacity)]
    TooLarge { requested: usize, capacity: usize },
    #[fail(display = "a zero-length span was requested")]
    ZeroLength,
    #[fail(display = "the arena sink was destroyed while this operation was pending")]
    Aborted,
}

#[derive(Debug, Clone, Copy)]
enum EntryState {
    Open,
    Committed(usize),
    Discarded,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    offset: u64,
    len: usize,
    state: EntryState,
}

struct State {
    capacity: usize,
    reserved: VecDeque<Entry>,
    base_offset: u64,
    next_offset: u64,
    next_id: u64,
    destroyed: bool,
    one_shot_enabled: bool,
    one_shot_committed: u64,
    one_shot_fired: bool,
    one_shot_handler: Option<Box<dyn FnOnce() + Send>>,
}

impl State {
    fn occupied(&self) -> u64 {
        self.next_offset - self.base_offset
    }

    fn available(&self) -> usize {
        self.capacity - self.occupied() as usize
    }

    /// Pops leading `Discarded` entries, reclaiming their space, stopping at
    /// the first `Open` or `Committed` entry (or an empty queue).
    fn advance(&mut self) {
        while let Some(front) = self.reserved.front() {
            match front.state {
                EntryState::Discarded => {
                    let len = front.len as u64;
                    self.reserved.pop_front();
                    self.base_offset += len;
                }
                EntryState::Open | EntryState::Committed(_) => break,
            }
        }
    }
}

/// The shared arena. Cheap to clone (`Arc`-backed); all clones refer to the
/// same underlying allocation and mutex-guarded state.
#[derive(Clone)]
pub struct ArenaSink {
    inner: Arc<Shared>,
}

struct Shared {
    buffer_ptr: *mut u8,
    buffer_len: usize,
    // Keeps the allocation alive; never touched after construction.
    _buffer: Mutex<Vec<u8>>,
    state: Mutex<State>,
    space_available: Condvar,
    committed_ready: Condvar,
}

unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl ArenaSink {
    pub fn new(capacity: usize) -> Self {
        let mut buffer = vec![0u8; capacity];
        let buffer_ptr = buffer.as_mut_ptr();
        let buffer_len = buffer.len();

        let state = State {
            capacity,
            reserved: VecDeque::new(),
            base_offset: 0,
            next_offset: 0,
            next_id: 0,
            destroyed: false,
            one_shot_enabled: false,
            one_shot_committed: 0,
            one_shot_fired: false,
            one_shot_handler: None,
        };

        ArenaSink {
            inner: Arc::new(Shared {
                buffer_ptr,
                buffer_len,
                _buffer: Mutex::new(buffer),
                state: Mutex::new(state),
                space_available: Condvar::new(),
                committed_ready: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.buffer_len
    }

    /// Registers a completion handler fired exactly once, the first time
    /// cumulative committed bytes since this call reach the arena's
    /// capacity (spec.md §4.C "one-shot mode").
    pub fn enable_one_shot<F: FnOnce() + Send + 'static>(&self, on_full: F) {
        let mut state = self.inner.state.lock().unwrap();
        state.one_shot_enabled = true;
        state.one_shot_committed = 0;
        state.one_shot_fired = false;
        state.one_shot_handler = Some(Box::new(on_full));
    }

    /// Blocks until `n` contiguous bytes are available, the sink is
    /// destroyed, or the request is invalid.
    pub fn request_space(&self, n: usize) -> Result<ReservedSpan, ArenaError> {
        self.reserve_inner(n, true).map(|span| span.expect("blocking reservation always returns Some"))
    }

    /// Non-blocking variant used by the ring-buffer monitor's hot path
    /// (spec.md §4.F "back-pressure"): returns `Ok(None)` immediately
    /// instead of waiting when there isn't room, so the caller can leave
    /// `data_tail` untouched and retry on the next poll.
    pub fn try_request_space(&self, n: usize) -> Result<Option<ReservedSpan>, ArenaError> {
        self.reserve_inner(n, false)
    }

    fn reserve_inner(&self, n: usize, block: bool) -> Result<Option<ReservedSpan>, ArenaError> {
        if n == 0 {
            return Err(ArenaError::ZeroLength);
        }
        if n > self.inner.buffer_len {
            return Err(ArenaError::TooLarge { requested: n, capacity: self.inner.buffer_len });
        }

        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.destroyed {
                return Err(ArenaError::Aborted);
            }

            // The backing storage is a physical ring: a reservation must sit
            // in one contiguous physical range. If the tail end of the
            // buffer is too short to hold `n`, burn it as an immediately
            // Discarded padding entry and retry from physical offset 0,
            // exactly as the perf ring buffer's own consumer treats the
            // unused tail of a wrapped record (mmap.rs's `slices`).
            let local_offset = (state.next_offset % self.inner.buffer_len as u64) as usize;
            let contiguous = self.inner.buffer_len - local_offset;
            if contiguous < n {
                if state.available() >= contiguous + n {
                    let pad_id = state.next_id;
                    state.next_id += 1;
                    let pad_offset = state.next_offset;
                    state.next_offset += contiguous as u64;
                    state.reserved.push_back(Entry {
                        id: pad_id,
                        offset: pad_offset,
                        len: contiguous,
                        state: EntryState::Discarded,
                    });
                    continue;
                }
                if !block {
                    return Ok(None);
                }
                state = self.inner.space_available.wait(state).unwrap();
                continue;
            }

            if state.available() >= n {
                let id = state.next_id;
                state.next_id += 1;
                let offset = state.next_offset;
                state.next_offset += n as u64;
                state.reserved.push_back(Entry { id, offset, len: n, state: EntryState::Open });

                let ptr = unsafe { self.inner.buffer_ptr.add(local_offset) };

                return Ok(Some(ReservedSpan {
                    sink: self.inner.clone(),
                    id,
                    ptr,
                    len: n,
                    resolved: false,
                }));
            }
            if !block {
                return Ok(None);
            }
            state = self.inner.space_available.wait(state).unwrap();
        }
    }

    /// Blocks until the oldest reservation is committed, the sink is
    /// destroyed, or there is nothing left to drain.
    pub fn pull_committed(&self) -> Result<ConsumeHandle, ArenaError> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.destroyed {
                return Err(ArenaError::Aborted);
            }
            state.advance();
            if let Some(front) = state.reserved.front() {
                if let EntryState::Committed(committed_len) = front.state {
                    let id = front.id;
                    let offset = front.offset;
                    let local_offset = (offset % self.inner.buffer_len as u64) as usize;
                    let ptr = unsafe { self.inner.buffer_ptr.add(local_offset) };
                    return Ok(ConsumeHandle {
                        sink: self.inner.clone(),
                        id,
                        ptr,
                        len: committed_len,
                        consumed: false,
                    });
                }
            }
            state = self.inner.committed_ready.wait(state).unwrap();
        }
    }

    /// Cancels every outstanding producer and consumer wait with an
    /// aborted signal; no further reservations are accepted.
    pub fn destroy(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.destroyed = true;
        drop(state);
        self.inner.space_available.notify_all();
        self.inner.committed_ready.notify_all();
    }

    /// Total bytes currently reserved but not yet reclaimed.
    pub fn occupied_bytes(&self) -> u64 {
        self.inner.state.lock().unwrap().occupied()
    }
}

fn commit_entry(sink: &Shared, id: u64, commit_len: usize) {
    let mut state = sink.state.lock().unwrap();
    if let Some(entry) = state.reserved.iter_mut().find(|e| e.id == id) {
        entry.state = EntryState::Committed(commit_len);
    }

    let mut just_fired = false;
    if state.one_shot_enabled && !state.one_shot_fired {
        state.one_shot_committed += commit_len as u64;
        if state.one_shot_committed >= state.capacity as u64 {
            state.one_shot_fired = true;
            just_fired = true;
        }
    }
    let handler = if just_fired { state.one_shot_handler.take() } else { None };

    state.advance();
    drop(state);

    if let Some(f) = handler {
        f();
    }
    sink.committed_ready.notify_all();
    sink.space_available.notify_all();
}

fn discard_entry(sink: &Shared, id: u64) {
    let mut state = sink.state.lock().unwrap();
    if let Some(entry) = state.reserved.iter_mut().find(|e| e.id == id) {
        entry.state = EntryState::Discarded;
    }
    state.advance();
    drop(state);
    sink.space_available.notify_all();
    sink.committed_ready.notify_all();
}

fn consume_entry(sink: &Shared, id: u64) {
    let mut state = sink.state.lock().unwrap();
    debug_assert_eq!(state.reserved.front().map(|e| e.id), Some(id), "consume called out of FIFO order");
    if let Some(front) = state.reserved.front() {
        if front.id == id {
            let len = front.len as u64;
            state.reserved.pop_front();
            state.base_offset += len;
        }
    }
    state.advance();
    drop(state);
    sink.space_available.notify_all();
    sink.committed_ready.notify_all();
}

/// A producer's handle to a reserved span. Write into [`Self::as_mut_slice`]
/// then call [`Self::commit`]; dropping without committing discards the
/// reservation.
pub struct ReservedSpan {
    sink: Arc<Shared>,
    id: u64,
    ptr: *mut u8,
    len: usize,
    resolved: bool,
}

unsafe impl Send for ReservedSpan {}

impl ReservedSpan {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Commits up to `self.len()` bytes; the committed span becomes visible
    /// to the consumer in FIFO order.
    pub fn commit(mut self, n: usize) {
        assert!(n <= self.len, "commit length exceeds reserved length");
        self.resolved = true;
        commit_entry(&self.sink, self.id, n);
    }

    /// Explicitly discards the reservation without committing.
    pub fn discard(mut self) {
        self.resolved = true;
        discard_entry(&self.sink, self.id);
    }
}

impl Drop for ReservedSpan {
    fn drop(&mut self) {
        if !self.resolved {
            discard_entry(&self.sink, self.id);
        }
    }
}

/// The consumer's handle to a committed span. Read from
/// [`Self::as_slice`] then call [`Self::consume`] to release the space.
pub struct ConsumeHandle {
    sink: Arc<Shared>,
    id: u64,
    ptr: *mut u8,
    len: usize,
    consumed: bool,
}

unsafe impl Send for ConsumeHandle {}

impl ConsumeHandle {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn consume(mut self) {
        self.consumed = true;
        consume_entry(&self.sink, self.id);
    }
}

impl Drop for ConsumeHandle {
    fn drop(&mut self) {
        if !self.consumed {
            // Dropping without consuming signals failure back to the
            // producer's side; the space is still reclaimed so the arena
            // never wedges, matching the "never silently dropped" rule by
            // at minimum not leaking capacity.
            consume_entry(&self.sink, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn reserve_zero_or_oversized_fails_immediately() {
        let arena = ArenaSink::new(16);
        assert_eq!(arena.request_space(0).unwrap_err(), ArenaError::ZeroLength);
        assert!(matches!(arena.request_space(17).unwrap_err(), ArenaError::TooLarge { .. }));
    }

    #[test]
    fn try_request_space_returns_none_without_blocking_when_full() {
        let arena = ArenaSink::new(8);
        let _hold = arena.request_space(8).unwrap();
        assert!(arena.try_request_space(1).unwrap().is_none());
    }

    #[test]
    fn commit_then_consume_reclaims_exact_bytes() {
        let arena = ArenaSink::new(16);
        let mut span = arena.request_space(8).unwrap();
        span.as_mut_slice().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        span.commit(8);

        assert_eq!(arena.occupied_bytes(), 8);

        let handle = arena.pull_committed().unwrap();
        assert_eq!(handle.as_slice(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        handle.consume();

        assert_eq!(arena.occupied_bytes(), 0);
    }

    #[test]
    fn discard_reclaims_space_without_reaching_consumer() {
        let arena = ArenaSink::new(16);
        let span = arena.request_space(16).unwrap();
        drop(span); // implicit discard

        assert_eq!(arena.occupied_bytes(), 0);
        // a fresh reservation for the full capacity must now succeed
        let span2 = arena.request_space(16).unwrap();
        span2.discard();
    }

    #[test]
    fn uncommitted_head_blocks_reclaim_of_committed_tail() {
        let arena = ArenaSink::new(16);
        let first = arena.request_space(8).unwrap();
        let mut second = arena.request_space(8).unwrap();
        second.as_mut_slice().copy_from_slice(&[9; 8]);
        second.commit(8);

        // second is committed but first (the head) is still open: no space
        // should be reclaimed yet.
        assert_eq!(arena.occupied_bytes(), 16);

        first.discard();
        // now both entries are resolved and in FIFO order: first discards
        // immediately, which then exposes second as the new front, still
        // occupying its own space until consumed.
        assert_eq!(arena.occupied_bytes(), 8);
    }

    #[test]
    fn one_shot_fires_exactly_once_at_capacity() {
        let arena = ArenaSink::new(16);
        let (tx, rx) = mpsc::channel();
        arena.enable_one_shot(move || {
            tx.send(()).unwrap();
        });

        let mut span = arena.request_space(10).unwrap();
        span.as_mut_slice().copy_from_slice(&[0; 10]);
        span.commit(10);
        assert!(rx.try_recv().is_err());

        let handle = arena.pull_committed().unwrap();
        handle.consume();

        let mut span2 = arena.request_space(10).unwrap();
        span2.as_mut_slice()[..6].copy_from_slice(&[0; 6]);
        span2.commit(6);

        rx.recv_timeout(::std::time::Duration::from_secs(1)).expect("one-shot handler should have fired");
    }

    #[test]
    fn destroy_aborts_pending_producer() {
        let arena = ArenaSink::new(8);
        let _hold = arena.request_space(8).unwrap();

        let arena2 = arena.clone();
        let waiter = thread::spawn(move || arena2.request_space(1));

        thread::sleep(::std::time::Duration::from_millis(50));
        arena.destroy();

        let result = waiter.join().unwrap();
        assert_eq!(result.unwrap_err(), ArenaError::Aborted);
    }
}
