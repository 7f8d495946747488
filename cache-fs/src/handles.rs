//! Read and write handles (C6, §4.4/§4.5): the public per-transaction
//! surface returned by `CacheFs::async_open_read`/`async_open_write`.
//!
//! The `running -> close -> closed` state machine plus the parallel
//! `service_stopped` terminal state are grounded on
//! `examples/original_source/xproxy-beta/cache/object_write_handle.cpp`'s
//! `exec()` dispatch. The resumable skip/copy-driven fragment staging is
//! grounded on the same file's `try_write_all`, adapted from a transaction
//! that tracks a wider "actual range" against a narrower declared range to
//! our simpler single-declared-range transaction: the overflow
//! ("unexpected_data") case is exactly `!skip.done() && more input remains`
//! becoming `skip.done() && !cursor.all_read()`. Handle teardown releasing
//! resources even if the caller forgets to call close is grounded on
//! `vector_buffers::disk_v2::writer::Writer`'s `Drop` impl.
//!
//! Every data-moving call (`async_write`, `async_read`) is dispatched
//! through the [`crate::aio::AioService`] rather than run inline, so a slow
//! disk never blocks the caller's executor thread beyond the cost of
//! awaiting a `oneshot` receiver; `async_open_read`/`async_open_write`
//! (defined on `CacheFs` in `orchestrator.rs`) do the same.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::instrument;

use crate::error::HandleError;
use crate::key::ObjectKey;
use crate::orchestrator::CacheFs;
use crate::range::Range;

/// The three (plus one terminal) states a handle moves through. Represented
/// as a plain `AtomicU8` rather than an enum-typed atomic so it can be
/// checked cooperatively from inside an in-flight operation without taking
/// a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum HandleState {
    Running = 0,
    Close = 1,
    Closed = 2,
    ServiceStopped = 3,
}

impl HandleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HandleState::Running,
            1 => HandleState::Close,
            2 => HandleState::Closed,
            _ => HandleState::ServiceStopped,
        }
    }
}

/// A resumable cursor over an owned gather list of byte buffers, the Rust
/// analogue of `read_buffers.h`'s multi-buffer scatter/gather cursor.
/// Buffers are owned `Bytes` rather than borrowed slices so a job built from
/// one of these can be boxed into a `'static` future for the AIO queue.
struct GatherCursor {
    bufs: Vec<Bytes>,
    idx: usize,
    offset: usize,
}

impl GatherCursor {
    fn new(bufs: Vec<Bytes>) -> Self {
        Self { bufs, idx: 0, offset: 0 }
    }

    fn all_read(&self) -> bool {
        self.idx >= self.bufs.len()
    }

    /// Discards up to `n` remaining bytes without copying them anywhere.
    /// Used to drain the rest of an overlong input after detecting
    /// [`HandleError::UnexpectedData`].
    fn skip(&mut self, mut n: u64) -> u64 {
        let mut skipped = 0u64;
        while n > 0 && !self.all_read() {
            let cur = &self.bufs[self.idx];
            let avail = (cur.len() - self.offset) as u64;
            let take = avail.min(n);
            self.offset += take as usize;
            n -= take;
            skipped += take;
            if self.offset == cur.len() {
                self.idx += 1;
                self.offset = 0;
            }
        }
        skipped
    }

    /// Copies up to `dst.len()` bytes out of the gather list, returning the
    /// number actually copied (less than `dst.len()` only once the list is
    /// exhausted).
    fn read(&mut self, dst: &mut [u8]) -> u64 {
        let mut copied = 0usize;
        while copied < dst.len() && !self.all_read() {
            let cur = &self.bufs[self.idx];
            let avail = cur.len() - self.offset;
            let take = avail.min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&cur[self.offset..self.offset + take]);
            self.offset += take;
            copied += take;
            if self.offset == cur.len() {
                self.idx += 1;
                self.offset = 0;
            }
        }
        copied as u64
    }
}

/// A write transaction (§4.4): a declared logical range for one key, fed in
/// one or more `async_write` calls and finished by `async_close`.
pub struct WriteHandle {
    engine: Arc<CacheFs>,
    key: ObjectKey,
    range: Range,
    truncate: bool,
    produced: AtomicU64,
    state: AtomicU8,
    staging: Mutex<Vec<u8>>,
    in_flight: AtomicBool,
}

impl WriteHandle {
    pub(crate) fn new(
        engine: Arc<CacheFs>,
        key: ObjectKey,
        range: Range,
        truncate: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            key,
            range,
            truncate,
            produced: AtomicU64::new(0),
            state: AtomicU8::new(HandleState::Running as u8),
            staging: Mutex::new(Vec::new()),
            in_flight: AtomicBool::new(false),
        })
    }

    /// The `&dyn OverwritePolicy` selected by this transaction's declared
    /// `truncate` flag: `true` -> [`AlwaysOverwrite`], `false` ->
    /// [`NeverOverwrite`].
    fn overwrite_policy(&self) -> &'static dyn crate::index::OverwritePolicy {
        if self.truncate {
            &crate::index::AlwaysOverwrite
        } else {
            &crate::index::NeverOverwrite
        }
    }

    fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The key this transaction is writing.
    pub fn key(&self) -> ObjectKey {
        self.key
    }

    /// The declared logical range this transaction is writing.
    pub fn range(&self) -> Range {
        self.range
    }

    /// §4.4 `async_write`. Feeds a gather list of buffers into the
    /// transaction. Returns the number of bytes consumed, or
    /// [`HandleError::UnexpectedData`] if the input carries more bytes than
    /// the declared range has room for. At most one `async_write` may be
    /// in flight on a given handle at a time; a second concurrent call
    /// panics rather than silently interleaving writes.
    #[instrument(skip(self, bufs), fields(key = ?self.key))]
    pub async fn async_write(self: &Arc<Self>, bufs: Vec<Bytes>) -> Result<u64, HandleError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            panic!("concurrent async_write calls on the same write handle are a usage error");
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        let this = Arc::clone(self);
        let job: crate::aio::Job = Box::pin(async move {
            let res = this.do_write(bufs).await;
            let _ = tx.send(res);
        });
        self.engine.aio().push_back_write_queue(job);
        let res = rx.await.unwrap_or(Err(HandleError::ServiceStopped));
        self.in_flight.store(false, Ordering::Release);
        res
    }

    async fn do_write(&self, bufs: Vec<Bytes>) -> Result<u64, HandleError> {
        match self.state() {
            HandleState::Running => {}
            HandleState::ServiceStopped => return Err(HandleError::ServiceStopped),
            HandleState::Close | HandleState::Closed => return Err(HandleError::OperationAborted),
        }

        let mut cursor = GatherCursor::new(bufs);
        let mut consumed = 0u64;

        loop {
            if matches!(self.state(), HandleState::Close | HandleState::Closed) {
                return Err(HandleError::OperationAborted);
            }

            let produced = self.produced.load(Ordering::Acquire);
            if produced >= self.range.len {
                break;
            }

            let mut staging = self.staging.lock();
            let fragment_start = produced - staging.len() as u64;
            let frag_cap = self
                .engine
                .cfg()
                .frag_max_data_size
                .min(self.range.len - fragment_start);
            let space = (frag_cap - staging.len() as u64) as usize;

            let mut got = 0usize;
            if space > 0 {
                let before = staging.len();
                staging.resize(before + space, 0);
                got = cursor.read(&mut staging[before..]) as usize;
                staging.truncate(before + got);
                consumed += got as u64;
                self.produced.fetch_add(got as u64, Ordering::AcqRel);
            }

            let now_produced = self.produced.load(Ordering::Acquire);
            let is_final = now_produced >= self.range.len;
            let frag_full = staging.len() as u64 == frag_cap;

            if !staging.is_empty() && (frag_full || is_final) {
                let frag_len = staging.len() as u64;
                let frag_offset = self.range.offset + now_produced - frag_len;
                let payload = std::mem::take(&mut *staging);
                drop(staging);
                self.hand_off(frag_offset, &payload).await;
            }

            if is_final {
                break;
            }
            if got == 0 {
                // No more input available right now and the declared range
                // isn't finished yet; nothing left to do this call.
                break;
            }
        }

        if !cursor.all_read() {
            cursor.skip(u64::MAX);
            return Err(HandleError::UnexpectedData);
        }

        Ok(consumed)
    }

    /// Stages one fragment with the aggregate writer, flushing once if the
    /// current block has no room. Never surfaces the aggregate writer's I/O
    /// errors to the caller (§7 propagation policy): a flush failure is
    /// routed to the fatal-error counter and the write is silently dropped,
    /// the same way a budget-exhausted write is dropped.
    async fn hand_off(&self, offset: u64, payload: &[u8]) {
        let Some(range) = Range::new(offset, payload.len() as u64) else {
            return;
        };
        if self.engine.aggregate().write_frag(
            self.engine.index(),
            self.key,
            range,
            payload,
            self.overwrite_policy(),
        ) {
            return;
        }
        if self
            .engine
            .aggregate()
            .flush(self.engine.index(), self.engine.volume())
            .await
            .is_err()
        {
            self.engine.on_disk_error();
            return;
        }
        if !self.engine.aggregate().write_frag(
            self.engine.index(),
            self.key,
            range,
            payload,
            self.overwrite_policy(),
        )
        {
            // A freshly flushed block is empty; `frag_max_data_size` is
            // validated at config-build time to always fit inside one
            // block's payload, so this is unreachable in practice.
            self.engine.on_disk_error();
        }
    }

    /// §4.4 `async_close`. If any bytes are staged but not yet handed to
    /// the aggregate writer, flushes them as a final (possibly short)
    /// fragment first.
    pub async fn async_close(self: &Arc<Self>) -> Result<(), HandleError> {
        let prev = self.state.swap(HandleState::Close as u8, Ordering::AcqRel);
        if prev == HandleState::Running as u8 {
            let staging = {
                let mut s = self.staging.lock();
                std::mem::take(&mut *s)
            };
            if !staging.is_empty() {
                let produced = self.produced.load(Ordering::Acquire);
                let offset = self.range.offset + produced - staging.len() as u64;
                self.hand_off(offset, &staging).await;
            }
        }
        self.state.store(HandleState::Closed as u8, Ordering::Release);
        Ok(())
    }
}

/// A read transaction (§4.5): a snapshot of the range elements covering the
/// requested logical range at the moment it was opened, each with its
/// reader count bumped for the transaction's lifetime.
pub struct ReadHandle {
    engine: Arc<CacheFs>,
    key: ObjectKey,
    requested: Range,
    /// The logical sub-ranges the requested range was covered by at
    /// begin-time. Stored as plain `Range`s (not references into the
    /// index, and not clones of `RangeElem`, which holds non-`Clone`
    /// atomics) so release can re-look-up the live elements by equality —
    /// valid because a logical range is stable across evacuation; only its
    /// `disk_block`/`is_in_memory` bits move.
    covered: Vec<Range>,
    state: AtomicU8,
    cursor: AtomicU64,
    in_flight: AtomicBool,
}

impl ReadHandle {
    /// §4.5 `fsmd_begin_read`. Bumps every covering element's reader count;
    /// rolls back and returns `None` if the requested range isn't fully
    /// covered, or if bumping any element would overflow its counter.
    pub(crate) fn begin_read(engine: Arc<CacheFs>, key: ObjectKey, requested: Range) -> Option<Arc<Self>> {
        let table = engine.index().read();
        let slice = table.find_covering(&key, requested)?;

        let mut bumped = Vec::with_capacity(slice.len());
        for elem in slice {
            if elem.bump_reader() {
                bumped.push(elem.range);
            } else {
                for r in &bumped {
                    if let Some(e) = slice.iter().find(|e| e.range == *r) {
                        e.release_reader();
                    }
                }
                return None;
            }
        }
        drop(table);

        Some(Arc::new(Self {
            engine,
            key,
            requested,
            covered: bumped,
            state: AtomicU8::new(HandleState::Running as u8),
            cursor: AtomicU64::new(requested.offset),
            in_flight: AtomicBool::new(false),
        }))
    }

    fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn key(&self) -> ObjectKey {
        self.key
    }

    pub fn requested(&self) -> Range {
        self.requested
    }

    /// §4.5 `async_read`. Returns up to `max_len` bytes starting at the
    /// transaction's current cursor, or [`HandleError::Eof`] once the
    /// requested range is exhausted. At most one `async_read` may be in
    /// flight at a time.
    #[instrument(skip(self), fields(key = ?self.key))]
    pub async fn async_read(self: &Arc<Self>, max_len: usize) -> Result<Vec<u8>, HandleError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            panic!("concurrent async_read calls on the same read handle are a usage error");
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        let this = Arc::clone(self);
        let job: crate::aio::Job = Box::pin(async move {
            let res = this.do_read(max_len).await;
            let _ = tx.send(res);
        });
        self.engine.aio().push_back_read_queue(job);
        let res = rx.await.unwrap_or(Err(HandleError::ServiceStopped));
        self.in_flight.store(false, Ordering::Release);
        res
    }

    async fn do_read(&self, max_len: usize) -> Result<Vec<u8>, HandleError> {
        match self.state() {
            HandleState::Running => {}
            HandleState::ServiceStopped => return Err(HandleError::ServiceStopped),
            HandleState::Close | HandleState::Closed => return Err(HandleError::OperationAborted),
        }

        let pos = self.cursor.load(Ordering::Acquire);
        if pos >= self.requested.end() {
            return Err(HandleError::Eof);
        }

        let elem_range = self
            .covered
            .iter()
            .copied()
            .find(|r| r.offset <= pos && pos < r.end())
            .expect("read transaction's covered ranges span the full requested range");

        let (disk_block, in_memory) = {
            let table = self.engine.index().read();
            let elems = table.read_entries(&self.key).ok_or(HandleError::Eof)?;
            let e = elems
                .iter()
                .find(|e| e.range == elem_range)
                .ok_or(HandleError::Eof)?;
            (e.disk_block(), e.is_in_memory())
        };

        let payload = self
            .engine
            .aggregate()
            .read_fragment(self.engine.volume(), self.key, elem_range, disk_block, in_memory)
            .await?;

        // The caller's requested range may start or end partway through this
        // fragment (e.g. the fragment is wider than what was actually asked
        // for); `SkipCopy` is the same cursor the write path's original
        // counterpart used to carve a sub-window out of a fragment, reused
        // here for the read side's identical skip-before/copy-middle/
        // skip-after shape.
        let window_start = self.requested.offset.max(elem_range.offset) - elem_range.offset;
        let window_end = elem_range.end().min(self.requested.end()) - elem_range.offset;
        let cur_off = pos - elem_range.offset;
        let mut cursor = crate::skip_copy::SkipCopy::new(
            cur_off,
            elem_range.len,
            window_start,
            elem_range.len - window_end,
        );

        let mut src_pos = cur_off as usize;
        let want = (window_end - cur_off).min(max_len as u64) as usize;
        let mut buf = vec![0u8; want];
        let step = cursor.step(
            &mut buf,
            |n| {
                let n = n.min((payload.len() - src_pos) as u64);
                src_pos += n as usize;
                n
            },
            |dst| {
                let n = dst.len().min(payload.len() - src_pos);
                dst[..n].copy_from_slice(&payload[src_pos..src_pos + n]);
                src_pos += n;
                n as u64
            },
        );
        buf.truncate(step.copied as usize);
        self.cursor.fetch_add(step.copied, Ordering::AcqRel);
        Ok(buf)
    }

    /// §4.5 `end_read`/`async_close`: drops the read transaction,
    /// releasing every reader count it holds. Idempotent; safe to call
    /// more than once (e.g. once explicitly, once via `Drop`).
    pub fn async_close(&self) {
        self.release();
    }

    fn release(&self) {
        if self.state.swap(HandleState::Closed as u8, Ordering::AcqRel) == HandleState::Closed as u8 {
            return;
        }
        let table = self.engine.index().read();
        if let Some(elems) = table.read_entries(&self.key) {
            for r in &self.covered {
                if let Some(e) = elems.iter().find(|e| e.range == *r) {
                    e.release_reader();
                }
            }
        }
    }
}

impl Drop for ReadHandle {
    /// A caller that drops its `Arc<ReadHandle>` without calling
    /// `async_close` must not leak reader counts forever (§4.5: "exists
    /// until `end_read` is called"). `release` is idempotent, so this is a
    /// no-op if `async_close` already ran.
    fn drop(&mut self) {
        self.release();
    }
}
