//! The queue: an ordered set of segments with a single serialization point.
//!
//! Enqueues go to the tail segment, dequeues come from the head segment,
//! and a condition variable paired with the queue mutex lets consumers
//! block on an empty queue until a producer appends or the queue closes.
//! Only the head and tail segments are materialized in memory; segments
//! between them stay on disk until the head drains down to them.

use std::fs::DirBuilder;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::codec::Codec;
use crate::config::{Durability, QueueConfig};
use crate::error::{QueueError, QueueResult};
use crate::fs::scan_segment_range;
use crate::lock::DirLock;
use crate::segment::Segment;

type SharedSegment<C> = Arc<Mutex<Segment<C>>>;

/// An embedded, persistent FIFO queue of records encoded by `C`.
///
/// The queue lives in `<dir>/<name>/` as a sequence of append-only segment
/// files and survives process restarts: reopening replays the segment files
/// back into the same in-memory image. All methods are safe to call from
/// multiple threads of one process; a directory lock keeps a second process
/// (or a second `Queue` value in this process) out.
pub struct Queue<C: Codec> {
    name: String,
    dir_path: PathBuf,
    full_path: PathBuf,
    codec: Arc<C>,
    state: Mutex<QueueState<C>>,
    not_empty: Condvar,
    cached_size: AtomicUsize,
}

impl<C: Codec> std::fmt::Debug for Queue<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("full_path", &self.full_path)
            .field("cached_size", &self.cached_size.load(Ordering::Relaxed))
            .finish()
    }
}

struct QueueState<C: Codec> {
    head: SharedSegment<C>,
    tail: SharedSegment<C>,
    items_per_segment: usize,
    durability: Durability,
    lock: Option<DirLock>,
    closed: bool,
    /// Sticky fault set when a dequeue mutated the log but the follow-up
    /// bookkeeping failed; cleared only by close + reopen.
    fault: Option<String>,
}

impl<C: Codec> Queue<C> {
    /// Create a new queue. `<dir>/<name>` must not exist yet; it is created
    /// with mode 0755.
    pub fn new(
        name: &str,
        dir: impl AsRef<Path>,
        items_per_segment: usize,
        codec: C,
    ) -> QueueResult<Self> {
        Self::new_with(name, dir, QueueConfig::new(items_per_segment), codec)
    }

    /// Open an existing queue. `<dir>/<name>` must exist.
    pub fn open(
        name: &str,
        dir: impl AsRef<Path>,
        items_per_segment: usize,
        codec: C,
    ) -> QueueResult<Self> {
        Self::open_with(name, dir, QueueConfig::new(items_per_segment), codec)
    }

    /// Create the queue if `<dir>/<name>` does not exist, open it otherwise.
    pub fn new_or_open(
        name: &str,
        dir: impl AsRef<Path>,
        items_per_segment: usize,
        codec: C,
    ) -> QueueResult<Self> {
        Self::new_or_open_with(name, dir, QueueConfig::new(items_per_segment), codec)
    }

    /// [`Queue::new`] with an explicit configuration.
    pub fn new_with(
        name: &str,
        dir: impl AsRef<Path>,
        config: QueueConfig,
        codec: C,
    ) -> QueueResult<Self> {
        let dir = dir.as_ref();
        let full_path = Self::validate(name, dir, &config)?;
        if full_path.is_dir() {
            return Err(QueueError::invalid_config(format!(
                "queue directory already exists: {} (open it instead)",
                full_path.display()
            )));
        }
        let mut builder = DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o755);
        }
        builder.create(&full_path)?;
        Self::boot(name, dir, full_path, config, codec)
    }

    /// [`Queue::open`] with an explicit configuration.
    pub fn open_with(
        name: &str,
        dir: impl AsRef<Path>,
        config: QueueConfig,
        codec: C,
    ) -> QueueResult<Self> {
        let dir = dir.as_ref();
        let full_path = Self::validate(name, dir, &config)?;
        if !full_path.is_dir() {
            return Err(QueueError::invalid_config(format!(
                "queue does not exist: {}",
                full_path.display()
            )));
        }
        Self::boot(name, dir, full_path, config, codec)
    }

    /// [`Queue::new_or_open`] with an explicit configuration.
    pub fn new_or_open_with(
        name: &str,
        dir: impl AsRef<Path>,
        config: QueueConfig,
        codec: C,
    ) -> QueueResult<Self> {
        let dir = dir.as_ref();
        let full_path = Self::validate(name, dir, &config)?;
        if full_path.is_dir() {
            Self::boot(name, dir, full_path, config, codec)
        } else {
            Self::new_with(name, dir, config, codec)
        }
    }

    fn validate(name: &str, dir: &Path, config: &QueueConfig) -> QueueResult<PathBuf> {
        if name.is_empty() {
            return Err(QueueError::invalid_config("queue name requires a value"));
        }
        if dir.as_os_str().is_empty() {
            return Err(QueueError::invalid_config(
                "queue directory requires a value",
            ));
        }
        if !dir.is_dir() {
            return Err(QueueError::invalid_config(format!(
                "queue parent directory is not valid: {}",
                dir.display()
            )));
        }
        config.validate()?;
        Ok(dir.join(name))
    }

    /// Lock the directory, then recover head and tail from the segment
    /// files on disk (or start segment 1 fresh).
    fn boot(
        name: &str,
        dir: &Path,
        full_path: PathBuf,
        config: QueueConfig,
        codec: C,
    ) -> QueueResult<Self> {
        let lock = DirLock::acquire(&full_path)?;
        let codec = Arc::new(codec);
        let (head, tail) = match scan_segment_range(&full_path)? {
            None => {
                let segment =
                    Segment::create(&full_path, 1, config.durability, Arc::clone(&codec))?;
                let shared = Arc::new(Mutex::new(segment));
                (Arc::clone(&shared), shared)
            }
            Some((min, max)) => {
                let head = Arc::new(Mutex::new(Segment::open(
                    &full_path,
                    min,
                    config.durability,
                    Arc::clone(&codec),
                )?));
                let tail = if min == max {
                    Arc::clone(&head)
                } else {
                    Arc::new(Mutex::new(Segment::open(
                        &full_path,
                        max,
                        config.durability,
                        Arc::clone(&codec),
                    )?))
                };
                (head, tail)
            }
        };

        let queue = Self {
            name: name.to_string(),
            dir_path: dir.to_path_buf(),
            full_path,
            codec,
            state: Mutex::new(QueueState {
                head,
                tail,
                items_per_segment: config.items_per_segment,
                durability: config.durability,
                lock: Some(lock),
                closed: false,
                fault: None,
            }),
            not_empty: Condvar::new(),
            cached_size: AtomicUsize::new(0),
        };
        {
            let state = queue.state.lock();
            queue.refresh_size(&state);
            let head_number = state.head.lock().number();
            let tail_number = state.tail.lock().number();
            debug!(
                queue = %queue.name,
                head = head_number,
                tail = tail_number,
                "opened queue"
            );
        }
        Ok(queue)
    }

    /// Queue name (the directory name under the parent directory).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the queue's segment files.
    pub fn path(&self) -> &Path {
        &self.full_path
    }

    /// Parent directory the queue was created under.
    pub fn dir_path(&self) -> &Path {
        &self.dir_path
    }

    /// Append a record at the tail of the queue.
    ///
    /// Rolls the tail over to a fresh segment first when the current tail
    /// file has reached its record cap, so no segment file ever exceeds the
    /// cap. Wakes one blocked consumer.
    pub fn enqueue(&self, record: C::Record) -> QueueResult<()> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;

        let (tail_full, tail_number) = {
            let tail = state.tail.lock();
            (
                tail.size_on_disk() >= state.items_per_segment,
                tail.number(),
            )
        };
        if tail_full {
            // Seal the full tail: once it is no longer the tail, sync() can
            // not reach it, so any deferred writes must hit the disk now.
            state.tail.lock().sync()?;
            let segment = Segment::create(
                &self.full_path,
                tail_number + 1,
                state.durability,
                Arc::clone(&self.codec),
            )?;
            debug!(
                queue = %self.name,
                segment = tail_number + 1,
                "rolled over to a new tail segment"
            );
            state.tail = Arc::new(Mutex::new(segment));
        }

        let appended = state.tail.lock().append(record);
        if let Err(err) = appended {
            // Encoding is rejected before any bytes are written; anything
            // after that can leave a partial frame in the file.
            if !matches!(err, QueueError::Serialization(_)) {
                error!(
                    queue = %self.name,
                    error = %err,
                    "append failed after touching the segment file; queue must be reopened"
                );
                state.fault = Some(err.to_string());
            }
            return Err(err);
        }
        self.refresh_size(&state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove and return the record at the head of the queue, or `None`
    /// when the queue is empty.
    pub fn dequeue(&self) -> QueueResult<Option<C::Record>> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        self.dequeue_locked(&mut state)
    }

    /// Remove and return the record at the head of the queue, waiting for a
    /// producer when the queue is empty. Returns [`QueueError::Closed`]
    /// when the queue is closed while waiting.
    pub fn dequeue_blocking(&self) -> QueueResult<C::Record> {
        let mut state = self.state.lock();
        loop {
            self.ensure_open(&state)?;
            if let Some(record) = self.dequeue_locked(&mut state)? {
                return Ok(record);
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Return a copy of the record at the head of the queue without
    /// removing it, or `None` when the queue is empty.
    pub fn peek(&self) -> QueueResult<Option<C::Record>>
    where
        C::Record: Clone,
    {
        let state = self.state.lock();
        self.ensure_open(&state)?;
        let head = state.head.lock();
        Ok(head.peek().cloned())
    }

    /// [`Queue::peek`], waiting for a producer when the queue is empty.
    pub fn peek_blocking(&self) -> QueueResult<C::Record>
    where
        C::Record: Clone,
    {
        let mut state = self.state.lock();
        loop {
            self.ensure_open(&state)?;
            {
                let head = state.head.lock();
                if let Some(record) = head.peek() {
                    return Ok(record.clone());
                }
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Insert records ahead of everything currently queued, preserving
    /// their order. This rewrites the head segment file (the append-only
    /// format has no front-insert), so it costs O(head segment size) and
    /// should stay rare.
    pub fn prepend(&self, records: Vec<C::Record>) -> QueueResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let state = self.state.lock();
        self.ensure_open(&state)?;
        let count = records.len();
        state.head.lock().prepend(records)?;
        self.refresh_size(&state);
        debug!(queue = %self.name, count, "prepended records at the queue head");
        self.not_empty.notify_all();
        Ok(())
    }

    /// Number of records in the queue. Fails once the queue is closed.
    ///
    /// When more than two segments exist, the contribution of the segments
    /// between head and tail is estimated as `items_per_segment` each; the
    /// estimate is exact as long as `items_per_segment` has not changed
    /// since the queue was last empty.
    pub fn size(&self) -> QueueResult<usize> {
        let state = self.state.lock();
        self.ensure_open(&state)?;
        Ok(self.locked_size(&state))
    }

    /// Last computed size, read without taking the queue mutex. Intended
    /// for observability; may lag [`Queue::size`] by a concurrent
    /// operation.
    pub fn size_unsafe(&self) -> usize {
        self.cached_size.load(Ordering::Relaxed)
    }

    /// Current head and tail segment numbers. Fails once the queue is
    /// closed.
    pub fn segment_numbers(&self) -> QueueResult<(u64, u64)> {
        let state = self.state.lock();
        self.ensure_open(&state)?;
        let head = state.head.lock().number();
        let tail = state.tail.lock().number();
        Ok((head, tail))
    }

    /// Switch to strict durability: every enqueue and dequeue syncs the
    /// segment file before returning. Fails if strict mode is already on.
    pub fn durability_on(&self) -> QueueResult<()> {
        self.set_durability(Durability::Strict)
    }

    /// Switch to relaxed durability: writes reach the OS but are not
    /// synced until [`Queue::sync`] or [`Queue::durability_on`]. Fails if
    /// relaxed mode is already on.
    pub fn durability_off(&self) -> QueueResult<()> {
        self.set_durability(Durability::Relaxed)
    }

    /// Flush deferred writes in both live segments.
    pub fn sync(&self) -> QueueResult<()> {
        let state = self.state.lock();
        self.ensure_open(&state)?;
        state.head.lock().sync()?;
        if !Arc::ptr_eq(&state.head, &state.tail) {
            state.tail.lock().sync()?;
        }
        Ok(())
    }

    /// Close the queue: flush both segments, drop their file handles,
    /// release the directory lock, and wake every blocked consumer with
    /// [`QueueError::Closed`]. A second close fails with the same error.
    pub fn close(&self) -> QueueResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.closed = true;
        let result = Self::shutdown(&mut state);
        self.not_empty.notify_all();
        debug!(queue = %self.name, "closed queue");
        result
    }

    fn set_durability(&self, durability: Durability) -> QueueResult<()> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        if state.durability == durability {
            return Err(QueueError::invalid_state(match durability {
                Durability::Strict => "durability is already on",
                Durability::Relaxed => "durability is already off",
            }));
        }
        state.head.lock().set_durability(durability)?;
        if !Arc::ptr_eq(&state.head, &state.tail) {
            state.tail.lock().set_durability(durability)?;
        }
        state.durability = durability;
        debug!(queue = %self.name, ?durability, "switched durability mode");
        Ok(())
    }

    fn ensure_open(&self, state: &QueueState<C>) -> QueueResult<()> {
        if state.closed {
            return Err(QueueError::Closed);
        }
        if let Some(reason) = &state.fault {
            return Err(QueueError::Inconsistent(reason.clone()));
        }
        Ok(())
    }

    fn dequeue_locked(&self, state: &mut QueueState<C>) -> QueueResult<Option<C::Record>> {
        let removed = state.head.lock().remove();
        let removed = match removed {
            Ok(removed) => removed,
            Err(err) => {
                // The tombstone write may have stopped partway through,
                // leaving a truncated frame at the end of the file.
                error!(
                    queue = %self.name,
                    error = %err,
                    "tombstone append failed; queue must be reopened"
                );
                state.fault = Some(err.to_string());
                return Err(err);
            }
        };
        let Some(record) = removed else {
            return Ok(None);
        };
        if let Err(err) = self.reclaim(state) {
            // The record is already tombstoned on disk, so it is handed to
            // the caller; the queue refuses further work until a close and
            // reopen replays the log.
            error!(
                queue = %self.name,
                error = %err,
                "head segment reclamation failed; queue must be reopened"
            );
            state.fault = Some(err.to_string());
        }
        self.refresh_size(state);
        Ok(Some(record))
    }

    /// Drop the head segment once it is drained and can take no further
    /// records, then advance to the next segment on disk.
    fn reclaim(&self, state: &mut QueueState<C>) -> QueueResult<()> {
        let single = Arc::ptr_eq(&state.head, &state.tail);
        let (drained, sealed, head_number) = {
            let head = state.head.lock();
            (
                head.size() == 0,
                head.size_on_disk() >= state.items_per_segment,
                head.number(),
            )
        };
        // A head that is also the tail keeps accumulating tombstones until
        // it reaches the cap; a head that is not the tail can never be
        // appended to again, so draining it is enough.
        if !drained || (single && !sealed) {
            return Ok(());
        }

        state.head.lock().delete()?;
        if single {
            let segment = Segment::create(
                &self.full_path,
                head_number + 1,
                state.durability,
                Arc::clone(&self.codec),
            )?;
            let shared = Arc::new(Mutex::new(segment));
            state.head = Arc::clone(&shared);
            state.tail = shared;
            debug!(
                queue = %self.name,
                segment = head_number + 1,
                "replaced the sole drained segment"
            );
        } else {
            let tail_number = state.tail.lock().number();
            if head_number + 1 == tail_number {
                state.head = Arc::clone(&state.tail);
            } else {
                let segment = Segment::open(
                    &self.full_path,
                    head_number + 1,
                    state.durability,
                    Arc::clone(&self.codec),
                )?;
                state.head = Arc::new(Mutex::new(segment));
            }
            debug!(
                queue = %self.name,
                segment = head_number + 1,
                "advanced to the next head segment"
            );
        }
        Ok(())
    }

    fn locked_size(&self, state: &QueueState<C>) -> usize {
        if Arc::ptr_eq(&state.head, &state.tail) {
            return state.head.lock().size();
        }
        let head = state.head.lock();
        let tail = state.tail.lock();
        if tail.number() == head.number() + 1 {
            head.size() + tail.size()
        } else {
            let between = (tail.number() - head.number() - 1) as usize;
            head.size() + between * state.items_per_segment + tail.size()
        }
    }

    fn refresh_size(&self, state: &QueueState<C>) {
        self.cached_size
            .store(self.locked_size(state), Ordering::Relaxed);
    }

    fn shutdown(state: &mut QueueState<C>) -> QueueResult<()> {
        let head_result = state.head.lock().close();
        let tail_result = if Arc::ptr_eq(&state.head, &state.tail) {
            Ok(())
        } else {
            state.tail.lock().close()
        };
        if let Some(lock) = state.lock.as_mut() {
            lock.release();
        }
        state.lock = None;
        head_result.and(tail_result)
    }
}

impl<C: Codec> Drop for Queue<C> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Err(err) = Self::shutdown(state) {
            warn!(queue = %self.name, error = %err, "error while closing queue on drop");
        }
    }
}
