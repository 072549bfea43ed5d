//! Embedded, persistent FIFO queue backed by a segmented append-only log.
//!
//! A queue lives in a directory of its own and holds records of a single
//! type. Enqueues append a length-prefixed frame to the tail segment file;
//! dequeues append a zero-length tombstone frame instead of rewriting
//! anything, so both operations are O(1) appends. Reopening a queue replays
//! the segment files back into the in-memory image, which mirrors only the
//! currently-live records.
//!
//! ## Key components
//!
//! - [`Queue`]: the public API (enqueue, dequeue, blocking consumers,
//!   durability control, close).
//! - [`Codec`]: pluggable record serialization; [`BincodeCodec`] covers any
//!   serde type with a `Default` starting value.
//! - [`QueueConfig`] / [`Durability`]: rollover threshold and sync policy.
//!
//! ## Example
//!
//! ```no_run
//! use duraq::{BincodeCodec, Queue};
//!
//! # fn main() -> Result<(), duraq::QueueError> {
//! let codec: BincodeCodec<u32> = BincodeCodec::new();
//! let queue = Queue::new_or_open("jobs", "/var/lib/myapp", 50, codec)?;
//!
//! queue.enqueue(7)?;
//! if let Some(job) = queue.dequeue()? {
//!     println!("working on {job}");
//! }
//! queue.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! Every public method serializes on one per-queue mutex, so the queue is
//! safe to share across the threads of a process (wrap it in an
//! [`std::sync::Arc`]). The blocking consumers ([`Queue::dequeue_blocking`],
//! [`Queue::peek_blocking`]) park on a condition variable and wake on
//! enqueue or close. A directory-level advisory lock rejects a second live
//! queue over the same directory, in this process or another.
//!
//! ## Durability
//!
//! In the default strict mode every enqueue and dequeue syncs the segment
//! file before returning. [`Queue::durability_off`] defers syncing for
//! throughput; [`Queue::sync`] or [`Queue::durability_on`] flushes the
//! backlog.

mod codec;
mod config;
mod error;
mod fs;
mod lock;
mod queue;
mod segment;

pub use codec::{BincodeCodec, Codec};
pub use config::{Durability, QueueConfig, DEFAULT_ITEMS_PER_SEGMENT};
pub use error::{QueueError, QueueResult};
pub use fs::SEGMENT_FILE_EXTENSION;
pub use queue::Queue;
