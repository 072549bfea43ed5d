//! One segment of the queue: an append-only file plus the in-memory image
//! of its currently-live records.
//!
//! The file is a concatenation of frames. A data frame is a little-endian
//! `u32` payload length followed by the payload; a zero-length frame is a
//! tombstone marking the removal of the oldest live record. Appending is the
//! only write path, so a dequeue costs one 4-byte append instead of a
//! rewrite, and reopening a segment replays the frames into the same image
//! that was in memory before the segment was closed.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{debug, trace};

use crate::codec::Codec;
use crate::config::Durability;
use crate::error::{QueueError, QueueResult};
use crate::fs::{fsync_dir, segment_path};

const FRAME_HEADER_LEN: usize = 4;
const TOMBSTONE_FRAME: [u8; FRAME_HEADER_LEN] = [0; FRAME_HEADER_LEN];

/// Hard ceiling on the payload buffer reserved up front during replay, so a
/// corrupt length prefix cannot trigger a giant allocation before the short
/// read is detected.
const REPLAY_RESERVE_LIMIT: usize = 1 << 20;

pub(crate) struct Segment<C: Codec> {
    dir_path: PathBuf,
    number: u64,
    codec: Arc<C>,
    live: VecDeque<C::Record>,
    removed_count: usize,
    file: Option<File>,
    durability: Durability,
    dirty: bool,
}

impl<C: Codec> std::fmt::Debug for Segment<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("dir_path", &self.dir_path)
            .field("number", &self.number)
            .field("live_len", &self.live.len())
            .field("removed_count", &self.removed_count)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl<C: Codec> Segment<C> {
    /// Create the segment file for `number` inside `dir`. The file must not
    /// already exist.
    pub(crate) fn create(
        dir: &Path,
        number: u64,
        durability: Durability,
        codec: Arc<C>,
    ) -> QueueResult<Self> {
        if !dir.is_dir() {
            return Err(QueueError::invalid_state(format!(
                "queue directory does not exist: {}",
                dir.display()
            )));
        }
        let path = segment_path(dir, number);
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| match err.kind() {
                io::ErrorKind::AlreadyExists => QueueError::invalid_state(format!(
                    "segment file already exists: {}",
                    path.display()
                )),
                _ => QueueError::Io(err),
            })?;
        debug!(segment = number, path = %path.display(), "created segment file");
        Ok(Self {
            dir_path: dir.to_path_buf(),
            number,
            codec,
            live: VecDeque::new(),
            removed_count: 0,
            file: Some(file),
            durability,
            dirty: false,
        })
    }

    /// Open an existing segment file, replay its frames into memory, and
    /// keep an append handle for future writes.
    pub(crate) fn open(
        dir: &Path,
        number: u64,
        durability: Durability,
        codec: Arc<C>,
    ) -> QueueResult<Self> {
        let path = segment_path(dir, number);
        let mut segment = Self {
            dir_path: dir.to_path_buf(),
            number,
            codec,
            live: VecDeque::new(),
            removed_count: 0,
            file: None,
            durability,
            dirty: false,
        };
        segment.replay(&path)?;
        segment.file = Some(OpenOptions::new().append(true).open(&path)?);
        Ok(segment)
    }

    /// Fold the segment file into the in-memory image, frame by frame.
    fn replay(&mut self, path: &Path) -> QueueResult<()> {
        let file = File::open(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => QueueError::invalid_state(format!(
                "segment file does not exist: {}",
                path.display()
            )),
            _ => QueueError::Io(err),
        })?;
        let mut reader = BufReader::new(file);
        let mut header = [0u8; FRAME_HEADER_LEN];
        loop {
            let filled = read_full(&mut reader, &mut header)?;
            if filled == 0 {
                break;
            }
            if filled < FRAME_HEADER_LEN {
                return Err(QueueError::corrupted(path, "truncated frame header"));
            }
            let len = u32::from_le_bytes(header) as usize;
            if len == 0 {
                if self.live.pop_front().is_none() {
                    return Err(QueueError::corrupted(path, "tombstone with no live record"));
                }
                self.removed_count += 1;
                continue;
            }
            let mut payload = Vec::with_capacity(len.min(REPLAY_RESERVE_LIMIT));
            let filled = (&mut reader).take(len as u64).read_to_end(&mut payload)?;
            if filled < len {
                return Err(QueueError::corrupted(
                    path,
                    format!("truncated record payload: expected {len} bytes, found {filled}"),
                ));
            }
            let mut record = self.codec.new_empty();
            self.codec
                .decode_into(&payload, &mut record)
                .map_err(|err| QueueError::corrupted(path, format!("undecodable record: {err}")))?;
            self.live.push_back(record);
        }
        debug!(
            segment = self.number,
            live = self.live.len(),
            removed = self.removed_count,
            "replayed segment file"
        );
        Ok(())
    }

    /// Append a record frame and take ownership of the record.
    pub(crate) fn append(&mut self, record: C::Record) -> QueueResult<()> {
        let payload = self.codec.encode(&record)?;
        if payload.is_empty() {
            return Err(QueueError::serialization(
                "record encoded to zero bytes, which marks a removal on disk",
            ));
        }
        let len = u32::try_from(payload.len()).map_err(|_| {
            QueueError::serialization(format!(
                "record payload of {} bytes exceeds the frame limit",
                payload.len()
            ))
        })?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        {
            let mut file = self.writer()?;
            file.write_all(&frame)?;
        }
        self.live.push_back(record);
        trace!(segment = self.number, bytes = payload.len(), "appended record frame");
        self.apply_durability()
    }

    /// Remove the oldest live record, marking the removal with a tombstone
    /// frame. Returns `None` when the segment has no live records.
    pub(crate) fn remove(&mut self) -> QueueResult<Option<C::Record>> {
        if self.live.is_empty() {
            return Ok(None);
        }
        {
            let mut file = self.writer()?;
            file.write_all(&TOMBSTONE_FRAME)?;
        }
        let record = self.live.pop_front();
        self.removed_count += 1;
        trace!(segment = self.number, "appended tombstone frame");
        self.apply_durability()?;
        Ok(record)
    }

    /// The oldest live record, without removing it.
    pub(crate) fn peek(&self) -> Option<&C::Record> {
        self.live.front()
    }

    /// Insert records ahead of the current live image.
    ///
    /// The append-only format has no front-insert frame, so the whole file
    /// is rewritten: the resulting live records are encoded into a temp file
    /// in the segment directory, synced, and renamed over the segment file,
    /// and the directory is synced so the rename survives power loss. The
    /// rewritten file carries no tombstones, so the removal count resets.
    pub(crate) fn prepend(&mut self, records: Vec<C::Record>) -> QueueResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut frames = Vec::new();
        for record in records.iter().chain(self.live.iter()) {
            let payload = self.codec.encode(record)?;
            if payload.is_empty() {
                return Err(QueueError::serialization(
                    "record encoded to zero bytes, which marks a removal on disk",
                ));
            }
            let len = u32::try_from(payload.len()).map_err(|_| {
                QueueError::serialization(format!(
                    "record payload of {} bytes exceeds the frame limit",
                    payload.len()
                ))
            })?;
            frames.extend_from_slice(&len.to_le_bytes());
            frames.extend_from_slice(&payload);
        }

        let path = self.path();
        let mut tmp = NamedTempFile::new_in(&self.dir_path).map_err(|err| {
            QueueError::FileSystem(format!(
                "unable to create temp file in {}: {err}",
                self.dir_path.display()
            ))
        })?;
        tmp.write_all(&frames)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|err| {
            QueueError::FileSystem(format!(
                "unable to replace segment file {}: {}",
                path.display(),
                err.error
            ))
        })?;
        fsync_dir(&self.dir_path)?;
        self.file = Some(OpenOptions::new().append(true).open(&path)?);

        let prepended = records.len();
        for record in records.into_iter().rev() {
            self.live.push_front(record);
        }
        self.removed_count = 0;
        self.dirty = false;
        debug!(
            segment = self.number,
            prepended,
            live = self.live.len(),
            "rewrote segment file for front insert"
        );
        Ok(())
    }

    /// Number of live records.
    pub(crate) fn size(&self) -> usize {
        self.live.len()
    }

    /// Number of records ever appended to this segment's file: live records
    /// plus tombstoned ones. Rollover and reclamation are driven by this
    /// count, which bounds the file size.
    pub(crate) fn size_on_disk(&self) -> usize {
        self.live.len() + self.removed_count
    }

    pub(crate) fn number(&self) -> u64 {
        self.number
    }

    pub(crate) fn path(&self) -> PathBuf {
        segment_path(&self.dir_path, self.number)
    }

    /// Flush deferred writes, if any.
    pub(crate) fn sync(&mut self) -> QueueResult<()> {
        if self.dirty {
            self.flush()?;
        }
        Ok(())
    }

    /// Switch durability mode. Entering strict mode flushes any deferred
    /// writes first, so the strict guarantee holds from this call on.
    pub(crate) fn set_durability(&mut self, durability: Durability) -> QueueResult<()> {
        if durability == Durability::Strict && self.dirty {
            self.flush()?;
        }
        self.durability = durability;
        Ok(())
    }

    /// Flush deferred writes and drop the file handle.
    pub(crate) fn close(&mut self) -> QueueResult<()> {
        let result = if self.dirty { self.flush() } else { Ok(()) };
        self.file = None;
        result
    }

    /// Drop the file handle, unlink the segment file, and clear the image.
    pub(crate) fn delete(&mut self) -> QueueResult<()> {
        self.file = None;
        let path = self.path();
        fs::remove_file(&path).map_err(|err| {
            QueueError::FileSystem(format!(
                "unable to delete segment file {}: {err}",
                path.display()
            ))
        })?;
        self.live.clear();
        debug!(segment = self.number, "deleted drained segment file");
        Ok(())
    }

    fn writer(&self) -> QueueResult<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| QueueError::invalid_state("segment file handle is closed"))
    }

    fn apply_durability(&mut self) -> QueueResult<()> {
        match self.durability {
            Durability::Strict => self.flush(),
            Durability::Relaxed => {
                self.dirty = true;
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> QueueResult<()> {
        let path = self.path();
        self.writer()?.sync_all().map_err(|err| {
            QueueError::FileSystem(format!(
                "unable to sync segment file {}: {err}",
                path.display()
            ))
        })?;
        self.dirty = false;
        Ok(())
    }
}

/// Read until `buf` is full or EOF; returns how many bytes were read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;
    use tempfile::TempDir;

    fn codec() -> Arc<BincodeCodec<u64>> {
        Arc::new(BincodeCodec::new())
    }

    fn drain(segment: &mut Segment<BincodeCodec<u64>>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(record) = segment.remove().expect("remove") {
            out.push(record);
        }
        out
    }

    #[test]
    fn append_remove_replay_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        {
            let mut segment =
                Segment::create(dir.path(), 1, Durability::Strict, codec()).expect("create");
            for id in [10u64, 11, 12] {
                segment.append(id).expect("append");
            }
            assert_eq!(segment.remove().expect("remove"), Some(10));
            assert_eq!(segment.size(), 2);
            assert_eq!(segment.size_on_disk(), 3);
            segment.close().expect("close");
        }

        let mut reopened =
            Segment::open(dir.path(), 1, Durability::Strict, codec()).expect("open");
        assert_eq!(reopened.size(), 2);
        assert_eq!(reopened.size_on_disk(), 3);
        assert_eq!(reopened.peek(), Some(&11));
        assert_eq!(drain(&mut reopened), vec![11, 12]);
    }

    #[test]
    fn remove_on_empty_segment_is_none() {
        let dir = TempDir::new().expect("tempdir");
        let mut segment =
            Segment::create(dir.path(), 1, Durability::Strict, codec()).expect("create");
        assert_eq!(segment.remove().expect("remove"), None);
        assert_eq!(segment.size_on_disk(), 0);
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = TempDir::new().expect("tempdir");
        let _segment =
            Segment::create(dir.path(), 1, Durability::Strict, codec()).expect("create");
        let err = Segment::create(dir.path(), 1, Durability::Strict, codec()).unwrap_err();
        assert!(matches!(err, QueueError::InvalidState(_)));
    }

    #[test]
    fn truncated_header_is_corruption() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(segment_path(dir.path(), 1), [7u8, 0, 0]).expect("write");
        let err = Segment::open(dir.path(), 1, Durability::Strict, codec()).unwrap_err();
        match err {
            QueueError::CorruptedSegment { path, reason } => {
                assert!(path.ends_with("0000000000001.dque"));
                assert!(reason.contains("truncated frame header"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn truncated_payload_is_corruption() {
        let dir = TempDir::new().expect("tempdir");
        let mut bytes = 8u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        std::fs::write(segment_path(dir.path(), 1), bytes).expect("write");
        let err = Segment::open(dir.path(), 1, Durability::Strict, codec()).unwrap_err();
        assert!(matches!(err, QueueError::CorruptedSegment { .. }));
    }

    #[test]
    fn tombstone_with_no_live_record_is_corruption() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(segment_path(dir.path(), 1), [0u8; 4]).expect("write");
        let err = Segment::open(dir.path(), 1, Durability::Strict, codec()).unwrap_err();
        match err {
            QueueError::CorruptedSegment { reason, .. } => {
                assert!(reason.contains("tombstone with no live record"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn undecodable_record_is_corruption() {
        let dir = TempDir::new().expect("tempdir");
        let mut bytes = 3u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xde, 0xad, 0xbe]);
        std::fs::write(segment_path(dir.path(), 1), bytes).expect("write");
        let err = Segment::open(dir.path(), 1, Durability::Strict, codec()).unwrap_err();
        match err {
            QueueError::CorruptedSegment { reason, .. } => {
                assert!(reason.contains("undecodable record"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_byte_encoding_is_rejected() {
        struct UnitCodec;
        impl Codec for UnitCodec {
            type Record = ();
            fn encode(&self, _record: &()) -> QueueResult<Vec<u8>> {
                Ok(Vec::new())
            }
            fn new_empty(&self) {}
            fn decode_into(&self, _bytes: &[u8], _record: &mut ()) -> QueueResult<()> {
                Ok(())
            }
        }

        let dir = TempDir::new().expect("tempdir");
        let mut segment =
            Segment::create(dir.path(), 1, Durability::Strict, Arc::new(UnitCodec))
                .expect("create");
        let err = segment.append(()).unwrap_err();
        assert!(matches!(err, QueueError::Serialization(_)));
        assert_eq!(segment.size_on_disk(), 0);
    }

    #[test]
    fn prepend_rewrites_the_file_and_resets_removals() {
        let dir = TempDir::new().expect("tempdir");
        {
            let mut segment =
                Segment::create(dir.path(), 1, Durability::Strict, codec()).expect("create");
            for id in [1u64, 2, 3] {
                segment.append(id).expect("append");
            }
            assert_eq!(segment.remove().expect("remove"), Some(1));

            segment.prepend(vec![100, 101]).expect("prepend");
            assert_eq!(segment.size(), 4);
            assert_eq!(segment.size_on_disk(), 4);
            assert_eq!(segment.peek(), Some(&100));

            // the rewritten file still takes appends
            segment.append(4).expect("append");
            segment.close().expect("close");
        }

        let mut reopened =
            Segment::open(dir.path(), 1, Durability::Strict, codec()).expect("open");
        assert_eq!(drain(&mut reopened), vec![100, 101, 2, 3, 4]);
    }

    #[test]
    fn relaxed_mode_defers_and_strict_transition_flushes() {
        let dir = TempDir::new().expect("tempdir");
        let mut segment =
            Segment::create(dir.path(), 1, Durability::Relaxed, codec()).expect("create");
        segment.append(1).expect("append");
        assert!(segment.dirty);

        segment.set_durability(Durability::Strict).expect("switch");
        assert!(!segment.dirty);

        segment.append(2).expect("append");
        assert!(!segment.dirty);
    }
}
