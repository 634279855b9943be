//! The paced broadcast buffer: a bounded, append-only byte log for the
//! currently playing segment, fanned out to any number of independent
//! listener cursors.
//!
//! Single-writer / multi-reader: the orchestrator's pump is the only caller
//! of `begin_segment` / `ingest` / `end_segment` / `fail_segment`; every
//! listener owns exactly one cursor and only ever calls `read` / `detach`
//! with it. One mutex guards the offsets, phase and cursor table; payload
//! chunks are immutable `Bytes` once appended, so reads copy or slice without
//! holding anything beyond the bookkeeping lock.
//!
//! Ingestion is paced against wall clock at the segment's playback byte-rate
//! (leaky bucket with one pacing window of burst allowance). Without this, a
//! fast transcoder would dump whole tracks into memory instantly and there
//! would be no shared "now" for listeners to join at.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::trace;

/// Lifecycle of the single live segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPhase {
    /// No segment has started yet (or the previous one was discarded).
    Idle,
    /// The pump is ingesting; listeners may attach.
    Filling,
    /// The track finished normally.
    Ended,
    /// The transcode pipeline faulted mid-track.
    Failed,
}

/// Result of a cursor read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Bytes in ingest order. `skipped` is non-zero when the cursor had
    /// fallen behind the eviction floor and was advanced past a gap.
    Data { bytes: Bytes, skipped: u64 },
    /// The segment ended normally and the cursor has drained it.
    EndOfSegment,
    /// The segment failed; remaining bytes are not delivered.
    Failed,
    /// The cursor was detached, possibly while this read was blocked.
    Detached,
}

/// A listener's handle into the current segment. Opaque outside this module.
#[derive(Debug, Clone)]
pub struct Cursor {
    id: u64,
    epoch: u64,
}

struct CursorState {
    offset: u64,
    /// Eviction gap observed while this cursor had nothing to read yet;
    /// reported with the next successful read.
    pending_skip: u64,
    detached: bool,
}

struct SegmentState {
    phase: SegmentPhase,
    /// Bumped by every `begin_segment`; cursors from older epochs read EOS.
    epoch: u64,
    chunks: VecDeque<Bytes>,
    /// Offset of the oldest retained byte (the eviction floor).
    floor: u64,
    /// Total bytes ingested this segment.
    write_offset: u64,
    byte_rate: u64,
    started_at: Option<Instant>,
    cursors: HashMap<u64, CursorState>,
    next_cursor_id: u64,
}

pub struct BroadcastBuffer {
    inner: Mutex<SegmentState>,
    data_ready: Condvar,
    capacity: u64,
    pacing_window: Duration,
}

impl BroadcastBuffer {
    pub fn new(capacity_bytes: u64, pacing_window: Duration) -> Self {
        Self {
            inner: Mutex::new(SegmentState {
                phase: SegmentPhase::Idle,
                epoch: 0,
                chunks: VecDeque::new(),
                floor: 0,
                write_offset: 0,
                byte_rate: 1,
                started_at: None,
                cursors: HashMap::new(),
                next_cursor_id: 0,
            }),
            data_ready: Condvar::new(),
            capacity: capacity_bytes.max(1),
            pacing_window,
        }
    }

    pub fn pacing_window(&self) -> Duration {
        self.pacing_window
    }

    pub fn phase(&self) -> SegmentPhase {
        self.inner.lock().unwrap().phase
    }

    /// Open a fresh segment at the given playback byte-rate.
    ///
    /// Any cursors left over from a previous segment are dropped; their reads
    /// observe the epoch change and report end-of-segment.
    pub fn begin_segment(&self, byte_rate: u64) {
        let mut state = self.inner.lock().unwrap();
        state.phase = SegmentPhase::Filling;
        state.epoch += 1;
        state.chunks.clear();
        state.floor = 0;
        state.write_offset = 0;
        state.byte_rate = byte_rate.max(1);
        state.started_at = Some(Instant::now());
        state.cursors.clear();
        self.data_ready.notify_all();
    }

    /// Close the segment normally and wake every blocked reader.
    pub fn end_segment(&self) {
        let mut state = self.inner.lock().unwrap();
        if state.phase == SegmentPhase::Filling {
            state.phase = SegmentPhase::Ended;
        }
        self.data_ready.notify_all();
    }

    /// Mark the segment failed and wake every blocked reader.
    pub fn fail_segment(&self) {
        let mut state = self.inner.lock().unwrap();
        if state.phase == SegmentPhase::Filling {
            state.phase = SegmentPhase::Failed;
        }
        self.data_ready.notify_all();
    }

    /// Append one chunk, paced to real time.
    ///
    /// Sleeps (outside the lock) until the chunk's start offset is due at the
    /// segment byte-rate, keeping at most one pacing window of bytes ahead of
    /// the wall clock. Then appends, evicts past the capacity ceiling and
    /// wakes blocked readers.
    pub fn ingest(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }

        let wait = {
            let state = self.inner.lock().unwrap();
            if state.phase != SegmentPhase::Filling {
                return;
            }
            pace_delay(&state, self.pacing_window)
        };
        if wait > Duration::ZERO {
            thread::sleep(wait);
        }

        let mut state = self.inner.lock().unwrap();
        if state.phase != SegmentPhase::Filling {
            return;
        }
        state.write_offset += chunk.len() as u64;
        state.chunks.push_back(chunk);

        // Ring discipline: drop whole chunks from the front until the
        // retained span fits the capacity ceiling again.
        while state.write_offset - state.floor > self.capacity {
            let Some(front) = state.chunks.front() else {
                break;
            };
            let len = front.len() as u64;
            state.floor += len;
            state.chunks.pop_front();
            trace!(floor = state.floor, "evicted oldest chunk");
        }

        self.data_ready.notify_all();
    }

    /// Attach a new cursor at the live write offset.
    ///
    /// Attaching outside `Filling` yields a cursor that immediately reports
    /// end-of-segment.
    pub fn attach(&self) -> Cursor {
        let mut state = self.inner.lock().unwrap();
        let id = state.next_cursor_id;
        state.next_cursor_id += 1;
        let epoch = state.epoch;

        if state.phase == SegmentPhase::Filling {
            let offset = state.write_offset;
            state.cursors.insert(
                id,
                CursorState {
                    offset,
                    pending_skip: 0,
                    detached: false,
                },
            );
        }

        Cursor { id, epoch }
    }

    /// Read up to `max_bytes` at the cursor's offset.
    ///
    /// Blocks while the cursor is caught up to the live write offset and the
    /// segment is still filling. Never returns an empty `Data`.
    pub fn read(&self, cursor: &Cursor, max_bytes: usize) -> ReadOutcome {
        let max_bytes = max_bytes.max(1);
        let mut state = self.inner.lock().unwrap();
        loop {
            if cursor.epoch != state.epoch {
                return ReadOutcome::EndOfSegment;
            }
            let Some(cs) = state.cursors.get(&cursor.id) else {
                // Attached outside `Filling`: nothing will ever arrive.
                return ReadOutcome::EndOfSegment;
            };
            if cs.detached {
                return ReadOutcome::Detached;
            }
            if state.phase == SegmentPhase::Failed {
                return ReadOutcome::Failed;
            }

            let offset = cs.offset;
            let pending_skip = cs.pending_skip;
            if offset < state.write_offset {
                let gap = state.floor.saturating_sub(offset);
                let start = offset.max(state.floor);
                if start >= state.write_offset {
                    // Everything between the cursor and the live offset was
                    // evicted. Snap to the floor, remember the gap and go
                    // back through the phase checks: only a segment that is
                    // still filling is worth waiting on.
                    if let Some(cs) = state.cursors.get_mut(&cursor.id) {
                        cs.offset = start;
                        cs.pending_skip = pending_skip + gap;
                    }
                    continue;
                }
                let bytes = copy_range(&state, start, max_bytes);
                let advanced = start + bytes.len() as u64;
                if let Some(cs) = state.cursors.get_mut(&cursor.id) {
                    cs.offset = advanced;
                    cs.pending_skip = 0;
                }
                debug_assert!(advanced <= state.write_offset);
                return ReadOutcome::Data {
                    bytes,
                    skipped: pending_skip + gap,
                };
            }

            match state.phase {
                SegmentPhase::Ended | SegmentPhase::Idle => return ReadOutcome::EndOfSegment,
                SegmentPhase::Filling | SegmentPhase::Failed => {}
            }

            state = self.data_ready.wait(state).unwrap();
        }
    }

    /// Detach a cursor. Idempotent, and safe to call while a `read` for the
    /// same cursor is blocked: that read wakes and returns `Detached`.
    pub fn detach(&self, cursor: &Cursor) {
        let mut state = self.inner.lock().unwrap();
        if cursor.epoch != state.epoch {
            return;
        }
        if let Some(cs) = state.cursors.get_mut(&cursor.id) {
            if !cs.detached {
                cs.detached = true;
                self.data_ready.notify_all();
            }
        }
    }
}

/// How long the ingest path must sleep before releasing a chunk whose first
/// byte sits at the current write offset.
fn pace_delay(state: &SegmentState, window: Duration) -> Duration {
    let Some(started_at) = state.started_at else {
        return Duration::ZERO;
    };
    let due = Duration::from_secs_f64(state.write_offset as f64 / state.byte_rate as f64);
    let allowance = started_at.elapsed() + window;
    due.saturating_sub(allowance)
}

/// Copy up to `max_bytes` starting at absolute offset `start`.
///
/// A read satisfied by a single chunk is a zero-copy slice.
fn copy_range(state: &SegmentState, start: u64, max_bytes: usize) -> Bytes {
    let available = (state.write_offset - start) as usize;
    let want = max_bytes.min(available);

    let mut chunk_start = state.floor;
    let mut iter = state.chunks.iter();
    let mut out: Option<BytesMut> = None;
    let mut copied = 0usize;

    while copied < want {
        let Some(chunk) = iter.next() else {
            break;
        };
        let chunk_end = chunk_start + chunk.len() as u64;
        if chunk_end <= start {
            chunk_start = chunk_end;
            continue;
        }
        let begin = (start + copied as u64 - chunk_start) as usize;
        let take = (chunk.len() - begin).min(want - copied);
        if copied == 0 && take == want {
            return chunk.slice(begin..begin + take);
        }
        out.get_or_insert_with(|| BytesMut::with_capacity(want))
            .extend_from_slice(&chunk[begin..begin + take]);
        copied += take;
        chunk_start = chunk_end;
    }

    out.map(BytesMut::freeze).unwrap_or_else(Bytes::new)
}
