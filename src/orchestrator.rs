//! Playback orchestration: drives the catalog through the transcode pipeline
//! into the broadcast buffer, one track at a time.
//!
//! The orchestrator owns the buffer's writer side. Per-track failures are
//! logged and skipped so one broken file never takes the station down; only
//! an empty or fully unplayable catalog ends the run.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use bytes::BytesMut;
use tracing::{error, info, warn};

use crate::buffer::BroadcastBuffer;
use crate::catalog::Catalog;
use crate::config::PlaybackSettings;
use crate::metadata::{self, Track};
use crate::transcode::{self, TranscodeError};

/// Smallest chunk the pump hands to the buffer. Keeps per-chunk bookkeeping
/// negligible even for very low byte rates.
const MIN_CHUNK_BYTES: usize = 4 * 1024;

/// Shared view of the track currently on air.
#[derive(Clone, Default)]
pub struct NowPlaying {
    inner: Arc<Mutex<Option<Track>>>,
}

impl NowPlaying {
    pub fn set(&self, track: Track) {
        *self.inner.lock().unwrap() = Some(track);
    }

    pub fn clear(&self) {
        *self.inner.lock().unwrap() = None;
    }

    pub fn get(&self) -> Option<Track> {
        self.inner.lock().unwrap().clone()
    }
}

pub struct OrchestratorHandle {
    now_playing: NowPlaying,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl OrchestratorHandle {
    pub fn now_playing(&self) -> NowPlaying {
        self.now_playing.clone()
    }

    /// Ask the run loop to finish after the in-flight chunk.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn join(self) -> std::thread::Result<()> {
        self.thread.join()
    }
}

pub struct Orchestrator;

impl Orchestrator {
    /// Start the run loop on its own thread.
    pub fn spawn(
        catalog: Catalog,
        buffer: Arc<BroadcastBuffer>,
        playback: PlaybackSettings,
    ) -> OrchestratorHandle {
        let now_playing = NowPlaying::default();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let now_playing = now_playing.clone();
            let stop = stop.clone();
            thread::spawn(move || run(&catalog, &buffer, &playback, &now_playing, &stop))
        };

        OrchestratorHandle {
            now_playing,
            stop,
            thread,
        }
    }
}

fn run(
    catalog: &Catalog,
    buffer: &BroadcastBuffer,
    playback: &PlaybackSettings,
    now_playing: &NowPlaying,
    stop: &AtomicBool,
) {
    if catalog.is_empty() {
        warn!("catalog is empty, nothing to broadcast");
        return;
    }

    loop {
        let mut played = 0usize;
        for path in catalog.iter() {
            if stop.load(Ordering::Relaxed) {
                info!("orchestrator stopping");
                return;
            }

            let track = match metadata::resolve(path) {
                Ok(track) => track,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unresolvable track");
                    continue;
                }
            };
            let source = match transcode::open(&track) {
                Ok(source) => source,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unplayable track");
                    continue;
                }
            };

            info!(
                track = %track.display,
                duration_secs = track.duration.as_secs(),
                byte_rate = track.byte_rate,
                "now playing"
            );
            buffer.begin_segment(track.byte_rate);
            now_playing.set(track.clone());

            let outcome = pump(buffer, track.byte_rate, source, stop);
            now_playing.clear();

            match outcome {
                Ok(stopped) => {
                    buffer.end_segment();
                    played += 1;
                    if stopped {
                        info!("orchestrator stopping");
                        return;
                    }
                }
                Err(e) => {
                    error!(track = %track.display, error = %e, "transcode fault mid-track");
                    buffer.fail_segment();
                }
            }
        }

        if played == 0 {
            error!("no playable tracks in the catalog, giving up");
            return;
        }
        if !playback.loop_catalog {
            info!("catalog finished");
            return;
        }
    }
}

/// Feed one track's producer into the buffer.
///
/// Output is coalesced to roughly one pacing window of bytes per chunk, so
/// the buffer's pacing sleeps are few and long rather than many and tiny.
/// Returns `Ok(true)` when interrupted by the stop flag.
fn pump<I>(
    buffer: &BroadcastBuffer,
    byte_rate: u64,
    source: I,
    stop: &AtomicBool,
) -> Result<bool, TranscodeError>
where
    I: Iterator<Item = Result<Vec<u8>, TranscodeError>>,
{
    let window = buffer.pacing_window().as_secs_f64();
    let target = ((byte_rate as f64 * window) as usize).max(MIN_CHUNK_BYTES);

    let mut pending = BytesMut::with_capacity(target);
    for item in source {
        if stop.load(Ordering::Relaxed) {
            return Ok(true);
        }
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                // Everything produced before the fault is still good audio;
                // hand it over before reporting the break.
                if !pending.is_empty() {
                    buffer.ingest(pending.freeze());
                }
                return Err(e);
            }
        };
        pending.extend_from_slice(&chunk);
        while pending.len() >= target {
            let out = pending.split_to(target).freeze();
            buffer.ingest(out);
        }
    }

    if !pending.is_empty() {
        buffer.ingest(pending.freeze());
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ReadOutcome, SegmentPhase};
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    const FAST: u64 = 1_000_000_000;

    fn fast_buffer() -> Arc<BroadcastBuffer> {
        Arc::new(BroadcastBuffer::new(1 << 20, Duration::from_millis(10)))
    }

    fn drain(buf: &BroadcastBuffer, cursor: &crate::buffer::Cursor) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match buf.read(cursor, 64 * 1024) {
                ReadOutcome::Data { bytes, .. } => out.extend_from_slice(&bytes),
                ReadOutcome::EndOfSegment => return out,
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
    }

    #[test]
    fn pump_coalesces_but_delivers_every_byte_in_order() {
        let buf = fast_buffer();
        buf.begin_segment(FAST);
        let cursor = buf.attach();

        // Ragged producer output: tiny chunks, one large, then a tail.
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 253) as u8).collect();
        let mut chunks: Vec<Result<Vec<u8>, TranscodeError>> = Vec::new();
        let mut off = 0;
        for take in [13usize, 13_000, 17, 25_000, 1970] {
            chunks.push(Ok(payload[off..off + take].to_vec()));
            off += take;
        }
        assert_eq!(off, payload.len());

        let stop = AtomicBool::new(false);
        let stopped = pump(&buf, FAST, chunks.into_iter(), &stop).unwrap();
        assert!(!stopped);
        buf.end_segment();

        assert_eq!(drain(&buf, &cursor), payload);
    }

    #[test]
    fn pump_fault_reaches_listeners_as_failure() {
        let buf = fast_buffer();
        buf.begin_segment(FAST);
        let cursor = buf.attach();

        let source = vec![
            Ok(vec![1u8; 8_192]),
            Err(TranscodeError::Encode("synthetic".into())),
        ];
        let stop = AtomicBool::new(false);
        let err = pump(&buf, FAST, source.into_iter(), &stop).unwrap_err();
        assert!(matches!(err, TranscodeError::Encode(_)));

        // Bytes delivered before the fault are still readable.
        match buf.read(&cursor, 64 * 1024) {
            ReadOutcome::Data { bytes, .. } => assert_eq!(bytes.len(), 8_192),
            other => panic!("unexpected outcome: {:?}", other),
        }

        // After the segment is failed, undelivered bytes are withheld and the
        // listener gets the failure signal instead.
        buf.fail_segment();
        assert!(matches!(buf.read(&cursor, 64), ReadOutcome::Failed));
    }

    #[test]
    fn pump_honors_the_stop_flag() {
        let buf = fast_buffer();
        buf.begin_segment(FAST);

        let stop = AtomicBool::new(true);
        let source = std::iter::repeat_with(|| Ok(vec![0u8; 4_096]));
        let stopped = pump(&buf, FAST, source, &stop).unwrap();
        assert!(stopped);
    }

    #[test]
    fn run_skips_unplayable_tracks_and_terminates() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bad1.mp3"), b"not audio").unwrap();
        fs::write(dir.path().join("bad2.mp3"), b"also not audio").unwrap();

        let catalog =
            crate::catalog::build(dir.path(), &crate::config::LibrarySettings::default()).unwrap();
        assert_eq!(catalog.len(), 2);

        let buf = fast_buffer();
        let playback = PlaybackSettings { loop_catalog: true };
        let handle = Orchestrator::spawn(catalog, buf.clone(), playback);

        // Every track is unplayable: the loop must give up instead of
        // spinning, even with looping enabled.
        handle.join().unwrap();
        assert!(handle_now_playing_cleared(&buf));
    }

    fn handle_now_playing_cleared(buf: &BroadcastBuffer) -> bool {
        buf.phase() == SegmentPhase::Idle
    }

    #[test]
    fn run_on_empty_catalog_returns_immediately() {
        let dir = tempdir().unwrap();
        let catalog =
            crate::catalog::build(dir.path(), &crate::config::LibrarySettings::default()).unwrap();
        let buf = fast_buffer();
        let handle = Orchestrator::spawn(catalog, buf, PlaybackSettings::default());
        handle.join().unwrap();
    }
}
