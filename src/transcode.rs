//! Transcoding: decodes a source track and re-encodes it into the single
//! fixed broadcast profile, as a finite, non-restartable byte producer.
//!
//! Decode goes through Symphonia; encode through LAME. Every track is
//! normalized to the same channel layout and sample rate so a listener never
//! has to renegotiate mid-session.

use std::fs::File;
use std::path::{Path, PathBuf};

use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, InterleavedPcm, Quality};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::{debug, info};

use crate::metadata::Track;

/// The one profile every segment is encoded to.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastProfile {
    pub channels: u16,
    pub sample_rate: u32,
    pub bitrate_kbps: u32,
}

pub const PROFILE: BroadcastProfile = BroadcastProfile {
    channels: 2,
    sample_rate: 44_100,
    bitrate_kbps: 320,
};

/// Input codecs the pipeline accepts. Decided from the path alone so an
/// unsupported track is rejected before any I/O happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputCodec {
    Mp3,
}

impl InputCodec {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("mp3") => Some(Self::Mp3),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("unsupported input codec: {0}")]
    UnsupportedCodec(PathBuf),
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("container probe failed for {path}: {source}")]
    Probe {
        path: PathBuf,
        source: SymphoniaError,
    },
    #[error("no audio track in {0}")]
    NoAudioTrack(PathBuf),
    #[error("decoder init failed: {0}")]
    DecoderInit(SymphoniaError),
    #[error("encoder init failed: {0}")]
    EncoderInit(String),
    #[error("decode fault: {0}")]
    Decode(SymphoniaError),
    #[error("encode fault: {0}")]
    Encode(String),
}

/// Open the transcode pipeline for one track.
///
/// Returns a producer that yields MP3 bytes in encode order; the iterator
/// ends on normal end-of-input and yields an error on a mid-track fault, so
/// the orchestrator can tell "finished" from "broke".
pub fn open(track: &Track) -> Result<TranscodeStream, TranscodeError> {
    let codec = InputCodec::from_path(&track.path)
        .ok_or_else(|| TranscodeError::UnsupportedCodec(track.path.clone()))?;

    let file = File::open(&track.path).map_err(|source| TranscodeError::Open {
        path: track.path.clone(),
        source,
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = track.path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|source| TranscodeError::Probe {
            path: track.path.clone(),
            source,
        })?;

    let format = probed.format;
    let st = format
        .default_track()
        .ok_or_else(|| TranscodeError::NoAudioTrack(track.path.clone()))?;
    let track_id = st.id;
    let src_rate = st.codec_params.sample_rate.unwrap_or(PROFILE.sample_rate);
    let src_channels = st
        .codec_params
        .channels
        .map(|c| c.count())
        .unwrap_or(PROFILE.channels as usize)
        .max(1);

    let decoder = symphonia::default::get_codecs()
        .make(&st.codec_params, &DecoderOptions::default())
        .map_err(TranscodeError::DecoderInit)?;

    let encoder = build_encoder(&PROFILE)?;

    let resampler = (src_rate != PROFILE.sample_rate)
        .then(|| LinearResampler::new(src_rate, PROFILE.sample_rate));

    info!(
        path = %track.path.display(),
        ?codec,
        src_rate,
        src_channels,
        "transcode pipeline opened"
    );

    Ok(TranscodeStream {
        format,
        decoder,
        encoder,
        track_id,
        src_channels,
        resampler,
        finished: false,
    })
}

fn build_encoder(profile: &BroadcastProfile) -> Result<mp3lame_encoder::Encoder, TranscodeError> {
    let mut builder =
        Builder::new().ok_or_else(|| TranscodeError::EncoderInit("builder alloc failed".into()))?;
    builder
        .set_num_channels(profile.channels as u8)
        .map_err(|e| TranscodeError::EncoderInit(format!("channels: {e:?}")))?;
    builder
        .set_sample_rate(profile.sample_rate)
        .map_err(|e| TranscodeError::EncoderInit(format!("sample rate: {e:?}")))?;
    let brate = match profile.bitrate_kbps {
        320 => Bitrate::Kbps320,
        192 => Bitrate::Kbps192,
        128 => Bitrate::Kbps128,
        other => return Err(TranscodeError::EncoderInit(format!("bitrate {other} kbps"))),
    };
    builder
        .set_brate(brate)
        .map_err(|e| TranscodeError::EncoderInit(format!("bitrate: {e:?}")))?;
    builder
        .set_quality(Quality::Best)
        .map_err(|e| TranscodeError::EncoderInit(format!("quality: {e:?}")))?;
    builder
        .build()
        .map_err(|e| TranscodeError::EncoderInit(format!("{e:?}")))
}

/// A finite producer of broadcast-profile MP3 bytes for one track.
pub struct TranscodeStream {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    encoder: mp3lame_encoder::Encoder,
    track_id: u32,
    src_channels: usize,
    resampler: Option<LinearResampler>,
    finished: bool,
}

impl std::fmt::Debug for TranscodeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeStream")
            .field("track_id", &self.track_id)
            .field("src_channels", &self.src_channels)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl TranscodeStream {
    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>, TranscodeError> {
        // LAME's worst-case output estimate: 1.25x the frame count + 7200.
        let frames = pcm.len() / PROFILE.channels as usize;
        let estimated = (frames as f64 * 1.25 + 7200.0) as usize;
        let mut out: Vec<u8> = Vec::with_capacity(estimated);

        let written = self
            .encoder
            .encode(InterleavedPcm(pcm), out.spare_capacity_mut())
            .map_err(|e| TranscodeError::Encode(format!("{e:?}")))?;
        // SAFETY: LAME wrote exactly `written` bytes into the spare capacity.
        unsafe {
            out.set_len(written);
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<u8>, TranscodeError> {
        let mut out: Vec<u8> = Vec::with_capacity(7200);
        let written = self
            .encoder
            .flush::<FlushNoGap>(out.spare_capacity_mut())
            .map_err(|e| TranscodeError::Encode(format!("{e:?}")))?;
        unsafe {
            out.set_len(written);
        }
        Ok(out)
    }

    fn next_chunk(&mut self) -> Option<Result<Vec<u8>, TranscodeError>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.finished = true;
                    return match self.flush() {
                        Ok(tail) if tail.is_empty() => None,
                        Ok(tail) => Some(Ok(tail)),
                        Err(e) => Some(Err(e)),
                    };
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(TranscodeError::Decode(e)));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // Bad frames mid-file are routine for MP3; skip them.
                Err(SymphoniaError::DecodeError(e)) => {
                    debug!(error = %e, "skipping undecodable packet");
                    continue;
                }
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::InvalidData =>
                {
                    continue;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(TranscodeError::Decode(e)));
                }
            };

            let spec = *decoded.spec();
            let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);

            let stereo = to_stereo(sample_buf.samples(), self.src_channels);
            let pcm = match &mut self.resampler {
                Some(r) => r.process(&stereo),
                None => stereo,
            };
            if pcm.is_empty() {
                continue;
            }

            match self.encode(&pcm) {
                Ok(bytes) if bytes.is_empty() => continue,
                Ok(bytes) => return Some(Ok(bytes)),
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Iterator for TranscodeStream {
    type Item = Result<Vec<u8>, TranscodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        self.next_chunk()
    }
}

/// Map interleaved source samples to interleaved stereo: mono is duplicated,
/// extra channels beyond the first two are dropped.
fn to_stereo(samples: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        2 => samples.to_vec(),
        1 => {
            let mut out = Vec::with_capacity(samples.len() * 2);
            for &s in samples {
                out.push(s);
                out.push(s);
            }
            out
        }
        n => {
            let mut out = Vec::with_capacity(samples.len() / n * 2);
            for frame in samples.chunks_exact(n) {
                out.push(frame[0]);
                out.push(frame[1]);
            }
            out
        }
    }
}

/// First-order interpolating resampler over interleaved stereo frames.
///
/// Carries the last frame and fractional position across calls so packet
/// boundaries stay continuous. Good enough for the rare off-rate source; the
/// broadcast profile itself never changes.
struct LinearResampler {
    /// Source frames consumed per output frame.
    step: f64,
    /// Fractional position into the source stream, relative to `prev`.
    pos: f64,
    prev: [f32; 2],
}

impl LinearResampler {
    fn new(src_rate: u32, dst_rate: u32) -> Self {
        Self {
            step: src_rate as f64 / dst_rate as f64,
            pos: 0.0,
            prev: [0.0; 2],
        }
    }

    fn frame_at(&self, input: &[f32], i: i64) -> [f32; 2] {
        if i < 0 {
            self.prev
        } else {
            let b = i as usize * 2;
            [input[b], input[b + 1]]
        }
    }

    fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let frames = (input.len() / 2) as i64;
        if frames == 0 {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(((frames as f64 / self.step) as usize + 2) * 2);
        let mut pos = self.pos;
        while pos < (frames - 1) as f64 {
            let base = pos.floor();
            let frac = (pos - base) as f32;
            let i = base as i64;
            let a = self.frame_at(input, i);
            let b = self.frame_at(input, i + 1);
            out.push(a[0] + (b[0] - a[0]) * frac);
            out.push(a[1] + (b[1] - a[1]) * frac);
            pos += self.step;
        }

        self.prev = [input[input.len() - 2], input[input.len() - 1]];
        self.pos = pos - frames as f64;
        out
    }
}
