//! The chunk-accumulating encoder session.
//!
//! A session owns one codec per image component and repeatedly drives the
//! slice codec until a caller budget is met: a slice count, a byte size, or a
//! decibel quality target. Cumulative counters only move on successful chunk
//! emission, so a failed call leaves the session exactly where it was.

use crate::encode::slice::codec::SliceCodec;
use crate::encode::slice::constants::DECIBEL_PRUNE;
use crate::encode::slice::cursor::SliceStatus;
use crate::encode::slice::plane::CoeffPlane;
use crate::encode::slice::quant::QuantTables;
use crate::ingest;
use crate::utils::error::{Error, Result};
use log::{debug, info};

/// Chroma handling for color sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChromaMode {
    /// Luma only; chroma planes are dropped at ingestion.
    None,
    /// Chroma slices start after ten luma slices.
    Normal,
    /// Chroma slices are interleaved from the first luma slice.
    #[default]
    Full,
}

impl ChromaMode {
    fn delay(self) -> Option<u64> {
        match self {
            ChromaMode::None => None,
            ChromaMode::Normal => Some(10),
            ChromaMode::Full => Some(0),
        }
    }
}

/// Session construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct SessionParams {
    pub quant: QuantTables,
    pub chroma_mode: ChromaMode,
    /// Share of worst blocks the decibel estimate averages over.
    pub db_frac: f32,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self { quant: QuantTables::default(), chroma_mode: ChromaMode::Full, db_frac: 0.35 }
    }
}

/// Budgets for one `encode_chunk` call. At least one field must be set;
/// slice and byte budgets are hard caps, the decibel budget is an early-exit
/// quality gate, and whichever triggers first wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkTarget {
    pub slices: Option<usize>,
    pub bytes: Option<usize>,
    pub decibels: Option<f32>,
}

impl ChunkTarget {
    fn validate(&self) -> Result<()> {
        let slices_set = self.slices.is_some_and(|s| s > 0);
        let bytes_set = self.bytes.is_some_and(|b| b > 0);
        let decibels_set = self.decibels.is_some_and(|d| d > 0.0);
        if !slices_set && !bytes_set && !decibels_set {
            return Err(Error::InvalidInput(
                "at least one stop condition must be set".into(),
            ));
        }
        Ok(())
    }
}

/// Whether a chunk exhausted the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    More,
    Done,
}

/// One encoded chunk: a concatenation of self-delimited slices.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub status: ChunkStatus,
}

/// A progressive encoding session over one image.
pub struct EncoderSession {
    primary: SliceCodec,
    chroma: Option<(SliceCodec, SliceCodec)>,
    chroma_delay: u64,
    db_frac: f32,
    total_slices: u64,
    total_bytes: u64,
    done: bool,
}

fn check_dims(width: usize, height: usize) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidInput(format!(
            "image dimensions must be positive, got {}x{}",
            width, height
        )));
    }
    Ok(())
}

fn check_len(name: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(Error::InvalidInput(format!(
            "{} buffer holds {} bytes, expected {}",
            name, actual, expected
        )));
    }
    Ok(())
}

impl EncoderSession {
    /// Creates a session over a grayscale image.
    pub fn new_gray(
        pixels: &[u8],
        width: usize,
        height: usize,
        mask: Option<&[u8]>,
        params: SessionParams,
    ) -> Result<Self> {
        check_dims(width, height)?;
        check_len("pixel", pixels.len(), width * height)?;
        if let Some(mask) = mask {
            check_len("mask", mask.len(), width * height)?;
        }

        let coeffs = ingest::gray_to_plane(pixels, mask);
        let plane = CoeffPlane::from_raw(&coeffs, width, height)?;
        let primary = SliceCodec::new(plane, params.quant)?;
        info!(
            "grayscale session created: {}x{}, starting bit plane {}",
            width,
            height,
            primary.cursor().bit_plane
        );
        Ok(Self::assemble(primary, None, params))
    }

    /// Creates a session over an interleaved RGB image.
    pub fn new_rgb(
        pixels: &[u8],
        width: usize,
        height: usize,
        mask: Option<&[u8]>,
        params: SessionParams,
    ) -> Result<Self> {
        check_dims(width, height)?;
        check_len("pixel", pixels.len(), width * height * 3)?;
        if let Some(mask) = mask {
            check_len("mask", mask.len(), width * height)?;
        }

        let (y, cb, cr) = ingest::rgb_to_planes(pixels, mask);
        let primary = SliceCodec::new(CoeffPlane::from_raw(&y, width, height)?, params.quant)?;
        let chroma = match params.chroma_mode {
            ChromaMode::None => None,
            _ => Some((
                SliceCodec::new(CoeffPlane::from_raw(&cb, width, height)?, params.quant)?,
                SliceCodec::new(CoeffPlane::from_raw(&cr, width, height)?, params.quant)?,
            )),
        };
        info!(
            "color session created: {}x{}, chroma {:?}, starting bit plane {}",
            width,
            height,
            params.chroma_mode,
            primary.cursor().bit_plane
        );
        Ok(Self::assemble(primary, chroma, params))
    }

    /// Creates a session over an already-transformed coefficient plane,
    /// bypassing pixel ingestion entirely.
    pub fn from_plane(
        coeffs: &[i16],
        width: usize,
        height: usize,
        params: SessionParams,
    ) -> Result<Self> {
        let plane = CoeffPlane::from_raw(coeffs, width, height)?;
        let primary = SliceCodec::new(plane, params.quant)?;
        Ok(Self::assemble(primary, None, params))
    }

    fn assemble(
        primary: SliceCodec,
        chroma: Option<(SliceCodec, SliceCodec)>,
        params: SessionParams,
    ) -> Self {
        let chroma_delay = params.chroma_mode.delay().unwrap_or(0);
        EncoderSession {
            primary,
            chroma,
            chroma_delay,
            db_frac: params.db_frac,
            total_slices: 0,
            total_bytes: 0,
            done: false,
        }
    }

    /// Encodes one chunk, accumulating slices until a budget triggers.
    ///
    /// A session that has already reached its terminal state returns an empty
    /// chunk with DONE status; that is not an error and mutates nothing.
    pub fn encode_chunk(&mut self, target: &ChunkTarget) -> Result<Chunk> {
        target.validate()?;
        if self.done {
            return Ok(Chunk { data: Vec::new(), status: ChunkStatus::Done });
        }

        let mut data = Vec::new();
        let mut slices = 0u64;
        let mut estdb = -1.0f32;

        loop {
            let emit = self.primary.encode_slice()?;
            data.extend_from_slice(&emit.data);
            slices += 1;

            if let Some((cb, cr)) = self.chroma.as_mut() {
                if self.total_slices + slices > self.chroma_delay {
                    if !cb.cursor().is_done() {
                        data.extend_from_slice(&cb.encode_slice()?.data);
                    }
                    if !cr.cursor().is_done() {
                        data.extend_from_slice(&cr.encode_slice()?.data);
                    }
                }
            }

            if emit.status == SliceStatus::Done {
                self.done = true;
                break;
            }
            if target.slices.is_some_and(|max| slices as usize >= max) {
                break;
            }
            if target.bytes.is_some_and(|max| data.len() >= max) {
                break;
            }
            if let Some(db_target) = target.decibels {
                // Estimating is costly, so it only starts once a bit plane
                // completes or the previous estimate came close to the target.
                if self.primary.cursor().band == 0 || estdb >= db_target - DECIBEL_PRUNE {
                    estdb = self.primary.estimate_decibel(self.db_frac);
                    debug!("quality estimate after {} slices: {:.2} dB", slices, estdb);
                    if estdb >= db_target {
                        info!("reached target quality {:.2} dB, stopping", db_target);
                        self.done = true;
                        break;
                    }
                }
            }
        }

        self.total_slices += slices;
        self.total_bytes += data.len() as u64;
        let status = if self.done { ChunkStatus::Done } else { ChunkStatus::More };
        info!(
            "chunk complete: {} slices, {} bytes, cumulative {}/{}",
            slices,
            data.len(),
            self.total_slices,
            self.total_bytes
        );
        Ok(Chunk { data, status })
    }

    /// Cumulative luma slices emitted. Never decreases; query has no side
    /// effects.
    pub fn slices_so_far(&self) -> u64 {
        self.total_slices
    }

    /// Cumulative bytes emitted. Never decreases; query has no side effects.
    pub fn bytes_so_far(&self) -> u64 {
        self.total_bytes
    }

    /// Whether the session has reached its terminal state.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(width: usize, height: usize) -> Vec<u8> {
        (0..width * height)
            .map(|i| (((i % width) + (i / width)) % 256) as u8)
            .collect()
    }

    #[test]
    fn test_create_rejects_bad_dimensions() {
        let params = SessionParams::default();
        assert!(EncoderSession::new_gray(&[], 0, 4, None, params).is_err());
        assert!(EncoderSession::new_gray(&[0; 16], 4, 0, None, params).is_err());
    }

    #[test]
    fn test_create_rejects_short_buffers() {
        let params = SessionParams::default();
        assert!(EncoderSession::new_gray(&[0; 15], 4, 4, None, params).is_err());
        assert!(EncoderSession::new_rgb(&[0; 16], 4, 4, None, params).is_err());
        assert!(EncoderSession::new_gray(&[0; 16], 4, 4, Some(&[0; 3]), params).is_err());
    }

    #[test]
    fn test_invalid_target_leaves_counters_untouched() {
        let img = gradient_image(16, 16);
        let mut session =
            EncoderSession::new_gray(&img, 16, 16, None, SessionParams::default()).unwrap();
        let err = session.encode_chunk(&ChunkTarget::default());
        assert!(err.is_err());
        assert_eq!(session.slices_so_far(), 0);
        assert_eq!(session.bytes_so_far(), 0);

        // The session stays usable after the rejected call.
        let chunk = session
            .encode_chunk(&ChunkTarget { slices: Some(2), ..Default::default() })
            .unwrap();
        assert!(!chunk.data.is_empty());
        assert_eq!(session.slices_so_far(), 2);
    }

    #[test]
    fn test_slice_budget_is_exact() {
        let img = gradient_image(16, 16);
        let mut session =
            EncoderSession::new_gray(&img, 16, 16, None, SessionParams::default()).unwrap();
        let chunk = session
            .encode_chunk(&ChunkTarget { slices: Some(3), ..Default::default() })
            .unwrap();
        assert_eq!(session.slices_so_far(), 3);
        assert_eq!(session.bytes_so_far(), chunk.data.len() as u64);
    }

    #[test]
    fn test_counters_are_monotonic() {
        let img = gradient_image(32, 32);
        let mut session =
            EncoderSession::new_gray(&img, 32, 32, None, SessionParams::default()).unwrap();
        let mut prev = (0u64, 0u64);
        for _ in 0..50 {
            let chunk = session
                .encode_chunk(&ChunkTarget { slices: Some(4), ..Default::default() })
                .unwrap();
            let now = (session.slices_so_far(), session.bytes_so_far());
            assert!(now.0 >= prev.0 && now.1 >= prev.1);
            prev = now;
            if chunk.status == ChunkStatus::Done {
                break;
            }
        }
        assert!(session.is_done());
    }

    #[test]
    fn test_done_session_is_idempotent() {
        let img = gradient_image(16, 16);
        let mut session =
            EncoderSession::new_gray(&img, 16, 16, None, SessionParams::default()).unwrap();
        loop {
            let chunk = session
                .encode_chunk(&ChunkTarget { slices: Some(64), ..Default::default() })
                .unwrap();
            if chunk.status == ChunkStatus::Done {
                break;
            }
        }
        let counters = (session.slices_so_far(), session.bytes_so_far());
        for _ in 0..3 {
            let chunk = session
                .encode_chunk(&ChunkTarget { slices: Some(1), ..Default::default() })
                .unwrap();
            assert!(chunk.data.is_empty());
            assert_eq!(chunk.status, ChunkStatus::Done);
        }
        assert_eq!((session.slices_so_far(), session.bytes_so_far()), counters);
    }

    #[test]
    fn test_from_plane_skips_ingestion() {
        let coeffs: Vec<i16> = (0..64).map(|i| (i * 3 - 96) as i16).collect();
        let mut session =
            EncoderSession::from_plane(&coeffs, 8, 8, SessionParams::default()).unwrap();
        let chunk = session
            .encode_chunk(&ChunkTarget { slices: Some(5), ..Default::default() })
            .unwrap();
        assert!(!chunk.data.is_empty());
    }
}
