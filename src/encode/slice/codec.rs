use super::constants::{
    BAND_BUCKETS, BANDS_PER_PLANE, BUCKETS_PER_BLOCK, COEFFS_PER_BUCKET, IW_SHIFT, MAX_BIT_PLANE,
};
use super::cursor::{Cursor, SliceStatus};
use super::plane::{Block, CoeffPlane};
use super::quant::QuantTables;
use crate::encode::mq::{MqContext, MqEncoder};
use crate::utils::error::{Error, Result};
use byteorder::{BigEndian, WriteBytesExt};
use log::debug;

// Coefficient states, derived from magnitude and threshold alone so that the
// cursor stays a complete resumption token.
const ACTIVE: u8 = 1; // significant since an earlier bit plane
const NEW: u8 = 2; // becomes significant at this bit plane
const UNK: u8 = 4; // candidate, coded as not-yet-significant

/// Byte length of the self-delimiting slice header:
/// bit plane, band, payload length (big-endian u32).
pub const SLICE_HEADER_LEN: usize = 6;

/// Adaptive contexts for one slice. Reset for every slice, which keeps the
/// stateful codec and the stateless entry point byte-identical for the same
/// coefficients, cursor, and tables.
#[derive(Default)]
struct SliceContexts {
    root: MqContext,
    bucket: [MqContext; COEFFS_PER_BUCKET],
    start: [MqContext; 2 * COEFFS_PER_BUCKET],
    sign: MqContext,
    mant: MqContext,
}

/// One encoded slice plus the cursor to resume from.
#[derive(Debug, Clone)]
pub struct SliceEmit {
    pub data: Vec<u8>,
    pub cursor: Cursor,
    pub status: SliceStatus,
}

/// The stateful slice-encoding engine for one coefficient plane.
pub struct SliceCodec {
    plane: CoeffPlane,
    quant: QuantTables,
    cursor: Cursor,
}

impl SliceCodec {
    /// Creates a codec with the starting bit plane derived from the largest
    /// quantized magnitude, so no coefficient is significant before coding
    /// begins.
    pub fn new(plane: CoeffPlane, quant: QuantTables) -> Result<Self> {
        quant.validate()?;
        let start = starting_bit_plane(&plane, &quant);
        Ok(SliceCodec { plane, quant, cursor: Cursor::new(start) })
    }

    /// Creates a codec resuming at an explicit cursor.
    pub fn with_cursor(plane: CoeffPlane, quant: QuantTables, cursor: Cursor) -> Result<Self> {
        quant.validate()?;
        if cursor.band >= BANDS_PER_PLANE {
            return Err(Error::InvalidInput(format!("band {} out of range", cursor.band)));
        }
        if cursor.bit_plane > MAX_BIT_PLANE {
            return Err(Error::InvalidInput(format!(
                "bit plane {} above maximum {}",
                cursor.bit_plane, MAX_BIT_PLANE
            )));
        }
        Ok(SliceCodec { plane, quant, cursor })
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn plane(&self) -> &CoeffPlane {
        &self.plane
    }

    /// Encodes one band at the current bit plane and advances the cursor.
    /// On an already-exhausted codec this returns an empty slice with DONE.
    pub fn encode_slice(&mut self) -> Result<SliceEmit> {
        if self.cursor.is_done() {
            return Ok(SliceEmit { data: Vec::new(), cursor: self.cursor, status: SliceStatus::Done });
        }
        let data = encode_slice_at(&self.plane, &self.quant, self.cursor)?;
        self.cursor = self.cursor.advance();
        let status = if self.cursor.is_done() { SliceStatus::Done } else { SliceStatus::More };
        debug!(
            "encoded slice: {} bytes, next bit plane {}, next band {}",
            data.len(),
            self.cursor.bit_plane,
            self.cursor.band
        );
        Ok(SliceEmit { data, cursor: self.cursor, status })
    }

    /// Estimates reconstruction quality at the current cursor, in decibels.
    ///
    /// Block MSE values are sorted and averaged over the worst `frac` share,
    /// mirroring how the quality gate of the original encoder concentrates on
    /// the blocks that still look bad.
    pub fn estimate_decibel(&self, frac: f32) -> f32 {
        let mut mse_per_block: Vec<f32> = self
            .plane
            .blocks()
            .iter()
            .map(|block| block_mse(block, &self.quant, self.cursor))
            .collect();

        mse_per_block.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let m = mse_per_block.len() - 1;
        let p = ((m as f32) * (1.0 - frac) + 0.5) as usize;
        let p = p.min(m);

        let avg_mse: f32 =
            mse_per_block[p..].iter().sum::<f32>() / (mse_per_block.len() - p) as f32;
        if avg_mse <= 0.0 {
            return 99.9;
        }

        let factor = (255 << IW_SHIFT) as f32;
        10.0 * (factor * factor / avg_mse).log10()
    }
}

/// Encodes exactly one slice of `plane` at `cursor` into a fresh buffer.
///
/// This is the stateless form used by the low-level boundary entry point;
/// the stateful codec delegates here, so both paths emit identical bytes.
pub fn encode_slice_at(plane: &CoeffPlane, quant: &QuantTables, cursor: Cursor) -> Result<Vec<u8>> {
    quant.validate()?;
    if cursor.band >= BANDS_PER_PLANE {
        return Err(Error::InvalidInput(format!("band {} out of range", cursor.band)));
    }
    if cursor.bit_plane < 0 || cursor.bit_plane > MAX_BIT_PLANE {
        return Err(Error::InvalidInput(format!(
            "bit plane {} outside 0..={}",
            cursor.bit_plane, MAX_BIT_PLANE
        )));
    }

    let mut mq = MqEncoder::new(Vec::new());
    let mut ctx = SliceContexts::default();
    for block in plane.blocks() {
        encode_block_band(&mut mq, &mut ctx, block, quant, cursor.band, cursor.bit_plane as u32)?;
    }
    let payload = mq.finish()?;

    let mut out = Vec::with_capacity(SLICE_HEADER_LEN + payload.len());
    out.push(cursor.bit_plane as u8);
    out.push(cursor.band as u8);
    out.write_u32::<BigEndian>(payload.len() as u32)?;
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Codes one band of one block at bit plane `k`.
fn encode_block_band(
    mq: &mut MqEncoder<Vec<u8>>,
    ctx: &mut SliceContexts,
    block: &Block,
    quant: &QuantTables,
    band: usize,
    k: u32,
) -> Result<()> {
    let range = &BAND_BUCKETS[band];
    let mut coeff_state = [0u8; 256];
    let mut bucket_state = [0u8; COEFFS_PER_BUCKET];
    let mut block_state = 0u8;

    for buckno in 0..range.size {
        let coeffs = block.bucket(range.start + buckno);
        let mut bstate = 0u8;
        for slot in 0..COEFFS_PER_BUCKET {
            let mag = coeffs.map_or(0i64, |c| (c[slot] as i64).abs());
            let threshold = (quant.step(band, slot) as i64) << k;
            let state = if mag >= threshold << 1 {
                ACTIVE
            } else if mag >= threshold {
                NEW | UNK
            } else {
                UNK
            };
            coeff_state[buckno * COEFFS_PER_BUCKET + slot] = state;
            bstate |= state;
        }
        bucket_state[buckno] = bstate;
        block_state |= bstate;
    }

    // Root decision: skipped when the block already carries significance in
    // this band, because the buckets must be scanned either way.
    let any_new = block_state & NEW != 0;
    if block_state & ACTIVE == 0 {
        mq.encode(any_new, &mut ctx.root)?;
        if !any_new {
            return Ok(());
        }
    }

    // Bucket decisions for buckets without prior significance.
    for buckno in 0..range.size {
        if bucket_state[buckno] & ACTIVE != 0 {
            continue;
        }
        mq.encode(bucket_state[buckno] & NEW != 0, &mut ctx.bucket[buckno])?;
    }

    // New significance and signs.
    for buckno in 0..range.size {
        if bucket_state[buckno] & (ACTIVE | NEW) == 0 {
            continue;
        }
        let Some(coeffs) = block.bucket(range.start + buckno) else {
            continue;
        };
        let bucket_has_active = bucket_state[buckno] & ACTIVE != 0;
        for slot in 0..COEFFS_PER_BUCKET {
            let state = coeff_state[buckno * COEFFS_PER_BUCKET + slot];
            if state & ACTIVE != 0 {
                continue;
            }
            let is_new = state & NEW != 0;
            let ctx_idx = slot + if bucket_has_active { COEFFS_PER_BUCKET } else { 0 };
            mq.encode(is_new, &mut ctx.start[ctx_idx])?;
            if is_new {
                mq.encode(coeffs[slot] < 0, &mut ctx.sign)?;
            }
        }
    }

    // Refinement bits for coefficients significant since earlier planes.
    for buckno in 0..range.size {
        if bucket_state[buckno] & ACTIVE == 0 {
            continue;
        }
        let Some(coeffs) = block.bucket(range.start + buckno) else {
            continue;
        };
        for slot in 0..COEFFS_PER_BUCKET {
            if coeff_state[buckno * COEFFS_PER_BUCKET + slot] & ACTIVE == 0 {
                continue;
            }
            let mag = (coeffs[slot] as i64).abs();
            let quantized = mag / quant.step(band, slot) as i64;
            mq.encode((quantized >> k) & 1 != 0, &mut ctx.mant)?;
        }
    }

    Ok(())
}

/// The smallest starting bit plane that keeps every coefficient insignificant
/// before the first slice.
fn starting_bit_plane(plane: &CoeffPlane, quant: &QuantTables) -> i32 {
    let mut max_quantized = 0i64;
    for block in plane.blocks() {
        for bucket_idx in 0..BUCKETS_PER_BLOCK {
            let Some(coeffs) = block.bucket(bucket_idx) else {
                continue;
            };
            let band = band_of_bucket(bucket_idx);
            for (slot, &coeff) in coeffs.iter().enumerate() {
                let step = quant.step(band, slot) as i64;
                max_quantized = max_quantized.max((coeff as i64).abs() / step);
            }
        }
    }
    if max_quantized > 0 {
        (max_quantized.ilog2() as i32).min(MAX_BIT_PLANE)
    } else {
        0
    }
}

fn band_of_bucket(bucket_idx: usize) -> usize {
    for (band, range) in BAND_BUCKETS.iter().enumerate() {
        if bucket_idx >= range.start && bucket_idx < range.start + range.size {
            return band;
        }
    }
    // BAND_BUCKETS tiles all 64 buckets; tested in constants.
    BANDS_PER_PLANE - 1
}

/// Mean squared reconstruction error of one block at the given cursor.
fn block_mse(block: &Block, quant: &QuantTables, cursor: Cursor) -> f32 {
    let mut mse = 0.0f32;
    for (band, range) in BAND_BUCKETS.iter().enumerate() {
        // Bands before the cursor's band are refined one plane deeper.
        let coded_plane = if band < cursor.band { cursor.bit_plane } else { cursor.bit_plane + 1 };
        for buckno in 0..range.size {
            let Some(coeffs) = block.bucket(range.start + buckno) else {
                continue;
            };
            for (slot, &coeff) in coeffs.iter().enumerate() {
                let mag = (coeff as i64).abs();
                let step = quant.step(band, slot) as i64;
                let recon = if coded_plane > MAX_BIT_PLANE {
                    0
                } else {
                    let threshold = step << coded_plane;
                    if mag >= threshold {
                        let known = (mag / step) >> coded_plane << coded_plane;
                        known * step + (threshold >> 1)
                    } else {
                        0
                    }
                };
                let delta = (mag - recon) as f32;
                mse += delta * delta;
            }
        }
    }
    mse / 1024.0
}
