//! C ABI for the low-level slice primitive.
//!
//! This is the finer-grained entry point: the caller supplies the coefficient
//! array, the resumption cursor, both quantization sub-tables, and an output
//! buffer of stated capacity. The primitive is stateless, so driving it in a
//! loop with the cursor it returns reproduces the stateful session's slice
//! stream byte for byte.

use crate::encode::slice::codec::encode_slice_at;
use crate::encode::slice::constants::BANDS_PER_PLANE;
use crate::encode::slice::cursor::Cursor;
use crate::encode::slice::plane::CoeffPlane;
use crate::encode::slice::quant::QuantTables;
use crate::ffi::session::{IWAVE_DONE, IWAVE_ERR_FAULT, IWAVE_ERR_INVALID, IWAVE_MORE};
use std::ffi::c_int;
use std::panic::{self, AssertUnwindSafe};

/// Encodes exactly one slice: the band `cur_band` of every block at bit plane
/// `cur_bit`.
///
/// `quant_lo` must hold 16 entries, `quant_hi` 10. `output_size` carries the
/// buffer capacity in and the exact number of bytes written out; a slice that
/// would not fit is an error, never a truncation. `next_bit`/`next_band`
/// receive the resumption cursor. Returns `IWAVE_MORE`, `IWAVE_DONE` once the
/// next bit plane crosses below zero (calling again in that state is a no-op
/// reporting `IWAVE_DONE`), or a negative error code.
///
/// # Safety
///
/// All pointers must be valid for the lengths stated above, and `coeffs` must
/// hold `num_coeffs == width * height` values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn iwave_encode_slice(
    coeffs: *const i16,
    num_coeffs: c_int,
    width: c_int,
    height: c_int,
    cur_bit: c_int,
    cur_band: c_int,
    quant_lo: *const i32,
    quant_hi: *const i32,
    output: *mut u8,
    output_size: *mut c_int,
    next_bit: *mut c_int,
    next_band: *mut c_int,
) -> c_int {
    if coeffs.is_null()
        || quant_lo.is_null()
        || quant_hi.is_null()
        || output.is_null()
        || output_size.is_null()
        || next_bit.is_null()
        || next_band.is_null()
    {
        return IWAVE_ERR_INVALID;
    }
    if width <= 0 || height <= 0 || num_coeffs as i64 != width as i64 * height as i64 {
        return IWAVE_ERR_INVALID;
    }
    if cur_band < 0 || cur_band as usize >= BANDS_PER_PLANE {
        return IWAVE_ERR_INVALID;
    }
    let capacity = unsafe { *output_size };
    if capacity < 0 {
        return IWAVE_ERR_INVALID;
    }

    // Past the terminal bit plane the primitive is an explicit no-op.
    if cur_bit < 0 {
        unsafe {
            *output_size = 0;
            *next_bit = cur_bit;
            *next_band = cur_band;
        }
        return IWAVE_DONE;
    }

    let coeffs = unsafe { std::slice::from_raw_parts(coeffs, num_coeffs as usize) };
    let lo = unsafe { std::slice::from_raw_parts(quant_lo, 16) };
    let hi = unsafe { std::slice::from_raw_parts(quant_hi, 10) };
    let cursor = Cursor { bit_plane: cur_bit, band: cur_band as usize };

    let encoded = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut lo_arr = [0i32; 16];
        let mut hi_arr = [0i32; 10];
        lo_arr.copy_from_slice(lo);
        hi_arr.copy_from_slice(hi);
        let quant = QuantTables::new(lo_arr, hi_arr)?;
        let plane = CoeffPlane::from_raw(coeffs, width as usize, height as usize)?;
        encode_slice_at(&plane, &quant, cursor)
    }));

    let slice = match encoded {
        Ok(Ok(slice)) => slice,
        Ok(Err(err)) => return super::session::error_status(&err),
        Err(_) => return IWAVE_ERR_FAULT,
    };

    if slice.len() > capacity as usize {
        return IWAVE_ERR_INVALID;
    }

    let next = cursor.advance();
    unsafe {
        std::ptr::copy_nonoverlapping(slice.as_ptr(), output, slice.len());
        *output_size = slice.len() as c_int;
        *next_bit = next.bit_plane;
        *next_band = next.band as c_int;
    }

    if next.is_done() { IWAVE_DONE } else { IWAVE_MORE }
}
