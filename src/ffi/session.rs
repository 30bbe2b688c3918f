//! C ABI for the encoder session: opaque handles, explicit buffer ownership.
//!
//! A session handle is created by one of the `iwave_encoder_new_*` functions
//! and must be released exactly once with `iwave_encoder_free`. Chunk buffers
//! are allocated by this crate and must come back through `iwave_chunk_free`;
//! pairing them with any other deallocator corrupts the heap. One handle may
//! only be driven by one caller at a time; independent handles are fully
//! independent. Panics never unwind across the boundary, they surface as
//! `IWAVE_ERR_FAULT`.

use crate::session::{ChunkStatus, ChunkTarget, EncoderSession, SessionParams};
use crate::utils::error::Error;
use std::ffi::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

/// The session is exhausted; the call produced no further data.
pub const IWAVE_DONE: c_int = 0;
/// The call succeeded and further slices remain meaningful.
pub const IWAVE_MORE: c_int = 1;
/// A precondition was violated; nothing was encoded.
pub const IWAVE_ERR_INVALID: c_int = -1;
/// An internal encoding fault; session counters are unchanged.
pub const IWAVE_ERR_FAULT: c_int = -2;

/// Opaque session handle.
pub struct IwaveEncoder {
    session: EncoderSession,
}

/// Chunk budgets as they cross the boundary. A field that is zero or
/// negative counts as unset; at least one must be set.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IwaveEncodeParms {
    pub slices: i32,
    pub bytes: i32,
    pub decibels: f32,
}

impl IwaveEncodeParms {
    fn to_target(self) -> ChunkTarget {
        ChunkTarget {
            slices: (self.slices > 0).then_some(self.slices as usize),
            bytes: (self.bytes > 0).then_some(self.bytes as usize),
            decibels: (self.decibels > 0.0).then_some(self.decibels),
        }
    }
}

pub(crate) fn error_status(err: &Error) -> c_int {
    match err {
        Error::InvalidInput(_) => IWAVE_ERR_INVALID,
        _ => IWAVE_ERR_FAULT,
    }
}

unsafe fn new_session(
    pixels: *const u8,
    width: c_int,
    height: c_int,
    mask: *const u8,
    color: bool,
) -> *mut IwaveEncoder {
    if pixels.is_null() || width <= 0 || height <= 0 {
        return ptr::null_mut();
    }
    let npix = width as usize * height as usize;
    let pixel_len = if color { npix * 3 } else { npix };

    let created = panic::catch_unwind(AssertUnwindSafe(|| {
        let pixels = unsafe { std::slice::from_raw_parts(pixels, pixel_len) };
        let mask =
            (!mask.is_null()).then(|| unsafe { std::slice::from_raw_parts(mask, npix) });
        let params = SessionParams::default();
        if color {
            EncoderSession::new_rgb(pixels, width as usize, height as usize, mask, params)
        } else {
            EncoderSession::new_gray(pixels, width as usize, height as usize, mask, params)
        }
    }));

    match created {
        Ok(Ok(session)) => Box::into_raw(Box::new(IwaveEncoder { session })),
        _ => ptr::null_mut(),
    }
}

/// Creates an encoder session over a grayscale image of `width * height`
/// bytes. `mask` may be null, otherwise it holds `width * height` bytes where
/// non-zero marks excluded samples. Returns null on any invalid input.
///
/// # Safety
///
/// `pixels` (and `mask` when non-null) must point to buffers of the sizes
/// described above, valid for the duration of the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn iwave_encoder_new_grayscale(
    pixels: *const u8,
    width: c_int,
    height: c_int,
    mask: *const u8,
) -> *mut IwaveEncoder {
    unsafe { new_session(pixels, width, height, mask, false) }
}

/// Creates an encoder session over an interleaved RGB image of
/// `width * height * 3` bytes. See `iwave_encoder_new_grayscale` for the mask
/// contract.
///
/// # Safety
///
/// `pixels` (and `mask` when non-null) must point to buffers of the sizes
/// described above, valid for the duration of the call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn iwave_encoder_new_color(
    pixels: *const u8,
    width: c_int,
    height: c_int,
    mask: *const u8,
) -> *mut IwaveEncoder {
    unsafe { new_session(pixels, width, height, mask, true) }
}

/// Encodes one chunk. On success the chunk buffer is stored in `*out_data`
/// with its exact length in `*out_len`, ownership transfers to the caller,
/// and the return value is `IWAVE_MORE` or `IWAVE_DONE`. An exhausted session
/// reports `IWAVE_DONE` with a null buffer and zero length. On error nothing
/// is allocated and the session counters are unchanged.
///
/// # Safety
///
/// All pointers must be valid; `encoder` must be a live handle from one of
/// the constructors, driven by a single caller.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn iwave_encode_chunk(
    encoder: *mut IwaveEncoder,
    parms: *const IwaveEncodeParms,
    out_data: *mut *mut u8,
    out_len: *mut usize,
) -> c_int {
    if encoder.is_null() || parms.is_null() || out_data.is_null() || out_len.is_null() {
        return IWAVE_ERR_INVALID;
    }
    unsafe {
        *out_data = ptr::null_mut();
        *out_len = 0;
    }

    let handle = unsafe { &mut *encoder };
    let target = unsafe { (*parms).to_target() };

    let outcome =
        panic::catch_unwind(AssertUnwindSafe(|| handle.session.encode_chunk(&target)));
    match outcome {
        Ok(Ok(chunk)) => {
            let status =
                if chunk.status == ChunkStatus::Done { IWAVE_DONE } else { IWAVE_MORE };
            if !chunk.data.is_empty() {
                let boxed = chunk.data.into_boxed_slice();
                unsafe {
                    *out_len = boxed.len();
                    *out_data = Box::into_raw(boxed) as *mut u8;
                }
            }
            status
        }
        Ok(Err(err)) => error_status(&err),
        Err(_) => IWAVE_ERR_FAULT,
    }
}

/// Cumulative slices emitted by the session, or -1 on a null handle.
///
/// # Safety
///
/// `encoder` must be null or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn iwave_get_slices(encoder: *const IwaveEncoder) -> i64 {
    if encoder.is_null() {
        return -1;
    }
    unsafe { &*encoder }.session.slices_so_far() as i64
}

/// Cumulative bytes emitted by the session, or -1 on a null handle.
///
/// # Safety
///
/// `encoder` must be null or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn iwave_get_bytes(encoder: *const IwaveEncoder) -> i64 {
    if encoder.is_null() {
        return -1;
    }
    unsafe { &*encoder }.session.bytes_so_far() as i64
}

/// Releases a session handle. Null is a no-op; releasing the same handle
/// twice is a caller error.
///
/// # Safety
///
/// `encoder` must be null or a handle that has not been freed before.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn iwave_encoder_free(encoder: *mut IwaveEncoder) {
    if !encoder.is_null() {
        drop(unsafe { Box::from_raw(encoder) });
    }
}

/// Releases a chunk buffer previously returned by `iwave_encode_chunk`,
/// identified by its pointer and exact length. Null is a no-op.
///
/// # Safety
///
/// `data`/`len` must match one prior `iwave_encode_chunk` output exactly and
/// must not have been freed before.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn iwave_chunk_free(data: *mut u8, len: usize) {
    if !data.is_null() {
        drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(data, len)) });
    }
}
