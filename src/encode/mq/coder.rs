use super::table::MQ_TABLE;
use std::io::Write;
use thiserror::Error;

/// A single byte holding the adaptive state for one coding context:
/// the table row index in the upper bits, the current MPS sense in bit 0.
pub type MqContext = u8;

/// Errors that can occur while driving the MQ coder.
#[derive(Error, Debug)]
pub enum MqError {
    #[error("I/O error during write operation")]
    Io(#[from] std::io::Error),
    #[error("attempted to encode after the stream was finished")]
    Finished,
}

/// An adaptive binary arithmetic encoder (MQ coder).
///
/// The interval convention follows the software-conventions form of the
/// standard: the MPS owns the lower sub-interval `[0, A - Qe)` and the LPS the
/// upper `[A - Qe, A)`. Output bytes are staged internally so that carry
/// propagation can patch already-produced bytes; everything is handed to the
/// writer when `finish` is called.
pub struct MqEncoder<W: Write> {
    writer: Option<W>,
    a: u32,  // interval size register
    c: u32,  // code register
    ct: u8,  // renormalization countdown
    staged: Vec<u8>,
    finished: bool,
}

impl<W: Write> MqEncoder<W> {
    /// Creates a new encoder that will hand its output to `writer` on finish.
    pub fn new(writer: W) -> Self {
        MqEncoder {
            writer: Some(writer),
            a: 0x8000,
            c: 0,
            ct: 12,
            staged: Vec::new(),
            finished: false,
        }
    }

    /// Encodes a single decision using the given adaptive context.
    #[inline(always)]
    pub fn encode(&mut self, bit: bool, ctx: &mut MqContext) -> Result<(), MqError> {
        if self.finished {
            return Err(MqError::Finished);
        }

        let idx = (*ctx >> 1) as usize;
        let mps = (*ctx & 1) != 0;
        let state = MQ_TABLE[idx];
        let qe = state.qe as u32;

        self.a -= qe;
        if bit == mps {
            if self.a & 0x8000 != 0 {
                return Ok(());
            }
            if self.a < qe {
                // Conditional exchange: the MPS sub-interval shrank below Qe.
                self.c += self.a;
                self.a = qe;
            }
            *ctx = (state.nmps << 1) | (*ctx & 1);
            self.renormalize();
        } else {
            if self.a < qe {
                // Conditional exchange: LPS takes the lower sub-interval.
                self.a = qe;
            } else {
                self.c += self.a;
                self.a = qe;
            }
            let mps_bit = if state.switch_mps { (*ctx & 1) ^ 1 } else { *ctx & 1 };
            *ctx = (state.nlps << 1) | mps_bit;
            self.renormalize();
        }
        Ok(())
    }

    #[inline(always)]
    fn renormalize(&mut self) {
        loop {
            self.a <<= 1;
            self.c <<= 1;
            self.ct -= 1;
            if self.ct == 0 {
                self.byte_out();
            }
            if self.a & 0x8000 != 0 {
                break;
            }
        }
    }

    fn byte_out(&mut self) {
        let b = self.c >> 19;
        if b > 0xFF {
            // Carry out of the code register: patch the staged bytes,
            // growing the stream at the front if the carry escapes it.
            let mut i = self.staged.len();
            loop {
                if i == 0 {
                    self.staged.insert(0, 1);
                    break;
                }
                i -= 1;
                self.staged[i] = self.staged[i].wrapping_add(1);
                if self.staged[i] != 0 {
                    break;
                }
            }
        }
        let b = (b & 0xFF) as u8;
        self.c &= 0x7FFFF;
        // After a 0xFF only seven fresh bits fit in the next byte; the mask
        // above guarantees its top bit reads as zero.
        self.ct = if b == 0xFF { 7 } else { 8 };
        self.staged.push(b);
    }

    fn eflush(&mut self) {
        // SETBITS: force the largest code value still inside the interval.
        let upper = self.c + self.a;
        self.c |= 0xFFFF;
        if self.c >= upper {
            self.c -= 0x8000;
        }
        self.c <<= self.ct as u32;
        self.byte_out();
        self.c <<= self.ct as u32;
        self.byte_out();
        // A terminal 0xFF is implied by end of stream.
        while self.staged.len() > 1 && self.staged.last() == Some(&0xFF) {
            self.staged.pop();
        }
    }

    /// Flushes the interval state and writes all staged bytes to the writer.
    pub fn finish(mut self) -> Result<W, MqError> {
        if self.finished {
            return Err(MqError::Finished);
        }
        self.eflush();
        self.finished = true;
        let mut writer = self.writer.take().ok_or(MqError::Finished)?;
        writer.write_all(&self.staged)?;
        Ok(writer)
    }
}
