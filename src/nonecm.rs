//! Elastic buffer feeding non-ECM image data from the packet side to the
//! fast modulator.
//!
//! Data arrives in bursts from T.38 while the modulator drains at line rate.
//! When the buffer starves before the far end signals the stream complete,
//! zero bits go out instead: they read as fill within a T.4 row and as more
//! training zeros during TCF. In image mode the buffer also stretches the
//! zero run of an EOL to honour the negotiated minimum scan line time.

use log::{debug, warn};

const TX_BUF_LEN: usize = 4096;

/// Zero runs this long mean an EOL is in progress.
const EOL_ZERO_RUN: u32 = 11;

pub(crate) struct NonEcmBuffer {
    buf: [u8; TX_BUF_LEN],
    in_ptr: usize,
    out_ptr: usize,

    octet: u8,
    bit_no: u8,

    image_data_mode: bool,
    min_row_bits: u32,
    row_bits: u32,
    zero_run: u32,
    hold_eol_terminator: bool,

    /// Once set, starving means the stream is over rather than jittery.
    released: bool,

    in_octets: u32,
    out_octets: u32,
    fill_bits: u32,
}

impl NonEcmBuffer {
    pub fn new() -> Self {
        Self {
            buf: [0; TX_BUF_LEN],
            in_ptr: 0,
            out_ptr: 0,
            octet: 0,
            bit_no: 0,
            image_data_mode: false,
            min_row_bits: 0,
            row_bits: 0,
            zero_run: 0,
            hold_eol_terminator: false,
            released: false,
            in_octets: 0,
            out_octets: 0,
            fill_bits: 0,
        }
    }

    /// Reset for a new carrier.
    pub fn init(&mut self, image_data_mode: bool, min_row_bits: u32) {
        *self = Self::new();
        self.image_data_mode = image_data_mode;
        self.min_row_bits = min_row_bits;
    }

    /// Queue octets received from the packet side.
    pub fn inject(&mut self, data: &[u8]) {
        for &octet in data {
            let next = (self.in_ptr + 1) % TX_BUF_LEN;
            if next == self.out_ptr {
                warn!("non-ECM transmit buffer overflow");
                return;
            }
            self.buf[self.in_ptr] = octet;
            self.in_ptr = next;
            self.in_octets += 1;
        }
    }

    /// Stop flow-controlling: the stream is complete, drain what is left and
    /// then end the carrier.
    pub fn release(&mut self) {
        self.released = true;
    }

    /// Next bit for the modulator, MSB first. `None` once the stream has been
    /// released and fully drained.
    pub fn get_bit(&mut self) -> Option<u8> {
        if self.hold_eol_terminator {
            if self.row_bits < self.min_row_bits {
                self.row_bits += 1;
                self.fill_bits += 1;
                return Some(0);
            }
            self.hold_eol_terminator = false;
            self.row_bits = 0;
            self.zero_run = 0;
            return Some(1);
        }
        if self.bit_no == 0 {
            if self.out_ptr == self.in_ptr {
                if self.released {
                    return None;
                }
                self.fill_bits += 1;
                self.zero_run += 1;
                self.row_bits += 1;
                return Some(0);
            }
            self.octet = self.buf[self.out_ptr];
            self.out_ptr = (self.out_ptr + 1) % TX_BUF_LEN;
            self.out_octets += 1;
            self.bit_no = 8;
        }
        self.bit_no -= 1;
        let bit = (self.octet >> self.bit_no) & 1;
        if bit == 0 {
            self.zero_run += 1;
            self.row_bits += 1;
            return Some(0);
        }
        if self.image_data_mode
            && self.min_row_bits > 0
            && self.zero_run >= EOL_ZERO_RUN
            && self.row_bits < self.min_row_bits
        {
            // This one would complete an EOL of a short row. Stretch the zero
            // run out to the minimum and send the terminator afterwards.
            self.hold_eol_terminator = true;
            self.row_bits += 1;
            self.fill_bits += 1;
            return Some(0);
        }
        if self.zero_run >= EOL_ZERO_RUN {
            self.row_bits = 0;
        } else {
            self.row_bits += 1;
        }
        self.zero_run = 0;
        Some(1)
    }

    pub fn report_status(&self) {
        if self.in_octets != 0 || self.out_octets != 0 {
            debug!(
                "non-ECM buffer: {} octets in, {} octets out, {} fill bits",
                self.in_octets, self.out_octets, self.fill_bits
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull(buf: &mut NonEcmBuffer, n: usize) -> Vec<u8> {
        (0..n).map(|_| buf.get_bit().unwrap()).collect()
    }

    fn octet_bits(octet: u8) -> Vec<u8> {
        (0..8).rev().map(|i| (octet >> i) & 1).collect()
    }

    #[test]
    fn bits_come_out_msb_first() {
        let mut buf = NonEcmBuffer::new();
        buf.init(false, 0);
        buf.inject(&[0xA5, 0x3C]);
        let bits = pull(&mut buf, 16);
        let mut expected = octet_bits(0xA5);
        expected.extend(octet_bits(0x3C));
        assert_eq!(bits, expected);
    }

    #[test]
    fn starving_emits_zero_fill_until_released() {
        let mut buf = NonEcmBuffer::new();
        buf.init(false, 0);
        assert_eq!(buf.get_bit(), Some(0));
        assert_eq!(buf.get_bit(), Some(0));
        buf.inject(&[0xFF]);
        assert_eq!(pull(&mut buf, 8), octet_bits(0xFF));
        buf.release();
        assert_eq!(buf.get_bit(), None);
    }

    #[test]
    fn released_buffer_drains_before_ending() {
        let mut buf = NonEcmBuffer::new();
        buf.init(false, 0);
        buf.inject(&[0x0F]);
        buf.release();
        assert_eq!(pull(&mut buf, 8), octet_bits(0x0F));
        assert_eq!(buf.get_bit(), None);
    }

    #[test]
    fn short_row_is_padded_to_min_row_bits() {
        let mut buf = NonEcmBuffer::new();
        buf.init(true, 64);
        // EOL (eleven zeros then a one), a short row of data, then another EOL
        buf.inject(&[0x00, 0x10, 0xD0, 0x00, 0x10]);
        buf.release();
        let mut bits = Vec::new();
        while let Some(b) = buf.get_bit() {
            bits.push(b);
        }
        // The second EOL terminator must not appear until at least 64 bits
        // have gone out for the row it ends.
        let mut eols = Vec::new();
        let mut zeros = 0;
        for (i, &b) in bits.iter().enumerate() {
            if b == 0 {
                zeros += 1;
            } else {
                if zeros >= 11 {
                    eols.push(i);
                }
                zeros = 0;
            }
        }
        assert!(eols.len() >= 2);
        let row_len = eols[1] - eols[0];
        assert!(row_len >= 64, "row was only {row_len} bits");
    }

    #[test]
    fn long_rows_pass_untouched() {
        let mut buf = NonEcmBuffer::new();
        buf.init(true, 8);
        buf.inject(&[0x00, 0x10, 0xAA, 0xAA, 0x00, 0x10]);
        buf.release();
        let mut bits = Vec::new();
        while let Some(b) = buf.get_bit() {
            bits.push(b);
        }
        // total bit count unchanged: no fill was inserted
        assert_eq!(bits.len(), 6 * 8);
    }

    #[test]
    fn overflow_drops_excess() {
        let mut buf = NonEcmBuffer::new();
        buf.init(false, 0);
        buf.inject(&[0x55; TX_BUF_LEN + 16]);
        buf.release();
        let mut n = 0;
        while buf.get_bit().is_some() {
            n += 1;
        }
        assert_eq!(n, (TX_BUF_LEN - 1) * 8);
    }
}
