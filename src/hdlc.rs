//! HDLC framing: receive-side deframer state and the progressive transmitter.
//!
//! The receive bit machine itself lives in the gateway, because every decision
//! it makes (packetisation, editing, mode tracking) reaches across the whole
//! core; this module owns the state it runs over. The transmitter is
//! self-contained: octets go in, stuffed wire bits come out.

use crate::crc;
use crate::error::GatewayError;

/// Longest HDLC frame the gateway will carry, FCS included.
pub const MAX_FRAME_LEN: usize = 260;

/// Consecutive flags required before preamble is considered established.
pub const FRAMING_OK_THRESHOLD: u32 = 5;

/// Flag octet, sent LSB first.
const FLAG: u8 = 0x7E;

/// Minimum flag octets between the closing flag of one frame and the opening
/// of the next.
const INTER_FRAME_FLAGS: usize = 2;

/// Receive-side deframer counters for one carrier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HdlcRxStats {
    pub frames: u32,
    pub bytes: u32,
    pub crc_errors: u32,
    pub length_errors: u32,
    pub aborts: u32,
}

/// Receive-side deframer state.
///
/// Octets assemble LSB first out of the destuffed bit stream. The per-carrier
/// counters are reset on every modem restart.
pub(crate) struct HdlcRxState {
    pub raw_bit_stream: u32,
    pub byte_in_progress: u8,
    pub num_bits: u32,
    pub flags_seen: u32,
    pub framing_ok_announced: bool,
    pub len: usize,
    pub buffer: [u8; MAX_FRAME_LEN],

    pub rx_frames: u32,
    pub rx_bytes: u32,
    pub rx_crc_errors: u32,
    pub rx_length_errors: u32,
    pub rx_aborts: u32,
}

impl HdlcRxState {
    pub fn new() -> Self {
        Self {
            raw_bit_stream: 0,
            byte_in_progress: 0,
            num_bits: 0,
            flags_seen: 0,
            framing_ok_announced: false,
            len: 0,
            buffer: [0; MAX_FRAME_LEN],
            rx_frames: 0,
            rx_bytes: 0,
            rx_crc_errors: 0,
            rx_length_errors: 0,
            rx_aborts: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn stats(&self) -> HdlcRxStats {
        HdlcRxStats {
            frames: self.rx_frames,
            bytes: self.rx_bytes,
            crc_errors: self.rx_crc_errors,
            length_errors: self.rx_length_errors,
            aborts: self.rx_aborts,
        }
    }
}

/// Outcome of pulling one transmit bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdlcTxBit {
    /// A live bit, LSB-first wire order.
    Bit(u8),
    /// The transmitter has run out of things to send. The caller may load the
    /// next frame (or request shutdown) and pull again; idle flags follow if
    /// it does neither. Reported once per drain.
    Underflow,
    /// Shutdown was requested and the final flag is out.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxPhase {
    Flags,
    Data,
    FcsHigh,
    Closing,
}

/// Progressive HDLC transmitter.
///
/// A frame may be extended with [`HdlcTx::frame`] while it is already being
/// clocked out; the FCS goes on the wire when the drain catches up with the
/// last octet supplied. [`HdlcTx::shutdown`] queues a terminating null frame.
pub struct HdlcTx {
    buf: [u8; MAX_FRAME_LEN],
    len: usize,
    pos: usize,
    crc: u16,
    fcs: u16,
    have_frame: bool,
    corrupt: bool,

    phase: TxPhase,
    octet: u8,
    bit_pos: u8,
    stuff: bool,
    ones: u8,
    flags_to_send: usize,
    tx_end: bool,
    underflow_reported: bool,
}

impl HdlcTx {
    pub fn new() -> Self {
        Self {
            buf: [0; MAX_FRAME_LEN],
            len: 0,
            pos: 0,
            crc: 0xFFFF,
            fcs: 0,
            have_frame: false,
            corrupt: false,
            phase: TxPhase::Flags,
            octet: 0,
            bit_pos: 8,
            stuff: false,
            ones: 0,
            // Guarantee an opening flag even on a cold start.
            flags_to_send: 1,
            tx_end: false,
            underflow_reported: false,
        }
    }

    pub fn restart(&mut self) {
        *self = Self::new();
    }

    /// Set the number of preamble flags to send before any frame.
    pub fn flags(&mut self, count: usize) {
        self.flags_to_send = count;
        self.underflow_reported = false;
    }

    /// Supply frame octets. Starts a frame if none is in progress, otherwise
    /// extends the one being transmitted. An empty slice is a null frame,
    /// i.e. a shutdown request.
    pub fn frame(&mut self, data: &[u8]) -> Result<(), GatewayError> {
        if data.is_empty() {
            self.shutdown();
            return Ok(());
        }
        if self.len + data.len() > MAX_FRAME_LEN {
            return Err(GatewayError::FrameTooLong(self.len + data.len()));
        }
        self.buf[self.len..self.len + data.len()].copy_from_slice(data);
        for &b in data {
            self.crc = crc::update(self.crc, b);
        }
        self.len += data.len();
        self.have_frame = true;
        self.tx_end = false;
        self.underflow_reported = false;
        Ok(())
    }

    /// Transmit a deliberately wrong FCS for the frame in progress.
    pub fn corrupt_frame(&mut self) {
        self.corrupt = true;
    }

    /// Queue a terminating null frame: once current output drains, report
    /// [`HdlcTxBit::Done`] instead of idling on flags.
    pub fn shutdown(&mut self) {
        self.tx_end = true;
    }

    pub fn get_bit(&mut self) -> HdlcTxBit {
        loop {
            if self.bit_pos < 8 {
                if self.stuff && self.ones == 5 {
                    self.ones = 0;
                    return HdlcTxBit::Bit(0);
                }
                let bit = (self.octet >> self.bit_pos) & 1;
                self.bit_pos += 1;
                if self.stuff {
                    if bit == 1 {
                        self.ones += 1;
                    } else {
                        self.ones = 0;
                    }
                }
                return HdlcTxBit::Bit(bit);
            }
            match self.phase {
                TxPhase::Flags => {
                    if self.flags_to_send > 0 {
                        self.flags_to_send -= 1;
                        self.load(FLAG, false);
                    } else if self.have_frame {
                        self.phase = TxPhase::Data;
                    } else if self.tx_end {
                        return HdlcTxBit::Done;
                    } else if !self.underflow_reported {
                        self.underflow_reported = true;
                        return HdlcTxBit::Underflow;
                    } else {
                        self.load(FLAG, false);
                    }
                }
                TxPhase::Data => {
                    if self.pos < self.len {
                        let octet = self.buf[self.pos];
                        self.pos += 1;
                        self.load(octet, true);
                    } else {
                        // Drained: the FCS follows, complemented, low octet
                        // first. A corrupt frame sends the raw register.
                        self.fcs = if self.corrupt { self.crc } else { !self.crc };
                        self.load((self.fcs & 0xFF) as u8, true);
                        self.phase = TxPhase::FcsHigh;
                    }
                }
                TxPhase::FcsHigh => {
                    self.load((self.fcs >> 8) as u8, true);
                    // The frame is spoken for; octets supplied from here on
                    // belong to the next one.
                    self.len = 0;
                    self.pos = 0;
                    self.crc = 0xFFFF;
                    self.have_frame = false;
                    self.corrupt = false;
                    self.phase = TxPhase::Closing;
                }
                TxPhase::Closing => {
                    self.load(FLAG, false);
                    if self.flags_to_send == 0 {
                        self.flags_to_send = INTER_FRAME_FLAGS - 1;
                    }
                    self.underflow_reported = false;
                    self.phase = TxPhase::Flags;
                }
            }
        }
    }

    fn load(&mut self, octet: u8, stuff: bool) {
        self.octet = octet;
        self.bit_pos = 0;
        self.stuff = stuff;
        if !stuff {
            self.ones = 0;
        }
    }
}

impl Default for HdlcTx {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pull bits until `Done`, handling underflows with `on_underflow`.
    fn drain(tx: &mut HdlcTx, mut on_underflow: impl FnMut(&mut HdlcTx)) -> Vec<u8> {
        let mut bits = Vec::new();
        for _ in 0..100_000 {
            match tx.get_bit() {
                HdlcTxBit::Bit(b) => bits.push(b),
                HdlcTxBit::Underflow => on_underflow(tx),
                HdlcTxBit::Done => return bits,
            }
        }
        panic!("transmitter never finished");
    }

    /// Destuff a wire bit stream back into frames of octets.
    fn deframe(bits: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut cur: Vec<u8> = Vec::new();
        let mut ones = 0u32;
        for &bit in bits {
            if bit == 1 {
                ones += 1;
                cur.push(1);
                continue;
            }
            if ones == 5 {
                // stuffed zero
            } else if ones == 6 {
                // flag: strip its seven leading bits from the accumulator
                let body_len = cur.len().saturating_sub(7);
                cur.truncate(body_len);
                if !cur.is_empty() && cur.len() % 8 == 0 {
                    let octets = cur
                        .chunks(8)
                        .map(|c| c.iter().enumerate().fold(0u8, |o, (i, b)| o | (*b << i)))
                        .collect();
                    frames.push(octets);
                }
                cur.clear();
            } else {
                cur.push(0);
            }
            ones = 0;
        }
        frames
    }

    #[test]
    fn single_frame_with_fcs() {
        let payload = [0xFF, 0x03, 0x80, 0x00, 0x66];
        let mut tx = HdlcTx::new();
        tx.flags(4);
        tx.frame(&payload).unwrap();
        let bits = drain(&mut tx, |t| t.shutdown());
        let frames = deframe(&bits);
        assert_eq!(frames.len(), 1);
        let fcs = crate::crc::fcs(&payload);
        let mut expected = payload.to_vec();
        expected.push((fcs & 0xFF) as u8);
        expected.push((fcs >> 8) as u8);
        assert_eq!(frames[0], expected);
    }

    #[test]
    fn stuffing_survives_all_ones() {
        let payload = [0xFF; 16];
        let mut tx = HdlcTx::new();
        tx.frame(&payload).unwrap();
        let bits = drain(&mut tx, |t| t.shutdown());
        // no run of more than five ones outside the flags
        let frames = deframe(&bits);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..16], &payload);
    }

    #[test]
    fn corrupt_frame_sends_wrong_fcs() {
        let payload = [0x01, 0x02, 0x03];
        let mut tx = HdlcTx::new();
        tx.frame(&payload).unwrap();
        tx.corrupt_frame();
        let bits = drain(&mut tx, |t| t.shutdown());
        let frames = deframe(&bits);
        assert_eq!(frames.len(), 1);
        let fcs = crate::crc::fcs(&payload);
        let sent = u16::from(frames[0][3]) | (u16::from(frames[0][4]) << 8);
        assert_ne!(sent, fcs);
    }

    #[test]
    fn progressive_append_extends_frame() {
        let mut tx = HdlcTx::new();
        tx.frame(&[0x11, 0x22]).unwrap();
        // pull a handful of bits, then extend the frame mid-flight
        let mut bits = Vec::new();
        for _ in 0..12 {
            if let HdlcTxBit::Bit(b) = tx.get_bit() {
                bits.push(b);
            }
        }
        tx.frame(&[0x33, 0x44]).unwrap();
        bits.extend(drain(&mut tx, |t| t.shutdown()));
        let frames = deframe(&bits);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..4], &[0x11, 0x22, 0x33, 0x44]);
        let fcs = crate::crc::fcs(&[0x11, 0x22, 0x33, 0x44]);
        let sent = u16::from(frames[0][4]) | (u16::from(frames[0][5]) << 8);
        assert_eq!(sent, fcs);
    }

    #[test]
    fn underflow_once_then_idle_flags() {
        let mut tx = HdlcTx::new();
        tx.flags(2);
        let mut underflows = 0;
        let mut bits = 0;
        for _ in 0..100 {
            match tx.get_bit() {
                HdlcTxBit::Bit(_) => bits += 1,
                HdlcTxBit::Underflow => underflows += 1,
                HdlcTxBit::Done => break,
            }
        }
        assert_eq!(underflows, 1);
        assert!(bits > 16);
    }

    #[test]
    fn shutdown_when_idle_finishes() {
        let mut tx = HdlcTx::new();
        tx.flags(1);
        tx.shutdown();
        let bits = drain(&mut tx, |_| {});
        // one flag then done
        assert_eq!(bits.len(), 8);
    }

    #[test]
    fn two_frames_are_separated_by_flags() {
        let mut tx = HdlcTx::new();
        tx.frame(&[0xAA, 0xBB]).unwrap();
        let mut loaded_second = false;
        let bits = drain(&mut tx, |t| {
            if !loaded_second {
                loaded_second = true;
                t.frame(&[0xCC, 0xDD]).unwrap();
            } else {
                t.shutdown();
            }
        });
        let frames = deframe(&bits);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..2], &[0xAA, 0xBB]);
        assert_eq!(&frames[1][..2], &[0xCC, 0xDD]);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut tx = HdlcTx::new();
        assert_eq!(
            tx.frame(&[0u8; MAX_FRAME_LEN + 1]),
            Err(GatewayError::FrameTooLong(MAX_FRAME_LEN + 1))
        );
    }
}
