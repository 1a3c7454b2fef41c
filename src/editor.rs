//! In-flight editing of V.21 control frames.
//!
//! The gateway is a man in the middle: it clamps advertised capabilities to
//! what it can actually relay, and mangles NSF/NSC/NSS bodies so the two
//! endpoints cannot strike up proprietary behaviour it would then have to
//! proxy. Frames are edited one octet at a time as they arrive, always after
//! the receive CRC has covered the original octet.

use log::debug;

use crate::error::GatewayError;
use crate::t30::{self, ModemSupport, DISBIT3, DISBIT4, DISBIT5, DISBIT6, DISBIT7};

/// Which way a control frame is travelling through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    FromT38,
    FromModem,
}

impl Direction {
    fn idx(self) -> usize {
        match self {
            Direction::FromT38 => 0,
            Direction::FromModem => 1,
        }
    }
}

pub(crate) const MAX_NSX_SUPPRESSION: usize = 10;

pub(crate) struct MessageEditor {
    /// Total frame length up to which NSX bytes are overwritten (payload
    /// limit plus the three-octet header); 0 disables suppression.
    suppress_nsx_len: [usize; 2],
    nsx_overwrite: [[u8; MAX_NSX_SUPPRESSION]; 2],
    corrupt_current_frame: [bool; 2],
}

impl MessageEditor {
    pub fn new() -> Self {
        let mut overwrite = [[0u8; MAX_NSX_SUPPRESSION]; 2];
        overwrite[0][0] = 0xFF;
        overwrite[1][0] = 0xFF;
        Self {
            // default: suppress three payload bytes in each direction
            suppress_nsx_len: [6, 6],
            nsx_overwrite: overwrite,
            corrupt_current_frame: [false; 2],
        }
    }

    /// Set how many NSX payload bytes to overwrite in one direction;
    /// `None` disables suppression.
    pub fn set_suppression(
        &mut self,
        dir: Direction,
        payload_bytes: Option<usize>,
    ) -> Result<(), GatewayError> {
        match payload_bytes {
            None => self.suppress_nsx_len[dir.idx()] = 0,
            Some(n) if n <= MAX_NSX_SUPPRESSION => self.suppress_nsx_len[dir.idx()] = n + 3,
            Some(n) => return Err(GatewayError::NsxSuppressionTooLong(n)),
        }
        Ok(())
    }

    pub fn clear_corrupt(&mut self, dir: Direction) {
        self.corrupt_current_frame[dir.idx()] = false;
    }

    /// Inspect (and possibly rewrite) the octet that just brought the frame
    /// to `len` octets.
    pub fn edit(
        &mut self,
        dir: Direction,
        supported: ModemSupport,
        ecm_allowed: bool,
        buf: &mut [u8],
        len: usize,
    ) {
        let d = dir.idx();
        if self.corrupt_current_frame[d] {
            // Keep overwriting the trailing octet until the suppression
            // length runs out; the far end sees a recognisably mangled body.
            if len >= 4 && len <= self.suppress_nsx_len[d] {
                buf[len - 1] = self.nsx_overwrite[d][len - 4];
            }
            return;
        }
        match len {
            3 => {
                if matches!(buf[2], t30::NSF | t30::NSC | t30::NSS)
                    && self.suppress_nsx_len[d] != 0
                {
                    debug!(
                        "corrupting {} message to prevent recognition",
                        t30::frame_name(buf[2])
                    );
                    self.corrupt_current_frame[d] = true;
                }
            }
            5 => {
                if buf[2] == t30::DIS {
                    debug!("applying fast modem type constraints");
                    let code = buf[4] & (DISBIT6 | DISBIT5 | DISBIT4 | DISBIT3);
                    if code == 0 || code == DISBIT4 {
                        // V.27ter only
                    } else if code == DISBIT3 || code == (DISBIT4 | DISBIT3) {
                        // V.27ter and V.29
                        if !supported.contains(ModemSupport::V29) {
                            buf[4] &= !DISBIT3;
                        }
                    } else if code == (DISBIT6 | DISBIT4 | DISBIT3) {
                        // V.27ter, V.29 and V.17
                        if !supported.contains(ModemSupport::V17) {
                            buf[4] &= !DISBIT6;
                        }
                        if !supported.contains(ModemSupport::V29) {
                            buf[4] &= !DISBIT3;
                        }
                    } else {
                        // reserved or unused combination
                        buf[4] &= !(DISBIT6 | DISBIT5);
                        buf[4] |= DISBIT4 | DISBIT3;
                    }
                }
            }
            7 => {
                if buf[2] == t30::DIS && !ecm_allowed {
                    debug!("inhibiting ECM");
                    buf[6] &= !(DISBIT3 | DISBIT7);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::t30::DISBIT1;

    fn run_editor(
        editor: &mut MessageEditor,
        dir: Direction,
        supported: ModemSupport,
        ecm_allowed: bool,
        frame: &mut [u8],
    ) {
        for len in 1..=frame.len() {
            editor.edit(dir, supported, ecm_allowed, frame, len);
        }
    }

    #[test]
    fn nsf_body_is_overwritten() {
        let mut editor = MessageEditor::new();
        editor
            .set_suppression(Direction::FromModem, Some(4))
            .unwrap();
        let mut frame = [0xFF, 0x03, t30::NSF, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE];
        run_editor(
            &mut editor,
            Direction::FromModem,
            ModemSupport::all(),
            true,
            &mut frame,
        );
        assert_eq!(frame, [0xFF, 0x03, t30::NSF, 0xFF, 0x00, 0x00, 0x00, 0xEE]);
    }

    #[test]
    fn suppression_stops_at_the_limit() {
        let mut editor = MessageEditor::new();
        editor
            .set_suppression(Direction::FromT38, Some(1))
            .unwrap();
        let mut frame = [0xFF, 0x03, t30::NSS, 0x11, 0x22, 0x33];
        run_editor(
            &mut editor,
            Direction::FromT38,
            ModemSupport::all(),
            true,
            &mut frame,
        );
        assert_eq!(frame[3], 0xFF);
        assert_eq!(frame[4], 0x22);
        assert_eq!(frame[5], 0x33);
    }

    #[test]
    fn suppression_disabled_leaves_nsf_alone() {
        let mut editor = MessageEditor::new();
        editor.set_suppression(Direction::FromModem, None).unwrap();
        let mut frame = [0xFF, 0x03, t30::NSF, 0xAA, 0xBB];
        run_editor(
            &mut editor,
            Direction::FromModem,
            ModemSupport::all(),
            true,
            &mut frame,
        );
        assert_eq!(frame, [0xFF, 0x03, t30::NSF, 0xAA, 0xBB]);
    }

    #[test]
    fn oversize_suppression_is_rejected() {
        let mut editor = MessageEditor::new();
        assert_eq!(
            editor.set_suppression(Direction::FromModem, Some(11)),
            Err(GatewayError::NsxSuppressionTooLong(11))
        );
    }

    #[test]
    fn dis_fast_modem_bits_clamped_to_v27ter() {
        let mut editor = MessageEditor::new();
        // advertises V.27ter + V.29 + V.17
        let mut frame = [0xFF, 0x13, t30::DIS, 0x00, DISBIT6 | DISBIT4 | DISBIT3];
        run_editor(
            &mut editor,
            Direction::FromModem,
            ModemSupport::V27TER,
            true,
            &mut frame,
        );
        assert_eq!(frame[4], DISBIT4);
    }

    #[test]
    fn dis_reserved_combination_rewritten() {
        let mut editor = MessageEditor::new();
        let mut frame = [0xFF, 0x13, t30::DIS, 0x00, DISBIT6 | DISBIT5 | DISBIT4];
        run_editor(
            &mut editor,
            Direction::FromT38,
            ModemSupport::all(),
            true,
            &mut frame,
        );
        assert_eq!(frame[4], DISBIT4 | DISBIT3);
    }

    #[test]
    fn dis_v29_only_advert_kept_when_supported() {
        let mut editor = MessageEditor::new();
        let mut frame = [0xFF, 0x13, t30::DIS, 0x00, DISBIT4 | DISBIT3];
        run_editor(
            &mut editor,
            Direction::FromModem,
            ModemSupport::V27TER | ModemSupport::V29,
            true,
            &mut frame,
        );
        assert_eq!(frame[4], DISBIT4 | DISBIT3);
    }

    #[test]
    fn ecm_and_t6_inhibited_when_not_allowed() {
        let mut editor = MessageEditor::new();
        let mut frame = [
            0xFF,
            0x13,
            t30::DIS,
            0x00,
            DISBIT4,
            0x00,
            DISBIT7 | DISBIT3 | DISBIT1,
        ];
        run_editor(
            &mut editor,
            Direction::FromModem,
            ModemSupport::all(),
            false,
            &mut frame,
        );
        assert_eq!(frame[6], DISBIT1);
    }

    #[test]
    fn ecm_left_alone_when_allowed() {
        let mut editor = MessageEditor::new();
        let mut frame = [0xFF, 0x13, t30::DIS, 0x00, DISBIT4, 0x00, DISBIT3];
        run_editor(
            &mut editor,
            Direction::FromModem,
            ModemSupport::all(),
            true,
            &mut frame,
        );
        assert_eq!(frame[6], DISBIT3);
    }
}
