//! Mode tracking: following the T.30 conversation to decide which modem
//! should run next, in which training mode, and how image data will arrive.

use log::debug;

use crate::editor::Direction;
use crate::t30::{self, ModemSupport, DISBIT3, DISBIT4, DISBIT5, DISBIT6, DISBIT7};

/// The fast modem selected by the last DCS/DTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FastModem {
    None,
    V17,
    V27ter,
    V29,
}

/// Predictive fast-training announcement during TCF.
///
/// A DCS from the audio side arms the prediction; when the V.21 carrier then
/// drops, a 75 ms countdown starts, and on expiry the fast training indicator
/// goes out before the fast carrier has actually been demodulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcfPrediction {
    Off,
    Countdown,
    Armed,
}

/// DCS bits 11-14 mapped to the modem and rate they select.
const MODEM_CODES: [(u32, FastModem, u8); 8] = [
    (14400, FastModem::V17, DISBIT6),
    (12000, FastModem::V17, DISBIT6 | DISBIT4),
    (9600, FastModem::V17, DISBIT6 | DISBIT3),
    (9600, FastModem::V29, DISBIT3),
    (7200, FastModem::V17, DISBIT6 | DISBIT4 | DISBIT3),
    (7200, FastModem::V29, DISBIT4 | DISBIT3),
    (4800, FastModem::V27ter, DISBIT4),
    (2400, FastModem::V27ter, 0),
];

/// Minimum scan line time in ms, indexed by DCS bits 21-23.
const MIN_SCAN_LINE_TIMES_MS: [u32; 8] = [20, 5, 10, 0, 40, 0, 0, 0];

pub(crate) struct ModePolicy {
    pub supported_modems: ModemSupport,
    pub fast_modem: FastModem,
    pub fast_bit_rate: u32,
    pub short_train: bool,
    pub ecm_mode: bool,
    pub ecm_allowed: bool,
    pub image_data_mode: bool,
    pub min_row_bits: u32,
    pub tcf_predict: TcfPrediction,
    pub count_page_on_mcf: bool,
    pub pages_confirmed: u32,
}

impl ModePolicy {
    pub fn new() -> Self {
        Self {
            supported_modems: ModemSupport::V27TER | ModemSupport::V29,
            fast_modem: FastModem::None,
            fast_bit_rate: 0,
            short_train: false,
            ecm_mode: false,
            ecm_allowed: false,
            image_data_mode: false,
            min_row_bits: 0,
            tcf_predict: TcfPrediction::Off,
            count_page_on_mcf: false,
            pages_confirmed: 0,
        }
    }

    /// Digest a complete, CRC-good V.21 control frame. Returns true when the
    /// receive modem should be restarted right away.
    pub fn observe_control_frame(&mut self, dir: Direction, frame: &[u8]) -> bool {
        if frame.len() < 3 {
            return false;
        }
        debug!("monitoring {}", t30::frame_name(frame[2]));
        self.tcf_predict = TcfPrediction::Off;
        let fcf = frame[2];
        match fcf {
            t30::CFR => {
                // Training confirmed: TCF exchange gives way to image data.
                self.image_data_mode = true;
                self.short_train = true;
                debug!(
                    "CFR - short train = {}, ECM = {}",
                    self.short_train, self.ecm_mode
                );
                return dir == Direction::FromT38;
            }
            t30::RTN | t30::RTP => {
                // Back to fresh TCF.
                self.image_data_mode = false;
                self.short_train = false;
            }
            _ if fcf & 0xFE == t30::CTR => {
                // The next image block does full training without a return to
                // TCF; the single long-training case for image data.
                self.short_train = false;
            }
            _ if fcf == t30::DTC || fcf & 0xFE == t30::DCS => {
                if frame.len() >= 5 {
                    let code = frame[4] & (DISBIT6 | DISBIT5 | DISBIT4 | DISBIT3);
                    let (rate, modem) = MODEM_CODES
                        .iter()
                        .find(|&&(_, _, c)| c == code)
                        .map(|&(r, m, _)| (r, m))
                        .unwrap_or((0, FastModem::None));
                    self.fast_bit_rate = rate;
                    self.fast_modem = modem;
                }
                if frame.len() >= 6 {
                    let j = ((frame[5] & (DISBIT7 | DISBIT6 | DISBIT5)) >> 4) as usize;
                    self.min_row_bits = self.fast_bit_rate * MIN_SCAN_LINE_TIMES_MS[j] / 1000;
                    debug!("min bits per row = {}", self.min_row_bits);
                }
                self.ecm_mode = frame.len() >= 7 && (frame[6] & DISBIT3) != 0;
                self.image_data_mode = false;
                self.short_train = false;
                if dir == Direction::FromModem {
                    self.tcf_predict = TcfPrediction::Armed;
                }
            }
            _ if fcf & 0xFE == t30::PPS => {
                if frame.len() >= 4
                    && matches!(
                        frame[3] & 0xFE,
                        t30::EOP
                            | t30::EOM
                            | t30::EOS
                            | t30::MPS
                            | t30::PRI_EOP
                            | t30::PRI_EOM
                            | t30::PRI_MPS
                    )
                {
                    self.count_page_on_mcf = true;
                }
            }
            _ if matches!(
                fcf & 0xFE,
                t30::EOP
                    | t30::EOM
                    | t30::EOS
                    | t30::MPS
                    | t30::PRI_EOP
                    | t30::PRI_EOM
                    | t30::PRI_MPS
            ) =>
            {
                self.count_page_on_mcf = true;
            }
            _ if fcf & 0xFE == t30::MCF => {
                if self.count_page_on_mcf {
                    self.pages_confirmed += 1;
                    debug!("pages confirmed = {}", self.pages_confirmed);
                    self.count_page_on_mcf = false;
                }
            }
            _ => {}
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dcs(code: u8, scan: u8, ecm: u8) -> [u8; 7] {
        [0xFF, 0x13, t30::DCS | 1, 0x00, code, scan, ecm]
    }

    #[test]
    fn dcs_selects_v17_14400() {
        let mut m = ModePolicy::new();
        m.observe_control_frame(Direction::FromModem, &dcs(DISBIT6, 0, 0));
        assert_eq!(m.fast_modem, FastModem::V17);
        assert_eq!(m.fast_bit_rate, 14400);
        assert_eq!(m.tcf_predict, TcfPrediction::Armed);
        assert!(!m.short_train);
        assert!(!m.image_data_mode);
    }

    #[test]
    fn dcs_distinguishes_v29_and_v17_9600() {
        let mut m = ModePolicy::new();
        m.observe_control_frame(Direction::FromT38, &dcs(DISBIT3, 0, 0));
        assert_eq!(m.fast_modem, FastModem::V29);
        assert_eq!(m.fast_bit_rate, 9600);
        assert_eq!(m.tcf_predict, TcfPrediction::Off);

        m.observe_control_frame(Direction::FromT38, &dcs(DISBIT6 | DISBIT3, 0, 0));
        assert_eq!(m.fast_modem, FastModem::V17);
        assert_eq!(m.fast_bit_rate, 9600);
    }

    #[test]
    fn dcs_unknown_code_clears_fast_modem() {
        let mut m = ModePolicy::new();
        m.observe_control_frame(Direction::FromModem, &dcs(DISBIT5, 0, 0));
        assert_eq!(m.fast_modem, FastModem::None);
        assert_eq!(m.fast_bit_rate, 0);
    }

    #[test]
    fn min_row_bits_from_scan_line_time() {
        let mut m = ModePolicy::new();
        // V.17 14400, 5 ms minimum scan line time
        m.observe_control_frame(Direction::FromModem, &dcs(DISBIT6, DISBIT5, 0));
        assert_eq!(m.min_row_bits, 14400 * 5 / 1000);
    }

    #[test]
    fn dcs_reads_ecm_bit() {
        let mut m = ModePolicy::new();
        m.observe_control_frame(Direction::FromModem, &dcs(DISBIT6, 0, DISBIT3));
        assert!(m.ecm_mode);
        m.observe_control_frame(Direction::FromModem, &dcs(DISBIT6, 0, 0));
        assert!(!m.ecm_mode);
    }

    #[test]
    fn cfr_enters_image_mode_and_restarts_from_t38() {
        let mut m = ModePolicy::new();
        assert!(m.observe_control_frame(Direction::FromT38, &[0xFF, 0x13, t30::CFR]));
        assert!(m.image_data_mode);
        assert!(m.short_train);
        assert!(!m.observe_control_frame(Direction::FromModem, &[0xFF, 0x13, t30::CFR]));
    }

    #[test]
    fn rtn_returns_to_tcf() {
        let mut m = ModePolicy::new();
        m.observe_control_frame(Direction::FromT38, &[0xFF, 0x13, t30::CFR]);
        m.observe_control_frame(Direction::FromModem, &[0xFF, 0x13, t30::RTN]);
        assert!(!m.image_data_mode);
        assert!(!m.short_train);
    }

    #[test]
    fn ctr_forces_long_training_only() {
        let mut m = ModePolicy::new();
        m.observe_control_frame(Direction::FromT38, &[0xFF, 0x13, t30::CFR]);
        m.observe_control_frame(Direction::FromModem, &[0xFF, 0x13, t30::CTR]);
        assert!(m.image_data_mode);
        assert!(!m.short_train);
    }

    #[test]
    fn mps_then_mcf_counts_one_page() {
        let mut m = ModePolicy::new();
        m.observe_control_frame(Direction::FromModem, &[0xFF, 0x13, t30::MPS | 1]);
        m.observe_control_frame(Direction::FromT38, &[0xFF, 0x13, t30::MCF | 1]);
        assert_eq!(m.pages_confirmed, 1);
        // a second MCF without a fresh post-page command does not count
        m.observe_control_frame(Direction::FromT38, &[0xFF, 0x13, t30::MCF | 1]);
        assert_eq!(m.pages_confirmed, 1);
    }

    #[test]
    fn bare_mcf_does_not_count() {
        let mut m = ModePolicy::new();
        m.observe_control_frame(Direction::FromT38, &[0xFF, 0x13, t30::MCF]);
        assert_eq!(m.pages_confirmed, 0);
    }

    #[test]
    fn pps_over_eop_arms_page_count() {
        let mut m = ModePolicy::new();
        m.observe_control_frame(
            Direction::FromModem,
            &[0xFF, 0x13, t30::PPS, t30::EOP | 1, 0x00, 0x01, 0x02],
        );
        m.observe_control_frame(Direction::FromT38, &[0xFF, 0x13, t30::MCF]);
        assert_eq!(m.pages_confirmed, 1);
    }
}
