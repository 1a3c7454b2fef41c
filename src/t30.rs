//! T.30 frame vocabulary: FCF values, DIS bit masks and capability masks.
//!
//! FCF values are stored the way they land in an HDLC receive buffer: bits
//! arrive LSB first, so the first bit of the T.30 notation becomes bit 0.
//! Frame types sent in both command and response phases differ only in the
//! X bit (bit 0), e.g. `DCS` is 0x82 or 0x83 on the wire.

use bitflags::bitflags;

pub const NSF: u8 = 0x20;
pub const CSI: u8 = 0x40;
pub const DIS: u8 = 0x80;
pub const NSC: u8 = 0x21;
pub const CIG: u8 = 0x41;
pub const DTC: u8 = 0x81;
pub const NSS: u8 = 0x22;
pub const TSI: u8 = 0x42;
pub const DCS: u8 = 0x82;
pub const CFR: u8 = 0x84;
pub const FTT: u8 = 0x44;
pub const CTC: u8 = 0x12;
pub const CTR: u8 = 0xC4;
pub const MCF: u8 = 0x8C;
pub const RTP: u8 = 0xCC;
pub const RTN: u8 = 0x4C;
pub const PIP: u8 = 0xAC;
pub const PIN: u8 = 0x2C;
pub const EOM: u8 = 0x8E;
pub const MPS: u8 = 0x4E;
pub const EOP: u8 = 0x2E;
pub const EOS: u8 = 0x1E;
pub const PRI_EOM: u8 = 0x9E;
pub const PRI_MPS: u8 = 0x5E;
pub const PRI_EOP: u8 = 0x3E;
pub const PPS: u8 = 0xBE;
pub const PPR: u8 = 0xBC;
pub const EOR: u8 = 0xCE;
pub const ERR: u8 = 0x1C;
pub const RR: u8 = 0x6E;
pub const RNR: u8 = 0xEC;
pub const FCD: u8 = 0x06;
pub const RCP: u8 = 0x86;
pub const DCN: u8 = 0xFA;

pub const DISBIT1: u8 = 0x01;
pub const DISBIT2: u8 = 0x02;
pub const DISBIT3: u8 = 0x04;
pub const DISBIT4: u8 = 0x08;
pub const DISBIT5: u8 = 0x10;
pub const DISBIT6: u8 = 0x20;
pub const DISBIT7: u8 = 0x40;
pub const DISBIT8: u8 = 0x80;

bitflags! {
    /// Which fast modems the gateway is prepared to run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModemSupport: u32 {
        const V27TER = 0x01;
        const V29 = 0x02;
        const V17 = 0x04;
    }
}

/// Name of a T.30 frame type, for log output.
pub fn frame_name(fcf: u8) -> &'static str {
    // DIS/DTC and NSF/NSC/CSI/CIG pairs differ only in bit 0, so they must be
    // matched exactly before folding out the X bit.
    match fcf {
        DIS => "DIS",
        DTC => "DTC",
        NSF => "NSF",
        NSC => "NSC",
        CIG => "CIG",
        _ => match fcf & 0xFE {
            NSS => "NSS",
            CSI => "CSI",
            TSI => "TSI",
            DCS => "DCS",
            CFR => "CFR",
            FTT => "FTT",
            CTC => "CTC",
            CTR => "CTR",
            MCF => "MCF",
            RTP => "RTP",
            RTN => "RTN",
            PIP => "PIP",
            PIN => "PIN",
            EOM => "EOM",
            MPS => "MPS",
            EOP => "EOP",
            EOS => "EOS",
            PRI_EOM => "PRI-EOM",
            PRI_MPS => "PRI-MPS",
            PRI_EOP => "PRI-EOP",
            PPS => "PPS",
            PPR => "PPR",
            EOR => "EOR",
            ERR => "ERR",
            RR => "RR",
            RNR => "RNR",
            FCD => "FCD",
            RCP => "RCP",
            DCN => "DCN",
            _ => "???",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_names() {
        assert_eq!(frame_name(DIS), "DIS");
        assert_eq!(frame_name(DTC), "DTC");
        assert_eq!(frame_name(DCS), "DCS");
        assert_eq!(frame_name(DCS | 1), "DCS");
        assert_eq!(frame_name(MCF | 1), "MCF");
        assert_eq!(frame_name(NSF), "NSF");
        assert_eq!(frame_name(NSC), "NSC");
        assert_eq!(frame_name(0x77), "???");
    }

    #[test]
    fn modem_support_mask() {
        let m = ModemSupport::V27TER | ModemSupport::V29;
        assert!(m.contains(ModemSupport::V29));
        assert!(!m.contains(ModemSupport::V17));
    }
}
