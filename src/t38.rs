//! T.38 IFP vocabulary and the outbound packet seam.
//!
//! The gateway does not serialise IFP packets or talk to a transport. It
//! emits indicators and data fields through [`T38Sink`] and is fed decoded
//! fields through the gateway's `process_rx_*` entry points.

use std::fmt;

/// Times an indicator packet is repeated on the wire.
pub const INDICATOR_TX_COUNT: u32 = 3;
/// Times an ordinary data packet is sent.
pub const DATA_TX_COUNT: u32 = 1;
/// Times a terminating data packet is repeated.
pub const DATA_END_TX_COUNT: u32 = 3;

/// T.38 indicator: a modem state transition on the analogue side.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum T38Indicator {
    NoSignal,
    Cng,
    Ced,
    V21Preamble,
    V27ter2400Training,
    V27ter4800Training,
    V29_7200Training,
    V29_9600Training,
    V17_7200ShortTraining,
    V17_7200LongTraining,
    V17_9600ShortTraining,
    V17_9600LongTraining,
    V17_12000ShortTraining,
    V17_12000LongTraining,
    V17_14400ShortTraining,
    V17_14400LongTraining,
    V8Ansam,
    V8Signal,
    V34CntlChannel1200,
    V34PriChannel,
    V34CcRetrain,
    V33_12000Training,
    V33_14400Training,
}

impl fmt::Display for T38Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            T38Indicator::NoSignal => "no-signal",
            T38Indicator::Cng => "CNG",
            T38Indicator::Ced => "CED",
            T38Indicator::V21Preamble => "V.21-preamble",
            T38Indicator::V27ter2400Training => "V.27ter-2400-training",
            T38Indicator::V27ter4800Training => "V.27ter-4800-training",
            T38Indicator::V29_7200Training => "V.29-7200-training",
            T38Indicator::V29_9600Training => "V.29-9600-training",
            T38Indicator::V17_7200ShortTraining => "V.17-7200-short",
            T38Indicator::V17_7200LongTraining => "V.17-7200-long",
            T38Indicator::V17_9600ShortTraining => "V.17-9600-short",
            T38Indicator::V17_9600LongTraining => "V.17-9600-long",
            T38Indicator::V17_12000ShortTraining => "V.17-12000-short",
            T38Indicator::V17_12000LongTraining => "V.17-12000-long",
            T38Indicator::V17_14400ShortTraining => "V.17-14400-short",
            T38Indicator::V17_14400LongTraining => "V.17-14400-long",
            T38Indicator::V8Ansam => "V.8-ansam",
            T38Indicator::V8Signal => "V.8-signal",
            T38Indicator::V34CntlChannel1200 => "V.34-cc-1200",
            T38Indicator::V34PriChannel => "V.34-pri-channel",
            T38Indicator::V34CcRetrain => "V.34-cc-retrain",
            T38Indicator::V33_12000Training => "V.33-12000-training",
            T38Indicator::V33_14400Training => "V.33-14400-training",
        };
        f.write_str(name)
    }
}

/// T.38 data type: which carrier a data field belongs to.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum T38DataType {
    None,
    V21,
    V27ter2400,
    V27ter4800,
    V29_7200,
    V29_9600,
    V17_7200,
    V17_9600,
    V17_12000,
    V17_14400,
    V8,
    V34PriRate,
    V34Cc1200,
    V34PriCh,
    V33_12000,
    V33_14400,
}

impl T38DataType {
    /// True for the high-speed image carriers.
    pub fn is_fast(self) -> bool {
        matches!(
            self,
            T38DataType::V27ter2400
                | T38DataType::V27ter4800
                | T38DataType::V29_7200
                | T38DataType::V29_9600
                | T38DataType::V17_7200
                | T38DataType::V17_9600
                | T38DataType::V17_12000
                | T38DataType::V17_14400
        )
    }
}

impl fmt::Display for T38DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            T38DataType::None => "none",
            T38DataType::V21 => "V.21",
            T38DataType::V27ter2400 => "V.27ter-2400",
            T38DataType::V27ter4800 => "V.27ter-4800",
            T38DataType::V29_7200 => "V.29-7200",
            T38DataType::V29_9600 => "V.29-9600",
            T38DataType::V17_7200 => "V.17-7200",
            T38DataType::V17_9600 => "V.17-9600",
            T38DataType::V17_12000 => "V.17-12000",
            T38DataType::V17_14400 => "V.17-14400",
            T38DataType::V8 => "V.8",
            T38DataType::V34PriRate => "V.34-pri-rate",
            T38DataType::V34Cc1200 => "V.34-cc-1200",
            T38DataType::V34PriCh => "V.34-pri-ch",
            T38DataType::V33_12000 => "V.33-12000",
            T38DataType::V33_14400 => "V.33-14400",
        };
        f.write_str(name)
    }
}

/// T.38 data field type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum T38FieldType {
    HdlcData,
    HdlcSigEnd,
    HdlcFcsOk,
    HdlcFcsBad,
    HdlcFcsOkSigEnd,
    HdlcFcsBadSigEnd,
    T4NonEcmData,
    T4NonEcmSigEnd,
    CmMessage,
    JmMessage,
    CiMessage,
    V34Rate,
}

impl fmt::Display for T38FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            T38FieldType::HdlcData => "HDLC-data",
            T38FieldType::HdlcSigEnd => "HDLC-sig-end",
            T38FieldType::HdlcFcsOk => "HDLC-FCS-OK",
            T38FieldType::HdlcFcsBad => "HDLC-FCS-bad",
            T38FieldType::HdlcFcsOkSigEnd => "HDLC-FCS-OK-sig-end",
            T38FieldType::HdlcFcsBadSigEnd => "HDLC-FCS-bad-sig-end",
            T38FieldType::T4NonEcmData => "T4-non-ECM-data",
            T38FieldType::T4NonEcmSigEnd => "T4-non-ECM-sig-end",
            T38FieldType::CmMessage => "CM-message",
            T38FieldType::JmMessage => "JM-message",
            T38FieldType::CiMessage => "CI-message",
            T38FieldType::V34Rate => "V34-rate",
        };
        f.write_str(name)
    }
}

/// Outbound packet seam to the T.38 wire side.
///
/// `tx_count` is the redundancy multiplier the transport should apply; it is
/// one of [`INDICATOR_TX_COUNT`], [`DATA_TX_COUNT`] or [`DATA_END_TX_COUNT`].
pub trait T38Sink {
    fn send_indicator(&mut self, indicator: T38Indicator, tx_count: u32);

    fn send_data(
        &mut self,
        data_type: T38DataType,
        field_type: T38FieldType,
        field: &[u8],
        tx_count: u32,
    );
}
