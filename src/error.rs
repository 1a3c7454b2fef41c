use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum GatewayError {
    #[error("NSX suppression length {0} exceeds the maximum of 10 bytes")]
    NsxSuppressionTooLong(usize),

    #[error("HDLC frame of {0} bytes exceeds the maximum of 260")]
    FrameTooLong(usize),
}
