//! Core of a T.38 fax gateway: the bidirectional bridge between an analogue
//! PSTN fax call and a T.38 packet fax relay.
//!
//! Audio from the telephone side is demodulated into a bit stream, deframed
//! and packaged as T.38 IFP data fields; fields arriving from the packet side
//! are queued, reframed and remodulated onto the audio side. In between sit
//! the pieces that make a gateway more than a pipe: a mode tracker following
//! the T.30 conversation to pick the right modem at each instant, a bit-level
//! HDLC deframer with progressive CRC so FCS verdicts accompany each frame,
//! fill-bit handling for non-ECM image data, and an in-flight editor that
//! clamps advertised capabilities and suppresses proprietary NSF/NSC/NSS
//! negotiation.
//!
//! The DSP modem kernels, the T.38 wire serialisation and the transport all
//! live outside this crate, behind the seams in [`modem`] and [`t38`].
//!
//! A [`gateway::T38Gateway`] is single-threaded and cooperative: all entry
//! points run to completion on the caller's thread, and one instance must
//! never be entered concurrently. A host multiplexing calls creates one
//! gateway per call.

pub mod crc;
pub mod error;
pub mod gateway;
pub mod hdlc;
pub mod modem;
pub mod t30;
pub mod t38;

mod bits;
mod editor;
mod mode;
mod nonecm;
mod ring;

pub use editor::Direction;
pub use error::GatewayError;
pub use gateway::{FrameObserver, T38Gateway, T38Stats};
pub use modem::{BitEvent, BitSource, FaxDemodulator, FaxModulator, ModemSet, RxStatus};
pub use t30::ModemSupport;
pub use t38::{T38DataType, T38FieldType, T38Indicator, T38Sink};
