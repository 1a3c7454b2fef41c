//! The T.38 gateway: a man in the middle between an analogue fax terminal
//! and a T.38 packet endpoint.
//!
//! Audio in is demodulated (fast modem and V.21 in parallel until training
//! resolves), deframed and forwarded as IFP data fields; IFP fields in are
//! queued, reframed and remodulated onto the audio side. A mode tracker
//! follows the T.30 conversation on both paths to keep the two directions
//! pointed at the right modems.

use std::mem;

use log::{debug, warn};

use crate::bits;
use crate::crc;
use crate::editor::{Direction, MessageEditor};
use crate::error::GatewayError;
use crate::hdlc::{HdlcRxState, HdlcTx, HdlcTxBit, FRAMING_OK_THRESHOLD, MAX_FRAME_LEN};
use crate::mode::{FastModem, ModePolicy, TcfPrediction};
use crate::modem::{
    ms_to_samples, BitEvent, BitSource, DcRestore, FaxDemodulator, FaxModulator, ModemSet,
    RxStatus, SilenceGen,
};
use crate::nonecm::NonEcmBuffer;
use crate::ring::{HdlcRing, SlotContents, SlotFlags};
use crate::t30::{self, ModemSupport};
use crate::t38::{
    T38DataType, T38FieldType, T38Indicator, T38Sink, DATA_END_TX_COUNT, DATA_TX_COUNT,
    INDICATOR_TX_COUNT,
};

/// Target wall-clock time per outbound T.38 data packet.
const MS_PER_TX_CHUNK: u32 = 30;

/// Octets that must accumulate before a V.21 frame starts clocking out, as
/// elasticity against packet jitter.
const HDLC_START_BUFFER_LEVEL: usize = 8;

fn octets_per_packet(bit_rate: u32) -> usize {
    ((MS_PER_TX_CHUNK * bit_rate / 8000) as usize).max(1)
}

/// Which receive dispatch is live on the audio side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxPath {
    /// Receiver intentionally ignores samples while the gateway is speaking.
    Muted,
    V21,
    /// Fast demodulator and V.21 run in parallel until training resolves.
    Dual,
    Fast,
}

/// The active (or deferred) element of the transmit chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxHandler {
    Silence,
    CngTone,
    CedTone,
    V21,
    Fast(FastModem),
}

/// Who feeds a fast modulator's bit hunger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxBitSource {
    Hdlc,
    NonEcm,
}

/// Where the fast demodulator's bits are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FastSink {
    Hdlc,
    NonEcm,
    NonEcmFill,
}

/// What kind of IFP field stream is currently arriving from the packet side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldClass {
    None,
    Hdlc,
    NonEcm,
}

struct AudioSide {
    modems: ModemSet,
    rx_path: RxPath,
    base_rx_path: RxPath,
    rx_signal_present: bool,
    rx_trained: bool,
    tx_handler: TxHandler,
    next_tx_handler: Option<TxHandler>,
    tx_bit_source: TxBitSource,
    tx_bit_rate: u32,
    use_tep: bool,
    transmit_on_idle: bool,
    silence_gen: SilenceGen,
    hdlc_tx: HdlcTx,
    dc_restore: DcRestore,
}

struct PacketSide {
    /// Data type for fields the gateway is currently emitting.
    current_tx_data_type: T38DataType,
    /// Last indicator accepted from the far end (repeats are dropped).
    current_rx_indicator: Option<T38Indicator>,
    /// Indicator the transmit chain was last pointed at.
    in_progress_rx_indicator: Option<T38Indicator>,
    /// Last data field accepted, for repeat suppression.
    current_rx_data: Option<(T38DataType, T38FieldType)>,
    current_rx_field_class: FieldClass,
    editor: MessageEditor,
    v34_rate: u32,
}

/// Audio-to-T.38 assembly state, shared by the HDLC and non-ECM paths.
struct ToT38Buf {
    data: [u8; MAX_FRAME_LEN],
    data_ptr: usize,
    crc: u16,
    bit_stream: u16,
    bit_no: u32,
    octets_per_data_packet: usize,
    fill_bit_removal: bool,
    in_bits: u32,
    out_octets: u32,
    bits_absorbed: u32,
}

impl ToT38Buf {
    fn new() -> Self {
        Self {
            data: [0; MAX_FRAME_LEN],
            data_ptr: 0,
            crc: 0xFFFF,
            bit_stream: 0xFFFF,
            bit_no: 0,
            octets_per_data_packet: 1,
            fill_bit_removal: false,
            in_bits: 0,
            out_octets: 0,
            bits_absorbed: 0,
        }
    }

    fn init(&mut self) {
        self.data_ptr = 0;
        self.crc = 0xFFFF;
        self.bit_stream = 0xFFFF;
        self.bit_no = 0;
        self.in_bits = 0;
        self.out_octets = 0;
        self.bits_absorbed = 0;
    }
}

struct CoreState {
    mode: ModePolicy,
    hdlc_rx: HdlcRxState,
    to_t38: ToT38Buf,
    hdlc_to_modem: HdlcRing,
    non_ecm_to_modem: NonEcmBuffer,
    fast_rx_active: FastModem,
    fast_rx_sink: FastSink,
    samples_to_timeout: i32,
}

/// Transfer statistics, a snapshot of the current call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct T38Stats {
    pub bit_rate: u32,
    pub error_correcting_mode: bool,
    pub pages_transferred: u32,
}

/// Observer called with every complete, clean V.21 control frame.
pub type FrameObserver = Box<dyn FnMut(Direction, &[u8])>;

/// A T.38 gateway instance.
///
/// One instance bridges exactly one call. The instance is single-threaded
/// and cooperative: [`rx`](Self::rx), [`tx`](Self::tx) and the
/// `process_rx_*` entry points must never run concurrently. A host that
/// multiplexes calls creates one gateway per call.
pub struct T38Gateway<S: T38Sink> {
    audio: AudioSide,
    packet: PacketSide,
    core: CoreState,
    sink: S,
    frame_observer: Option<FrameObserver>,
    scratch_fast: Vec<BitEvent>,
    scratch_v21: Vec<BitEvent>,
}

impl<S: T38Sink> T38Gateway<S> {
    /// Build a gateway around a modem ensemble and a packet sink.
    ///
    /// The sink is held by value, so there is no unconfigured state to guard
    /// against. Defaults match an ordinary PSTN gateway: V.27ter and V.29
    /// supported, ECM disallowed, three NSX payload bytes suppressed in each
    /// direction.
    pub fn new(modems: ModemSet, sink: S) -> Self {
        let mut gateway = Self {
            audio: AudioSide {
                modems,
                rx_path: RxPath::V21,
                base_rx_path: RxPath::V21,
                rx_signal_present: false,
                rx_trained: false,
                tx_handler: TxHandler::Silence,
                next_tx_handler: None,
                tx_bit_source: TxBitSource::NonEcm,
                tx_bit_rate: 0,
                use_tep: false,
                transmit_on_idle: false,
                silence_gen: SilenceGen::new(),
                hdlc_tx: HdlcTx::new(),
                dc_restore: DcRestore::new(),
            },
            packet: PacketSide {
                current_tx_data_type: T38DataType::V21,
                current_rx_indicator: None,
                in_progress_rx_indicator: None,
                current_rx_data: None,
                current_rx_field_class: FieldClass::None,
                editor: MessageEditor::new(),
                v34_rate: 0,
            },
            core: CoreState {
                mode: ModePolicy::new(),
                hdlc_rx: HdlcRxState::new(),
                to_t38: ToT38Buf::new(),
                hdlc_to_modem: HdlcRing::new(),
                non_ecm_to_modem: NonEcmBuffer::new(),
                fast_rx_active: FastModem::None,
                fast_rx_sink: FastSink::NonEcm,
                samples_to_timeout: 0,
            },
            sink,
            frame_observer: None,
            scratch_fast: Vec::new(),
            scratch_v21: Vec::new(),
        };
        gateway.restart_rx_modem();
        gateway
    }

    // ------------------------------------------------------------------
    // configuration
    // ------------------------------------------------------------------

    pub fn set_supported_modems(&mut self, modems: ModemSupport) {
        self.core.mode.supported_modems = modems;
    }

    pub fn set_ecm_capability(&mut self, ecm_allowed: bool) {
        self.core.mode.ecm_allowed = ecm_allowed;
    }

    /// Pad [`tx`](Self::tx) output with silence up to the requested length.
    pub fn set_transmit_on_idle(&mut self, on: bool) {
        self.audio.transmit_on_idle = on;
    }

    pub fn set_tep_mode(&mut self, use_tep: bool) {
        self.audio.use_tep = use_tep;
    }

    /// Strip excess EOL fill bits from non-ECM image data heading to T.38.
    pub fn set_fill_bit_removal(&mut self, remove: bool) {
        self.core.to_t38.fill_bit_removal = remove;
    }

    /// How many NSF/NSC/NSS payload bytes to overwrite in each direction;
    /// `None` disables suppression for that direction.
    pub fn set_nsx_suppression(
        &mut self,
        from_t38: Option<usize>,
        from_modem: Option<usize>,
    ) -> Result<(), GatewayError> {
        self.packet.editor.set_suppression(Direction::FromT38, from_t38)?;
        self.packet.editor.set_suppression(Direction::FromModem, from_modem)?;
        Ok(())
    }

    pub fn set_real_time_frame_handler(&mut self, handler: Option<FrameObserver>) {
        self.frame_observer = handler;
    }

    pub fn transfer_statistics(&self) -> T38Stats {
        T38Stats {
            bit_rate: self.core.mode.fast_bit_rate,
            error_correcting_mode: self.core.mode.ecm_mode,
            pages_transferred: self.core.mode.pages_confirmed,
        }
    }

    /// Last V.34 rate field received, raw big-endian octets.
    pub fn v34_rate(&self) -> u32 {
        self.packet.v34_rate
    }

    /// Receive-side HDLC counters for the carrier currently being
    /// demodulated; reset on every modem restart.
    pub fn hdlc_rx_stats(&self) -> crate::hdlc::HdlcRxStats {
        self.core.hdlc_rx.stats()
    }

    // ------------------------------------------------------------------
    // audio entry points
    // ------------------------------------------------------------------

    /// Feed received audio from the analogue side.
    pub fn rx(&mut self, amp: &mut [i16]) {
        if self.core.samples_to_timeout > 0 {
            self.core.samples_to_timeout -= amp.len() as i32;
            if self.core.samples_to_timeout <= 0
                && self.core.mode.tcf_predict == TcfPrediction::Countdown
            {
                self.announce_training();
            }
        }
        for s in amp.iter_mut() {
            *s = self.audio.dc_restore.restore(*s);
        }
        let mut fast_events = mem::take(&mut self.scratch_fast);
        let mut slow_events = mem::take(&mut self.scratch_v21);
        match self.audio.rx_path {
            RxPath::Muted => {}
            RxPath::V21 => self.audio.modems.v21_rx.rx(amp, &mut slow_events),
            RxPath::Fast => self.fast_demod_rx(amp, &mut fast_events),
            RxPath::Dual => {
                self.fast_demod_rx(amp, &mut fast_events);
                self.audio.modems.v21_rx.rx(amp, &mut slow_events);
            }
        }
        for ev in fast_events.drain(..) {
            self.handle_fast_event(ev);
        }
        for ev in slow_events.drain(..) {
            self.handle_v21_event(ev);
        }
        self.scratch_fast = fast_events;
        self.scratch_v21 = slow_events;

        if self.audio.rx_path == RxPath::Dual && self.audio.rx_signal_present {
            if self.audio.rx_trained {
                debug!("fast modem trained, dropping the parallel V.21 receiver");
                self.set_rx_handler(RxPath::Fast);
            } else {
                debug!("V.21 answered instead of fast training, dropping the fast receiver");
                self.set_rx_handler(RxPath::V21);
            }
        }
    }

    /// Generate transmit audio for the analogue side. Returns the number of
    /// samples produced, padded to `amp.len()` when transmit-on-idle is set.
    pub fn tx(&mut self, amp: &mut [i16]) -> usize {
        let max_len = amp.len();
        let mut len = self.run_tx_handler(amp);
        if len < max_len && self.set_next_tx_type() {
            // give the new handler a chance to fill the remaining space
            len += self.run_tx_handler(&mut amp[len..]);
            if len < max_len {
                self.audio.silence_gen.set(0);
                self.set_next_tx_type();
            }
        }
        if self.audio.transmit_on_idle {
            amp[len..].fill(0);
            len = max_len;
        }
        len
    }

    // ------------------------------------------------------------------
    // T.38 ingress
    // ------------------------------------------------------------------

    /// An indicator arrived from the packet side.
    pub fn process_rx_indicator(&mut self, indicator: T38Indicator) {
        if self.packet.current_rx_indicator == Some(indicator) {
            // far end repeating itself; harmless
            return;
        }
        let ring = &mut self.core.hdlc_to_modem;
        if ring.slot_in().contents != SlotContents::Empty {
            ring.advance_in();
        }
        let slot = ring.slot_in_mut();
        slot.clear();
        slot.contents = SlotContents::Indicator(indicator);
        ring.advance_in();
        debug!(
            "queued change - ({}) {:?} -> {}",
            self.audio.silence_gen.remainder(),
            self.packet.current_rx_indicator,
            indicator
        );
        self.packet.current_rx_field_class = FieldClass::None;
        self.packet.current_rx_indicator = Some(indicator);
        self.packet.current_rx_data = None;
    }

    /// The transport noticed missing packets; capability bits in the frame
    /// being assembled can no longer be trusted.
    pub fn process_rx_missing(&mut self, rx_seq: u16, expected_seq: u16) {
        debug!("sequence {} received, {} expected", rx_seq, expected_seq);
        self.core.hdlc_to_modem.slot_in_mut().flags |= SlotFlags::MISSING_DATA;
    }

    /// A data field arrived from the packet side.
    pub fn process_rx_data(&mut self, data_type: T38DataType, field_type: T38FieldType, buf: &[u8]) {
        // Some implementations repeat terminal fields in IFP packets with
        // incrementing sequence numbers; act only on change.
        let repeated = self.packet.current_rx_data == Some((data_type, field_type));
        match field_type {
            T38FieldType::HdlcData => {
                self.packet.current_rx_field_class = FieldClass::Hdlc;
                if self.core.hdlc_to_modem.slot_in().contents != SlotContents::Data(data_type) {
                    self.queue_missing_indicator(data_type);
                }
                let supported = self.core.mode.supported_modems;
                let ecm_allowed = self.core.mode.ecm_allowed;
                let at_output = self.core.hdlc_to_modem.is_empty();
                let slot = self.core.hdlc_to_modem.slot_in_mut();
                let previous = slot.len;
                if previous + buf.len() <= MAX_FRAME_LEN {
                    slot.contents = SlotContents::Data(data_type);
                    bits::reverse_into(&mut slot.buf[previous..previous + buf.len()], buf);
                    // Control messages are too slow to hold back until the
                    // whole frame arrives, so they stream (edited on the fly);
                    // fast frames go out whole once finalized.
                    if data_type == T38DataType::V21 {
                        for i in 1..=buf.len() {
                            self.packet.editor.edit(
                                Direction::FromT38,
                                supported,
                                ecm_allowed,
                                &mut slot.buf,
                                previous + i,
                            );
                        }
                        if previous + buf.len() >= HDLC_START_BUFFER_LEVEL {
                            if at_output {
                                let from = if slot.flags.contains(SlotFlags::PROCEED_WITH_OUTPUT) {
                                    previous
                                } else {
                                    0
                                };
                                let _ = self
                                    .audio
                                    .hdlc_tx
                                    .frame(&slot.buf[from..previous + buf.len()]);
                            }
                            slot.flags |= SlotFlags::PROCEED_WITH_OUTPUT;
                        }
                    }
                    slot.len = previous + buf.len();
                }
            }
            T38FieldType::HdlcFcsOk => {
                self.packet.current_rx_field_class = FieldClass::Hdlc;
                if !buf.is_empty() {
                    warn!("data inside an HDLC-FCS-OK field");
                }
                if !repeated {
                    debug!("HDLC frame type {} - CRC good", self.slot_in_frame_name());
                    if self.core.hdlc_to_modem.slot_in().contents != SlotContents::Data(data_type)
                    {
                        self.queue_missing_indicator(data_type);
                    }
                    let restart_needed = self.finalize_slot_frame(data_type);
                    if restart_needed {
                        self.restart_rx_modem();
                    }
                    let good = !self
                        .core
                        .hdlc_to_modem
                        .slot_in()
                        .flags
                        .contains(SlotFlags::MISSING_DATA);
                    self.pump_out_final_hdlc(good);
                }
                let slot = self.core.hdlc_to_modem.slot_in_mut();
                slot.len = 0;
                slot.flags = SlotFlags::empty();
                self.packet.editor.clear_corrupt(Direction::FromT38);
            }
            T38FieldType::HdlcFcsBad => {
                self.packet.current_rx_field_class = FieldClass::Hdlc;
                if !buf.is_empty() {
                    warn!("data inside an HDLC-FCS-BAD field");
                }
                if !repeated {
                    debug!("HDLC frame type {} - CRC bad", self.slot_in_frame_name());
                    if self.core.hdlc_to_modem.slot_in().contents != SlotContents::Data(data_type)
                    {
                        self.queue_missing_indicator(data_type);
                    }
                    if self.core.hdlc_to_modem.slot_in().len > 0 {
                        self.core.hdlc_to_modem.slot_in_mut().contents =
                            SlotContents::Data(data_type);
                        self.pump_out_final_hdlc(false);
                    }
                }
                let slot = self.core.hdlc_to_modem.slot_in_mut();
                slot.len = 0;
                slot.flags = SlotFlags::empty();
                self.packet.editor.clear_corrupt(Direction::FromT38);
            }
            T38FieldType::HdlcFcsOkSigEnd => {
                self.packet.current_rx_field_class = FieldClass::Hdlc;
                if !buf.is_empty() {
                    warn!("data inside an HDLC-FCS-OK-sig-end field");
                }
                if !repeated {
                    debug!(
                        "HDLC frame type {} - CRC OK, sig end",
                        self.slot_in_frame_name()
                    );
                    if self.core.hdlc_to_modem.slot_in().contents != SlotContents::Data(data_type)
                    {
                        self.queue_missing_indicator(data_type);
                    }
                    let restart_needed = self.finalize_slot_frame(data_type);
                    if restart_needed {
                        self.restart_rx_modem();
                    }
                    let good = !self
                        .core
                        .hdlc_to_modem
                        .slot_in()
                        .flags
                        .contains(SlotFlags::MISSING_DATA);
                    self.pump_out_final_hdlc(good);
                    self.core.hdlc_to_modem.slot_in_mut().clear();
                    self.queue_missing_indicator(T38DataType::None);
                    self.packet.current_rx_field_class = FieldClass::None;
                }
                self.packet.editor.clear_corrupt(Direction::FromT38);
            }
            T38FieldType::HdlcFcsBadSigEnd => {
                self.packet.current_rx_field_class = FieldClass::Hdlc;
                if !buf.is_empty() {
                    warn!("data inside an HDLC-FCS-bad-sig-end field");
                }
                if !repeated {
                    debug!(
                        "HDLC frame type {} - CRC bad, sig end",
                        self.slot_in_frame_name()
                    );
                    if self.core.hdlc_to_modem.slot_in().contents != SlotContents::Data(data_type)
                    {
                        self.queue_missing_indicator(data_type);
                    }
                    if self.core.hdlc_to_modem.slot_in().len > 0 {
                        self.core.hdlc_to_modem.slot_in_mut().contents =
                            SlotContents::Data(data_type);
                        self.pump_out_final_hdlc(false);
                    }
                    self.core.hdlc_to_modem.slot_in_mut().clear();
                    self.queue_missing_indicator(T38DataType::None);
                    self.packet.current_rx_field_class = FieldClass::None;
                }
                self.packet.editor.clear_corrupt(Direction::FromT38);
            }
            T38FieldType::HdlcSigEnd => {
                if !buf.is_empty() {
                    warn!("data inside an HDLC-sig-end field");
                }
                if !repeated {
                    if self.core.hdlc_to_modem.slot_in().contents != SlotContents::Data(data_type)
                    {
                        self.queue_missing_indicator(data_type);
                    }
                    if self.packet.current_rx_field_class == FieldClass::NonEcm {
                        // Some boxes send HDLC-sig-end at the end of non-ECM
                        // data. Stop flow controlling and drain the buffer.
                        warn!("HDLC-sig-end at the end of non-ECM data");
                        self.core.non_ecm_to_modem.release();
                    } else {
                        // Either the tail of an FCS-OK / sig-end split, or the
                        // carrier dropped mid-frame.
                        self.core.hdlc_to_modem.slot_in_mut().clear();
                    }
                    self.queue_missing_indicator(T38DataType::None);
                    self.packet.current_rx_field_class = FieldClass::None;
                }
                self.packet.editor.clear_corrupt(Direction::FromT38);
            }
            T38FieldType::T4NonEcmData => {
                self.packet.current_rx_field_class = FieldClass::NonEcm;
                if self.core.hdlc_to_modem.slot_in().contents != SlotContents::Data(data_type) {
                    self.queue_missing_indicator(data_type);
                }
                self.core.non_ecm_to_modem.inject(buf);
                self.packet.editor.clear_corrupt(Direction::FromT38);
            }
            T38FieldType::T4NonEcmSigEnd => {
                if !repeated {
                    if self.packet.current_rx_field_class == FieldClass::NonEcm {
                        if !buf.is_empty() {
                            if self.core.hdlc_to_modem.slot_in().contents
                                != SlotContents::Data(data_type)
                            {
                                self.queue_missing_indicator(data_type);
                            }
                            self.core.non_ecm_to_modem.inject(buf);
                        }
                        if self.core.hdlc_to_modem.slot_in().contents
                            != SlotContents::Data(data_type)
                        {
                            self.queue_missing_indicator(data_type);
                        }
                        // stream complete: drain as fast as the modem runs
                        self.core.non_ecm_to_modem.release();
                    } else {
                        warn!("non-ECM-sig-end at the end of HDLC data");
                        if self.core.hdlc_to_modem.slot_in().contents
                            != SlotContents::Data(data_type)
                        {
                            self.queue_missing_indicator(data_type);
                        }
                        self.core.hdlc_to_modem.slot_in_mut().clear();
                    }
                    self.queue_missing_indicator(T38DataType::None);
                    self.packet.current_rx_field_class = FieldClass::None;
                }
                self.packet.editor.clear_corrupt(Direction::FromT38);
            }
            T38FieldType::CmMessage => {
                if !buf.is_empty() {
                    debug!("CM profile {}", buf[0].wrapping_sub(b'0'));
                } else {
                    debug!("bad length for CM message - {}", buf.len());
                }
            }
            T38FieldType::JmMessage => {
                if buf.len() >= 2 {
                    debug!("JM {:02X} {:02X}", buf[0], buf[1]);
                } else {
                    debug!("bad length for JM message - {}", buf.len());
                }
            }
            T38FieldType::CiMessage => {
                if !buf.is_empty() {
                    debug!("CI {:#04X}", buf[0]);
                } else {
                    debug!("bad length for CI message - {}", buf.len());
                }
            }
            T38FieldType::V34Rate => {
                if buf.len() >= 3 {
                    self.packet.v34_rate =
                        (u32::from(buf[0]) << 16) | (u32::from(buf[1]) << 8) | u32::from(buf[2]);
                    debug!("V.34 rate field {:#08X}", self.packet.v34_rate);
                } else {
                    debug!("bad length for V34rate message - {}", buf.len());
                }
            }
        }
        self.packet.current_rx_data = Some((data_type, field_type));
    }

    // ------------------------------------------------------------------
    // T.38 ingress internals
    // ------------------------------------------------------------------

    fn slot_in_frame_name(&self) -> &'static str {
        let slot = self.core.hdlc_to_modem.slot_in();
        if slot.len >= 3 {
            t30::frame_name(slot.buf[2])
        } else {
            "???"
        }
    }

    /// Mark the slot being filled as a finished frame, let the mode tracker
    /// and observer see clean V.21 frames. Returns true when the receive
    /// modem must be restarted.
    fn finalize_slot_frame(&mut self, data_type: T38DataType) -> bool {
        let CoreState {
            mode,
            hdlc_to_modem: ring,
            ..
        } = &mut self.core;
        let slot = ring.slot_in_mut();
        slot.contents = SlotContents::Data(data_type);
        let mut restart_needed = false;
        if data_type == T38DataType::V21 {
            if !slot.flags.contains(SlotFlags::MISSING_DATA) {
                restart_needed =
                    mode.observe_control_frame(Direction::FromT38, &slot.buf[..slot.len]);
                if let Some(handler) = self.frame_observer.as_mut() {
                    handler(Direction::FromT38, &slot.buf[..slot.len]);
                }
            }
        } else {
            // Any complete fast frame is proof short training works, even if
            // CTC/CTR forced a long train for this block.
            mode.short_train = true;
        }
        restart_needed
    }

    /// Missing packets may have cost us the indicator that should have moved
    /// the transmit chain; synthesize it. Also used to force an indicator,
    /// as when data says "end of signal".
    fn queue_missing_indicator(&mut self, data_type: T38DataType) {
        let current = self.packet.current_rx_indicator;
        let indicator = match data_type {
            T38DataType::None => T38Indicator::NoSignal,
            T38DataType::V21 => T38Indicator::V21Preamble,
            T38DataType::V27ter2400 => T38Indicator::V27ter2400Training,
            T38DataType::V27ter4800 => T38Indicator::V27ter4800Training,
            T38DataType::V29_7200 => T38Indicator::V29_7200Training,
            T38DataType::V29_9600 => T38Indicator::V29_9600Training,
            T38DataType::V17_7200 => {
                if current == Some(T38Indicator::V17_7200ShortTraining) {
                    return;
                }
                T38Indicator::V17_7200LongTraining
            }
            T38DataType::V17_9600 => {
                if current == Some(T38Indicator::V17_9600ShortTraining) {
                    return;
                }
                T38Indicator::V17_9600LongTraining
            }
            T38DataType::V17_12000 => {
                if current == Some(T38Indicator::V17_12000ShortTraining) {
                    return;
                }
                T38Indicator::V17_12000LongTraining
            }
            T38DataType::V17_14400 => {
                if current == Some(T38Indicator::V17_14400ShortTraining) {
                    return;
                }
                T38Indicator::V17_14400LongTraining
            }
            _ => return,
        };
        self.process_rx_indicator(indicator);
    }

    /// A frame in the ring is complete: mark it, and if it is the one at the
    /// output, make sure the transmitter has it.
    fn pump_out_final_hdlc(&mut self, good_fcs: bool) {
        if !good_fcs {
            self.core.hdlc_to_modem.slot_in_mut().flags |= SlotFlags::CORRUPT_CRC;
        }
        if self.core.hdlc_to_modem.is_empty() {
            // this is the frame in progress at the output
            let slot = self.core.hdlc_to_modem.slot_out_mut();
            if !slot.flags.contains(SlotFlags::PROCEED_WITH_OUTPUT) {
                // output has not begun; throw the whole frame at it now
                let _ = self.audio.hdlc_tx.frame(&slot.buf[..slot.len]);
            }
            if slot.flags.contains(SlotFlags::CORRUPT_CRC) {
                self.audio.hdlc_tx.corrupt_frame();
            }
        }
        let ring = &mut self.core.hdlc_to_modem;
        ring.slot_in_mut().flags |= SlotFlags::PROCEED_WITH_OUTPUT | SlotFlags::FINISHED;
        ring.advance_in();
    }

    // ------------------------------------------------------------------
    // audio transmit chain
    // ------------------------------------------------------------------

    fn run_tx_handler(&mut self, amp: &mut [i16]) -> usize {
        match self.audio.tx_handler {
            TxHandler::Silence => self.audio.silence_gen.tx(amp),
            TxHandler::CngTone => self.audio.modems.cng_tx.tx(&mut NoBits, amp),
            TxHandler::CedTone => self.audio.modems.ced_tx.tx(&mut NoBits, amp),
            TxHandler::V21 => {
                let AudioSide { modems, hdlc_tx, .. } = &mut self.audio;
                let mut source = HdlcBits {
                    hdlc: hdlc_tx,
                    ring: &mut self.core.hdlc_to_modem,
                };
                modems.v21_tx.tx(&mut source, amp)
            }
            TxHandler::Fast(fast) => {
                let AudioSide {
                    modems,
                    hdlc_tx,
                    tx_bit_source,
                    ..
                } = &mut self.audio;
                let modulator = match fast {
                    FastModem::V17 => modems.v17_tx.as_mut(),
                    FastModem::V27ter => modems.v27ter_tx.as_mut(),
                    FastModem::V29 => modems.v29_tx.as_mut(),
                    FastModem::None => return 0,
                };
                match *tx_bit_source {
                    TxBitSource::Hdlc => {
                        let mut source = HdlcBits {
                            hdlc: hdlc_tx,
                            ring: &mut self.core.hdlc_to_modem,
                        };
                        modulator.tx(&mut source, amp)
                    }
                    TxBitSource::NonEcm => {
                        let mut source = NonEcmBits(&mut self.core.non_ecm_to_modem);
                        modulator.tx(&mut source, amp)
                    }
                }
            }
        }
    }

    /// Move the transmit chain along: promote a deferred handler, or pick up
    /// the next indicator queued in the ring. Returns true when the handler
    /// changed.
    fn set_next_tx_type(&mut self) -> bool {
        if let Some(next) = self.audio.next_tx_handler.take() {
            self.audio.tx_handler = next;
            let rx_active = matches!(next, TxHandler::Silence);
            self.set_rx_active(rx_active);
            return true;
        }
        if self.core.hdlc_to_modem.is_empty() {
            return false;
        }
        let indicator = match self.core.hdlc_to_modem.slot_out().contents {
            SlotContents::Indicator(indicator) => indicator,
            _ => return false,
        };
        self.core.hdlc_to_modem.slot_out_mut().clear();
        self.core.hdlc_to_modem.advance_out();
        debug!("changing to {}", indicator);
        if self.core.mode.image_data_mode && self.core.mode.ecm_mode {
            debug!("HDLC mode");
            self.audio.hdlc_tx.restart();
            self.audio.tx_bit_source = TxBitSource::Hdlc;
        } else {
            debug!("non-ECM mode");
            self.audio.tx_bit_source = TxBitSource::NonEcm;
        }
        let use_tep = self.audio.use_tep;
        match indicator {
            T38Indicator::NoSignal => {
                self.audio.tx_bit_rate = 0;
                self.audio.tx_handler = TxHandler::Silence;
                self.audio.next_tx_handler = None;
                self.set_rx_active(true);
            }
            T38Indicator::Cng => {
                self.audio.tx_bit_rate = 0;
                self.audio.modems.cng_tx.restart(0, use_tep, false);
                self.audio.tx_handler = TxHandler::CngTone;
                self.audio.silence_gen.set(0);
                self.audio.next_tx_handler = Some(TxHandler::Silence);
                self.set_rx_active(true);
            }
            T38Indicator::Ced => {
                self.audio.tx_bit_rate = 0;
                self.audio.modems.ced_tx.restart(0, use_tep, false);
                self.audio.tx_handler = TxHandler::CedTone;
                self.audio.next_tx_handler = None;
                self.set_rx_active(true);
            }
            T38Indicator::V21Preamble => {
                self.audio.tx_bit_rate = 300;
                self.audio.hdlc_tx.restart();
                self.audio.hdlc_tx.flags(32);
                self.audio.silence_gen.add(ms_to_samples(75));
                self.core.hdlc_to_modem.slot_in_mut().len = 0;
                self.audio.modems.v21_tx.restart(300, use_tep, false);
                self.audio.tx_handler = TxHandler::Silence;
                self.audio.next_tx_handler = Some(TxHandler::V21);
                self.set_rx_active(true);
            }
            T38Indicator::V27ter2400Training | T38Indicator::V27ter4800Training => {
                self.audio.tx_bit_rate = if indicator == T38Indicator::V27ter2400Training {
                    2400
                } else {
                    4800
                };
                self.audio.silence_gen.add(ms_to_samples(75));
                self.audio
                    .modems
                    .v27ter_tx
                    .restart(self.audio.tx_bit_rate, use_tep, false);
                self.audio.tx_handler = TxHandler::Silence;
                self.audio.next_tx_handler = Some(TxHandler::Fast(FastModem::V27ter));
                self.set_rx_active(true);
            }
            T38Indicator::V29_7200Training | T38Indicator::V29_9600Training => {
                self.audio.tx_bit_rate = if indicator == T38Indicator::V29_7200Training {
                    7200
                } else {
                    9600
                };
                self.audio.silence_gen.add(ms_to_samples(75));
                self.audio
                    .modems
                    .v29_tx
                    .restart(self.audio.tx_bit_rate, use_tep, false);
                self.audio.tx_handler = TxHandler::Silence;
                self.audio.next_tx_handler = Some(TxHandler::Fast(FastModem::V29));
                self.set_rx_active(true);
            }
            T38Indicator::V17_7200ShortTraining
            | T38Indicator::V17_7200LongTraining
            | T38Indicator::V17_9600ShortTraining
            | T38Indicator::V17_9600LongTraining
            | T38Indicator::V17_12000ShortTraining
            | T38Indicator::V17_12000LongTraining
            | T38Indicator::V17_14400ShortTraining
            | T38Indicator::V17_14400LongTraining => {
                let (bit_rate, short_train) = match indicator {
                    T38Indicator::V17_7200ShortTraining => (7200, true),
                    T38Indicator::V17_7200LongTraining => (7200, false),
                    T38Indicator::V17_9600ShortTraining => (9600, true),
                    T38Indicator::V17_9600LongTraining => (9600, false),
                    T38Indicator::V17_12000ShortTraining => (12000, true),
                    T38Indicator::V17_12000LongTraining => (12000, false),
                    T38Indicator::V17_14400ShortTraining => (14400, true),
                    _ => (14400, false),
                };
                self.audio.tx_bit_rate = bit_rate;
                self.audio.silence_gen.add(ms_to_samples(75));
                self.audio
                    .modems
                    .v17_tx
                    .restart(bit_rate, use_tep, short_train);
                self.audio.tx_handler = TxHandler::Silence;
                self.audio.next_tx_handler = Some(TxHandler::Fast(FastModem::V17));
                self.set_rx_active(true);
            }
            T38Indicator::V8Ansam
            | T38Indicator::V8Signal
            | T38Indicator::V34CntlChannel1200
            | T38Indicator::V34PriChannel
            | T38Indicator::V34CcRetrain => {
                self.audio.tx_bit_rate = 0;
            }
            T38Indicator::V33_12000Training => {
                self.audio.tx_bit_rate = 12000;
            }
            T38Indicator::V33_14400Training => {
                self.audio.tx_bit_rate = 14400;
            }
        }
        if self.audio.tx_bit_rate > 300 {
            // 200 ms of preamble flags for any fast modem
            self.audio.hdlc_tx.flags((self.audio.tx_bit_rate / 40) as usize);
        }
        self.core.non_ecm_to_modem.report_status();
        self.core
            .non_ecm_to_modem
            .init(self.core.mode.image_data_mode, self.core.mode.min_row_bits);
        self.packet.in_progress_rx_indicator = Some(indicator);
        true
    }

    fn set_rx_handler(&mut self, path: RxPath) {
        self.audio.base_rx_path = path;
        if self.audio.rx_path != RxPath::Muted {
            self.audio.rx_path = path;
        }
    }

    fn set_rx_active(&mut self, active: bool) {
        self.audio.rx_path = if active {
            self.audio.base_rx_path
        } else {
            RxPath::Muted
        };
    }

    // ------------------------------------------------------------------
    // audio receive path
    // ------------------------------------------------------------------

    fn fast_demod_rx(&mut self, amp: &[i16], events: &mut Vec<BitEvent>) {
        match self.core.fast_rx_active {
            FastModem::V17 => self.audio.modems.v17_rx.rx(amp, events),
            FastModem::V27ter => self.audio.modems.v27ter_rx.rx(amp, events),
            FastModem::V29 => self.audio.modems.v29_rx.rx(amp, events),
            FastModem::None => {}
        }
    }

    fn handle_fast_event(&mut self, event: BitEvent) {
        match (self.core.fast_rx_sink, event) {
            (FastSink::Hdlc, _) => self.handle_v21_event(event),
            (_, BitEvent::Status(status)) => self.non_ecm_rx_status(status),
            (FastSink::NonEcm, BitEvent::Bit(bit)) => self.non_ecm_put_bit(bit),
            (FastSink::NonEcmFill, BitEvent::Bit(bit)) => {
                self.non_ecm_remove_fill_and_put_bit(bit)
            }
        }
    }

    fn handle_v21_event(&mut self, event: BitEvent) {
        match event {
            BitEvent::Bit(bit) => self.hdlc_rx_put_bit(bit),
            BitEvent::Status(status) => self.hdlc_rx_status(status),
        }
    }

    fn hdlc_rx_put_bit(&mut self, bit: u8) {
        {
            let t = &mut self.core.hdlc_rx;
            t.raw_bit_stream = (t.raw_bit_stream << 1) | u32::from(bit & 1);
        }
        let raw = self.core.hdlc_rx.raw_bit_stream;
        if (raw & 0x3F) == 0x3E {
            // time to either skip a stuffed zero, or handle a flag or abort
            if (raw & 0x40) != 0 {
                self.rx_flag_or_abort();
            }
            return;
        }
        let supported = self.core.mode.supported_modems;
        let ecm_allowed = self.core.mode.ecm_allowed;
        let CoreState {
            hdlc_rx: t,
            to_t38: u,
            ..
        } = &mut self.core;
        t.num_bits += 1;
        if !t.framing_ok_announced {
            return;
        }
        t.byte_in_progress = (t.byte_in_progress >> 1) | (((raw as u8) & 0x01) << 7);
        if t.num_bits != 8 {
            return;
        }
        t.num_bits = 0;
        if t.len >= MAX_FRAME_LEN {
            // too long; abandon and wait for the next flag
            t.rx_length_errors += 1;
            t.flags_seen = FRAMING_OK_THRESHOLD - 1;
            t.len = 0;
            return;
        }
        t.buffer[t.len] = t.byte_in_progress;
        // progressive CRC, before the frame may be altered in place
        u.crc = crc::update(u.crc, t.byte_in_progress);
        t.len += 1;
        // Lag transmission by two octets, so the CRC is never sent and its
        // verdict is not reported late.
        if t.len <= 2 {
            return;
        }
        if self.packet.current_tx_data_type == T38DataType::V21 {
            self.packet.editor.edit(
                Direction::FromModem,
                supported,
                ecm_allowed,
                &mut t.buffer,
                t.len,
            );
        }
        u.data_ptr += 1;
        if u.data_ptr >= u.octets_per_data_packet {
            let n = u.data_ptr;
            bits::reverse_into(&mut u.data[..n], &t.buffer[t.len - 2 - n..t.len - 2]);
            self.sink.send_data(
                self.packet.current_tx_data_type,
                T38FieldType::HdlcData,
                &u.data[..n],
                DATA_TX_COUNT,
            );
            u.data_ptr = 0;
        }
    }

    fn rx_flag_or_abort(&mut self) {
        let mut restart_needed = false;
        let mut advance_tx = false;
        {
            let data_type = self.packet.current_tx_data_type;
            let CoreState {
                hdlc_rx: t,
                to_t38: u,
                mode,
                ..
            } = &mut self.core;
            if (t.raw_bit_stream & 0x80) != 0 {
                // HDLC abort
                t.rx_aborts += 1;
                if t.flags_seen < FRAMING_OK_THRESHOLD {
                    t.flags_seen = 0;
                } else {
                    t.flags_seen = FRAMING_OK_THRESHOLD - 1;
                }
            } else if t.flags_seen >= FRAMING_OK_THRESHOLD {
                if t.len > 0 {
                    // not back-to-back flags
                    if t.len >= 2 {
                        if u.data_ptr > 0 {
                            let n = u.data_ptr;
                            bits::reverse_into(
                                &mut u.data[..n],
                                &t.buffer[t.len - 2 - n..t.len - 2],
                            );
                            self.sink.send_data(
                                data_type,
                                T38FieldType::HdlcData,
                                &u.data[..n],
                                DATA_TX_COUNT,
                            );
                        }
                        if t.num_bits != 7 {
                            t.rx_crc_errors += 1;
                            debug!(
                                "HDLC frame type {}, misaligned terminating flag at {}",
                                t30::frame_name(t.buffer[2]),
                                t.len
                            );
                            if t.len > 2 {
                                self.sink.send_data(
                                    data_type,
                                    T38FieldType::HdlcFcsBad,
                                    &[],
                                    DATA_TX_COUNT,
                                );
                            }
                        } else if u.crc != crc::GOOD_RESIDUE {
                            t.rx_crc_errors += 1;
                            debug!(
                                "HDLC frame type {}, bad CRC at {}",
                                t30::frame_name(t.buffer[2]),
                                t.len
                            );
                            if t.len > 2 {
                                self.sink.send_data(
                                    data_type,
                                    T38FieldType::HdlcFcsBad,
                                    &[],
                                    DATA_TX_COUNT,
                                );
                            }
                        } else {
                            t.rx_frames += 1;
                            t.rx_bytes += (t.len - 2) as u32;
                            debug!("HDLC frame type {}, CRC OK", t30::frame_name(t.buffer[2]));
                            if data_type == T38DataType::V21 {
                                restart_needed = mode.observe_control_frame(
                                    Direction::FromModem,
                                    &t.buffer[..t.len - 2],
                                );
                                if let Some(handler) = self.frame_observer.as_mut() {
                                    handler(Direction::FromModem, &t.buffer[..t.len - 2]);
                                }
                            } else {
                                // a clean fast frame proves short training works
                                mode.short_train = true;
                            }
                            self.sink.send_data(
                                data_type,
                                T38FieldType::HdlcFcsOk,
                                &[],
                                DATA_TX_COUNT,
                            );
                        }
                    } else {
                        // frame too short to carry an FCS
                        t.rx_length_errors += 1;
                    }
                }
            } else {
                // Only back-to-back flags establish preamble; anything else
                // is most likely noise.
                if t.num_bits != 7 {
                    t.flags_seen = 0;
                }
                t.flags_seen += 1;
                if t.flags_seen >= FRAMING_OK_THRESHOLD && !t.framing_ok_announced {
                    if data_type == T38DataType::V21 {
                        u.octets_per_data_packet = octets_per_packet(300);
                        self.packet.current_tx_data_type = T38DataType::V21;
                        self.sink
                            .send_indicator(T38Indicator::V21Preamble, INDICATOR_TX_COUNT);
                        self.audio.rx_signal_present = true;
                    }
                    if self.packet.in_progress_rx_indicator == Some(T38Indicator::Cng) {
                        advance_tx = true;
                    }
                    t.framing_ok_announced = true;
                }
            }
            t.len = 0;
            t.num_bits = 0;
            u.crc = 0xFFFF;
            u.data_ptr = 0;
        }
        self.packet.editor.clear_corrupt(Direction::FromModem);
        if restart_needed {
            self.restart_rx_modem();
        }
        if advance_tx {
            self.set_next_tx_type();
        }
    }

    fn hdlc_rx_status(&mut self, status: RxStatus) {
        match status {
            RxStatus::TrainingInProgress => {
                debug!("HDLC carrier training in progress");
                self.announce_training();
            }
            RxStatus::TrainingFailed => {
                debug!("HDLC carrier training failed");
            }
            RxStatus::TrainingSucceeded => {
                debug!("HDLC carrier trained");
                self.audio.rx_signal_present = true;
                self.audio.rx_trained = true;
                // behave as if the preamble has been announced
                self.core.hdlc_rx.framing_ok_announced = true;
                self.core.to_t38.init();
            }
            RxStatus::CarrierUp => {
                debug!("HDLC carrier up");
                let t = &mut self.core.hdlc_rx;
                t.raw_bit_stream = 0;
                t.len = 0;
                t.num_bits = 0;
                t.flags_seen = 0;
                t.framing_ok_announced = false;
                self.core.to_t38.init();
            }
            RxStatus::CarrierDown => {
                debug!("HDLC carrier down");
                if self.core.hdlc_rx.framing_ok_announced {
                    self.sink.send_data(
                        self.packet.current_tx_data_type,
                        T38FieldType::HdlcSigEnd,
                        &[],
                        DATA_END_TX_COUNT,
                    );
                    self.sink
                        .send_indicator(T38Indicator::NoSignal, INDICATOR_TX_COUNT);
                    self.core.hdlc_rx.framing_ok_announced = false;
                }
                self.restart_rx_modem();
                if self.core.mode.tcf_predict == TcfPrediction::Armed {
                    // During TCF the fast carrier starts 75±20 ms after V.21
                    // ends; waiting for it to train announces far too late.
                    self.core.samples_to_timeout = ms_to_samples(75);
                    self.core.mode.tcf_predict = TcfPrediction::Countdown;
                }
            }
        }
    }

    fn non_ecm_rx_status(&mut self, status: RxStatus) {
        match status {
            RxStatus::TrainingInProgress => {
                debug!("non-ECM carrier training in progress");
                if self.core.mode.tcf_predict != TcfPrediction::Off {
                    self.core.mode.tcf_predict = TcfPrediction::Off;
                } else {
                    self.announce_training();
                }
            }
            RxStatus::TrainingFailed => {
                debug!("non-ECM carrier training failed");
            }
            RxStatus::TrainingSucceeded => {
                debug!("non-ECM carrier trained");
                self.audio.rx_signal_present = true;
                self.audio.rx_trained = true;
                self.core.to_t38.init();
            }
            RxStatus::CarrierUp => {
                debug!("non-ECM carrier up");
            }
            RxStatus::CarrierDown => {
                debug!("non-ECM carrier down");
                self.core.mode.tcf_predict = TcfPrediction::Off;
                if self.packet.current_tx_data_type.is_fast() {
                    self.non_ecm_push_residue();
                    self.sink
                        .send_indicator(T38Indicator::NoSignal, INDICATOR_TX_COUNT);
                    self.restart_rx_modem();
                }
            }
        }
    }

    fn non_ecm_put_bit(&mut self, bit: u8) {
        let u = &mut self.core.to_t38;
        u.in_bits += 1;
        u.bit_stream = (u.bit_stream << 1) | u16::from(bit & 1);
        u.bit_no += 1;
        if u.bit_no < 8 {
            return;
        }
        u.bit_no = 0;
        u.data[u.data_ptr] = (u.bit_stream & 0xFF) as u8;
        u.data_ptr += 1;
        if u.data_ptr >= u.octets_per_data_packet {
            self.non_ecm_push();
        }
    }

    fn non_ecm_remove_fill_and_put_bit(&mut self, bit: u8) {
        let u = &mut self.core.to_t38;
        u.bits_absorbed += 1;
        let bit = bit & 1;
        // Drop extra zeros once enough have gone by for an EOL. Codes can end
        // in up to three zero bits, so look for fourteen rather than eleven;
        // not every fill bit is stripped, but most are, and the image data
        // never needs deep parsing.
        if (u.bit_stream & 0x3FFF) == 0 && bit == 0 {
            if u.bits_absorbed > 2 * 8 * u.octets_per_data_packet as u32 {
                // Flush anyway, or rows would be delayed beyond what a
                // receiving gateway can play out.
                self.non_ecm_push();
            }
            return;
        }
        u.bit_stream = (u.bit_stream << 1) | u16::from(bit);
        u.bit_no += 1;
        if u.bit_no < 8 {
            return;
        }
        u.bit_no = 0;
        u.data[u.data_ptr] = (u.bit_stream & 0xFF) as u8;
        u.data_ptr += 1;
        if u.data_ptr >= u.octets_per_data_packet {
            self.non_ecm_push();
        }
    }

    fn non_ecm_push(&mut self) {
        let u = &mut self.core.to_t38;
        if u.data_ptr == 0 {
            return;
        }
        self.sink.send_data(
            self.packet.current_tx_data_type,
            T38FieldType::T4NonEcmData,
            &u.data[..u.data_ptr],
            DATA_TX_COUNT,
        );
        u.out_octets += u.data_ptr as u32;
        u.in_bits += u.bits_absorbed;
        u.bits_absorbed = 0;
        u.data_ptr = 0;
    }

    fn non_ecm_push_residue(&mut self) {
        let u = &mut self.core.to_t38;
        if u.bit_no > 0 {
            // a fractional octet is in progress; send every last bit
            u.data[u.data_ptr] = ((u.bit_stream << (8 - u.bit_no)) & 0xFF) as u8;
            u.data_ptr += 1;
        }
        self.sink.send_data(
            self.packet.current_tx_data_type,
            T38FieldType::T4NonEcmSigEnd,
            &u.data[..u.data_ptr],
            DATA_END_TX_COUNT,
        );
        u.out_octets += u.data_ptr as u32;
        u.in_bits += u.bits_absorbed;
        u.data_ptr = 0;
    }

    fn announce_training(&mut self) {
        let indicator = self.set_fast_packetisation();
        self.sink.send_indicator(indicator, INDICATOR_TX_COUNT);
    }

    /// Point outbound packetisation at the fast modem now receiving, and
    /// return the indicator that announces it.
    fn set_fast_packetisation(&mut self) -> T38Indicator {
        let short_train = self.core.mode.short_train;
        let bit_rate = self.core.mode.fast_bit_rate;
        match self.core.fast_rx_active {
            FastModem::V17 => {
                self.core.to_t38.octets_per_data_packet = octets_per_packet(bit_rate);
                let (indicator, data_type) = match bit_rate {
                    7200 => (
                        if short_train {
                            T38Indicator::V17_7200ShortTraining
                        } else {
                            T38Indicator::V17_7200LongTraining
                        },
                        T38DataType::V17_7200,
                    ),
                    9600 => (
                        if short_train {
                            T38Indicator::V17_9600ShortTraining
                        } else {
                            T38Indicator::V17_9600LongTraining
                        },
                        T38DataType::V17_9600,
                    ),
                    12000 => (
                        if short_train {
                            T38Indicator::V17_12000ShortTraining
                        } else {
                            T38Indicator::V17_12000LongTraining
                        },
                        T38DataType::V17_12000,
                    ),
                    _ => (
                        if short_train {
                            T38Indicator::V17_14400ShortTraining
                        } else {
                            T38Indicator::V17_14400LongTraining
                        },
                        T38DataType::V17_14400,
                    ),
                };
                self.packet.current_tx_data_type = data_type;
                indicator
            }
            FastModem::V27ter => {
                self.core.to_t38.octets_per_data_packet = octets_per_packet(bit_rate);
                let (indicator, data_type) = match bit_rate {
                    2400 => (T38Indicator::V27ter2400Training, T38DataType::V27ter2400),
                    _ => (T38Indicator::V27ter4800Training, T38DataType::V27ter4800),
                };
                self.packet.current_tx_data_type = data_type;
                indicator
            }
            FastModem::V29 => {
                self.core.to_t38.octets_per_data_packet = octets_per_packet(bit_rate);
                let (indicator, data_type) = match bit_rate {
                    7200 => (T38Indicator::V29_7200Training, T38DataType::V29_7200),
                    _ => (T38Indicator::V29_9600Training, T38DataType::V29_9600),
                };
                self.packet.current_tx_data_type = data_type;
                indicator
            }
            FastModem::None => T38Indicator::NoSignal,
        }
    }

    /// Reset the audio receive side for whatever carrier comes next.
    fn restart_rx_modem(&mut self) {
        {
            let u = &mut self.core.to_t38;
            if u.in_bits != 0 || u.out_octets != 0 {
                debug!(
                    "{} incoming audio bits, {} outgoing T.38 octets",
                    u.in_bits, u.out_octets
                );
                u.in_bits = 0;
                u.out_octets = 0;
            }
            if u.bits_absorbed != 0 {
                debug!("{} audio bits absorbed", u.bits_absorbed);
            }
        }
        let stats = self.core.hdlc_rx.stats();
        if stats != crate::hdlc::HdlcRxStats::default() {
            debug!(
                "HDLC rx - {} frames, {} bytes, {} CRC errors, {} length errors, {} aborts",
                stats.frames, stats.bytes, stats.crc_errors, stats.length_errors, stats.aborts
            );
        }
        debug!(
            "restart rx modem - modem = {:?}, short train = {}, ECM = {}",
            self.core.mode.fast_modem, self.core.mode.short_train, self.core.mode.ecm_mode
        );
        self.core.hdlc_rx.reset();
        self.audio.rx_signal_present = false;
        self.audio.rx_trained = false;
        // transmit data stays V.21 unless a faster modem pops up trained
        self.packet.current_tx_data_type = T38DataType::V21;
        self.audio.modems.v21_rx.restart(300, false);
        self.core.fast_rx_sink = if self.core.mode.image_data_mode && self.core.mode.ecm_mode {
            FastSink::Hdlc
        } else if self.core.mode.image_data_mode && self.core.to_t38.fill_bit_removal {
            FastSink::NonEcmFill
        } else {
            FastSink::NonEcm
        };
        self.core.to_t38.init();
        self.core.to_t38.octets_per_data_packet = 1;
        let bit_rate = self.core.mode.fast_bit_rate;
        let short_train = self.core.mode.short_train;
        match self.core.mode.fast_modem {
            FastModem::V17 => {
                self.audio.modems.v17_rx.restart(bit_rate, short_train);
                self.core.fast_rx_active = FastModem::V17;
                self.set_rx_handler(RxPath::Dual);
            }
            FastModem::V27ter => {
                self.audio.modems.v27ter_rx.restart(bit_rate, false);
                self.core.fast_rx_active = FastModem::V27ter;
                self.set_rx_handler(RxPath::Dual);
            }
            FastModem::V29 => {
                self.audio.modems.v29_rx.restart(bit_rate, false);
                self.core.fast_rx_active = FastModem::V29;
                self.set_rx_handler(RxPath::Dual);
            }
            FastModem::None => {
                self.core.fast_rx_active = FastModem::None;
                self.set_rx_handler(RxPath::V21);
            }
        }
    }
}

/// Underflow on the HDLC transmitter: retire the frame just sent and line up
/// whatever the ring holds next.
fn hdlc_underflow(ring: &mut HdlcRing, hdlc_tx: &mut HdlcTx) {
    debug!("HDLC underflow at {}", ring.out_index());
    // Without PROCEED_WITH_OUTPUT this underflow is just the end of preamble.
    if !ring
        .slot_out()
        .flags
        .contains(SlotFlags::PROCEED_WITH_OUTPUT)
    {
        return;
    }
    ring.slot_out_mut().clear();
    ring.advance_out();
    let slot = ring.slot_out();
    debug!("HDLC next is {:?}", slot.contents);
    match slot.contents {
        SlotContents::Indicator(_) => {
            // an indicator is next, so this modem must be stopped
            debug!("HDLC shutdown");
            hdlc_tx.shutdown();
        }
        SlotContents::Data(_) => {
            if slot.flags.contains(SlotFlags::PROCEED_WITH_OUTPUT) {
                // ready to go on the same modem; send whatever we have
                debug!("HDLC start next frame");
                let _ = hdlc_tx.frame(&slot.buf[..slot.len]);
                if slot.flags.contains(SlotFlags::CORRUPT_CRC) {
                    hdlc_tx.corrupt_frame();
                }
            }
        }
        SlotContents::Empty => {}
    }
}

/// Bit source marrying the HDLC transmitter to the ring, so underflows are
/// handled inline while the modulator pulls.
struct HdlcBits<'a> {
    hdlc: &'a mut HdlcTx,
    ring: &'a mut HdlcRing,
}

impl BitSource for HdlcBits<'_> {
    fn get_bit(&mut self) -> Option<u8> {
        loop {
            match self.hdlc.get_bit() {
                HdlcTxBit::Bit(bit) => return Some(bit),
                HdlcTxBit::Underflow => hdlc_underflow(self.ring, self.hdlc),
                HdlcTxBit::Done => return None,
            }
        }
    }
}

struct NonEcmBits<'a>(&'a mut NonEcmBuffer);

impl BitSource for NonEcmBits<'_> {
    fn get_bit(&mut self) -> Option<u8> {
        self.0.get_bit()
    }
}

struct NoBits;

impl BitSource for NoBits {
    fn get_bit(&mut self) -> Option<u8> {
        None
    }
}
