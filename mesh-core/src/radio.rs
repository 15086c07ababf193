//! Radio transport: single owner of the half-duplex transceiver.
//!
//! Driver callbacks are not allowed to touch transport state directly. The driver pushes
//! [`RadioEvent`]s into the transport's [`EventQueue`] from inside [`Transceiver::poll`], and
//! [`RadioTransport::tick`] drains them; the transition methods here are the only mutation points.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::noise_floor::{NoiseFloorEstimate, DEFAULT_MIN_NOISE_FLOOR};

/// Largest frame the transceiver can put on air.
pub const MAX_PACKET_LEN: usize = 255;

/// Events buffered between two ticks. The driver raises at most a couple per poll.
pub const EVENT_QUEUE_CAPACITY: usize = 8;

/// Lowest spreading factor `packet_score` knows a noise threshold for.
pub const MIN_SCORED_SPREADING_FACTOR: u8 = 7;

/// Demodulation floor in dB for SF7..=SF12.
const SNR_THRESHOLD: [f32; 6] = [-7.5, -10.0, -12.5, -15.0, -17.5, -20.0];

const PREAMBLE_SYMBOLS: f64 = 16.0;

/// Transport state. Exactly one per transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Idle,
    Listening,
    FrameReceived,
    Transmitting,
    TransmitComplete,
}

/// Callback from the transceiver driver, delivered synchronously inside `Transceiver::poll`.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    Received { bytes: Vec<u8>, rssi: i16, snr: f32 },
    Transmitted,
    ReceiveTimeout,
    ReceiveError,
    TransmitTimeout,
}

/// Bounded single-producer queue the driver writes events into.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<RadioEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(EVENT_QUEUE_CAPACITY),
        }
    }

    /// Queue an event. Returns false (event dropped) when the queue is full.
    pub fn push(&mut self, event: RadioEvent) -> bool {
        if self.events.len() >= EVENT_QUEUE_CAPACITY {
            tracing::warn!(?event, "radio event queue full, dropping event");
            return false;
        }
        self.events.push_back(event);
        true
    }

    pub fn pop(&mut self) -> Option<RadioEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Driver primitive for one LoRa transceiver. All calls are non-blocking.
pub trait Transceiver {
    /// Configure modulation and power. Called once at construction and on every reconfigure.
    fn init(&mut self, params: &RadioParams) -> std::io::Result<()>;
    fn set_channel(&mut self, freq_hz: u32);
    fn start_receive(&mut self);
    fn start_transmit(&mut self, bytes: &[u8]);
    /// Instantaneous RSSI in dBm.
    fn read_rssi(&mut self) -> i16;
    /// RSSI and SNR of the last received packet. Queried when the frame is drained.
    fn read_signal_metrics(&mut self) -> (i16, f32);
    /// Service the hardware and push any pending callbacks into `events`.
    fn poll(&mut self, events: &mut EventQueue);
}

/// LoRa modulation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RadioParams {
    pub freq_mhz: f32,
    pub bandwidth_khz: f32,
    pub spreading_factor: u8,
    pub coding_rate: u8,
    pub tx_power_dbm: i8,
}

impl Default for RadioParams {
    fn default() -> Self {
        Self {
            freq_mhz: 915.0,
            bandwidth_khz: 250.0,
            spreading_factor: 10,
            coding_rate: 5,
            tx_power_dbm: 20,
        }
    }
}

impl RadioParams {
    pub fn validate(&self) -> Result<(), ParamError> {
        if !(137.0..=1020.0).contains(&self.freq_mhz) {
            return Err(ParamError::Frequency(self.freq_mhz));
        }
        if !(7.8..=500.0).contains(&self.bandwidth_khz) {
            return Err(ParamError::Bandwidth(self.bandwidth_khz));
        }
        if !(5..=12).contains(&self.spreading_factor) {
            return Err(ParamError::SpreadingFactor(self.spreading_factor));
        }
        if !(5..=8).contains(&self.coding_rate) {
            return Err(ParamError::CodingRate(self.coding_rate));
        }
        if !(2..=30).contains(&self.tx_power_dbm) {
            return Err(ParamError::TxPower(self.tx_power_dbm));
        }
        Ok(())
    }

    pub fn freq_hz(&self) -> u32 {
        (f64::from(self.freq_mhz) * 1_000_000.0) as u32
    }

    /// Estimated time on air for a `len` byte payload (explicit header, CRC on).
    pub fn estimated_airtime_ms(&self, len: usize) -> u32 {
        let sf = f64::from(self.spreading_factor);
        let bw_hz = f64::from(self.bandwidth_khz) * 1000.0;
        let symbol_ms = 2f64.powf(sf) / bw_hz * 1000.0;
        let low_data_rate = if symbol_ms > 16.0 { 1.0 } else { 0.0 };

        let preamble_ms = (PREAMBLE_SYMBOLS + 4.25) * symbol_ms;
        let numerator = 8.0 * len as f64 - 4.0 * sf + 28.0 + 16.0;
        let denominator = 4.0 * (sf - 2.0 * low_data_rate);
        let coded = (numerator / denominator).ceil() * f64::from(self.coding_rate);
        let payload_symbols = 8.0 + coded.max(0.0);

        (preamble_ms + payload_symbols * symbol_ms).ceil() as u32
    }

    /// Forwarding desirability of a packet heard at `snr`, in `[0.0, 1.0]`.
    pub fn packet_score(&self, snr: f32, packet_len: usize) -> f32 {
        if self.spreading_factor < MIN_SCORED_SPREADING_FACTOR {
            return 0.0;
        }
        let idx = usize::from(self.spreading_factor - MIN_SCORED_SPREADING_FACTOR);
        let Some(&threshold) = SNR_THRESHOLD.get(idx) else {
            return 0.0;
        };
        if snr < threshold {
            return 0.0;
        }
        let success = ((snr - threshold) / 10.0).clamp(0.0, 1.0);
        let penalty = 1.0 - (packet_len as f32 / 256.0);
        success * penalty
    }
}

/// Out-of-range radio configuration value.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParamError {
    #[error("frequency {0} MHz outside 137..=1020")]
    Frequency(f32),
    #[error("bandwidth {0} kHz outside 7.8..=500")]
    Bandwidth(f32),
    #[error("spreading factor {0} outside 5..=12")]
    SpreadingFactor(u8),
    #[error("coding rate {0} outside 5..=8")]
    CodingRate(u8),
    #[error("tx power {0} dBm outside 2..=30")]
    TxPower(i8),
}

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("invalid radio parameters: {0}")]
    Params(#[from] ParamError),
    #[error("transceiver init failed: {0}")]
    Driver(#[from] std::io::Error),
}

/// Packet counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RadioStats {
    pub packets_recv: u32,
    pub packets_sent: u32,
    pub recv_errors: u32,
}

type PreTransmitHook = Box<dyn FnMut(&[u8]) + Send>;

/// State machine around one transceiver.
pub struct RadioTransport<T: Transceiver> {
    driver: T,
    params: RadioParams,
    state: RadioState,
    events: EventQueue,
    rx_frame: Vec<u8>,
    last_rssi: i16,
    last_snr: f32,
    noise: NoiseFloorEstimate,
    stats: RadioStats,
    started: bool,
    pre_transmit: Option<PreTransmitHook>,
}

impl<T: Transceiver> RadioTransport<T> {
    pub fn new(mut driver: T, params: RadioParams) -> Result<Self, RadioError> {
        params.validate()?;
        driver.init(&params)?;
        Ok(Self {
            driver,
            params,
            state: RadioState::Idle,
            events: EventQueue::new(),
            rx_frame: Vec::with_capacity(MAX_PACKET_LEN),
            last_rssi: 0,
            last_snr: 0.0,
            noise: NoiseFloorEstimate::new(DEFAULT_MIN_NOISE_FLOOR),
            stats: RadioStats::default(),
            started: false,
            pre_transmit: None,
        })
    }

    /// Install the hook run right before every transmit (duty-cycle bookkeeping, PA control).
    pub fn set_pre_transmit_hook(&mut self, hook: impl FnMut(&[u8]) + Send + 'static) {
        self.pre_transmit = Some(Box::new(hook));
    }

    /// Reset counters and calibration, then start listening.
    pub fn begin(&mut self) {
        self.state = RadioState::Idle;
        self.noise.reset();
        self.stats = RadioStats::default();
        self.rx_frame.clear();
        self.started = true;
        self.arm_receive();
    }

    /// Arm reception. Only valid from `Idle`.
    pub fn begin_receive(&mut self) {
        if self.state != RadioState::Idle {
            return;
        }
        self.started = true;
        self.arm_receive();
    }

    /// Abort listening so a transmit can start. No-op with a buffered frame or a transmit in flight.
    pub fn standby(&mut self) {
        if self.state == RadioState::Listening {
            self.state = RadioState::Idle;
        }
    }

    /// Copy a buffered frame into `buf`. Returns 0 without side effects when nothing is buffered.
    pub fn poll_incoming(&mut self, buf: &mut [u8]) -> usize {
        if self.state != RadioState::FrameReceived {
            return 0;
        }
        let len = self.rx_frame.len().min(buf.len());
        buf[..len].copy_from_slice(&self.rx_frame[..len]);
        self.rx_frame.clear();
        self.state = RadioState::Idle;
        if len > 0 {
            let (rssi, snr) = self.driver.read_signal_metrics();
            self.last_rssi = rssi;
            self.last_snr = snr;
            self.stats.packets_recv += 1;
            self.arm_receive();
        }
        len
    }

    /// Start transmitting `bytes`. Only valid from `Idle`; returns false (no-op) otherwise.
    pub fn begin_transmit(&mut self, bytes: &[u8]) -> bool {
        if self.state != RadioState::Idle {
            tracing::debug!(state = ?self.state, "transmit refused, radio not idle");
            return false;
        }
        if bytes.is_empty() || bytes.len() > MAX_PACKET_LEN {
            tracing::warn!(len = bytes.len(), "transmit refused, bad frame length");
            return false;
        }
        if let Some(hook) = self.pre_transmit.as_mut() {
            hook(bytes);
        }
        self.driver.start_transmit(bytes);
        self.state = RadioState::Transmitting;
        true
    }

    /// True exactly once per finished transmission; returns the radio to `Idle`.
    pub fn is_transmit_complete(&mut self) -> bool {
        if self.state != RadioState::TransmitComplete {
            return false;
        }
        self.state = RadioState::Idle;
        self.stats.packets_sent += 1;
        true
    }

    /// Drain driver events, take a calibration sample, re-arm reception if idle.
    pub fn tick(&mut self) {
        self.driver.poll(&mut self.events);
        while let Some(event) = self.events.pop() {
            self.handle_event(event);
        }

        if self.state == RadioState::Listening && self.noise.wants_sample() {
            let rssi = self.driver.read_rssi();
            self.noise.offer_sample(rssi);
        }

        if self.state == RadioState::Idle && self.started {
            self.arm_receive();
        }
    }

    pub fn trigger_calibration(&mut self, threshold: i16) {
        self.noise.trigger_calibration(threshold);
    }

    /// Listen-before-talk check against the calibrated floor.
    pub fn is_channel_active(&mut self) -> bool {
        if self.noise.threshold() == 0 {
            return false;
        }
        let rssi = self.driver.read_rssi();
        self.noise.is_active(rssi)
    }

    pub fn packet_score(&self, snr: f32, packet_len: usize) -> f32 {
        self.params.packet_score(snr, packet_len)
    }

    pub fn estimated_airtime_ms(&self, len: usize) -> u32 {
        self.params.estimated_airtime_ms(len)
    }

    /// Apply new modulation parameters and resume listening. Rejected without change if invalid.
    pub fn set_params(&mut self, params: RadioParams) -> Result<(), RadioError> {
        params.validate()?;
        self.driver.init(&params)?;
        self.params = params;
        if matches!(self.state, RadioState::Idle | RadioState::Listening) {
            self.state = RadioState::Idle;
            self.arm_receive();
        }
        Ok(())
    }

    pub fn set_frequency(&mut self, freq_mhz: f32) -> Result<(), RadioError> {
        let params = RadioParams {
            freq_mhz,
            ..self.params
        };
        params.validate()?;
        self.driver.set_channel(params.freq_hz());
        self.params = params;
        Ok(())
    }

    pub fn params(&self) -> &RadioParams {
        &self.params
    }

    pub fn state(&self) -> RadioState {
        self.state
    }

    pub fn is_in_recv_mode(&self) -> bool {
        matches!(self.state, RadioState::Listening | RadioState::FrameReceived)
    }

    pub fn noise_floor(&self) -> i16 {
        self.noise.floor()
    }

    pub fn last_rssi(&self) -> i16 {
        self.last_rssi
    }

    pub fn last_snr(&self) -> f32 {
        self.last_snr
    }

    pub fn stats(&self) -> RadioStats {
        self.stats
    }

    pub fn driver(&self) -> &T {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut T {
        &mut self.driver
    }

    fn arm_receive(&mut self) {
        self.driver.start_receive();
        self.state = RadioState::Listening;
    }

    fn handle_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Received { bytes, rssi, snr } => {
                if self.state != RadioState::Listening {
                    tracing::debug!(state = ?self.state, "frame outside listen window dropped");
                    return;
                }
                let len = bytes.len().min(MAX_PACKET_LEN);
                self.rx_frame.clear();
                self.rx_frame.extend_from_slice(&bytes[..len]);
                tracing::trace!(len, rssi, snr, "frame buffered");
                self.state = RadioState::FrameReceived;
            }
            RadioEvent::Transmitted => {
                if self.state == RadioState::Transmitting {
                    self.state = RadioState::TransmitComplete;
                }
            }
            RadioEvent::ReceiveTimeout => {
                if self.state == RadioState::Listening {
                    self.state = RadioState::Idle;
                }
            }
            RadioEvent::ReceiveError => {
                self.stats.recv_errors += 1;
                if self.state == RadioState::Listening {
                    self.state = RadioState::Idle;
                }
            }
            RadioEvent::TransmitTimeout => {
                if self.state == RadioState::Transmitting {
                    tracing::warn!("transmit timed out");
                    self.state = RadioState::Idle;
                }
            }
        }
    }
}
