//! Control-loop driver over the radio transport: outbound queue, duty cycle, listen-before-talk
//! and periodic noise floor calibration.

use std::collections::VecDeque;

use serde::Deserialize;

use crate::radio::{RadioError, RadioParams, RadioState, RadioTransport, Transceiver, MAX_PACKET_LEN};

/// Dispatcher tuning.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Silence after a transmission, as a multiple of its airtime.
    pub airtime_factor: f32,
    /// dB above the noise floor that counts as a busy channel. 0 disables listen-before-talk.
    pub activity_threshold: i16,
    pub calibration_interval_ms: u64,
    pub queue_depth: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            airtime_factor: 1.0,
            activity_threshold: 0,
            calibration_interval_ms: 2000,
            queue_depth: 16,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), DispatchError> {
        if !(0.01..=100.0).contains(&self.airtime_factor) {
            return Err(DispatchError::AirtimeFactor(self.airtime_factor));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("packet of {0} bytes exceeds radio MTU")]
    PacketTooLarge(usize),
    #[error("empty packet")]
    Empty,
    #[error("outbound queue full")]
    QueueFull,
    #[error("airtime factor {0} outside 0.01..=100")]
    AirtimeFactor(f32),
    #[error(transparent)]
    Radio(#[from] RadioError),
}

/// A frame drained from the radio, with its link metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    pub bytes: Vec<u8>,
    pub rssi: i16,
    pub snr: f32,
    pub score: f32,
}

pub struct Dispatcher<T: Transceiver> {
    radio: RadioTransport<T>,
    config: DispatcherConfig,
    outbound: VecDeque<(u64, Vec<u8>)>,
    next_ticket: u64,
    last_started: Option<u64>,
    in_flight_airtime_ms: u32,
    next_tx_allowed_ms: u64,
    next_calibration_ms: u64,
    total_airtime_ms: u64,
    rx_buf: [u8; MAX_PACKET_LEN],
}

impl<T: Transceiver> Dispatcher<T> {
    pub fn new(
        driver: T,
        params: RadioParams,
        config: DispatcherConfig,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        let mut radio = RadioTransport::new(driver, params)?;
        radio.begin();
        Ok(Self {
            radio,
            config,
            outbound: VecDeque::with_capacity(config.queue_depth),
            next_ticket: 0,
            last_started: None,
            in_flight_airtime_ms: 0,
            next_tx_allowed_ms: 0,
            next_calibration_ms: 0,
            total_airtime_ms: 0,
            rx_buf: [0u8; MAX_PACKET_LEN],
        })
    }

    /// Queue a raw packet for transmission. Returns a ticket for `has_started`.
    pub fn enqueue(&mut self, packet: Vec<u8>) -> Result<u64, DispatchError> {
        if packet.is_empty() {
            return Err(DispatchError::Empty);
        }
        if packet.len() > MAX_PACKET_LEN {
            return Err(DispatchError::PacketTooLarge(packet.len()));
        }
        if self.outbound.len() >= self.config.queue_depth {
            return Err(DispatchError::QueueFull);
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.outbound.push_back((ticket, packet));
        Ok(ticket)
    }

    /// Whether the packet queued under `ticket` has gone on air. Packets leave in queue order.
    pub fn has_started(&self, ticket: u64) -> bool {
        self.last_started.is_some_and(|last| last >= ticket)
    }

    /// One control-loop step. Returns at most one received frame.
    pub fn poll(&mut self, now_ms: u64) -> Option<ReceivedFrame> {
        self.radio.tick();

        if self.radio.is_transmit_complete() {
            let airtime = self.in_flight_airtime_ms;
            self.total_airtime_ms += u64::from(airtime);
            let silence = (airtime as f32 * self.config.airtime_factor) as u64;
            self.next_tx_allowed_ms = now_ms + silence;
            tracing::debug!(airtime_ms = airtime, silence_ms = silence, "transmit complete");
            self.radio.begin_receive();
        }

        let received = self.drain_received();

        if now_ms >= self.next_calibration_ms {
            self.radio.trigger_calibration(self.config.activity_threshold);
            self.next_calibration_ms = now_ms + self.config.calibration_interval_ms;
        }

        self.try_transmit(now_ms);
        received
    }

    fn drain_received(&mut self) -> Option<ReceivedFrame> {
        let len = self.radio.poll_incoming(&mut self.rx_buf);
        if len == 0 {
            return None;
        }
        let snr = self.radio.last_snr();
        Some(ReceivedFrame {
            bytes: self.rx_buf[..len].to_vec(),
            rssi: self.radio.last_rssi(),
            snr,
            score: self.radio.packet_score(snr, len),
        })
    }

    fn try_transmit(&mut self, now_ms: u64) {
        if self.outbound.is_empty() || now_ms < self.next_tx_allowed_ms {
            return;
        }
        if !matches!(self.radio.state(), RadioState::Idle | RadioState::Listening) {
            return;
        }
        if self.radio.is_channel_active() {
            tracing::debug!(floor = self.radio.noise_floor(), "channel busy, deferring transmit");
            return;
        }
        let Some((ticket, packet)) = self.outbound.pop_front() else {
            return;
        };
        self.radio.standby();
        if self.radio.begin_transmit(&packet) {
            self.in_flight_airtime_ms = self.radio.estimated_airtime_ms(packet.len());
            self.last_started = Some(ticket);
        } else {
            self.outbound.push_front((ticket, packet));
        }
    }

    pub fn queue_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn total_airtime_ms(&self) -> u64 {
        self.total_airtime_ms
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn radio(&self) -> &RadioTransport<T> {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut RadioTransport<T> {
        &mut self.radio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noise_floor::NUM_NOISE_FLOOR_SAMPLES;
    use crate::test_support::MockTransceiver;

    fn dispatcher(config: DispatcherConfig) -> Dispatcher<MockTransceiver> {
        let mut driver = MockTransceiver::new(-110);
        driver.auto_complete = true;
        Dispatcher::new(driver, RadioParams::default(), config).unwrap()
    }

    #[test]
    fn enqueue_validates() {
        let mut d = dispatcher(DispatcherConfig {
            queue_depth: 1,
            ..DispatcherConfig::default()
        });
        assert!(matches!(d.enqueue(vec![]), Err(DispatchError::Empty)));
        assert!(matches!(
            d.enqueue(vec![0; 256]),
            Err(DispatchError::PacketTooLarge(256))
        ));
        d.enqueue(vec![1]).unwrap();
        assert!(matches!(d.enqueue(vec![2]), Err(DispatchError::QueueFull)));
    }

    #[test]
    fn bad_airtime_factor_rejected() {
        let cfg = DispatcherConfig {
            airtime_factor: 0.0,
            ..DispatcherConfig::default()
        };
        assert!(matches!(
            Dispatcher::new(MockTransceiver::new(-110), RadioParams::default(), cfg),
            Err(DispatchError::AirtimeFactor(_))
        ));
    }

    #[test]
    fn duty_cycle_spaces_transmissions() {
        let mut d = dispatcher(DispatcherConfig::default());
        let first = d.enqueue(vec![1; 20]).unwrap();
        let second = d.enqueue(vec![2; 20]).unwrap();
        assert!(!d.has_started(first));
        d.poll(0);
        assert_eq!(d.radio().driver().sent.len(), 1);
        assert!(d.has_started(first));
        assert!(!d.has_started(second));

        d.poll(1);
        let airtime = d.radio().estimated_airtime_ms(20);
        assert_eq!(d.total_airtime_ms(), u64::from(airtime));
        assert_eq!(d.radio().driver().sent.len(), 1);

        d.poll(u64::from(airtime));
        assert_eq!(d.radio().driver().sent.len(), 1);
        d.poll(1 + u64::from(airtime));
        assert_eq!(d.radio().driver().sent.len(), 2);
        assert!(d.has_started(second));
        assert_eq!(d.queue_len(), 0);
    }

    #[test]
    fn busy_channel_defers_transmit() {
        let mut d = dispatcher(DispatcherConfig {
            activity_threshold: 10,
            ..DispatcherConfig::default()
        });
        for _ in 0..NUM_NOISE_FLOOR_SAMPLES {
            d.poll(0);
        }
        assert_eq!(d.radio().noise_floor(), -110);

        d.radio_mut().driver_mut().rssi = -90;
        d.enqueue(vec![7; 10]).unwrap();
        d.poll(100);
        assert!(d.radio().driver().sent.is_empty());
        assert_eq!(d.queue_len(), 1);

        d.radio_mut().driver_mut().rssi = -110;
        d.poll(200);
        assert_eq!(d.radio().driver().sent.len(), 1);
    }

    #[test]
    fn received_frame_carries_metrics() {
        let mut d = dispatcher(DispatcherConfig::default());
        d.radio_mut().driver_mut().inject_frame(vec![1, 2, 3]);
        let frame = d.poll(0).unwrap();
        assert_eq!(frame.bytes, vec![1, 2, 3]);
        assert_eq!(frame.rssi, -70);
        assert!(frame.score > 0.0);
        assert!(d.poll(1).is_none());
    }
}
