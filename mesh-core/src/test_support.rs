//! Scripted transceiver, serial stream and clock shared by the unit tests.

use std::collections::VecDeque;

use crate::clock::RtcClock;
use crate::radio::{EventQueue, RadioEvent, RadioParams, Transceiver};
use crate::wire::SerialStream;

pub struct MockTransceiver {
    pub rssi: i16,
    pub pending: Vec<RadioEvent>,
    pub sent: Vec<Vec<u8>>,
    pub rx_starts: usize,
    pub channel: Option<u32>,
    /// Metrics reported for the last frame handed to the radio.
    pub last_metrics: (i16, f32),
    /// Raise `Transmitted` on the poll after every transmit.
    pub auto_complete: bool,
}

impl MockTransceiver {
    pub fn new(rssi: i16) -> Self {
        Self {
            rssi,
            pending: Vec::new(),
            sent: Vec::new(),
            rx_starts: 0,
            channel: None,
            last_metrics: (0, 0.0),
            auto_complete: false,
        }
    }

    pub fn inject(&mut self, event: RadioEvent) {
        self.pending.push(event);
    }

    pub fn inject_frame(&mut self, bytes: Vec<u8>) {
        self.pending.push(RadioEvent::Received {
            bytes,
            rssi: -70,
            snr: 8.0,
        });
    }
}

impl Transceiver for MockTransceiver {
    fn init(&mut self, _params: &RadioParams) -> std::io::Result<()> {
        Ok(())
    }

    fn set_channel(&mut self, freq_hz: u32) {
        self.channel = Some(freq_hz);
    }

    fn start_receive(&mut self) {
        self.rx_starts += 1;
    }

    fn start_transmit(&mut self, bytes: &[u8]) {
        self.sent.push(bytes.to_vec());
        if self.auto_complete {
            self.pending.push(RadioEvent::Transmitted);
        }
    }

    fn read_rssi(&mut self) -> i16 {
        self.rssi
    }

    fn read_signal_metrics(&mut self) -> (i16, f32) {
        self.last_metrics
    }

    fn poll(&mut self, events: &mut EventQueue) {
        for event in self.pending.drain(..) {
            if let RadioEvent::Received { rssi, snr, .. } = &event {
                self.last_metrics = (*rssi, *snr);
            }
            events.push(event);
        }
    }
}

/// In-memory duplex byte stream: tests feed `rx`, read back `tx`.
#[derive(Default)]
pub struct MemorySerial {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub flushes: usize,
}

impl MemorySerial {
    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }
}

impl SerialStream for MemorySerial {
    fn bytes_available(&mut self) -> usize {
        self.rx.len()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn write_byte(&mut self, byte: u8) {
        self.tx.push(byte);
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    pub now: u32,
}

impl ManualClock {
    pub fn at(now: u32) -> Self {
        Self { now }
    }
}

impl RtcClock for ManualClock {
    fn current_time(&self) -> u32 {
        self.now
    }

    fn set_current_time(&mut self, time: u32) {
        self.now = time;
    }
}
