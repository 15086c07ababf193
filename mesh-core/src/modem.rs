//! KISS modem: bridges a host on the serial link to the radio and answers its crypto requests.

use std::collections::VecDeque;

use crate::dispatcher::{Dispatcher, ReceivedFrame};
use crate::identity::{self, LocalIdentity, PSK_SIZE};
use crate::packet::{is_valid_packet_data, PUB_KEY_SIZE};
use crate::protocol::{HostCommand, ModemResponse};
use crate::radio::Transceiver;
use crate::wire::{FrameHandler, KissPort, SerialStream, MAX_FRAME_SIZE};

const MAX_SIGN_LEN: usize = MAX_FRAME_SIZE - 1;
const MAX_HASH_LEN: usize = MAX_FRAME_SIZE - 1;
const MIN_SEALED_LEN: usize = 12 + 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModemStats {
    pub packets_received: u32,
    pub packets_sent: u32,
    pub frames_from_host: u32,
    pub frames_to_host: u32,
    pub total_airtime_secs: u32,
    pub uptime_secs: u32,
    pub last_rssi: i16,
    /// Quarter dB.
    pub last_snr: i16,
}

/// Host request handler. Responses and outbound packets are queued for the loop to flush.
pub struct KissModem {
    identity: LocalIdentity,
    stats: ModemStats,
    to_host: VecDeque<(u8, Vec<u8>)>,
    to_radio: VecDeque<Vec<u8>>,
}

impl KissModem {
    pub fn new(identity: LocalIdentity) -> Self {
        Self {
            identity,
            stats: ModemStats::default(),
            to_host: VecDeque::new(),
            to_radio: VecDeque::new(),
        }
    }

    pub fn stats(&self) -> ModemStats {
        self.stats
    }

    pub fn public_key(&self) -> [u8; PUB_KEY_SIZE] {
        self.identity.public_key()
    }

    /// Forward a packet heard on air to the host.
    pub fn on_radio_frame(&mut self, frame: &ReceivedFrame) {
        self.to_host.push_back((HostCommand::Data.into(), frame.bytes.clone()));
    }

    pub fn next_for_host(&mut self) -> Option<(u8, Vec<u8>)> {
        self.to_host.pop_front()
    }

    pub fn next_for_radio(&mut self) -> Option<Vec<u8>> {
        self.to_radio.pop_front()
    }

    fn respond(&mut self, response: ModemResponse, payload: Vec<u8>) {
        self.to_host.push_back((response.into(), payload));
    }

    fn handle(&mut self, command: HostCommand, data: &[u8]) {
        match command {
            HostCommand::Data => {
                if is_valid_packet_data(data) {
                    self.to_radio.push_back(data.to_vec());
                } else {
                    tracing::debug!(len = data.len(), "invalid packet from host dropped");
                }
            }
            HostCommand::GetIdentity => {
                self.respond(ModemResponse::Identity, self.identity.public_key().to_vec());
            }
            HostCommand::Sign => {
                if (1..=MAX_SIGN_LEN).contains(&data.len()) {
                    self.respond(ModemResponse::Signature, self.identity.sign(data).to_vec());
                }
            }
            HostCommand::Encrypt => {
                if data.len() > PSK_SIZE && data.len() <= MAX_FRAME_SIZE {
                    let (psk, plaintext) = data.split_at(PSK_SIZE);
                    match identity::seal(psk, plaintext) {
                        Ok(sealed) => self.respond(ModemResponse::Encrypted, sealed),
                        Err(e) => tracing::debug!(error = %e, "encrypt request failed"),
                    }
                }
            }
            HostCommand::Decrypt => {
                if data.len() >= PSK_SIZE + MIN_SEALED_LEN {
                    let (psk, sealed) = data.split_at(PSK_SIZE);
                    match identity::open(psk, sealed) {
                        Ok(plain) if !plain.is_empty() => {
                            self.respond(ModemResponse::Decrypted, plain)
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!(error = %e, "decrypt request failed"),
                    }
                }
            }
            HostCommand::KeyExchange => {
                let Ok(peer) = <[u8; PUB_KEY_SIZE]>::try_from(data) else {
                    return;
                };
                match self.identity.shared_secret(&peer) {
                    Ok(secret) => self.respond(ModemResponse::SharedSecret, secret.to_vec()),
                    Err(e) => tracing::debug!(error = %e, "key exchange failed"),
                }
            }
            HostCommand::Hash => {
                if (1..=MAX_HASH_LEN).contains(&data.len()) {
                    self.respond(ModemResponse::Hash, identity::sha256(data).to_vec());
                }
            }
        }
    }
}

impl FrameHandler for KissModem {
    fn on_frame(&mut self, command: u8, payload: &[u8]) {
        self.stats.frames_from_host = self.stats.frames_from_host.wrapping_add(1);
        match HostCommand::try_from(command) {
            Ok(cmd) => self.handle(cmd, payload),
            Err(unknown) => tracing::warn!(command = unknown, "unknown host command"),
        }
    }
}

/// Drives host port, modem and dispatcher from one control loop.
pub struct ModemLoop<T: Transceiver, S: SerialStream> {
    port: KissPort<S>,
    dispatcher: Dispatcher<T>,
    modem: KissModem,
    started_ms: Option<u64>,
}

impl<T: Transceiver, S: SerialStream> ModemLoop<T, S> {
    pub fn new(port: KissPort<S>, dispatcher: Dispatcher<T>, modem: KissModem) -> Self {
        Self {
            port,
            dispatcher,
            modem,
            started_ms: None,
        }
    }

    pub fn poll(&mut self, now_ms: u64) {
        let started = *self.started_ms.get_or_insert(now_ms);

        self.port.process(&mut self.modem);
        while let Some(packet) = self.modem.next_for_radio() {
            if let Err(e) = self.dispatcher.enqueue(packet) {
                tracing::warn!(error = %e, "host packet not queued");
            }
        }

        if let Some(frame) = self.dispatcher.poll(now_ms) {
            self.modem.on_radio_frame(&frame);
        }

        while let Some((command, payload)) = self.modem.next_for_host() {
            match self.port.send_frame(command, &payload) {
                Ok(()) => {
                    self.modem.stats.frames_to_host = self.modem.stats.frames_to_host.wrapping_add(1)
                }
                Err(e) => tracing::warn!(error = %e, "frame to host dropped"),
            }
        }

        let radio = self.dispatcher.radio();
        let radio_stats = radio.stats();
        let stats = &mut self.modem.stats;
        stats.packets_received = radio_stats.packets_recv;
        stats.packets_sent = radio_stats.packets_sent;
        stats.total_airtime_secs = u32::try_from(self.dispatcher.total_airtime_ms() / 1000).unwrap_or(u32::MAX);
        stats.uptime_secs = u32::try_from(now_ms.saturating_sub(started) / 1000).unwrap_or(u32::MAX);
        stats.last_rssi = radio.last_rssi();
        stats.last_snr = (radio.last_snr() * 4.0) as i16;
    }

    pub fn stats(&self) -> ModemStats {
        self.modem.stats()
    }

    pub fn dispatcher(&self) -> &Dispatcher<T> {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<T> {
        &mut self.dispatcher
    }

    pub fn port(&self) -> &KissPort<S> {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut KissPort<S> {
        &mut self.port
    }
}
