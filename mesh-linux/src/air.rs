//! Simulated air: every node on the host joins one UDP multicast group and each datagram is a
//! LoRa frame. Datagram: sender tag (8) | channel Hz (u32 LE) | frame.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use mesh_core::radio::MAX_PACKET_LEN;
use mesh_core::{EventQueue, RadioEvent, RadioParams, Transceiver};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const AIR_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const TAG_LEN: usize = 8;
const HEADER_LEN: usize = TAG_LEN + 4;
const NOISE_DBM: i16 = -115;

struct AirFrame {
    freq_hz: u32,
    bytes: Vec<u8>,
}

/// `Transceiver` backed by the multicast channel. The socket lives in a tokio task; this side
/// is fully non-blocking so the core can call it from its control loop.
pub struct AirTransceiver {
    to_air: mpsc::UnboundedSender<AirFrame>,
    from_air: mpsc::UnboundedReceiver<AirFrame>,
    params: RadioParams,
    freq_hz: u32,
    receiving: bool,
    tx_done_at: Option<Instant>,
    busy_until: Option<Instant>,
    last_rssi: i16,
    last_snr: f32,
}

impl AirTransceiver {
    /// Join the air on `port` and spawn the socket task.
    pub fn open(port: u16) -> std::io::Result<Self> {
        let socket = make_multicast_socket(port)?;
        let (to_air, outbound) = mpsc::unbounded_channel();
        let (inbound, from_air) = mpsc::unbounded_channel();
        let mut tag = [0u8; TAG_LEN];
        rand::thread_rng().fill(&mut tag);
        tokio::spawn(run_air(socket, port, tag, outbound, inbound));
        tracing::info!(group = %AIR_GROUP, port, tag = %hex::encode(tag), "joined air");
        Ok(Self {
            to_air,
            from_air,
            params: RadioParams::default(),
            freq_hz: 0,
            receiving: false,
            tx_done_at: None,
            busy_until: None,
            last_rssi: NOISE_DBM,
            last_snr: 0.0,
        })
    }

    fn airtime(&self, len: usize) -> Duration {
        Duration::from_millis(u64::from(self.params.estimated_airtime_ms(len)))
    }
}

impl Transceiver for AirTransceiver {
    fn init(&mut self, params: &RadioParams) -> std::io::Result<()> {
        self.params = *params;
        self.freq_hz = params.freq_hz();
        Ok(())
    }

    fn set_channel(&mut self, freq_hz: u32) {
        self.freq_hz = freq_hz;
    }

    fn start_receive(&mut self) {
        self.receiving = true;
    }

    fn start_transmit(&mut self, bytes: &[u8]) {
        self.receiving = false;
        let frame = AirFrame {
            freq_hz: self.freq_hz,
            bytes: bytes.to_vec(),
        };
        if self.to_air.send(frame).is_err() {
            tracing::warn!("air task gone, frame lost");
        }
        self.tx_done_at = Some(Instant::now() + self.airtime(bytes.len()));
    }

    fn read_rssi(&mut self) -> i16 {
        let busy = self.busy_until.is_some_and(|t| Instant::now() < t);
        let jitter = rand::thread_rng().gen_range(-3..=3);
        if busy {
            self.last_rssi + jitter
        } else {
            NOISE_DBM + jitter
        }
    }

    fn read_signal_metrics(&mut self) -> (i16, f32) {
        (self.last_rssi, self.last_snr)
    }

    fn poll(&mut self, events: &mut EventQueue) {
        if self.tx_done_at.is_some_and(|t| Instant::now() >= t) {
            self.tx_done_at = None;
            events.push(RadioEvent::Transmitted);
        }
        while let Ok(frame) = self.from_air.try_recv() {
            if frame.freq_hz != self.freq_hz {
                continue;
            }
            // Someone else is on the channel for the frame's airtime, heard or not.
            self.busy_until = Some(Instant::now() + self.airtime(frame.bytes.len()));
            if !self.receiving {
                tracing::trace!(len = frame.bytes.len(), "frame missed, not listening");
                continue;
            }
            let mut rng = rand::thread_rng();
            self.last_rssi = rng.gen_range(-110..=-60);
            self.last_snr = f32::from(rng.gen_range(-40i16..=48)) / 4.0;
            self.receiving = false;
            events.push(RadioEvent::Received {
                bytes: frame.bytes,
                rssi: self.last_rssi,
                snr: self.last_snr,
            });
            break;
        }
    }
}

fn make_multicast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.join_multicast_v4(&AIR_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    let std_sock: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_sock)
}

async fn run_air(
    socket: UdpSocket,
    port: u16,
    tag: [u8; TAG_LEN],
    mut outbound: mpsc::UnboundedReceiver<AirFrame>,
    inbound: mpsc::UnboundedSender<AirFrame>,
) {
    let dest = SocketAddrV4::new(AIR_GROUP, port);
    let mut buf = [0u8; HEADER_LEN + MAX_PACKET_LEN];
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { return };
                let mut datagram = Vec::with_capacity(HEADER_LEN + frame.bytes.len());
                datagram.extend_from_slice(&tag);
                datagram.extend_from_slice(&frame.freq_hz.to_le_bytes());
                datagram.extend_from_slice(&frame.bytes);
                if let Err(e) = socket.send_to(&datagram, dest).await {
                    tracing::warn!(error = %e, "air send failed");
                }
            }
            r = socket.recv_from(&mut buf) => match r {
                Ok((n, from)) => {
                    let Some(frame) = parse_datagram(&buf[..n], &tag) else {
                        tracing::trace!(%from, len = n, "ignored datagram");
                        continue;
                    };
                    if inbound.send(frame).is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "air recv failed"),
            }
        }
    }
}

/// Own transmissions loop back through the group and are dropped here.
fn parse_datagram(datagram: &[u8], own_tag: &[u8; TAG_LEN]) -> Option<AirFrame> {
    if datagram.len() <= HEADER_LEN || datagram.len() > HEADER_LEN + MAX_PACKET_LEN {
        return None;
    }
    let (tag, rest) = datagram.split_at(TAG_LEN);
    if tag == own_tag {
        return None;
    }
    let (freq, bytes) = rest.split_at(4);
    Some(AirFrame {
        freq_hz: u32::from_le_bytes([freq[0], freq[1], freq[2], freq[3]]),
        bytes: bytes.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(tag: [u8; TAG_LEN], freq_hz: u32, frame: &[u8]) -> Vec<u8> {
        let mut d = tag.to_vec();
        d.extend_from_slice(&freq_hz.to_le_bytes());
        d.extend_from_slice(frame);
        d
    }

    #[test]
    fn parse_datagram_filters_own_and_malformed() {
        let own = [1u8; TAG_LEN];
        let other = [2u8; TAG_LEN];
        let f = parse_datagram(&datagram(other, 915_000_000, &[9, 8, 7]), &own).unwrap();
        assert_eq!(f.freq_hz, 915_000_000);
        assert_eq!(f.bytes, vec![9, 8, 7]);

        assert!(parse_datagram(&datagram(own, 915_000_000, &[1]), &own).is_none());
        assert!(parse_datagram(&datagram(other, 915_000_000, &[]), &own).is_none());
        assert!(parse_datagram(&datagram(other, 1, &[0; MAX_PACKET_LEN + 1]), &own).is_none());
    }
}
