//! KISS host link over TCP. One host at a time; the core sees it as a byte-oriented serial port.

use std::collections::VecDeque;
use std::net::SocketAddr;

use mesh_core::SerialStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Frames buffered towards the host before new ones are dropped.
const HOST_QUEUE_DEPTH: usize = 64;

/// Serial side of the link. Bytes from the host arrive in chunks from the listener task.
pub struct ChannelSerial {
    from_host: mpsc::UnboundedReceiver<Vec<u8>>,
    to_host: mpsc::Sender<Vec<u8>>,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    dropped: u32,
}

impl ChannelSerial {
    fn new(from_host: mpsc::UnboundedReceiver<Vec<u8>>, to_host: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            from_host,
            to_host,
            rx: VecDeque::new(),
            tx: Vec::new(),
            dropped: 0,
        }
    }

    fn refill(&mut self) {
        while let Ok(chunk) = self.from_host.try_recv() {
            self.rx.extend(chunk);
        }
    }
}

impl SerialStream for ChannelSerial {
    fn bytes_available(&mut self) -> usize {
        self.refill();
        self.rx.len()
    }

    fn read_byte(&mut self) -> Option<u8> {
        if self.rx.is_empty() {
            self.refill();
        }
        self.rx.pop_front()
    }

    fn write_byte(&mut self, byte: u8) {
        self.tx.push(byte);
    }

    fn flush(&mut self) {
        if self.tx.is_empty() {
            return;
        }
        match self.to_host.try_send(std::mem::take(&mut self.tx)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped = self.dropped.wrapping_add(1);
                tracing::debug!(dropped = self.dropped, "host link backed up, output dropped");
            }
            Err(TrySendError::Closed(_)) => tracing::debug!("host link task gone, output dropped"),
        }
    }
}

/// Bind the host port on localhost and spawn the accept loop.
pub async fn serve(port: u16) -> std::io::Result<ChannelSerial> {
    let bind: SocketAddr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(%bind, "KISS host link listening");
    let (host_tx, from_host) = mpsc::unbounded_channel();
    let (to_host, host_rx) = mpsc::channel(HOST_QUEUE_DEPTH);
    tokio::spawn(run_host_link(listener, host_tx, host_rx));
    Ok(ChannelSerial::new(from_host, to_host))
}

async fn run_host_link(
    listener: TcpListener,
    host_tx: mpsc::UnboundedSender<Vec<u8>>,
    mut host_rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut buf = [0u8; 1024];
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "host accept failed");
                continue;
            }
        };
        // Frames queued while nobody was connected are stale.
        while host_rx.try_recv().is_ok() {}
        tracing::info!(%peer, "host connected");
        let (mut rd, mut wr) = stream.into_split();
        loop {
            tokio::select! {
                r = rd.read(&mut buf) => match r {
                    Ok(0) => break,
                    Ok(n) => {
                        if host_tx.send(buf[..n].to_vec()).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "host read failed");
                        break;
                    }
                },
                out = host_rx.recv() => {
                    let Some(out) = out else { return };
                    if let Err(e) = wr.write_all(&out).await {
                        tracing::debug!(error = %e, "host write failed");
                        break;
                    }
                }
            }
        }
        tracing::info!(%peer, "host disconnected");
    }
}
