// Mesh node for Linux: KISS modem bridge or chat node over a simulated multicast air.

mod air;
mod chat;
mod config;
mod host_link;

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use mesh_core::{Dispatcher, KissModem, KissPort, LocalIdentity, ModemLoop, NodePrefs};
use tracing_subscriber::EnvFilter;

use crate::air::AirTransceiver;
use crate::config::{Config, Role};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const IDENTITY_FILE: &str = "identity.key";
const PREFS_FILE: &str = "prefs.bin";
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(5);
const STATS_INTERVAL: Duration = Duration::from_secs(60);

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("mesh-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    cfg.radio.validate().context("radio config")?;
    cfg.dispatcher.validate().context("dispatcher config")?;
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("create {}", cfg.data_dir.display()))?;
    let identity = load_or_create_identity(&cfg.data_dir.join(IDENTITY_FILE))?;
    tracing::info!(
        role = ?cfg.role,
        public_key = %hex::encode(identity.public_key()),
        "starting"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cfg.role {
            Role::Modem => run_modem(&cfg, identity).await,
            Role::Chat => {
                let prefs = sync_prefs(&cfg)?;
                chat::run(&cfg, identity, prefs).await
            }
        }
    })
}

fn load_or_create_identity(path: &Path) -> anyhow::Result<LocalIdentity> {
    if path.exists() {
        let mut f = std::fs::File::open(path)?;
        return LocalIdentity::load(&mut f).with_context(|| format!("read {}", path.display()));
    }
    let identity = LocalIdentity::generate();
    let mut f = std::fs::File::create(path)?;
    identity.save(&mut f)?;
    tracing::info!(path = %path.display(), "generated new identity");
    Ok(identity)
}

/// Stored prefs, with the config file's radio settings and name taking precedence.
fn sync_prefs(cfg: &Config) -> anyhow::Result<NodePrefs> {
    let path = cfg.data_dir.join(PREFS_FILE);
    let mut prefs = if path.exists() {
        let mut f = std::fs::File::open(&path)?;
        match NodePrefs::load(&mut f) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "prefs unreadable, using defaults");
                NodePrefs::default()
            }
        }
    } else {
        NodePrefs::default()
    };
    if let Some(name) = &cfg.node_name {
        prefs.node_name = name.clone();
    }
    prefs.freq_mhz = cfg.radio.freq_mhz;
    prefs.bandwidth_khz = cfg.radio.bandwidth_khz;
    prefs.spreading_factor = cfg.radio.spreading_factor;
    prefs.coding_rate = cfg.radio.coding_rate;
    prefs.tx_power_dbm = cfg.radio.tx_power_dbm;
    prefs.airtime_factor = cfg.dispatcher.airtime_factor;
    let mut f = std::fs::File::create(&path)?;
    prefs.save(&mut f)?;
    Ok(prefs)
}

async fn run_modem(cfg: &Config, identity: LocalIdentity) -> anyhow::Result<()> {
    let air = AirTransceiver::open(cfg.air_port).context("join air")?;
    let mut dispatcher = Dispatcher::new(air, cfg.radio, cfg.dispatcher)?;
    dispatcher
        .radio_mut()
        .set_pre_transmit_hook(|bytes| tracing::trace!(len = bytes.len(), "keying transmitter"));
    let serial = host_link::serve(cfg.host_port).await?;
    let mut modem = ModemLoop::new(KissPort::new(serial), dispatcher, KissModem::new(identity));

    let start = Instant::now();
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut report = tokio::time::interval(STATS_INTERVAL);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = tick.tick() => modem.poll(start.elapsed().as_millis() as u64),
            _ = report.tick() => {
                let s = modem.stats();
                tracing::info!(
                    rx = s.packets_received,
                    tx = s.packets_sent,
                    airtime_ms = modem.dispatcher().total_airtime_ms(),
                    noise_floor = modem.dispatcher().radio().noise_floor(),
                    "modem stats"
                );
            }
            r = &mut shutdown => {
                r?;
                break;
            }
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
pub(crate) async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("shutting down");
    Ok(())
}
