// src/main.rs
//! netcap engine
//!
//! Attaches to a TUN device handed over by the host as an open file
//! descriptor and proxies every TCP flow on it through real sockets.

use anyhow::{bail, Context, Result};
use netcap_engine::device::{DeviceBridge, TunDevice};
use netcap_engine::observability::{init_metrics, init_tracing};
use netcap_engine::packet::{Ipv4TcpCodec, PacketCodec};
use netcap_engine::tunnel::{self, protect};
use netcap_engine::utils::config::EngineConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Interval between traffic rate log lines
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::load().context("failed to load configuration")?;

    init_tracing(&config.observability)?;
    init_metrics(config.observability.metrics_addr)?;

    info!("Starting netcap engine v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {:?}", config);

    let Some(fd) = config.device.fd else {
        bail!("no device file descriptor configured (set device.fd or NETCAP__DEVICE__FD)");
    };
    let device = open_device(fd)?;

    let codec: Arc<dyn PacketCodec> = Arc::new(Ipv4TcpCodec::new());
    let protector = protect::from_config(&config.tunnel);
    let handle = tunnel::spawn(config.tunnel.clone(), Arc::clone(&codec), protector);

    let bridge = DeviceBridge::new(codec, config.device.mtu);
    let traffic = bridge.traffic();
    let shutdown = bridge.shutdown_token();
    let mut bridge_task = bridge.spawn(device, handle.ingress, handle.egress);

    let stats = Arc::clone(&handle.stats);
    let mut report = tokio::time::interval(REPORT_INTERVAL);
    report.tick().await;

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, cleaning up...");
                shutdown.cancel();
                break (&mut bridge_task).await;
            }
            done = &mut bridge_task => break done,
            _ = report.tick() => {
                let (up, down) = traffic.take();
                let snapshot = stats.snapshot();
                info!(
                    "Traffic: up {} B, down {} B, live flows {}, dropped {:.2}%",
                    up,
                    down,
                    snapshot.live_flows(),
                    snapshot.drop_rate()
                );
            }
        }
    };

    match outcome {
        Ok(Ok(())) => {
            info!("Engine stopped gracefully");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Device bridge error: {}", e);
            Err(e.into())
        }
        Err(e) => Err(e).context("device bridge task panicked"),
    }
}

/// Adopt the TUN descriptor inherited from the host
fn open_device(fd: i32) -> Result<TunDevice> {
    use std::os::fd::{FromRawFd, OwnedFd};

    if fd < 0 {
        bail!("invalid device file descriptor {}", fd);
    }
    // SAFETY: the host transfers ownership of an open TUN descriptor to this
    // process; nothing else in the process uses it.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    TunDevice::new(fd).context("failed to register device descriptor")
}
