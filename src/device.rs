// src/device.rs
//! Virtual interface bridge
//!
//! Moves raw frames between the device and the tunnel queues. One read from
//! the device yields one IPv4 frame; frames that are not IPv4/TCP are skipped.
//! Both directions are non-blocking toward the tunnel: a full ingress queue
//! drops the frame.
//!
//! A TUN descriptor is driven through [`TunDevice`], which registers the
//! non-blocking fd with the reactor so reads and writes wait on readiness
//! independently of each other.

use crate::packet::{Packet, PacketCodec};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use std::io;
#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
#[cfg(unix)]
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Byte counters for traffic crossing the device
#[derive(Debug, Default)]
pub struct TrafficStats {
    /// Bytes read from the device (application to network)
    upload: AtomicU64,

    /// Bytes written to the device (network to application)
    download: AtomicU64,

    /// Frames skipped because they were not IPv4/TCP
    skipped: AtomicU64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_upload(&self, bytes: usize) {
        self.upload.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::counter!("netcap_upload_bytes_total").increment(bytes as u64);
    }

    fn record_download(&self, bytes: usize) {
        self.download.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::counter!("netcap_download_bytes_total").increment(bytes as u64);
    }

    fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Read and zero the byte counters, returning `(upload, download)`.
    /// Used for per-interval rate reporting.
    pub fn take(&self) -> (u64, u64) {
        (
            self.upload.swap(0, Ordering::Relaxed),
            self.download.swap(0, Ordering::Relaxed),
        )
    }
}

/// Put a descriptor in non-blocking mode
#[cfg(unix)]
fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor owned by the caller.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn fd_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(unix)]
fn fd_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: `buf` is valid for reads of `buf.len()` bytes.
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Packet device backed by a non-blocking descriptor, one frame per read
/// and per write
#[cfg(unix)]
pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
}

#[cfg(unix)]
impl TunDevice {
    /// Take ownership of an open device descriptor. Must be called inside a
    /// tokio runtime.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }
}

#[cfg(unix)]
impl AsyncRead for TunDevice {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| fd_read(inner.as_raw_fd(), unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(unix)]
impl AsyncWrite for TunDevice {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| fd_write(inner.as_raw_fd(), buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Pumps frames between a device and the tunnel queues
pub struct DeviceBridge {
    codec: Arc<dyn PacketCodec>,
    mtu: usize,
    traffic: Arc<TrafficStats>,
    shutdown: CancellationToken,
}

impl DeviceBridge {
    pub fn new(codec: Arc<dyn PacketCodec>, mtu: usize) -> Self {
        Self {
            codec,
            mtu,
            traffic: Arc::new(TrafficStats::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn traffic(&self) -> Arc<TrafficStats> {
        Arc::clone(&self.traffic)
    }

    /// Cancelling this token stops both directions
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn<D>(
        self,
        device: D,
        ingress: mpsc::Sender<Packet>,
        egress: mpsc::Receiver<Bytes>,
    ) -> JoinHandle<Result<()>>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        tokio::spawn(self.run(device, ingress, egress))
    }

    /// Run until the device reaches end of stream, fails, or shutdown is requested
    pub async fn run<D>(
        self,
        device: D,
        ingress: mpsc::Sender<Packet>,
        egress: mpsc::Receiver<Bytes>,
    ) -> Result<()>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(device);

        let output = tokio::spawn(write_frames(
            writer,
            egress,
            Arc::clone(&self.traffic),
            self.shutdown.clone(),
        ));

        let input = self.read_frames(reader, ingress).await;
        self.shutdown.cancel();

        let output = output
            .await
            .map_err(|e| EngineError::DeviceError(format!("output task failed: {}", e)))?;

        info!(
            "Device bridge stopped (upload {} B, download {} B)",
            self.traffic.upload(),
            self.traffic.download()
        );
        input.and(output)
    }

    async fn read_frames<R>(&self, mut reader: ReadHalf<R>, ingress: mpsc::Sender<Packet>) -> Result<()>
    where
        R: AsyncRead,
    {
        let mut buf = vec![0u8; self.mtu];

        loop {
            let n = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                read = reader.read(&mut buf) => read?,
            };
            if n == 0 {
                debug!("Device reached end of stream");
                return Ok(());
            }
            self.traffic.record_upload(n);

            let packet = match self.codec.decode(&buf[..n]) {
                Ok(packet) => packet,
                Err(e) => {
                    trace!("Skipping frame of {} bytes: {}", n, e);
                    self.traffic.record_skipped();
                    continue;
                }
            };

            match ingress.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Ingress queue full, frame dropped");
                }
                Err(TrySendError::Closed(_)) => return Err(EngineError::ChannelClosed("ingress")),
            }
        }
    }
}

async fn write_frames<W>(
    mut writer: WriteHalf<W>,
    mut egress: mpsc::Receiver<Bytes>,
    traffic: Arc<TrafficStats>,
    shutdown: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = egress.recv() => frame,
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        writer.write_all(&frame).await?;
        writer.flush().await?;
        traffic.record_download(frame.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Ipv4TcpCodec, TcpFlags};
    use std::net::SocketAddrV4;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn frame(flags: TcpFlags, seq: u32, payload: &[u8]) -> Vec<u8> {
        let codec = Ipv4TcpCodec::new();
        let app: SocketAddrV4 = "10.0.1.2:5000".parse().unwrap();
        let remote: SocketAddrV4 = "1.2.3.4:80".parse().unwrap();
        let mut buf = Vec::new();
        codec.build_tcp_packet(&mut buf, app, remote, flags, 0, seq, 1).unwrap();
        buf.extend_from_slice(payload);
        codec.update_tcp_buffer(&mut buf, flags, seq, 0, payload.len()).unwrap();
        buf
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (device, mut host) = tokio::io::duplex(64 * 1024);
        let (ingress_tx, mut ingress_rx) = mpsc::channel(8);
        let (egress_tx, egress_rx) = mpsc::channel(8);

        let bridge = DeviceBridge::new(Arc::new(Ipv4TcpCodec::new()), 16 * 1024);
        let traffic = bridge.traffic();
        let task = bridge.spawn(device, ingress_tx, egress_rx);

        let syn = frame(TcpFlags::SYN, 100, b"");
        host.write_all(&syn).await.unwrap();
        let packet = timeout(WAIT, ingress_rx.recv()).await.unwrap().unwrap();
        assert!(packet.is_syn());
        assert_eq!(packet.sequence_number, 100);

        let reply = frame(TcpFlags::SYN | TcpFlags::ACK, 7, b"");
        egress_tx.send(Bytes::from(reply.clone())).await.unwrap();
        let mut read_back = vec![0u8; reply.len()];
        timeout(WAIT, host.read_exact(&mut read_back)).await.unwrap().unwrap();
        assert_eq!(read_back, reply);

        drop(host);
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(traffic.upload(), syn.len() as u64);
        assert_eq!(traffic.download(), reply.len() as u64);
    }

    #[tokio::test]
    async fn test_non_tcp_frames_are_skipped() {
        let (device, mut host) = tokio::io::duplex(64 * 1024);
        let (ingress_tx, mut ingress_rx) = mpsc::channel(8);
        let (_egress_tx, egress_rx) = mpsc::channel(8);

        let bridge = DeviceBridge::new(Arc::new(Ipv4TcpCodec::new()), 16 * 1024);
        let traffic = bridge.traffic();
        let task = bridge.spawn(device, ingress_tx, egress_rx);

        // IPv6 version nibble
        host.write_all(&[0x60, 0, 0, 0]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        host.write_all(&frame(TcpFlags::ACK, 1, b"hi")).await.unwrap();

        let packet = timeout(WAIT, ingress_rx.recv()).await.unwrap().unwrap();
        assert_eq!(&packet.payload[..], b"hi");
        assert_eq!(traffic.skipped(), 1);

        drop(host);
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_stops_bridge() {
        let (device, _host) = tokio::io::duplex(1024);
        let (ingress_tx, _ingress_rx) = mpsc::channel(8);
        let (_egress_tx, egress_rx) = mpsc::channel(8);

        let bridge = DeviceBridge::new(Arc::new(Ipv4TcpCodec::new()), 1500);
        let shutdown = bridge.shutdown_token();
        let task = bridge.spawn(device, ingress_tx, egress_rx);

        shutdown.cancel();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fd_device_writes_while_app_is_silent() {
        use std::os::unix::net::UnixDatagram;

        // Datagram pair keeps frame boundaries the way a TUN fd does
        let (device_side, host_side) = UnixDatagram::pair().unwrap();
        let device = TunDevice::new(OwnedFd::from(device_side)).unwrap();
        host_side.set_nonblocking(true).unwrap();
        let host = tokio::net::UnixDatagram::from_std(host_side).unwrap();

        let (ingress_tx, mut ingress_rx) = mpsc::channel(8);
        let (egress_tx, egress_rx) = mpsc::channel(8);
        let bridge = DeviceBridge::new(Arc::new(Ipv4TcpCodec::new()), 16 * 1024);
        let shutdown = bridge.shutdown_token();
        let traffic = bridge.traffic();
        let task = bridge.spawn(device, ingress_tx, egress_rx);

        // The read side is parked on an idle fd; egress must still go out
        let reply = frame(TcpFlags::SYN | TcpFlags::ACK, 7, b"");
        egress_tx.send(Bytes::from(reply.clone())).await.unwrap();
        let mut buf = vec![0u8; 2048];
        let n = timeout(WAIT, host.recv(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], &reply[..]);

        let request = frame(TcpFlags::ACK | TcpFlags::PSH, 101, b"GET /");
        host.send(&request).await.unwrap();
        let packet = timeout(WAIT, ingress_rx.recv()).await.unwrap().unwrap();
        assert_eq!(&packet.payload[..], b"GET /");

        let data = frame(TcpFlags::ACK, 8, b"200 OK");
        egress_tx.send(Bytes::from(data.clone())).await.unwrap();
        let n = timeout(WAIT, host.recv(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], &data[..]);

        shutdown.cancel();
        timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(traffic.upload(), request.len() as u64);
        assert_eq!(traffic.download(), (reply.len() + data.len()) as u64);
    }

    #[cfg(unix)]
    #[test]
    fn test_set_nonblocking() {
        use std::os::unix::net::UnixDatagram;

        let (a, _b) = UnixDatagram::pair().unwrap();
        set_nonblocking(a.as_raw_fd()).unwrap();
        // SAFETY: fcntl on a live descriptor.
        let flags = unsafe { libc::fcntl(a.as_raw_fd(), libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn test_take_resets_byte_counters() {
        let traffic = TrafficStats::new();
        traffic.record_upload(100);
        traffic.record_download(40);

        assert_eq!(traffic.take(), (100, 40));
        assert_eq!(traffic.take(), (0, 0));
    }
}
