//! Control socket: adaptive bitrate and keyframe requests.

use super::protocol::{
    clamp_bitrate, quality_to_bitrate, ControlMessage, CONTROL_WRITE_TIMEOUT,
};
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Cloneable handle to a session's control channel.
pub type BitrateControl = Arc<ControlChannel>;

/// Write side of the control socket.
///
/// The socket is swapped out on reconnect; handles stay valid across it.
#[derive(Debug)]
pub struct ControlChannel {
    socket: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    bitrate: AtomicU32,
    changes: AtomicU64,
}

impl ControlChannel {
    pub fn new(initial_bitrate: u32) -> Self {
        Self {
            socket: Mutex::new(None),
            connected: AtomicBool::new(false),
            bitrate: AtomicU32::new(initial_bitrate),
            changes: AtomicU64::new(0),
        }
    }

    /// Install a freshly connected control socket.
    pub async fn attach(&self, stream: TcpStream) {
        *self.socket.lock().await = Some(stream);
        self.connected.store(true, Ordering::Release);
    }

    /// Drop the current socket, if any.
    pub async fn detach(&self) {
        self.connected.store(false, Ordering::Release);
        self.socket.lock().await.take();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Last bitrate successfully sent (or the initial one).
    pub fn current_bitrate(&self) -> u32 {
        self.bitrate.load(Ordering::Relaxed)
    }

    /// Number of successful bitrate changes.
    pub fn bitrate_changes(&self) -> u64 {
        self.changes.load(Ordering::Relaxed)
    }

    async fn send(&self, msg: ControlMessage) -> Result<()> {
        let mut guard = self.socket.lock().await;
        let Some(stream) = guard.as_mut() else {
            bail!("control channel not available");
        };
        let bytes = msg.encode();
        tokio::time::timeout(CONTROL_WRITE_TIMEOUT, stream.write_all(&bytes))
            .await
            .context("control write timed out")?
            .context("control write failed")?;
        Ok(())
    }

    /// Send a new target bitrate, clamped to the accepted range. Returns the
    /// value actually sent.
    pub async fn set_bitrate(&self, bps: u32) -> Result<u32> {
        let bps = clamp_bitrate(bps);
        self.send(ControlMessage::SetBitrate(bps)).await?;
        self.bitrate.store(bps, Ordering::Relaxed);
        self.changes.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Bitrate set to {} bps", bps);
        Ok(bps)
    }

    /// Ask the encoder for an IDR frame.
    pub async fn request_keyframe(&self) -> Result<()> {
        self.send(ControlMessage::RequestKeyframe).await?;
        tracing::debug!("Keyframe requested");
        Ok(())
    }

    /// Map a 0..=100 quality level to a bitrate and send it.
    pub async fn set_quality(&self, quality: u8) -> Result<u32> {
        self.set_bitrate(quality_to_bitrate(quality)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_without_socket() {
        let control = ControlChannel::new(4_000_000);
        assert!(!control.is_connected());
        assert!(control.set_bitrate(1_000_000).await.is_err());
        assert!(control.request_keyframe().await.is_err());
        assert_eq!(control.current_bitrate(), 4_000_000);
        assert_eq!(control.bitrate_changes(), 0);
    }

    #[tokio::test]
    async fn test_messages_on_the_wire() {
        let (client, mut server) = socket_pair().await;
        let control = Arc::new(ControlChannel::new(4_000_000));
        control.attach(client).await;
        assert!(control.is_connected());

        assert_eq!(control.set_bitrate(50).await.unwrap(), 100_000);
        control.request_keyframe().await.unwrap();
        assert_eq!(control.set_quality(60).await.unwrap(), 2_000_000);

        let mut buf = [0u8; 11];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(
            buf,
            [0x0D, 0x00, 0x01, 0x86, 0xA0, 0x0E, 0x0D, 0x00, 0x1E, 0x84, 0x80]
        );
        assert_eq!(control.current_bitrate(), 2_000_000);
        assert_eq!(control.bitrate_changes(), 2);

        control.detach().await;
        assert!(control.request_keyframe().await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_interleave() {
        let (client, mut server) = socket_pair().await;
        let control: BitrateControl = Arc::new(ControlChannel::new(4_000_000));
        control.attach(client).await;

        let tasks: Vec<_> = (0..10u32)
            .map(|i| {
                let control = Arc::clone(&control);
                tokio::spawn(async move { control.set_bitrate(1_000_000 + i).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let mut buf = [0u8; 50];
        server.read_exact(&mut buf).await.unwrap();
        for msg in buf.chunks(5) {
            assert_eq!(msg[0], 0x0D);
            let bps = u32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]);
            assert!((1_000_000..1_000_010).contains(&bps));
        }
        assert_eq!(control.bitrate_changes(), 10);
    }
}
