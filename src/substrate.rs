use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::{error, trace};

/// The send/recv primitives the packet engine runs on. This is the seam between the
///  transport-agnostic engine and the substrate variants; it also lets tests mock
///  the I/O away entirely.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WireTransport: Send + Sync + 'static {
    /// best effort: transmission errors are logged, the reliability layer recovers
    async fn send_frame(&self, to: SocketAddr, frame: &[u8]);

    async fn recv_frame(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> SocketAddr;
}

/// Substrate variant, chosen when an endpoint is opened.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SubstrateKind {
    /// UDP datagrams - the normal case
    Datagram,
    /// raw TCP; packet boundaries are preserved per write only, so this is usable
    ///  only where the peer reads frame-sized chunks
    Stream,
    /// TCP with a u32 length prefix per frame
    FramedStream,
}

pub async fn open_substrate(
    kind: SubstrateKind,
    bind: SocketAddr,
    peer: Option<SocketAddr>,
) -> anyhow::Result<Arc<dyn WireTransport>> {
    match kind {
        SubstrateKind::Datagram => {
            let socket = Arc::new(UdpSocket::bind(bind).await?);
            Ok(Arc::new(socket))
        }
        SubstrateKind::Stream | SubstrateKind::FramedStream => {
            let Some(peer) = peer else {
                bail!("stream substrates are point-to-point and need a peer address");
            };
            let stream = TcpStream::connect(peer).await?;
            Ok(Arc::new(StreamTransport::new(
                stream,
                kind == SubstrateKind::FramedStream,
            )?))
        }
    }
}

#[async_trait]
impl WireTransport for Arc<UdpSocket> {
    async fn send_frame(&self, to: SocketAddr, frame: &[u8]) {
        trace!("UDP: sending {} bytes to {:?}", frame.len(), to);
        if let Err(e) = self.send_to(frame, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    async fn recv_frame(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        Ok(self.recv_from(buf).await?)
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// TCP-backed substrate, optionally with length framing. One peer per transport.
pub struct StreamTransport {
    peer: SocketAddr,
    local: SocketAddr,
    framed: bool,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl StreamTransport {
    pub fn new(stream: TcpStream, framed: bool) -> anyhow::Result<StreamTransport> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(StreamTransport {
            peer,
            local,
            framed,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }
}

#[async_trait]
impl WireTransport for StreamTransport {
    async fn send_frame(&self, to: SocketAddr, frame: &[u8]) {
        if to != self.peer {
            error!("stream substrate is connected to {:?}, dropping frame for {:?}", self.peer, to);
            return;
        }

        let mut writer = self.writer.lock().await;
        let result = if self.framed {
            let len = (frame.len() as u32).to_be_bytes();
            match writer.write_all(&len).await {
                Ok(()) => writer.write_all(frame).await,
                Err(e) => Err(e),
            }
        } else {
            writer.write_all(frame).await
        };
        if let Err(e) = result {
            error!("error writing to stream peer {:?}: {}", self.peer, e);
        }
    }

    async fn recv_frame(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        let mut reader = self.reader.lock().await;
        if self.framed {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > buf.len() {
                bail!("framed packet of {} bytes exceeds the receive buffer", len);
            }
            reader.read_exact(&mut buf[..len]).await?;
            Ok((len, self.peer))
        } else {
            let n = reader.read(buf).await?;
            Ok((n, self.peer))
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}
