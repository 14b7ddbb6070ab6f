use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;

use crate::config::DEFAULT_MAX_FRAME_SIZE;
use crate::error::TransportError;
use crate::frame::{FrameHeader, HEADER_LEN};
use crate::{mux_debug, mux_trace, mux_warn};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Clone, Copy, Debug)]
pub struct TransportOptions {
    pub max_frame_size: usize,
    pub write_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self { max_frame_size: DEFAULT_MAX_FRAME_SIZE, write_timeout: Duration::from_secs(5) }
    }
}

/// Duplex frame stream over one socket.
///
/// Reads and writes are serialized independently: a pending receive never
/// blocks a write. Only one receive may be outstanding; the owner re-arms it
/// after processing each frame. Any read or write failure fires the
/// disconnect signal, after which every operation fails with
/// [`TransportError::Disposed`].
pub struct Transport {
    remote: SocketAddr,
    opts: TransportOptions,
    reader: Mutex<Option<BoxReader>>,
    writer: Mutex<Option<BoxWriter>>,
    disconnected: watch::Sender<bool>,
}

impl Transport {
    pub fn new<S>(stream: S, remote: SocketAddr, opts: TransportOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_halves(Box::new(reader), Box::new(writer), remote, opts)
    }

    pub fn from_tcp(stream: TcpStream, no_delay: bool, opts: TransportOptions) -> std::io::Result<Self> {
        if let Err(e) = stream.set_nodelay(no_delay) {
            mux_warn!("Failed to set TCP_NODELAY: {:?}", e);
        }
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self::from_halves(Box::new(reader), Box::new(writer), remote, opts))
    }

    fn from_halves(reader: BoxReader, writer: BoxWriter, remote: SocketAddr, opts: TransportOptions) -> Self {
        let (disconnected, _) = watch::channel(false);
        Self {
            remote,
            opts,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            disconnected,
        }
    }

    #[inline] pub fn remote_addr(&self) -> SocketAddr   { self.remote }
    #[inline] pub fn options(&self) -> TransportOptions { self.opts }
    #[inline] pub fn is_disconnected(&self) -> bool     { *self.disconnected.borrow() }

    /// Fires the disconnect signal. Only the first call returns `true`.
    pub fn disconnect(&self) -> bool {
        let fired = self.disconnected.send_if_modified(|state| {
            if *state {
                false
            } else {
                *state = true;
                true
            }
        });
        if fired {
            mux_debug!("Transport to {} disconnected", self.remote);
        }
        fired
    }

    /// Resolves once the disconnect signal has fired.
    pub async fn disconnected(&self) {
        let mut rx = self.disconnected.subscribe();
        let _ = rx.wait_for(|state| *state).await;
    }

    /// Writes one complete frame and flushes it.
    pub async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.is_disconnected() {
            return Err(TransportError::Disposed);
        }

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(TransportError::Disposed);
        };

        let written = timeout(self.opts.write_timeout, async {
            writer.write_all(frame).await?;
            writer.flush().await
        })
        .await;

        let result = match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::WriteTimeout),
        };

        match &result {
            Ok(()) => mux_trace!("Wrote {} B to {}", frame.len(), self.remote),
            Err(e) => {
                // a half-written frame leaves the stream unframeable
                mux_warn!("Write to {} failed: {}", self.remote, e);
                self.disconnect();
            }
        }
        result
    }

    /// Reads exactly one frame; the body lands in `buf`.
    pub async fn receive(&self, buf: &mut BytesMut) -> Result<FrameHeader, TransportError> {
        if self.is_disconnected() {
            return Err(TransportError::Disposed);
        }

        let mut guard = self.reader.try_lock().map_err(|_| TransportError::ReceivePending)?;
        let Some(reader) = guard.as_mut() else {
            return Err(TransportError::Disposed);
        };

        let result = tokio::select! {
            read = Self::read_frame(reader, buf, self.opts.max_frame_size) => read,
            _ = self.disconnected() => Err(TransportError::Disposed),
        };

        match &result {
            Ok(header) => mux_trace!("Received {:?} from {}", header, self.remote),
            Err(TransportError::Disposed) => {}
            Err(TransportError::ConnectionClosed) => {
                mux_debug!("Connection closed by peer {}", self.remote);
                self.disconnect();
            }
            Err(e) => {
                mux_warn!("Receive from {} failed: {}", self.remote, e);
                self.disconnect();
            }
        }
        result
    }

    async fn read_frame(
        reader: &mut BoxReader,
        buf: &mut BytesMut,
        max_frame_size: usize,
    ) -> Result<FrameHeader, TransportError> {
        // Read the header (handling partial reads)
        let mut head = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = reader.read(&mut head[filled..]).await?;
            if n == 0 {
                return Err(TransportError::ConnectionClosed);
            }
            filled += n;
        }

        let header = FrameHeader::parse(&head, max_frame_size)?;

        buf.clear();
        buf.resize(header.body_len(), 0);
        reader.read_exact(&mut buf[..]).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::ConnectionClosed
            } else {
                TransportError::Io(e)
            }
        })?;

        Ok(header)
    }

    /// Fires the disconnect signal and releases the socket. Idempotent.
    pub async fn close(&self) {
        self.disconnect();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = timeout(self.opts.write_timeout, writer.shutdown()).await;
        }
        self.reader.lock().await.take();
    }
}
