//! Per-connection TCP transport tasks
//!
//! Each socket is split into a reader task that decodes length-prefixed frames
//! and forwards them to the driver, and a writer task that encodes frames
//! queued by the driver. Dropping the handle lets the writer flush what is
//! already queued, shut the socket down and exit; the reader is aborted.

use std::io;

use flowrelay_core::{ConnectionId, Frame, FRAME_HEADER_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

// ----------------------------------------------------------------------------
// Driver Input
// ----------------------------------------------------------------------------

/// Notification from transport tasks to the driver
#[derive(Debug)]
pub(crate) enum TransportInput {
    /// A complete frame arrived
    Frame(ConnectionId, Frame),
    /// The socket closed or failed; `None` for an orderly end of stream
    Closed(ConnectionId, Option<String>),
    /// An outbound connect finished
    Connected(ConnectionId, TcpStream),
    /// An outbound connect failed
    ConnectFailed(ConnectionId, io::Error),
}

pub(crate) type InputSender = mpsc::UnboundedSender<TransportInput>;

// ----------------------------------------------------------------------------
// Transport Handle
// ----------------------------------------------------------------------------

/// Driver-side handle to one connection's socket tasks
#[derive(Debug)]
pub(crate) struct Transport {
    outbound: mpsc::UnboundedSender<Frame>,
    reader: JoinHandle<()>,
    last_input: Instant,
}

impl Transport {
    /// Split the stream and start its reader and writer tasks
    pub(crate) fn spawn(
        connection: ConnectionId,
        stream: TcpStream,
        inbound: InputSender,
        max_frame_size: usize,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for connection {}: {}", connection, e);
        }
        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(connection, read_half, inbound, max_frame_size));
        tokio::spawn(write_loop(connection, write_half, outbound_rx));

        Self {
            outbound,
            reader,
            last_input: Instant::now(),
        }
    }

    /// Queue a frame for the writer; false once the writer has gone away
    pub(crate) fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    pub(crate) fn touch(&mut self) {
        self.last_input = Instant::now();
    }

    pub(crate) fn last_input(&self) -> Instant {
        self.last_input
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ----------------------------------------------------------------------------
// Socket Tasks
// ----------------------------------------------------------------------------

async fn read_loop(
    connection: ConnectionId,
    mut reader: OwnedReadHalf,
    inbound: InputSender,
    max_frame_size: usize,
) {
    let reason = loop {
        match read_frame(&mut reader, max_frame_size).await {
            Ok(Some(frame)) => {
                trace!("Connection {} read {}", connection, frame.name());
                if inbound.send(TransportInput::Frame(connection, frame)).is_err() {
                    return;
                }
            }
            Ok(None) => break None,
            Err(e) => break Some(e.to_string()),
        }
    };

    if let Some(reason) = &reason {
        warn!("Connection {} transport failed: {}", connection, reason);
    }
    let _ = inbound.send(TransportInput::Closed(connection, reason));
}

/// Read one frame; `Ok(None)` on a clean end of stream between frames
async fn read_frame(reader: &mut OwnedReadHalf, max_frame_size: usize) -> flowrelay_core::Result<Option<Frame>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = Frame::body_len(header, max_frame_size)?;
    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Ok(Some(Frame::decode_body(&body)?))
}

async fn write_loop(
    connection: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound.recv().await {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Connection {} could not encode {}: {}", connection, frame.name(), e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(&bytes).await {
            warn!("Connection {} write failed: {}", connection, e);
            return;
        }
    }

    let _ = writer.shutdown().await;
    debug!("Connection {} writer finished", connection);
}
