//! Length-prefixed frame pump between a byte stream and a peer.
//!
//! Wire format: each frame is a little-endian `u32` byte length followed by
//! a serialized Cap'n Proto message. The driver owns both directions of one
//! stream: inbound frames go straight into `Peer::handle_frame`; outbound
//! frames arrive over an unbounded channel fed by the transport this driver
//! attaches to the peer.
//!
//! The peer is `!Send`, so run the driver on a current-thread runtime (or
//! inside a `LocalSet`), one task per connection.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::peer::{Peer, Transport};

/// Inbound frames above this are treated as protocol errors.
const MAX_FRAME_BYTES: u32 = 1 << 26;

/// Channel-backed transport: `send_frame` enqueues to the driver's writer.
struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closing: Rc<Cell<bool>>,
}

impl Transport for ChannelTransport {
    fn send_frame(&self, bytes: &[u8]) -> Result<(), Error> {
        if self.closing.get() {
            return Err(Error::Transport("transport is closing".to_string()));
        }
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| Error::Transport("connection writer is gone".to_string()))
    }

    fn is_closing(&self) -> bool {
        self.closing.get()
    }

    fn close(&self) {
        self.closing.set(true);
    }
}

/// Drive one connection until EOF, shutdown, or a fatal protocol error.
///
/// Attaches a transport to the peer for the duration and detaches it on the
/// way out. A remote abort surfaces as `RemoteAbort`; local protocol errors
/// already sent an abort frame before this returns.
pub async fn drive<S>(stream: S, peer: Rc<RefCell<Peer>>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let closing = Rc::new(Cell::new(false));
    peer.borrow_mut().attach_transport(Box::new(ChannelTransport {
        tx,
        closing: closing.clone(),
    }));

    let (mut reader, mut writer) = tokio::io::split(stream);
    let result = async {
        loop {
            tokio::select! {
                inbound = read_frame(&mut reader) => {
                    match inbound? {
                        Some(frame) => {
                            let outcome = peer.borrow_mut().handle_frame(&frame);
                            if let Err(err) = outcome {
                                peer.borrow().notify_error(&err);
                                if !matches!(err, Error::RemoteAbort(_)) {
                                    // Protocol breaches already queued an
                                    // abort frame; flush it before bailing.
                                    tracing::warn!(error = %err, "closing after protocol error");
                                    flush_pending(&mut rx, &mut writer).await?;
                                }
                                return Err(err);
                            }
                        }
                        None => {
                            tracing::debug!("connection closed by remote");
                            return Ok(());
                        }
                    }
                }
                outbound = rx.recv() => {
                    match outbound {
                        Some(frame) => write_frame(&mut writer, &frame).await?,
                        None => return Ok(()),
                    }
                }
            }
            if closing.get() {
                flush_pending(&mut rx, &mut writer).await?;
                tracing::debug!("transport closed locally");
                return Ok(());
            }
        }
    }
    .await;

    peer.borrow_mut().detach_transport();
    peer.borrow_mut().notify_close();
    result
}

async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(Error::Transport(err.to_string())),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(Error::MalformedMessage("frame length out of range"));
    }
    let mut frame = vec![0u8; len as usize];
    reader
        .read_exact(&mut frame)
        .await
        .map_err(|err| Error::Transport(err.to_string()))?;
    Ok(Some(frame))
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let len = frame.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|err| Error::Transport(err.to_string()))?;
    writer
        .write_all(frame)
        .await
        .map_err(|err| Error::Transport(err.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|err| Error::Transport(err.to_string()))
}

/// Drain already-enqueued outbound frames (aborts, final releases) before
/// tearing the stream down.
async fn flush_pending<W>(
    rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    writer: &mut W,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    while let Ok(frame) = rx.try_recv() {
        write_frame(writer, &frame).await?;
    }
    Ok(())
}
