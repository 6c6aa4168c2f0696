//! Forwarding terminal output to the session

use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{EvalError, EvalResult};
use crate::protocol::StreamMessage;

const READ_BUFFER_SIZE: usize = 4096;

/// Master side of a terminal, read through the runtime's reactor.
/// The descriptor must already be in non-blocking mode.
pub struct PtyReader {
    inner: AsyncFd<File>,
}

impl PtyReader {
    pub fn new(master: File) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(master)?,
        })
    }
}

impl AsyncRead for PtyReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
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

/// Forward every non-empty chunk of `master` until end-of-stream.
/// Resolves to the number of bytes read; aborting the task drops its
/// `outbox` handle, so nothing is sent afterwards.
pub fn spawn_reader(
    master: File,
    outbox: mpsc::Sender<StreamMessage>,
) -> EvalResult<JoinHandle<EvalResult<usize>>> {
    let reader = PtyReader::new(master).map_err(|e| EvalError::StreamError(e.to_string()))?;
    Ok(tokio::spawn(async move { forward_output(reader, &outbox).await }))
}

async fn forward_output<R>(
    mut source: R,
    outbox: &mpsc::Sender<StreamMessage>,
) -> EvalResult<usize>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut decoder = Utf8Decoder::default();
    let mut forwarder = Forwarder::new(outbox);
    let mut total = 0;

    let result = loop {
        match source.read(&mut buffer).await {
            Ok(0) => break Ok(total),
            Ok(n) => {
                total += n;
                forwarder.send(decoder.push(&buffer[..n])).await;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // the slave side closing reads as EIO on Linux
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break Ok(total),
            Err(e) => break Err(EvalError::StreamError(e.to_string())),
        }
    };

    forwarder.send(decoder.finish()).await;
    result
}

/// Sends output until the session goes away, then keeps quiet
struct Forwarder<'a> {
    outbox: &'a mpsc::Sender<StreamMessage>,
    connected: bool,
}

impl<'a> Forwarder<'a> {
    fn new(outbox: &'a mpsc::Sender<StreamMessage>) -> Self {
        Self {
            outbox,
            connected: true,
        }
    }

    async fn send(&mut self, text: String) {
        if text.is_empty() || !self.connected {
            return;
        }
        if self.outbox.send(StreamMessage::Output(text)).await.is_err() {
            warn!("Session closed, discarding remaining output");
            self.connected = false;
        }
    }
}

/// Decodes chunked bytes as UTF-8, holding back a character split across reads
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let keep = incomplete_tail(&self.pending);
        let ready = self.pending.len() - keep;
        let text = String::from_utf8_lossy(&self.pending[..ready]).into_owned();
        self.pending.drain(..ready);
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing, not yet complete, multi-byte sequence
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}
