use std::io::Result;
use std::sync::Arc;

use crate::tcp::TcpStream;

/// Byte-stream facade the framing layer runs over.
///
/// Implementations are non-blocking: `senddata`/`readdata` report
/// [`WouldBlock`](std::io::ErrorKind::WouldBlock) instead of waiting.
///
/// `senddata` carries exact-retry semantics: after a would-block or a short
/// write the *same* bytes must be offered again from offset 0 on the next
/// attempt. Encrypted transports reject a shifted buffer on retry, so the
/// caller keeps the whole packet around until it went out completely.
pub trait BinInterface: Send {
    /// Drives the underlying transport's timers.
    fn tick(&mut self);

    /// Writes `buf`. Returns the byte count accepted; see the exact-retry
    /// note above for anything short of `buf.len()`.
    fn senddata(&mut self, buf: &[u8]) -> Result<usize>;

    /// Reads exactly `buf.len()` bytes or fails with `WouldBlock`.
    /// `Ok(0)` signals a clean end of stream.
    fn readdata(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Whether the stream can currently carry bytes in either direction.
    fn isactive(&self) -> bool;

    /// Whether the send side will accept more bytes right now.
    fn cansend(&self) -> bool;

    /// Whether buffered inbound bytes are waiting.
    fn moretoread(&self) -> bool;

    /// Whether traffic over this interface counts against rate budgets.
    fn bandwidth_limited(&self) -> bool;

    fn close(&mut self);
}

/// [`BinInterface`] over a [`TcpStream`].
///
/// The stream should run with `no_partial_read` enabled so `readdata` is
/// exact-or-would-block, which the framing layer depends on.
pub struct BinTcp {
    stream: Arc<TcpStream>,
}

impl BinTcp {
    pub fn new(stream: Arc<TcpStream>) -> Self {
        Self { stream }
    }

    pub fn stream(&self) -> &Arc<TcpStream> {
        &self.stream
    }
}

impl BinInterface for BinTcp {
    fn tick(&mut self) {
        self.stream.tick();
    }

    fn senddata(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf)
    }

    fn readdata(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf)
    }

    fn isactive(&self) -> bool {
        self.stream.is_active()
    }

    fn cansend(&self) -> bool {
        self.stream.write_allowed().map_or(false, |n| n > 0)
    }

    fn moretoread(&self) -> bool {
        self.stream.read_pending().map_or(false, |n| n > 0)
    }

    fn bandwidth_limited(&self) -> bool {
        true
    }

    fn close(&mut self) {
        self.stream.close();
    }
}
