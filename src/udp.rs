use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use fxhash::FxHashMap;

use crate::tcp::TcpStream;

/// Datagram underlay a [`TcpStream`] transmits through.
///
/// The transport needs nothing beyond fire-and-forget sends with a per-packet
/// TTL; inbound datagrams come back through [`UdpDispatch`].
pub trait UdpLink: Send + Sync {
    /// Sends one datagram to `peer`. Returns the number of bytes handed to
    /// the socket layer.
    fn send_pkt(&self, buf: &[u8], peer: SocketAddr, ttl: u8) -> io::Result<usize>;
}

/// Routes inbound datagrams to the stream registered for their source
/// address.
///
/// Each [`TcpStream`] talks to exactly one peer, so the source address is a
/// sufficient key. Registrations are weak; dead entries are pruned on the
/// next delivery attempt.
#[derive(Default)]
pub struct UdpDispatch {
    streams: Mutex<FxHashMap<SocketAddr, Weak<TcpStream>>>,
}

impl UdpDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `stream` as the receiver for datagrams from `peer`,
    /// replacing any previous registration for that address.
    pub fn register(&self, peer: SocketAddr, stream: &Arc<TcpStream>) {
        self.lock().insert(peer, Arc::downgrade(stream));
    }

    pub fn unregister(&self, peer: SocketAddr) {
        self.lock().remove(&peer);
    }

    /// Delivers one datagram. Returns `false` when no live stream is
    /// registered for `src`.
    pub fn deliver(&self, src: SocketAddr, buf: &[u8]) -> bool {
        let stream = {
            let mut streams = self.lock();
            match streams.get(&src).and_then(Weak::upgrade) {
                Some(stream) => Some(stream),
                None => {
                    streams.remove(&src);
                    None
                }
            }
        };

        match stream {
            Some(stream) => {
                stream.recv_pkt(buf);
                true
            }
            None => {
                log::trace!(target: "peernet/udp", "dropping datagram from unregistered peer {src}");
                false
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<SocketAddr, Weak<TcpStream>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
