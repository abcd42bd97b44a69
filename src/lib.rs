//! Networking core of a peer-to-peer file/chat application.
//!
//! The crate layers a reliable, ordered, bidirectional byte stream on top of
//! plain UDP datagrams and runs a framed message pipe over that stream:
//!
//! - [`tcp::TcpStream`] is a TCP-workalike: connection state machine, cumulative
//!   acknowledgements, retransmission with Karn backoff, Jacobson RTT
//!   estimation, slow-start/additive-increase congestion control and
//!   receiver-advertised flow control, all carried over a [`udp::UdpLink`].
//! - [`bio::BinInterface`] is the byte-stream facade the upper layer consumes;
//!   [`bio::BinTcp`] implements it over a `TcpStream`.
//! - [`streamer::Streamer`] frames application items into length-prefixed
//!   packets, with per-direction token-bucket rate limiting and EWMA rate
//!   statistics.
//!
//! Nothing here blocks. A single ticker task is expected to call `tick()` at a
//! millisecond-scale cadence; producers and consumers may touch the item
//! queues from other threads.

pub mod bio;
pub mod clock;
pub mod notify;
pub mod streamer;
pub mod tcp;
pub mod udp;

pub use bio::{BinInterface, BinTcp};
pub use clock::{Clock, ManualClock, SystemClock};
pub use notify::{HeardFrom, Notify, NullNotify, SysMessageKind};
pub use streamer::{ItemClass, NetItem, Serialiser, Streamer};
pub use tcp::{TcpConfig, TcpState, TcpStatus, TcpStream};
pub use udp::{UdpDispatch, UdpLink};
