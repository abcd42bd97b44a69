//! Reliable ordered byte stream carried over UDP datagrams.
//!
//! The protocol is TCP-shaped but runs its own 16 byte pseudo-header over a
//! plain datagram link: three-way handshake, cumulative acknowledgements,
//! go-back retransmission with Karn backoff, Jacobson RTT estimation,
//! slow-start/additive-increase congestion control and a receiver-advertised
//! flow-control window. It is driven entirely by [`TcpStream::tick`] plus the
//! [`TcpStream::recv_pkt`] datagram callback; no call ever blocks.

mod config;
mod pkt;
mod types;

pub use config::{
    TcpConfig, TCP_ALIVE_TIMEOUT, TCP_DEFAULT_FIREWALL_TTL, TCP_MAX_WIN, TCP_NO_PKT_TIMEOUT,
    TCP_RETRANS_TIMEOUT, TCP_STD_TTL,
};
pub use pkt::{TcpFlags, TcpPacket, MAX_SEG, TCP_PSEUDO_HDR_SIZE};
pub use types::TcpState;

use types::seq_older;

use std::collections::VecDeque;
use std::fmt::Display;
use std::io::{Error, ErrorKind, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::Clock;
use crate::udp::UdpLink;

/// Cap on the segment queues and the reorder buffer.
const MAX_QUEUE_SIZE: usize = 100;

/// Smoothing factor of the Jacobson RTT estimator.
const RTT_ALPHA: f64 = 0.875;

/// Consecutive unchanged observations before a direction counts as idle.
const IDLE_CHECKS: u32 = 100;

fn gen_sequence_no() -> u32 {
    rand::random()
}

/// A reliable, ordered, bidirectional byte stream to a single remote peer.
///
/// One mutex guards all connection state; every public method as well as the
/// datagram ingress callback returns immediately with either progress or
/// [`ErrorKind::WouldBlock`].
pub struct TcpStream {
    inner: Mutex<Inner>,
}

struct Inner {
    udp: Arc<dyn UdpLink>,
    clock: Arc<dyn Clock>,
    cfg: TcpConfig,

    state: TcpState,
    in_stream_active: bool,
    out_stream_active: bool,
    error_state: Option<ErrorKind>,

    peer_addr: SocketAddr,
    peer_known: bool,

    // send side
    out_seqno: u32,
    out_acked: u32,
    out_win_size: u32,
    init_our_seqno: u32,
    in_data: Vec<u8>,             // partial tail below one segment
    in_queue: VecDeque<Vec<u8>>,  // full segments awaiting transmission
    out_pkt: VecDeque<TcpPacket>, // sent but unacknowledged

    // receive side
    in_ackno: u32,
    in_win_size: u32,
    init_peer_seqno: u32,
    in_pkt: VecDeque<TcpPacket>, // arrivals awaiting in-order processing
    out_data_net: Vec<u8>,       // reassembly tail
    out_queue: VecDeque<Vec<u8>>, // full segments ready for the reader
    out_data_read: Vec<u8>,      // partial leading buffer

    // congestion
    congest_win_size: u32,
    congest_threshold: u32,
    congest_update: u32,

    // timing
    rtt_est: f64,
    rtt_dev: f64,
    retrans_timeout: f64,
    keepalive_timer: f64,
    last_incoming_pkt: f64,
    ttl_end: f64,
    ttl: u8,

    last_sent_ack: u32,
    last_sent_winsize: u32,

    // idle detection
    last_write_tf: u32,
    last_read_tf: u32,
    wcount: u32,
    rcount: u32,
}

impl TcpStream {
    pub fn new(udp: Arc<dyn UdpLink>, clock: Arc<dyn Clock>, cfg: TcpConfig) -> Self {
        let now = clock.now();
        Self {
            inner: Mutex::new(Inner {
                udp,
                clock,

                state: TcpState::Closed,
                in_stream_active: false,
                out_stream_active: false,
                error_state: None,

                peer_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
                peer_known: false,

                out_seqno: 0,
                out_acked: 0,
                out_win_size: 0,
                init_our_seqno: 0,
                in_data: Vec::new(),
                in_queue: VecDeque::new(),
                out_pkt: VecDeque::new(),

                in_ackno: 0,
                in_win_size: 0,
                init_peer_seqno: 0,
                in_pkt: VecDeque::new(),
                out_data_net: Vec::new(),
                out_queue: VecDeque::new(),
                out_data_read: Vec::new(),

                congest_win_size: MAX_SEG as u32,
                congest_threshold: cfg.max_win_size,
                congest_update: 0,

                rtt_est: cfg.initial_rtt,
                rtt_dev: 0.0,
                retrans_timeout: cfg.initial_rtt,
                keepalive_timer: now,
                last_incoming_pkt: now,
                ttl_end: 0.0,
                ttl: cfg.init_ttl,

                last_sent_ack: 0,
                last_sent_winsize: 0,

                last_write_tf: 0,
                last_read_tf: 0,
                wcount: 0,
                rcount: 0,

                cfg,
            }),
        }
    }

    /// Starts an active open towards `peer`.
    ///
    /// Valid from `Closed` (or while armed via [`listen_for`]); the handshake
    /// proceeds on subsequent ticks. Returns [`ErrorKind::WouldBlock`] while
    /// the connection is in progress and `Ok(())` once established.
    ///
    /// `conn_period_secs` bounds the window during which SYN retransmissions
    /// keep a firewall-friendly TTL before ramping back up to the standard
    /// one.
    ///
    /// [`listen_for`]: Self::listen_for
    pub fn connect(&self, peer: SocketAddr, conn_period_secs: u32) -> Result<()> {
        let mut tcp = self.lock();
        tcp.set_remote_address(peer);

        match tcp.state {
            TcpState::Closed | TcpState::Listen => {}
            TcpState::Established => return Ok(()),
            s if s < TcpState::Established => {
                return Err(tcp.fail(ErrorKind::WouldBlock, "connection in progress"));
            }
            _ => return Err(tcp.fail(ErrorKind::Other, "connection is closing")),
        }

        let now = tcp.clock.now();
        tcp.out_seqno = gen_sequence_no();
        tcp.init_our_seqno = tcp.out_seqno;
        tcp.out_acked = tcp.out_seqno;
        tcp.in_win_size = tcp.cfg.max_win_size;

        tcp.congest_threshold = tcp.cfg.max_win_size;
        tcp.congest_win_size = MAX_SEG as u32;
        tcp.congest_update = tcp.out_acked.wrapping_add(tcp.congest_win_size);

        tcp.ttl = tcp.cfg.init_ttl;
        tcp.ttl_end = now + f64::from(conn_period_secs);
        tcp.last_incoming_pkt = now;

        let mut syn = TcpPacket::new();
        syn.flags.syn = true;
        tcp.to_send(syn);

        tcp.state = TcpState::SynSent;
        log::debug!(target: "peernet/tcp", "connect {peer}: state => SynSent");
        Err(tcp.fail(ErrorKind::WouldBlock, "connection in progress"))
    }

    /// Arms a passive open: only datagrams from `peer` will be answered.
    pub fn listen_for(&self, peer: SocketAddr) -> Result<()> {
        let mut tcp = self.lock();
        tcp.set_remote_address(peer);

        match tcp.state {
            TcpState::Closed | TcpState::Listen => {
                tcp.state = TcpState::Listen;
                tcp.last_incoming_pkt = tcp.clock.now();
                Ok(())
            }
            TcpState::Established => Ok(()),
            s if s < TcpState::Established => {
                Err(tcp.fail(ErrorKind::WouldBlock, "connection in progress"))
            }
            _ => Err(tcp.fail(ErrorKind::Other, "connection is closing")),
        }
    }

    /// Appends bytes to the send pipeline.
    ///
    /// Small writes accumulate in a partial buffer; anything filling a
    /// segment is cut into the transmission queue. Fails with
    /// [`ErrorKind::WouldBlock`] below `Established` or when the queue is
    /// full, [`ErrorKind::BrokenPipe`] once the stream or its write side is
    /// closed.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut tcp = self.lock();

        if tcp.state == TcpState::Closed {
            return Err(tcp.fail(ErrorKind::BrokenPipe, "stream closed"));
        } else if tcp.state < TcpState::Established {
            return Err(tcp.fail(ErrorKind::WouldBlock, "not yet connected"));
        } else if tcp.in_queue.len() >= MAX_QUEUE_SIZE {
            return Err(tcp.fail(ErrorKind::WouldBlock, "send queue full"));
        } else if !tcp.out_stream_active {
            return Err(tcp.fail(ErrorKind::BrokenPipe, "write side closed"));
        }

        if buf.len() + tcp.in_data.len() < MAX_SEG {
            tcp.in_data.extend_from_slice(buf);
            return Ok(buf.len());
        }

        // cut full segments, starting with the accumulated tail
        let lead = MAX_SEG - tcp.in_data.len();
        let mut seg = std::mem::take(&mut tcp.in_data);
        seg.extend_from_slice(&buf[..lead]);
        tcp.in_queue.push_back(seg);

        let mut rem = &buf[lead..];
        while rem.len() >= MAX_SEG {
            tcp.in_queue.push_back(rem[..MAX_SEG].to_vec());
            rem = &rem[MAX_SEG..];
        }
        tcp.in_data = rem.to_vec();

        Ok(buf.len())
    }

    /// Copies up to `buf.len()` received bytes.
    ///
    /// Returns `Ok(0)` only after a clean remote close with all data drained;
    /// [`ErrorKind::WouldBlock`] when nothing is buffered on a live stream
    /// (or, with `no_partial_read`, when the buffer cannot be filled);
    /// [`ErrorKind::BrokenPipe`] once fully closed.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut tcp = self.lock();

        let maxread = tcp.int_read_pending();
        if tcp.state == TcpState::Closed {
            return Err(tcp.fail(ErrorKind::BrokenPipe, "stream closed"));
        } else if tcp.state < TcpState::Established {
            return Err(tcp.fail(ErrorKind::WouldBlock, "not yet connected"));
        } else if maxread == 0 {
            if !tcp.in_stream_active {
                return Ok(0);
            }
            return Err(tcp.fail(ErrorKind::WouldBlock, "no data buffered"));
        }

        let mut size = buf.len();
        if maxread < size {
            if tcp.cfg.no_partial_read && tcp.in_stream_active {
                return Err(tcp.fail(ErrorKind::WouldBlock, "partial read suppressed"));
            }
            size = maxread;
        }

        let mut copied = 0;

        if !tcp.out_data_read.is_empty() {
            let k = size.min(tcp.out_data_read.len());
            buf[..k].copy_from_slice(&tcp.out_data_read[..k]);
            tcp.out_data_read.drain(..k);
            copied += k;
        }

        while copied < size {
            let Some(seg) = tcp.out_queue.pop_front() else {
                break;
            };
            let rem = size - copied;
            if rem >= seg.len() {
                buf[copied..copied + seg.len()].copy_from_slice(&seg);
                copied += seg.len();
            } else {
                buf[copied..size].copy_from_slice(&seg[..rem]);
                tcp.out_data_read = seg[rem..].to_vec();
                copied = size;
            }
        }

        if copied < size {
            let k = (size - copied).min(tcp.out_data_net.len());
            buf[copied..copied + k].copy_from_slice(&tcp.out_data_net[..k]);
            // whatever survives becomes the new leading buffer
            let rest = tcp.out_data_net.split_off(k);
            tcp.out_data_net.clear();
            tcp.out_data_read = rest;
            copied += k;
        }

        tcp.update_in_win_size();
        Ok(copied)
    }

    /// Graceful close: the write side shuts down and a FIN follows once the
    /// send queues drain. Reads stay valid until the peer closes too.
    pub fn close(&self) {
        let mut tcp = self.lock();
        match tcp.state {
            TcpState::Established | TcpState::CloseWait => {
                tcp.out_stream_active = false;
            }
            TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::LastAck
            | TcpState::TimedWait => {}
            _ => tcp.cleanup(),
        }
    }

    /// Aborts the connection with an RST and drops all queued data.
    pub fn reset(&self) {
        let mut tcp = self.lock();
        if tcp.peer_known && tcp.state > TcpState::Listen {
            let mut rst = TcpPacket::new();
            rst.flags.rst = true;
            tcp.to_send(rst);
        }
        tcp.cleanup();
    }

    /// Drives timers, retransmission and transmission. Must be called
    /// periodically.
    pub fn tick(&self) {
        let mut tcp = self.lock();
        tcp.recv_check();
        tcp.send_pass();
    }

    /// Datagram ingress callback, invoked by the UDP layer for packets from
    /// this stream's peer.
    pub fn recv_pkt(&self, buf: &[u8]) {
        let mut tcp = self.lock();
        if !tcp.peer_known {
            log::trace!(target: "peernet/tcp", "datagram before a peer was set, dropped");
            return;
        }
        match TcpPacket::read_wire(buf) {
            Ok(pkt) => {
                tcp.last_incoming_pkt = tcp.clock.now();
                tcp.handle_incoming(pkt);
            }
            Err(e) => {
                log::trace!(target: "peernet/tcp", "discarding undecodable datagram: {e}");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.lock().state == TcpState::Established
    }

    /// True while the stream can still carry bytes in either direction.
    pub fn is_active(&self) -> bool {
        self.lock().state >= TcpState::Established
    }

    pub fn state(&self) -> TcpState {
        self.lock().state
    }

    /// Kind of the most recent failure, for callers that poll instead of
    /// matching on returned errors.
    pub fn error_state(&self) -> Option<ErrorKind> {
        self.lock().error_state
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        let tcp = self.lock();
        tcp.peer_known.then_some(tcp.peer_addr)
    }

    /// Bytes the send pipeline will currently accept.
    pub fn write_allowed(&self) -> Result<usize> {
        let mut tcp = self.lock();
        if tcp.state == TcpState::Closed {
            return Err(tcp.fail(ErrorKind::BrokenPipe, "stream closed"));
        } else if tcp.state < TcpState::Established {
            return Err(tcp.fail(ErrorKind::WouldBlock, "not yet connected"));
        } else if !tcp.out_stream_active {
            return Err(tcp.fail(ErrorKind::BrokenPipe, "write side closed"));
        }
        Ok(MAX_QUEUE_SIZE.saturating_sub(tcp.in_queue.len()) * MAX_SEG)
    }

    /// Bytes buffered for the reader.
    pub fn read_pending(&self) -> Result<usize> {
        let mut tcp = self.lock();
        let pending = tcp.int_read_pending();
        if tcp.state == TcpState::Closed {
            return Err(tcp.fail(ErrorKind::BrokenPipe, "stream closed"));
        } else if tcp.state < TcpState::Established {
            return Err(tcp.fail(ErrorKind::WouldBlock, "not yet connected"));
        }
        Ok(pending)
    }

    /// Total payload bytes accepted for transmission over the stream's life.
    pub fn wbytes(&self) -> u32 {
        self.lock().int_wbytes()
    }

    /// Total payload bytes delivered in order over the stream's life.
    pub fn rbytes(&self) -> u32 {
        self.lock().int_rbytes()
    }

    /// Debounced write-idle detection.
    pub fn widle(&self) -> bool {
        let mut tcp = self.lock();
        if tcp.last_write_tf == 0 {
            tcp.last_write_tf = tcp.int_wbytes();
            return false;
        }
        if tcp.last_write_tf == tcp.int_wbytes()
            && tcp.in_data.is_empty()
            && tcp.in_queue.is_empty()
        {
            tcp.wcount += 1;
            return tcp.wcount > IDLE_CHECKS;
        }
        tcp.wcount = 0;
        tcp.last_write_tf = tcp.int_wbytes();
        false
    }

    /// Debounced read-idle detection.
    pub fn ridle(&self) -> bool {
        let mut tcp = self.lock();
        if tcp.last_read_tf == 0 {
            tcp.last_read_tf = tcp.int_rbytes();
            return false;
        }
        if tcp.last_read_tf == tcp.int_rbytes() && tcp.int_read_pending() == 0 {
            tcp.rcount += 1;
            return tcp.rcount > IDLE_CHECKS;
        }
        tcp.rcount = 0;
        tcp.last_read_tf = tcp.int_rbytes();
        false
    }

    /// Snapshot of the connection internals.
    pub fn status(&self) -> TcpStatus {
        let tcp = self.lock();
        TcpStatus {
            state: tcp.state,
            send_pending: tcp.in_data.len() + tcp.in_queue.len() * MAX_SEG,
            read_pending: tcp.int_read_pending(),
            unacked_pkts: tcp.out_pkt.len(),
            reorder_pkts: tcp.in_pkt.len(),
            out_seqno: tcp.out_seqno,
            out_acked: tcp.out_acked,
            out_win_size: tcp.out_win_size,
            in_ackno: tcp.in_ackno,
            in_win_size: tcp.in_win_size,
            congest_win_size: tcp.congest_win_size,
            congest_threshold: tcp.congest_threshold,
            rtt_est: tcp.rtt_est,
            retrans_timeout: tcp.retrans_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time view of a [`TcpStream`], for logging and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpStatus {
    pub state: TcpState,
    pub send_pending: usize,
    pub read_pending: usize,
    pub unacked_pkts: usize,
    pub reorder_pkts: usize,
    pub out_seqno: u32,
    pub out_acked: u32,
    pub out_win_size: u32,
    pub in_ackno: u32,
    pub in_win_size: u32,
    pub congest_win_size: u32,
    pub congest_threshold: u32,
    pub rtt_est: f64,
    pub retrans_timeout: f64,
}

impl Display for TcpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "state: {:?}", self.state)?;
        writeln!(
            f,
            "send: {} queued, {} unacked pkts, seqno {} acked {} win {}",
            self.send_pending, self.unacked_pkts, self.out_seqno, self.out_acked, self.out_win_size
        )?;
        writeln!(
            f,
            "recv: {} pending, {} reordering, ackno {} win {}",
            self.read_pending, self.reorder_pkts, self.in_ackno, self.in_win_size
        )?;
        write!(
            f,
            "congestion: win {} thresh {} rtt {:.3}s rto {:.3}s",
            self.congest_win_size, self.congest_threshold, self.rtt_est, self.retrans_timeout
        )
    }
}

impl Inner {
    fn fail(&mut self, kind: ErrorKind, msg: &'static str) -> Error {
        self.error_state = Some(kind);
        Error::new(kind, msg)
    }

    fn set_remote_address(&mut self, peer: SocketAddr) {
        if self.peer_known {
            if self.peer_addr != peer {
                log::warn!(
                    target: "peernet/tcp",
                    "ignoring peer address change {} -> {}",
                    self.peer_addr,
                    peer
                );
            }
            return;
        }
        self.peer_addr = peer;
        self.peer_known = true;
    }

    fn int_read_pending(&self) -> usize {
        self.out_data_read.len() + self.out_queue.len() * MAX_SEG + self.out_data_net.len()
    }

    fn int_wbytes(&self) -> u32 {
        self.out_seqno.wrapping_sub(self.init_our_seqno).wrapping_sub(1)
    }

    fn int_rbytes(&self) -> u32 {
        self.in_ackno.wrapping_sub(self.init_peer_seqno).wrapping_sub(1)
    }

    /// Stamps sequence, ack and window fields, serialises and transmits.
    /// Packets that consume sequence space stay on the unacked list.
    fn to_send(&mut self, mut pkt: TcpPacket) {
        if !self.peer_known {
            log::error!(target: "peernet/tcp", "dropping outbound packet, peer address unknown");
            return;
        }
        let now = self.clock.now();

        pkt.winsize = self.in_win_size;
        pkt.seqno = self.out_seqno;

        if !pkt.data.is_empty() {
            self.out_seqno = self.out_seqno.wrapping_add(pkt.data.len() as u32);
        }
        if pkt.flags.syn {
            // a SYN consumes one sequence number and never auto-acks
            self.out_seqno = self.out_seqno.wrapping_add(1);
        } else {
            if !pkt.flags.ack {
                pkt.set_ack(self.in_ackno);
            }
            if pkt.flags.fin {
                self.out_seqno = self.out_seqno.wrapping_add(1);
            }
        }

        // captured from the packet as serialised, not from intent
        self.last_sent_ack = pkt.ackno;
        self.last_sent_winsize = pkt.winsize;
        self.keepalive_timer = now;

        let mut wire = Vec::with_capacity(TCP_PSEUDO_HDR_SIZE + pkt.data.len());
        if let Err(e) = pkt.write_wire(&mut wire) {
            log::error!(target: "peernet/tcp", "packet serialisation failed: {e}");
            return;
        }
        match self.udp.send_pkt(&wire, self.peer_addr, self.ttl) {
            Ok(_) => log::trace!(
                target: "peernet/tcp",
                "sent seq {} [{}] {}B ack {} win {}",
                pkt.seqno,
                pkt.flags,
                pkt.data.len(),
                pkt.ackno,
                pkt.winsize
            ),
            Err(e) => log::trace!(target: "peernet/tcp", "udp send failed: {e}"),
        }

        if pkt.flags.syn || pkt.flags.fin || !pkt.data.is_empty() {
            pkt.ts = now;
            pkt.retrans = 0;
            self.out_pkt.push_back(pkt);
        }
    }

    fn send_ack(&mut self) {
        self.to_send(TcpPacket::new());
    }

    fn handle_incoming(&mut self, pkt: TcpPacket) {
        match self.state {
            TcpState::Closed | TcpState::Listen => self.incoming_closed(pkt),
            TcpState::SynSent => self.incoming_syn_sent(pkt),
            TcpState::SynRcvd => self.incoming_syn_rcvd(pkt),
            TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::CloseWait
            | TcpState::LastAck => self.incoming_established(pkt),
            TcpState::TimedWait => {
                // both sides are done, late packets just confirm that
                log::warn!(target: "peernet/tcp", "datagram in TimedWait, state => Closed");
                self.state = TcpState::Closed;
            }
        }
    }

    fn incoming_closed(&mut self, pkt: TcpPacket) {
        if !pkt.flags.syn || pkt.flags.ack {
            return;
        }

        self.init_peer_seqno = pkt.seqno;
        self.in_ackno = self.init_peer_seqno.wrapping_add(1);
        self.out_win_size = pkt.winsize;
        self.in_win_size = self.cfg.max_win_size;

        let mut rsp = TcpPacket::new();
        if self.state != TcpState::SynSent {
            // fresh passive open; from SynSent our own SYN is already in
            // flight (simultaneous open) and must not be repeated
            self.out_seqno = gen_sequence_no();
            self.init_our_seqno = self.out_seqno;
            self.out_acked = self.out_seqno;

            self.congest_threshold = self.cfg.max_win_size;
            self.congest_win_size = MAX_SEG as u32;
            self.congest_update = self.out_acked.wrapping_add(self.congest_win_size);

            rsp.flags.syn = true;
        }
        rsp.set_ack(self.in_ackno);

        // the peer reached us, so the path is open
        self.ttl = TCP_STD_TTL;
        self.to_send(rsp);

        self.state = TcpState::SynRcvd;
        log::debug!(target: "peernet/tcp", "state => SynRcvd");
    }

    fn incoming_syn_sent(&mut self, pkt: TcpPacket) {
        if pkt.flags.rst {
            log::debug!(target: "peernet/tcp", "reset while connecting");
            self.cleanup();
            return;
        }
        if pkt.flags.syn && pkt.flags.ack {
            if pkt.ackno != self.out_seqno {
                log::debug!(
                    target: "peernet/tcp",
                    "SYN+ACK with bad ack {} (expected {})",
                    pkt.ackno,
                    self.out_seqno
                );
                return;
            }

            self.init_peer_seqno = pkt.seqno;
            self.in_ackno = pkt.seqno.wrapping_add(1);
            self.out_win_size = pkt.winsize;
            self.out_acked = pkt.ackno;

            self.ttl = TCP_STD_TTL;
            self.send_ack();

            self.state = TcpState::Established;
            self.out_stream_active = true;
            self.in_stream_active = true;
            log::debug!(target: "peernet/tcp", "state => Established");
        } else {
            // bare SYN: simultaneous open
            self.incoming_closed(pkt);
        }
    }

    fn incoming_syn_rcvd(&mut self, pkt: TcpPacket) {
        if pkt.flags.rst {
            log::debug!(target: "peernet/tcp", "reset during handshake");
            self.cleanup();
            return;
        }
        if !pkt.flags.ack || pkt.ackno != self.out_seqno {
            return;
        }

        // If the handshake ACK was lost the peer may already be sending
        // data; re-process the packet below so its payload counts once.
        let ack_with_data = !pkt.data.is_empty();

        self.in_ackno = pkt.seqno;
        self.out_win_size = pkt.winsize;
        self.out_acked = pkt.ackno;

        self.ttl = TCP_STD_TTL;

        self.state = TcpState::Established;
        self.out_stream_active = true;
        self.in_stream_active = true;
        log::debug!(target: "peernet/tcp", "state => Established");

        if ack_with_data {
            self.incoming_established(pkt);
        }
    }

    fn incoming_established(&mut self, pkt: TcpPacket) {
        if pkt.flags.rst {
            log::debug!(target: "peernet/tcp", "reset by peer");
            self.cleanup();
            return;
        }

        let in_window = !seq_older(pkt.seqno, self.in_ackno)
            && seq_older(pkt.seqno, self.in_ackno.wrapping_add(self.cfg.max_win_size));
        if in_window {
            if pkt.flags.ack {
                self.out_acked = pkt.ackno;
            }
            self.out_win_size = pkt.winsize;
        } else {
            // duplicate or out-of-window, remind the peer where we are
            self.send_ack();
        }

        self.in_pkt.push_back(pkt);
        if self.in_pkt.len() > MAX_QUEUE_SIZE {
            self.in_pkt.pop_front();
        }

        self.drain_in_pkts();
    }

    /// Pulls in-order packets out of the reorder buffer, advancing the
    /// cumulative ack and feeding the read-side buffers.
    fn drain_in_pkts(&mut self) {
        loop {
            let mut found = None;
            let mut i = 0;
            while i < self.in_pkt.len() {
                if self.in_pkt[i].seqno == self.in_ackno {
                    found = self.in_pkt.remove(i);
                    break;
                } else if seq_older(self.in_pkt[i].seqno, self.in_ackno) {
                    self.in_pkt.remove(i);
                } else {
                    i += 1;
                }
            }
            let Some(pkt) = found else {
                return;
            };

            let consumed = pkt.data.len() as u32 + u32::from(pkt.flags.fin);
            self.in_ackno = pkt.seqno.wrapping_add(consumed);

            if pkt.flags.ack && seq_older(self.out_acked, pkt.ackno) {
                self.out_acked = pkt.ackno;
                self.out_win_size = pkt.winsize;
            }

            if self.out_data_net.len() + pkt.data.len() < MAX_SEG {
                self.out_data_net.extend_from_slice(&pkt.data);
            } else {
                let lead = MAX_SEG - self.out_data_net.len();
                let mut seg = std::mem::take(&mut self.out_data_net);
                seg.extend_from_slice(&pkt.data[..lead]);
                self.out_data_net = pkt.data[lead..].to_vec();

                if self.out_queue.len() >= MAX_QUEUE_SIZE {
                    // only a peer ignoring our advertised window gets here
                    log::warn!(target: "peernet/tcp", "read queue overflow, dropping oldest segment");
                    self.out_queue.pop_front();
                }
                self.out_queue.push_back(seg);
            }

            self.update_in_win_size();

            if pkt.flags.fin {
                self.send_ack();
                self.in_stream_active = false;

                match self.state {
                    TcpState::Established => {
                        self.state = TcpState::CloseWait;
                        log::debug!(target: "peernet/tcp", "state => CloseWait");
                    }
                    TcpState::FinWait1 => {
                        self.state = TcpState::Closing;
                        log::debug!(target: "peernet/tcp", "state => Closing");
                    }
                    TcpState::FinWait2 => {
                        log::debug!(target: "peernet/tcp", "state => TimedWait");
                        self.cleanup();
                    }
                    _ => {}
                }
            }

            if pkt.flags.ack && !self.out_stream_active && pkt.ackno == self.out_seqno {
                match self.state {
                    TcpState::FinWait1 => {
                        self.state = TcpState::FinWait2;
                        log::debug!(target: "peernet/tcp", "state => FinWait2");
                    }
                    TcpState::LastAck => {
                        log::debug!(target: "peernet/tcp", "FIN acked, state => Closed");
                        self.cleanup();
                    }
                    TcpState::Closing => {
                        log::debug!(target: "peernet/tcp", "state => TimedWait");
                        self.cleanup();
                    }
                    _ => {}
                }
            }

            if self.state == TcpState::Closed {
                return;
            }
        }
    }

    /// Re-advertises the receive window from the current buffer fill.
    fn update_in_win_size(&mut self) {
        let queued = self.int_read_pending().min(u32::MAX as usize) as u32;
        self.in_win_size = self.cfg.max_win_size.saturating_sub(queued);
    }

    /// Drops acknowledged packets off the unacked list, growing the
    /// congestion window and updating the RTT estimators as they go.
    fn acknowledge(&mut self) {
        let cts = self.clock.now();
        let mut update_rtt = true;

        while self
            .out_pkt
            .front()
            .map_or(false, |p| seq_older(p.seqno, self.out_acked))
        {
            let Some(pkt) = self.out_pkt.pop_front() else {
                break;
            };

            if !seq_older(self.out_acked, self.congest_update) {
                if self.congest_win_size < self.congest_threshold {
                    // slow start
                    self.congest_win_size *= 2;
                } else {
                    self.congest_win_size += MAX_SEG as u32;
                }
                if self.congest_win_size > self.cfg.max_win_size {
                    self.congest_win_size = self.cfg.max_win_size;
                }
                self.congest_update = self.out_acked.wrapping_add(self.congest_win_size);
            }

            // Karn: retransmitted packets and everything acked after them in
            // the same run cannot produce a valid RTT sample
            if pkt.retrans > 0 {
                update_rtt = false;
            }
            if update_rtt {
                let ack_time = cts - pkt.ts;
                self.rtt_est = RTT_ALPHA * self.rtt_est + (1.0 - RTT_ALPHA) * ack_time;
                self.rtt_dev =
                    RTT_ALPHA * self.rtt_dev + (1.0 - RTT_ALPHA) * (self.rtt_est - ack_time).abs();
                self.retrans_timeout = self.rtt_est + 4.0 * self.rtt_dev;
            }
        }

        if !update_rtt {
            // an acked retransmission clears the accumulated backoff,
            // otherwise repeated losses stall the stream entirely
            self.retrans_timeout = self.rtt_est + 4.0 * self.rtt_dev;
        }
    }

    /// Retransmits timed-out packets in order, applying the multiplicative
    /// congestion response once per pass.
    fn retrans(&mut self) {
        if !self.peer_known {
            return;
        }
        let cts = self.clock.now();
        let udp = Arc::clone(&self.udp);
        let mut update_congestion = true;
        let mut backed_off = false;

        let mut i = 0;
        while i < self.out_pkt.len() {
            if cts - self.out_pkt[i].ts <= self.retrans_timeout {
                i += 1;
                continue;
            }

            if update_congestion {
                self.congest_threshold = self.congest_win_size / 2;
                self.congest_win_size = MAX_SEG as u32;
                self.congest_update = self.out_acked.wrapping_add(self.congest_win_size);
                update_congestion = false;
            }

            if seq_older(
                self.out_acked.wrapping_add(self.congest_win_size),
                self.out_pkt[i].seqno,
            ) {
                // outside the shrunken window; packets are ordered, so the
                // rest of the list must wait too
                break;
            }

            let is_syn = self.out_pkt[i].flags.syn;
            if !is_syn {
                let ackno = self.in_ackno;
                self.out_pkt[i].set_ack(ackno);
                self.last_sent_ack = ackno;
            }
            let win = self.in_win_size;
            self.out_pkt[i].winsize = win;
            self.last_sent_winsize = win;
            self.keepalive_timer = cts;

            if is_syn && self.ttl < TCP_STD_TTL {
                // ramp outgoing stimulus through the firewall, then fall
                // back to a routable TTL
                if self.ttl_end > cts {
                    self.ttl = TCP_DEFAULT_FIREWALL_TTL;
                } else {
                    self.ttl += 1;
                }
                log::debug!(
                    target: "peernet/tcp",
                    "startup SYN retrans {} with ttl {}",
                    self.out_pkt[i].retrans,
                    self.ttl
                );
            }

            let excessive = (is_syn && self.out_pkt[i].retrans > self.cfg.max_syn_retransmit)
                || ((!is_syn || self.ttl == TCP_STD_TTL)
                    && self.out_pkt[i].retrans > self.cfg.max_pkt_retransmit);
            if excessive {
                log::debug!(target: "peernet/tcp", "retransmit cap exceeded, state => Closed");
                self.cleanup();
                return;
            }

            let mut wire = Vec::with_capacity(TCP_PSEUDO_HDR_SIZE + self.out_pkt[i].data.len());
            if self.out_pkt[i].write_wire(&mut wire).is_ok() {
                if let Err(e) = udp.send_pkt(&wire, self.peer_addr, self.ttl) {
                    log::trace!(target: "peernet/tcp", "udp send failed on retransmit: {e}");
                }
            }

            self.out_pkt[i].ts = cts;
            self.out_pkt[i].retrans += 1;
            backed_off = true;
            i += 1;
        }

        if backed_off {
            // Karn backoff, undone by acknowledge() on the next clean ack
            self.retrans_timeout *= 2.0;
        }
    }

    /// One transmission pass: reap acks, retransmit, then move queued
    /// segments onto the wire as far as the effective window allows.
    fn send_pass(&mut self) {
        self.acknowledge();
        self.retrans();

        if self.state < TcpState::Established {
            return;
        }

        let mut maxsend = self.congest_win_size.min(self.out_win_size);
        let in_transit = self.out_seqno.wrapping_sub(self.out_acked);
        maxsend = maxsend.saturating_sub(in_transit);

        let mut sent = false;
        while !self.in_queue.is_empty() && maxsend >= MAX_SEG as u32 {
            let Some(seg) = self.in_queue.pop_front() else {
                break;
            };
            maxsend -= MAX_SEG as u32;
            sent = true;
            self.to_send(TcpPacket::with_data(seg));
        }

        // the partial tail goes out alone once the queue is empty
        if !sent
            && self.in_queue.is_empty()
            && !self.in_data.is_empty()
            && maxsend >= self.in_data.len() as u32
        {
            let seg = std::mem::take(&mut self.in_data);
            sent = true;
            self.to_send(TcpPacket::with_data(seg));
        }

        if sent {
            return;
        }

        let cts = self.clock.now();
        let mut needs_ack = seq_older(self.last_sent_ack, self.in_ackno);

        // window reopen, doubling as a persist probe after a stall
        if (self.last_sent_winsize < MAX_SEG as u32 && self.in_win_size > MAX_SEG as u32)
            || (cts - self.keepalive_timer > self.retrans_timeout * 4.0
                && self.in_win_size > self.last_sent_winsize + 4 * MAX_SEG as u32)
        {
            needs_ack = true;
        }

        if cts - self.keepalive_timer > self.cfg.keepalive_timeout {
            needs_ack = true;
        }

        if !self.out_stream_active
            && self.in_queue.is_empty()
            && self.in_data.is_empty()
            && matches!(self.state, TcpState::Established | TcpState::CloseWait)
        {
            let mut fin = TcpPacket::new();
            fin.flags.fin = true;
            self.to_send(fin);

            match self.state {
                TcpState::Established => {
                    self.state = TcpState::FinWait1;
                    log::debug!(target: "peernet/tcp", "state => FinWait1");
                }
                TcpState::CloseWait => {
                    self.state = TcpState::LastAck;
                    log::debug!(target: "peernet/tcp", "state => LastAck");
                }
                _ => {}
            }
            return;
        }

        if needs_ack {
            self.send_ack();
        }
    }

    /// Tears the connection down when the peer has been silent past the
    /// idle limit; firewall mappings will be gone by then anyway.
    fn recv_check(&mut self) {
        if self.state > TcpState::SynRcvd
            && self.clock.now() - self.last_incoming_pkt > self.cfg.no_pkt_timeout
        {
            log::debug!(target: "peernet/tcp", "peer idle timeout, state => Closed");
            self.cleanup();
        }
    }

    /// Unconditional teardown: every queue is dropped and the state machine
    /// lands in `Closed`.
    fn cleanup(&mut self) {
        self.out_stream_active = false;
        self.in_stream_active = false;
        self.state = TcpState::Closed;
        self.ttl = TCP_STD_TTL;

        self.in_data.clear();
        self.in_queue.clear();
        self.out_pkt.clear();

        self.out_data_read.clear();
        self.out_data_net.clear();
        self.out_queue.clear();
        self.in_pkt.clear();

        log::debug!(target: "peernet/tcp", "state => Closed");
    }
}
