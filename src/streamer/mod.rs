//! Framed message pipe over a [`BinInterface`].
//!
//! Outbound items are serialised on enqueue into two FIFOs (control ahead of
//! file data) and drained under a token-bucket budget; a packet the
//! interface could not take completely is retried byte-identically on the
//! next tick. Inbound bytes run through a resumable two-phase parser: base
//! header first, then the announced remainder, then the codec.

mod item;
mod rates;

pub use item::{pkt_total_len, ItemClass, NetItem, PktHeader, Serialiser, PKT_BASE_SIZE, PKT_MAX_SIZE};
pub use rates::STREAM_ABS_MAX;

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::bio::BinInterface;
use crate::clock::Clock;
use crate::notify::{HeardFrom, Notify, SysMessageKind};

use rates::RateStat;

/// Tail reads that may stall on back-pressure before the link is declared
/// broken.
const MAX_FAILED_READ_ATTEMPTS: u32 = 2000;

/// Where the resumable inbound parser picks up on the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    Initial,
    HeaderRead,
}

/// Framed, rate-limited message pipe to one peer.
///
/// A single ticker drives [`tick`](Self::tick); [`send_item`](Self::send_item)
/// and [`get_item`](Self::get_item) may be called from any thread.
pub struct Streamer<S: Serialiser> {
    serialiser: S,
    peer_id: String,
    clock: Arc<dyn Clock>,
    notify: Arc<dyn Notify>,
    heard_from: Option<HeardFrom>,
    keep_bio_open: bool,

    io: Mutex<IoState>,
    queues: Mutex<Queues<S::Item>>,
}

/// Ticker-side state: the interface itself plus the resumable reader.
struct IoState {
    bio: Box<dyn BinInterface>,
    pkt_rpending: Vec<u8>,
    reading_state: ReadPhase,
    failed_read_attempts: u32,
    rates: RateStat,
}

/// Producer/consumer-side state.
struct Queues<I> {
    out_ctrl: VecDeque<Bytes>,
    out_data: VecDeque<Bytes>,
    pkt_wpending: Option<Bytes>,
    incoming: VecDeque<I>,
}

impl<S: Serialiser> Streamer<S> {
    pub fn new(
        serialiser: S,
        bio: Box<dyn BinInterface>,
        peer_id: impl Into<String>,
        clock: Arc<dyn Clock>,
        notify: Arc<dyn Notify>,
    ) -> Self {
        let now = clock.now();
        let max_size = serialiser.max_size();
        Self {
            serialiser,
            peer_id: peer_id.into(),
            clock,
            notify,
            heard_from: None,
            keep_bio_open: false,
            io: Mutex::new(IoState {
                bio,
                // allocated once, reused for every inbound packet
                pkt_rpending: vec![0u8; max_size],
                reading_state: ReadPhase::Initial,
                failed_read_attempts: 0,
                rates: RateStat::new(now),
            }),
            queues: Mutex::new(Queues {
                out_ctrl: VecDeque::new(),
                out_data: VecDeque::new(),
                pkt_wpending: None,
                incoming: VecDeque::new(),
            }),
        }
    }

    /// Installs the liveness callback fired for every parsed inbound item.
    pub fn set_heard_from(&mut self, cb: HeardFrom) {
        self.heard_from = Some(cb);
    }

    /// Leaves the interface open on drop. For harnesses that own the
    /// interface lifecycle themselves.
    pub fn set_keep_bio_open(&mut self, keep: bool) {
        self.keep_bio_open = keep;
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Serialises `item` and queues it for transmission. Serialisation
    /// failures are logged and swallowed; the pipe stays usable.
    pub fn send_item(&self, item: S::Item) {
        let size = self.serialiser.size(&item);
        let mut buf = vec![0u8; size];
        match self.serialiser.serialise(&item, &mut buf) {
            Ok(len) if len <= size => {
                buf.truncate(len);
                let mut queues = self.queues();
                match item.class() {
                    ItemClass::FileData => queues.out_data.push_back(Bytes::from(buf)),
                    ItemClass::Control => queues.out_ctrl.push_back(Bytes::from(buf)),
                }
            }
            Ok(len) => {
                log::warn!(
                    target: "peernet/streamer",
                    "serialiser wrote {len} bytes into a {size} byte packet, dropping item"
                );
            }
            Err(e) => {
                log::warn!(target: "peernet/streamer", "failed to serialise outbound item: {e}");
            }
        }
    }

    /// Takes the next fully parsed inbound item, if any.
    pub fn get_item(&self) -> Option<S::Item> {
        self.queues().incoming.pop_front()
    }

    /// One scheduling pass over the interface. Returns `true` while queued
    /// work remains.
    pub fn tick(&self) -> bool {
        let mut io = self.io();
        io.bio.tick();

        if !io.bio.isactive() {
            return false;
        }

        self.handleincoming(&mut io);
        self.handleoutgoing(&mut io);
        drop(io);

        let queues = self.queues();
        !queues.incoming.is_empty() || !queues.out_ctrl.is_empty() || !queues.out_data.is_empty()
    }

    /// Sets the budget of one direction in kB/s; `0` lifts the limit.
    pub fn set_max_rate(&self, inbound: bool, kb_per_s: f64) {
        let mut io = self.io();
        if inbound {
            io.rates.read.max_rate = kb_per_s;
        } else {
            io.rates.sent.max_rate = kb_per_s;
        }
    }

    pub fn max_rate(&self, inbound: bool) -> f64 {
        let io = self.io();
        if inbound {
            io.rates.read.max_rate
        } else {
            io.rates.sent.max_rate
        }
    }

    /// Published EWMA throughput of one direction in kB/s.
    pub fn rate(&self, inbound: bool) -> f64 {
        let io = self.io();
        if inbound {
            io.rates.read.rate
        } else {
            io.rates.sent.rate
        }
    }

    /// Lifetime byte totals as (read, sent).
    pub fn totals(&self) -> (u64, u64) {
        let io = self.io();
        (io.rates.read.total, io.rates.sent.total)
    }

    /// Serialised bytes waiting in the outbound queues.
    pub fn queued_bytes(&self) -> usize {
        let queues = self.queues();
        queues.out_ctrl.iter().map(Bytes::len).sum::<usize>()
            + queues.out_data.iter().map(Bytes::len).sum::<usize>()
            + queues.pkt_wpending.as_ref().map_or(0, Bytes::len)
    }

    /// Logs a one-line traffic summary.
    pub fn status(&self) {
        let (read, sent) = self.totals();
        log::debug!(
            target: "peernet/streamer",
            "{}: {read}B in / {sent}B out, {}B queued",
            self.peer_id,
            self.queued_bytes()
        );
    }

    /// Drains the outbound queues under the token-bucket budget, control
    /// packets first. An inactive interface clears everything queued.
    fn handleoutgoing(&self, io: &mut IoState) {
        let now = self.clock.now();
        let mut queues = self.queues();

        if !io.bio.isactive() {
            let dropped = queues.out_ctrl.len()
                + queues.out_data.len()
                + usize::from(queues.pkt_wpending.is_some());
            if dropped > 0 {
                log::debug!(
                    target: "peernet/streamer",
                    "{}: link inactive, clearing {dropped} queued packets",
                    self.peer_id
                );
            }
            queues.out_ctrl.clear();
            queues.out_data.clear();
            queues.pkt_wpending = None;

            let limited = io.bio.bandwidth_limited();
            io.rates.update_averages(now, limited);
            return;
        }

        let limited = io.bio.bandwidth_limited();
        let maxbytes = io.rates.sent.allowed(now, limited);
        let mut sentbytes = 0usize;

        loop {
            if !io.bio.cansend() || sentbytes > maxbytes {
                break;
            }

            if queues.pkt_wpending.is_none() {
                queues.pkt_wpending = queues
                    .out_ctrl
                    .pop_front()
                    .or_else(|| queues.out_data.pop_front());
            }
            let Some(pkt) = queues.pkt_wpending.clone() else {
                break;
            };

            match io.bio.senddata(&pkt) {
                Ok(n) if n == pkt.len() => {
                    queues.pkt_wpending = None;
                    sentbytes += n;
                }
                Ok(n) => {
                    // short write: exactly the same bytes go out next tick
                    log::debug!(
                        target: "peernet/streamer",
                        "short write {n}/{}B, packet kept pending",
                        pkt.len()
                    );
                    break;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!(
                        target: "peernet/streamer",
                        "send failed, retrying next tick: {e}"
                    );
                    break;
                }
            }
        }

        io.rates.sent.consumed(sentbytes);
        io.rates.update_averages(now, limited);
    }

    /// Pulls complete packets off the interface under the inbound budget,
    /// resuming a partially read packet where the previous tick stopped.
    fn handleincoming(&self, io: &mut IoState) {
        let now = self.clock.now();

        if !io.bio.isactive() {
            io.reading_state = ReadPhase::Initial;
            return;
        }

        let limited = io.bio.bandwidth_limited();
        let maxin = io.rates.read.allowed(now, limited);
        let mut readbytes = 0usize;

        let IoState {
            bio,
            pkt_rpending,
            reading_state,
            failed_read_attempts,
            ..
        } = io;

        let maxlen = pkt_rpending.len();
        let blen = PKT_BASE_SIZE;

        loop {
            if *reading_state == ReadPhase::Initial {
                pkt_rpending[..blen].fill(0);
                match bio.readdata(&mut pkt_rpending[..blen]) {
                    Ok(n) if n == blen => {
                        readbytes += blen;
                        *reading_state = ReadPhase::HeaderRead;
                        *failed_read_attempts = 0;
                    }
                    // clean end of stream
                    Ok(0) => break,
                    Ok(n) => {
                        log::warn!(
                            target: "peernet/streamer",
                            "incomplete base header read of {n}B"
                        );
                        break;
                    }
                    // blocked or back-pressured, retry next tick
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }

            let total = pkt_total_len(&pkt_rpending[..blen]);
            if total < blen || total > maxlen {
                let msg = format!(
                    "peer announced a {total}B packet (limit {maxlen}B); \
                     usually caused by an incompatible version"
                );
                log::warn!(target: "peernet/streamer", "{}: {msg}", self.peer_id);
                self.notify
                    .sys_message(SysMessageKind::Warning, "Bad packet read", &msg);
                bio.close();
                *reading_state = ReadPhase::Initial;
                *failed_read_attempts = 0;
                break;
            }

            let extralen = total - blen;
            if extralen > 0 {
                pkt_rpending[blen..total].fill(0);
                match bio.readdata(&mut pkt_rpending[blen..total]) {
                    Ok(n) if n == extralen => {
                        readbytes += extralen;
                        *failed_read_attempts = 0;
                    }
                    _ => {
                        // flow control can stall the tail for a long time;
                        // only a bounded number of attempts separates that
                        // from a broken peer
                        *failed_read_attempts += 1;
                        if *failed_read_attempts > MAX_FAILED_READ_ATTEMPTS {
                            let msg = format!(
                                "could not complete a {total}B packet after \
                                 {MAX_FAILED_READ_ATTEMPTS} attempts"
                            );
                            log::warn!(target: "peernet/streamer", "{}: {msg}", self.peer_id);
                            self.notify.sys_message(
                                SysMessageKind::Warning,
                                "Error completing read",
                                &msg,
                            );
                            bio.close();
                            *reading_state = ReadPhase::Initial;
                            *failed_read_attempts = 0;
                        }
                        break;
                    }
                }
            }

            match self.serialiser.deserialise(&pkt_rpending[..total]) {
                Ok(mut item) => {
                    item.set_peer_id(&self.peer_id);
                    self.queues().incoming.push_back(item);
                    if let Some(cb) = &self.heard_from {
                        cb(&self.peer_id);
                    }
                    log::trace!(target: "peernet/streamer", "read a {total}B packet");
                }
                Err(e) => {
                    // framing already advanced past the bad packet, so the
                    // link itself stays up
                    log::warn!(
                        target: "peernet/streamer",
                        "{}: failed to deserialise a {total}B packet: {e}",
                        self.peer_id
                    );
                }
            }
            *reading_state = ReadPhase::Initial;
            *failed_read_attempts = 0;

            if readbytes >= maxin || !bio.moretoread() {
                break;
            }
        }

        io.rates.read.consumed(readbytes);
    }

    fn io(&self) -> MutexGuard<'_, IoState> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queues(&self) -> MutexGuard<'_, Queues<S::Item>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Serialiser> Drop for Streamer<S> {
    fn drop(&mut self) {
        if !self.keep_bio_open {
            self.io
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .bio
                .close();
        }
    }
}
