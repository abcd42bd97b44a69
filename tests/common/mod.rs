#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Cursor, Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use peernet::streamer::{ItemClass, NetItem, PktHeader, Serialiser, PKT_BASE_SIZE};
use peernet::{
    BinInterface, ManualClock, Notify, SysMessageKind, TcpConfig, TcpStream, UdpDispatch, UdpLink,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One datagram in flight.
pub struct Datagram {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: Vec<u8>,
}

pub type DropFn = Box<dyn FnMut(&Datagram) -> bool + Send>;

/// In-memory datagram medium with programmable loss.
#[derive(Default)]
pub struct Wire {
    queue: Mutex<VecDeque<Datagram>>,
    drop_fn: Mutex<Option<DropFn>>,
    sent: Mutex<usize>,
}

impl Wire {
    /// Installs a predicate; datagrams it returns `true` for are lost.
    pub fn set_drop_fn(&self, f: DropFn) {
        *lock(&self.drop_fn) = Some(f);
    }

    pub fn clear_drop_fn(&self) {
        *lock(&self.drop_fn) = None;
    }

    /// Datagrams offered to the wire so far, lost ones included.
    pub fn sent_count(&self) -> usize {
        *lock(&self.sent)
    }

    fn push(&self, dg: Datagram) {
        *lock(&self.sent) += 1;
        if let Some(f) = lock(&self.drop_fn).as_mut() {
            if f(&dg) {
                return;
            }
        }
        lock(&self.queue).push_back(dg);
    }

    /// Takes the oldest datagram off the wire without delivering it.
    pub fn pop(&self) -> Option<Datagram> {
        lock(&self.queue).pop_front()
    }
}

/// The sending half owned by one endpoint.
pub struct EndLink {
    wire: Arc<Wire>,
    local: SocketAddr,
}

impl UdpLink for EndLink {
    fn send_pkt(&self, buf: &[u8], peer: SocketAddr, _ttl: u8) -> io::Result<usize> {
        self.wire.push(Datagram {
            src: self.local,
            dst: peer,
            payload: buf.to_vec(),
        });
        Ok(buf.len())
    }
}

/// Two connected endpoints over a lossy in-memory wire under virtual time.
pub struct Pair {
    pub clock: Arc<ManualClock>,
    pub wire: Arc<Wire>,
    pub dispatch: UdpDispatch,
    pub a: Arc<TcpStream>,
    pub b: Arc<TcpStream>,
    pub a_addr: SocketAddr,
    pub b_addr: SocketAddr,
}

impl Pair {
    pub fn new() -> Self {
        Self::with_config(TcpConfig::default(), TcpConfig::default())
    }

    pub fn with_config(cfg_a: TcpConfig, cfg_b: TcpConfig) -> Self {
        let clock = Arc::new(ManualClock::new());
        let wire = Arc::new(Wire::default());
        let a_addr: SocketAddr = "10.0.0.1:7812".parse().unwrap();
        let b_addr: SocketAddr = "10.0.0.2:7812".parse().unwrap();

        let a = Arc::new(TcpStream::new(
            Arc::new(EndLink {
                wire: wire.clone(),
                local: a_addr,
            }),
            clock.clone(),
            cfg_a,
        ));
        let b = Arc::new(TcpStream::new(
            Arc::new(EndLink {
                wire: wire.clone(),
                local: b_addr,
            }),
            clock.clone(),
            cfg_b,
        ));

        let dispatch = UdpDispatch::new();
        // inbound routing is keyed by the datagram's source address
        dispatch.register(a_addr, &b);
        dispatch.register(b_addr, &a);

        Self {
            clock,
            wire,
            dispatch,
            a,
            b,
            a_addr,
            b_addr,
        }
    }

    /// Delivers everything currently on the wire, including datagrams
    /// generated in response.
    pub fn pump(&self) {
        while let Some(dg) = self.wire.pop() {
            self.dispatch.deliver(dg.src, &dg.payload);
        }
    }

    /// One scheduling round: both ends tick, the wire drains, time advances.
    pub fn step(&self, dt: f64) {
        self.a.tick();
        self.b.tick();
        self.pump();
        self.clock.advance(dt);
    }

    /// Runs the handshake to completion.
    pub fn connect(&self) {
        self.b.listen_for(self.a_addr).unwrap();
        let err = self.a.connect(self.b_addr, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);

        for _ in 0..10 {
            if self.a.is_connected() && self.b.is_connected() {
                return;
            }
            self.step(0.001);
        }
        panic!("handshake did not complete");
    }
}

// ---------------------------------------------------------------------------
// streamer fixtures

/// A plain application item: opaque payload plus a queueing class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestItem {
    pub peer: String,
    pub class: ItemClass,
    pub payload: Vec<u8>,
}

impl TestItem {
    pub fn control(payload: &[u8]) -> Self {
        Self {
            peer: String::new(),
            class: ItemClass::Control,
            payload: payload.to_vec(),
        }
    }

    pub fn file_data(payload: &[u8]) -> Self {
        Self {
            peer: String::new(),
            class: ItemClass::FileData,
            payload: payload.to_vec(),
        }
    }
}

impl NetItem for TestItem {
    fn peer_id(&self) -> &str {
        &self.peer
    }

    fn set_peer_id(&mut self, id: &str) {
        self.peer = id.to_string();
    }

    fn class(&self) -> ItemClass {
        self.class
    }
}

const SUBTYPE_CONTROL: u8 = 0x01;
const SUBTYPE_FILE_DATA: u8 = 0x02;

/// Codec for [`TestItem`]: base header, then the raw payload.
pub struct TestSerialiser {
    pub max: usize,
}

impl Default for TestSerialiser {
    fn default() -> Self {
        Self { max: 65536 }
    }
}

impl Serialiser for TestSerialiser {
    type Item = TestItem;

    fn size(&self, item: &TestItem) -> usize {
        PKT_BASE_SIZE + item.payload.len()
    }

    fn serialise(&self, item: &TestItem, buf: &mut [u8]) -> Result<usize> {
        let total = self.size(item);
        let hdr = PktHeader {
            version: 1,
            service: 0x0021,
            subtype: match item.class {
                ItemClass::Control => SUBTYPE_CONTROL,
                ItemClass::FileData => SUBTYPE_FILE_DATA,
            },
            length: total as u32,
        };
        let mut cursor = Cursor::new(&mut buf[..]);
        hdr.write_to(&mut cursor)?;
        buf[PKT_BASE_SIZE..total].copy_from_slice(&item.payload);
        Ok(total)
    }

    fn deserialise(&self, buf: &[u8]) -> Result<TestItem> {
        let hdr = PktHeader::read_from(buf)?;
        if hdr.length as usize != buf.len() {
            return Err(Error::new(ErrorKind::InvalidData, "length mismatch"));
        }
        let class = match hdr.subtype {
            SUBTYPE_CONTROL => ItemClass::Control,
            SUBTYPE_FILE_DATA => ItemClass::FileData,
            _ => return Err(Error::new(ErrorKind::InvalidData, "unknown subtype")),
        };
        Ok(TestItem {
            peer: String::new(),
            class,
            payload: buf[PKT_BASE_SIZE..].to_vec(),
        })
    }

    fn max_size(&self) -> usize {
        self.max
    }
}

/// Notification sink that records what it was told.
#[derive(Default)]
pub struct RecordingNotify {
    messages: Mutex<Vec<(SysMessageKind, String)>>,
}

impl RecordingNotify {
    pub fn messages(&self) -> Vec<(SysMessageKind, String)> {
        lock(&self.messages).clone()
    }
}

impl Notify for RecordingNotify {
    fn sys_message(&self, kind: SysMessageKind, title: &str, _msg: &str) {
        lock(&self.messages).push((kind, title.to_string()));
    }
}

#[derive(Default)]
pub struct FakeBioState {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub active: bool,
    pub limited: bool,
    pub closed: bool,
    pub block_writes: bool,
}

/// Scriptable [`BinInterface`] with exact-or-would-block reads.
#[derive(Clone, Default)]
pub struct FakeBio(pub Arc<Mutex<FakeBioState>>);

impl FakeBio {
    pub fn active() -> Self {
        let bio = Self::default();
        lock(&bio.0).active = true;
        bio
    }

    pub fn push_rx(&self, bytes: &[u8]) {
        lock(&self.0).rx.extend(bytes);
    }

    pub fn tx_len(&self) -> usize {
        lock(&self.0).tx.len()
    }

    pub fn take_tx(&self) -> Vec<u8> {
        std::mem::take(&mut lock(&self.0).tx)
    }

    pub fn closed(&self) -> bool {
        lock(&self.0).closed
    }

    pub fn set_limited(&self, limited: bool) {
        lock(&self.0).limited = limited;
    }

    pub fn set_block_writes(&self, block: bool) {
        lock(&self.0).block_writes = block;
    }
}

impl BinInterface for FakeBio {
    fn tick(&mut self) {}

    fn senddata(&mut self, buf: &[u8]) -> Result<usize> {
        let mut state = lock(&self.0);
        if state.block_writes {
            return Err(Error::from(ErrorKind::WouldBlock));
        }
        state.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn readdata(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut state = lock(&self.0);
        if state.rx.len() < buf.len() {
            return Err(Error::from(ErrorKind::WouldBlock));
        }
        for byte in buf.iter_mut() {
            *byte = state.rx.pop_front().unwrap();
        }
        Ok(buf.len())
    }

    fn isactive(&self) -> bool {
        let state = lock(&self.0);
        state.active && !state.closed
    }

    fn cansend(&self) -> bool {
        true
    }

    fn moretoread(&self) -> bool {
        !lock(&self.0).rx.is_empty()
    }

    fn bandwidth_limited(&self) -> bool {
        lock(&self.0).limited
    }

    fn close(&mut self) {
        lock(&self.0).closed = true;
    }
}
