/// Connection state of a [`TcpStream`](super::TcpStream).
///
/// The discriminants are ordered so that everything below `Established` is a
/// connection attempt in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum TcpState {
    #[default]
    Closed = 0,
    Listen = 1,
    SynSent = 2,
    SynRcvd = 3,
    Established = 4,
    FinWait1 = 5,
    FinWait2 = 6,
    Closing = 7,
    CloseWait = 8,
    LastAck = 9,
    TimedWait = 10,
}

/// Half-space sequence comparison: `tst` is older than `curr` iff it lies in
/// the 2^31-wide window behind it, modulo wrap.
pub(super) fn seq_older(tst: u32, curr: u32) -> bool {
    (tst.wrapping_sub(curr) as i32) < 0
}
