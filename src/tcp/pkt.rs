use std::fmt::Display;
use std::io::{Cursor, Error, ErrorKind, Read};

use bytestream::{ByteOrder::BigEndian, StreamReader, StreamWriter};

/// Fixed preamble prepended to every datagram of the stream protocol.
pub const TCP_PSEUDO_HDR_SIZE: usize = 16;

/// Maximum payload bytes per datagram.
pub const MAX_SEG: usize = 1500 - TCP_PSEUDO_HDR_SIZE;

const FLAG_SYN: u8 = 0x01;
const FLAG_ACK: u8 = 0x02;
const FLAG_FIN: u8 = 0x04;
const FLAG_RST: u8 = 0x08;

/// One on-wire unit of the stream protocol.
///
/// `ts` and `retrans` are local retransmission bookkeeping and never leave
/// the host.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpPacket {
    pub seqno: u32,
    pub ackno: u32,
    pub winsize: u32,
    pub flags: TcpFlags,
    pub data: Vec<u8>,

    pub(super) ts: f64,
    pub(super) retrans: u32,
}

/// Flags of a [`TcpPacket`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

macro_rules! fimpl {
    ($i:ident) => {
        pub fn $i(mut self, value: bool) -> Self {
            self.$i = value;
            self
        }
    };
}

impl TcpFlags {
    pub fn new() -> Self {
        Self::default()
    }
    fimpl!(syn);
    fimpl!(ack);
    fimpl!(fin);
    fimpl!(rst);

    fn to_byte(self) -> u8 {
        let mut byte = 0u8;
        if self.syn {
            byte |= FLAG_SYN;
        }
        if self.ack {
            byte |= FLAG_ACK;
        }
        if self.fin {
            byte |= FLAG_FIN;
        }
        if self.rst {
            byte |= FLAG_RST;
        }
        byte
    }

    fn from_byte(byte: u8) -> Self {
        Self {
            syn: byte & FLAG_SYN != 0,
            ack: byte & FLAG_ACK != 0,
            fin: byte & FLAG_FIN != 0,
            rst: byte & FLAG_RST != 0,
        }
    }
}

impl Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.syn {
            write!(f, "SYN")?
        }
        if self.ack {
            write!(f, "ACK")?
        }
        if self.fin {
            write!(f, "FIN")?
        }
        if self.rst {
            write!(f, "RST")?
        }
        Ok(())
    }
}

impl TcpPacket {
    pub fn new() -> Self {
        Self {
            seqno: 0,
            ackno: 0,
            winsize: 0,
            flags: TcpFlags::new(),
            data: Vec::new(),
            ts: 0.0,
            retrans: 0,
        }
    }

    /// A data-carrying packet. `data` must not exceed [`MAX_SEG`].
    pub fn with_data(data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= MAX_SEG);
        Self {
            data,
            ..Self::new()
        }
    }

    pub fn set_ack(&mut self, ackno: u32) {
        self.flags.ack = true;
        self.ackno = ackno;
    }

    pub fn datasize(&self) -> usize {
        self.data.len()
    }

    /// Serialises the packet into its wire form, big-endian fields behind a
    /// 16 byte pseudo-header.
    pub fn write_wire(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        self.seqno.write_to(out, BigEndian)?;
        self.ackno.write_to(out, BigEndian)?;
        self.winsize.write_to(out, BigEndian)?;
        self.flags.to_byte().write_to(out, BigEndian)?;
        0u8.write_to(out, BigEndian)?;
        0u16.write_to(out, BigEndian)?;
        out.extend_from_slice(&self.data);
        Ok(())
    }

    /// Parses one datagram. Fails on truncated headers and oversized
    /// payloads.
    pub fn read_wire(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < TCP_PSEUDO_HDR_SIZE {
            return Err(Error::new(ErrorKind::InvalidData, "truncated pseudo-header"));
        }
        if buf.len() > TCP_PSEUDO_HDR_SIZE + MAX_SEG {
            return Err(Error::new(ErrorKind::InvalidData, "oversized segment"));
        }

        let mut cursor = Cursor::new(buf);
        let seqno = u32::read_from(&mut cursor, BigEndian)?;
        let ackno = u32::read_from(&mut cursor, BigEndian)?;
        let winsize = u32::read_from(&mut cursor, BigEndian)?;
        let flags = TcpFlags::from_byte(u8::read_from(&mut cursor, BigEndian)?);
        let _ = u8::read_from(&mut cursor, BigEndian)?;
        let _ = u16::read_from(&mut cursor, BigEndian)?;

        let mut data = Vec::new();
        cursor.read_to_end(&mut data)?;

        Ok(Self {
            seqno,
            ackno,
            winsize,
            flags,
            data,
            ts: 0.0,
            retrans: 0,
        })
    }
}

impl Default for TcpPacket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        let mut pkt = TcpPacket::with_data(vec![1, 2, 3, 4, 5]);
        pkt.seqno = 0xDEAD_BEEF;
        pkt.winsize = 65500;
        pkt.flags = TcpFlags::new().syn(true);
        pkt.set_ack(42);

        let mut wire = Vec::new();
        pkt.write_wire(&mut wire).unwrap();
        assert_eq!(wire.len(), TCP_PSEUDO_HDR_SIZE + 5);

        let parsed = TcpPacket::read_wire(&wire).unwrap();
        assert_eq!(parsed.seqno, pkt.seqno);
        assert_eq!(parsed.ackno, pkt.ackno);
        assert_eq!(parsed.winsize, pkt.winsize);
        assert_eq!(parsed.flags, pkt.flags);
        assert_eq!(parsed.data, pkt.data);
    }

    #[test]
    fn flag_bits() {
        let all = TcpFlags::new().syn(true).ack(true).fin(true).rst(true);
        assert_eq!(all.to_byte(), 0x0F);
        assert_eq!(TcpFlags::from_byte(0x01), TcpFlags::new().syn(true));
        assert_eq!(TcpFlags::from_byte(0x02), TcpFlags::new().ack(true));
        assert_eq!(TcpFlags::from_byte(0x04), TcpFlags::new().fin(true));
        assert_eq!(TcpFlags::from_byte(0x08), TcpFlags::new().rst(true));
    }

    #[test]
    fn rejects_truncated_and_oversized() {
        assert!(TcpPacket::read_wire(&[0u8; TCP_PSEUDO_HDR_SIZE - 1]).is_err());
        assert!(TcpPacket::read_wire(&[0u8; TCP_PSEUDO_HDR_SIZE + MAX_SEG + 1]).is_err());
        assert!(TcpPacket::read_wire(&[0u8; TCP_PSEUDO_HDR_SIZE]).is_ok());
    }
}
