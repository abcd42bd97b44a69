use std::io::{Cursor, Error, ErrorKind, Result, Write};

use bytestream::{ByteOrder::BigEndian, StreamReader, StreamWriter};

/// Size of the base header every wire packet starts with.
pub const PKT_BASE_SIZE: usize = 8;

/// Default ceiling on a single wire packet.
pub const PKT_MAX_SIZE: usize = 10 * 1024 * 1024;

/// Coarse prioritisation class of an item. File payloads queue behind
/// everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemClass {
    Control,
    FileData,
}

/// An application-level message carried by the streamer.
///
/// The streamer itself only cares about the owning peer and the queueing
/// class; everything else is opaque to it.
pub trait NetItem: Send {
    fn peer_id(&self) -> &str;
    fn set_peer_id(&mut self, id: &str);
    fn class(&self) -> ItemClass {
        ItemClass::Control
    }
}

/// Pluggable item codec.
///
/// Serialised packets must be self-delimiting: they start with the 8 byte
/// base header (see [`PktHeader`]) whose length field covers the whole
/// packet, header included. Both endpoints must produce byte-identical
/// encodings.
pub trait Serialiser: Send {
    type Item: NetItem;

    /// Upper bound on the serialised size of `item`.
    fn size(&self, item: &Self::Item) -> usize;

    /// Writes `item` into `buf` and returns the actual packet length.
    fn serialise(&self, item: &Self::Item, buf: &mut [u8]) -> Result<usize>;

    /// Rebuilds an item from a complete packet.
    fn deserialise(&self, buf: &[u8]) -> Result<Self::Item>;

    /// Largest packet this codec will ever produce or accept.
    fn max_size(&self) -> usize {
        PKT_MAX_SIZE
    }
}

/// The fixed preamble of every wire packet:
/// `version u8 | service u16 | subtype u8 | length u32`, big-endian, where
/// `length` is the total packet length including these 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktHeader {
    pub version: u8,
    pub service: u16,
    pub subtype: u8,
    pub length: u32,
}

impl PktHeader {
    pub fn write_to(&self, out: &mut impl Write) -> Result<()> {
        self.version.write_to(out, BigEndian)?;
        self.service.write_to(out, BigEndian)?;
        self.subtype.write_to(out, BigEndian)?;
        self.length.write_to(out, BigEndian)?;
        Ok(())
    }

    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < PKT_BASE_SIZE {
            return Err(Error::new(ErrorKind::InvalidData, "truncated packet header"));
        }
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            version: u8::read_from(&mut cursor, BigEndian)?,
            service: u16::read_from(&mut cursor, BigEndian)?,
            subtype: u8::read_from(&mut cursor, BigEndian)?,
            length: u32::read_from(&mut cursor, BigEndian)?,
        })
    }
}

/// Total packet length announced by a base header, `0` when the header is
/// truncated.
pub fn pkt_total_len(block: &[u8]) -> usize {
    PktHeader::read_from(block).map_or(0, |hdr| hdr.length as usize)
}
