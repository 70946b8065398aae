//! The header preceding every stream block on a host link.

use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::{Error, Result};

/// The byte order of encoded headers.
type ByteOrder = byteorder::BigEndian;

/// Identifies the kind of a stream block on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MagicByte {
    /// Not a valid block; never sent.
    Invalid = 0,
    /// A block of a [`CatStream`](crate::data::CatStream).
    CatStreamBlock = 1,
    /// A block of a [`MixStream`](crate::data::MixStream).
    MixStreamBlock = 2,
}

impl MagicByte {
    /// The magic byte of a mix (`true`) or cat stream.
    pub fn for_stream(mix: bool) -> Self {
        if mix { MagicByte::MixStreamBlock } else { MagicByte::CatStreamBlock }
    }

    fn from_u8(byte: u8) -> Self {
        match byte {
            1 => MagicByte::CatStreamBlock,
            2 => MagicByte::MixStreamBlock,
            _ => MagicByte::Invalid,
        }
    }
}

/// Describes the block that follows it, and who it is from and for.
///
/// A header with `size == 0` carries no block and only closes the sender's side. A header
/// with `is_last` set closes it after its block.
// *Warning*: Adding, removing and altering fields requires to adjust the implementation below!
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamBlockHeader {
    /// Stream kind.
    pub magic: MagicByte,
    /// Stream id, equal on all workers.
    pub stream_id: usize,
    /// Global rank of the sending worker.
    pub sender_worker: usize,
    /// Local index of the receiving worker on its host.
    pub receiver_local_worker: usize,
    /// Position of the block among those from this sender to this receiver.
    pub seq: usize,
    /// True for the sender's last block on this stream.
    pub is_last: bool,
    /// Bytes in the block.
    pub size: usize,
    /// Offset of the first item starting in the block.
    pub first_item: usize,
    /// Number of items starting in the block.
    pub num_items: usize,
}

impl StreamBlockHeader {
    /// Bytes occupied by an encoded header.
    pub const BYTES: usize = 2 + 7 * std::mem::size_of::<u64>();

    /// Encodes the header.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u8(self.magic as u8)?;
        writer.write_u64::<ByteOrder>(self.stream_id as u64)?;
        writer.write_u64::<ByteOrder>(self.sender_worker as u64)?;
        writer.write_u64::<ByteOrder>(self.receiver_local_worker as u64)?;
        writer.write_u64::<ByteOrder>(self.seq as u64)?;
        writer.write_u8(self.is_last as u8)?;
        writer.write_u64::<ByteOrder>(self.size as u64)?;
        writer.write_u64::<ByteOrder>(self.first_item as u64)?;
        writer.write_u64::<ByteOrder>(self.num_items as u64)?;
        Ok(())
    }

    /// The encoded header as a message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::BYTES);
        self.write_to(&mut bytes).expect("writing to a Vec cannot fail");
        bytes
    }

    /// Decodes a header, rejecting invalid magic bytes and inconsistent item offsets.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let bad = |e: io::Error| Error::BadHeader(e.to_string());
        let magic = MagicByte::from_u8(reader.read_u8().map_err(bad)?);
        let mut word = || reader.read_u64::<ByteOrder>().map(|x| x as usize).map_err(bad);
        let stream_id = word()?;
        let sender_worker = word()?;
        let receiver_local_worker = word()?;
        let seq = word()?;
        let is_last = reader.read_u8().map_err(bad)? != 0;
        let mut word = || reader.read_u64::<ByteOrder>().map(|x| x as usize).map_err(bad);
        let size = word()?;
        let first_item = word()?;
        let num_items = word()?;

        if magic == MagicByte::Invalid {
            return Err(Error::BadHeader(format!("invalid magic byte on stream {}", stream_id)));
        }
        if first_item > size {
            return Err(Error::BadHeader(format!("first item at {} in a block of {} bytes", first_item, size)));
        }
        Ok(StreamBlockHeader { magic, stream_id, sender_worker, receiver_local_worker, seq, is_last, size, first_item, num_items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encoding() {
        let header = StreamBlockHeader {
            magic: MagicByte::MixStreamBlock,
            stream_id: 7,
            sender_worker: 3,
            receiver_local_worker: 1,
            seq: 12,
            is_last: true,
            size: 4096,
            first_item: 17,
            num_items: 99,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), StreamBlockHeader::BYTES);
        assert_eq!(StreamBlockHeader::read_from(&mut &bytes[..]).unwrap(), header);

        let mut corrupt = bytes.clone();
        corrupt[0] = 9;
        assert!(matches!(StreamBlockHeader::read_from(&mut &corrupt[..]), Err(Error::BadHeader(_))));
        assert!(StreamBlockHeader::read_from(&mut &bytes[.. 20]).is_err());
    }
}
