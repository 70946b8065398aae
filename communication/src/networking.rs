//! Networking code for establishing TCP links between hosts and framing the messages on them.

use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::thread::sleep;
use std::time::Duration;

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::{Error, Result};

// This constant is sent along immediately after establishing a TCP stream, so
// that it is easy to sniff out sluice traffic when it is multiplexed with
// other traffic on the same port.
const HANDSHAKE_MAGIC: u64 = 0x51_1C_E0_DA_7A_F1_0E_01;

/// The byte order for writing frame headers and stream initialization.
type ByteOrder = byteorder::BigEndian;

/// Frame kind for a message carrying data.
pub const FRAME_DATA: u64 = 0;
/// Frame kind announcing that the sender will send nothing more.
pub const FRAME_SHUTDOWN: u64 = 1;

/// Framing for each message on a TCP link: its kind and its length in bytes.
// *Warning*: Adding, removing and altering fields requires to adjust the implementation below!
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct FrameHeader {
    /// `FRAME_DATA` or `FRAME_SHUTDOWN`.
    pub kind: u64,
    /// number of bytes in message.
    pub length: usize,
}

impl FrameHeader {

    /// The number of `u64` fields in [FrameHeader].
    const FIELDS: usize = 2;

    /// Bytes occupied by an encoded header.
    pub const BYTES: usize = std::mem::size_of::<u64>() * Self::FIELDS;

    /// A header for a data message of `length` bytes.
    pub fn data(length: usize) -> Self {
        FrameHeader { kind: FRAME_DATA, length }
    }

    /// The header ending a link.
    pub fn shutdown() -> Self {
        FrameHeader { kind: FRAME_SHUTDOWN, length: 0 }
    }

    /// Reads a header from `reader`.
    ///
    /// Returns `Ok(None)` on a clean end of stream before any header byte.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Option<FrameHeader>> {
        let mut buffer = [0u8; Self::BYTES];
        let mut filled = 0;
        while filled < Self::BYTES {
            match reader.read(&mut buffer[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated frame header")),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e),
            }
        }
        let mut cursor = io::Cursor::new(&buffer[..]);
        let mut fields = [0u64; Self::FIELDS];
        cursor.read_u64_into::<ByteOrder>(&mut fields)?;
        // Order must match writing order.
        Ok(Some(FrameHeader { kind: fields[0], length: fields[1] as usize }))
    }

    /// Writes the header as binary data.
    #[inline]
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut buffer = [0u8; Self::BYTES];
        let mut cursor = io::Cursor::new(&mut buffer[..]);
        // Order must match reading order.
        cursor.write_u64::<ByteOrder>(self.kind)?;
        cursor.write_u64::<ByteOrder>(self.length as u64)?;
        writer.write_all(&buffer[..])
    }
}

/// Creates socket connections from a list of host addresses, `groups` connections per pair.
///
/// The result is indexed first by group and then by host. Entry `[g][i]` is a `Some(TcpStream)`
/// to host `i`, except for entry `my_index` which is `None` (no socket to self).
pub fn create_sockets(addresses: Vec<String>, my_index: usize, groups: usize, noisy: bool) -> Result<Vec<Vec<Option<TcpStream>>>> {

    let hosts1 = Arc::new(addresses);
    let hosts2 = Arc::clone(&hosts1);

    let start_task = thread::spawn(move || start_connections(hosts1, my_index, groups, noisy));
    let await_task = thread::spawn(move || await_connections(hosts2, my_index, groups, noisy));

    let started = start_task.join().map_err(|_| Error::Handshake("connecting thread panicked".to_owned()))??;
    let awaited = await_task.join().map_err(|_| Error::Handshake("accepting thread panicked".to_owned()))??;

    let results = started
        .into_iter()
        .zip(awaited)
        .map(|(mut lower, higher)| {
            lower.push(None);
            lower.extend(higher);
            lower
        })
        .collect();

    if noisy { println!("host {}:\tinitialization complete", my_index) }

    Ok(results)
}

/// Result contains, per group, connections [0, my_index - 1].
pub fn start_connections(addresses: Arc<Vec<String>>, my_index: usize, groups: usize, noisy: bool) -> Result<Vec<Vec<Option<TcpStream>>>> {
    let mut results = Vec::with_capacity(groups);
    for group in 0 .. groups {
        let mut connections = Vec::with_capacity(my_index);
        for (index, address) in addresses.iter().take(my_index).enumerate() {
            let stream = loop {
                match TcpStream::connect(address) {
                    Ok(mut stream) => {
                        stream.set_nodelay(true)?;
                        stream.write_u64::<ByteOrder>(HANDSHAKE_MAGIC)?;
                        stream.write_u64::<ByteOrder>(my_index as u64)?;
                        stream.write_u64::<ByteOrder>(group as u64)?;
                        if noisy { println!("host {}:\tconnection to host {} (group {})", my_index, index, group); }
                        break stream;
                    },
                    Err(error) => {
                        println!("host {}:\terror connecting to host {}: {}; retrying", my_index, index, error);
                        sleep(Duration::from_secs(1));
                    },
                }
            };
            connections.push(Some(stream));
        }
        results.push(connections);
    }
    Ok(results)
}

/// Result contains, per group, connections [my_index + 1, addresses.len() - 1].
pub fn await_connections(addresses: Arc<Vec<String>>, my_index: usize, groups: usize, noisy: bool) -> Result<Vec<Vec<Option<TcpStream>>>> {
    let higher = addresses.len() - my_index - 1;
    let mut results: Vec<Vec<Option<TcpStream>>> = (0 .. groups).map(|_| (0 .. higher).map(|_| None).collect()).collect();
    let listener = TcpListener::bind(&addresses[my_index][..])?;

    for _ in 0 .. higher * groups {
        let mut stream = listener.accept()?.0;
        stream.set_nodelay(true)?;
        let mut buffer = [0u8; 24];
        stream.read_exact(&mut buffer)?;
        let mut cursor = io::Cursor::new(buffer);
        let magic = cursor.read_u64::<ByteOrder>()?;
        if magic != HANDSHAKE_MAGIC {
            return Err(Error::Handshake("received incorrect sluice handshake".to_owned()));
        }
        let identifier = cursor.read_u64::<ByteOrder>()? as usize;
        let group = cursor.read_u64::<ByteOrder>()? as usize;
        if identifier <= my_index || identifier >= addresses.len() || group >= groups {
            return Err(Error::Handshake(format!("unexpected connection from host {} for group {}", identifier, group)));
        }
        results[group][identifier - my_index - 1] = Some(stream);
        if noisy { println!("host {}:\tconnection from host {} (group {})", my_index, identifier, group); }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_survives_the_wire() {
        let mut wire = Vec::new();
        FrameHeader::data(1234).write_to(&mut wire).unwrap();
        FrameHeader::shutdown().write_to(&mut wire).unwrap();
        assert_eq!(wire.len(), 2 * FrameHeader::BYTES);

        let mut reader = &wire[..];
        assert_eq!(FrameHeader::read_from(&mut reader).unwrap(), Some(FrameHeader::data(1234)));
        assert_eq!(FrameHeader::read_from(&mut reader).unwrap(), Some(FrameHeader::shutdown()));
        assert_eq!(FrameHeader::read_from(&mut reader).unwrap(), None);
    }

    #[test]
    fn truncated_header_is_an_error() {
        let mut wire = Vec::new();
        FrameHeader::data(7).write_to(&mut wire).unwrap();
        let mut reader = &wire[.. 5];
        assert!(FrameHeader::read_from(&mut reader).is_err());
    }
}
