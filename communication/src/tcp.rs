//! Threads that move framed messages between TCP streams and link channels.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use sluice_bytes::arc::Bytes;

use crate::link::Link;
use crate::logging::{CommunicationLogger, CommunicationSetup, LogFn, MessageEvent, StateEvent};
use crate::networking::{FrameHeader, FRAME_SHUTDOWN};
use crate::Result;

/// Repeatedly reads from a TcpStream and carves out messages.
///
/// The intended communication pattern is a sequence of (header, message)^* for valid
/// messages, followed by a shutdown header indicating the end of stream. If the stream ends
/// without being shut down the receive thread exits early; dropping `target` then reports the
/// link as closed to whoever reads from it.
pub fn recv_loop(
    reader: TcpStream,
    target: Sender<Bytes>,
    process: usize,
    remote: usize,
    logger: Option<CommunicationLogger>)
{
    // Log the receive thread's start.
    if let Some(l) = logger.as_ref() { l.log(StateEvent { send: false, process, remote, start: true }) }

    let mut reader = BufReader::with_capacity(1 << 16, reader);

    loop {
        let header = match FrameHeader::read_from(&mut reader) {
            Ok(Some(header)) => header,
            Ok(None) => {
                eprintln!("host {}:\tconnection from host {} closed without shutdown", process, remote);
                break;
            },
            Err(error) => {
                eprintln!("host {}:\tread from host {} failed: {}", process, remote, error);
                break;
            },
        };

        if header.kind == FRAME_SHUTDOWN {
            // Confirm absence of subsequent data.
            let mut probe = [0u8; 1];
            if let Ok(n) = reader.read(&mut probe) {
                if n > 0 {
                    eprintln!("host {}:\tclean shutdown from host {} followed by data", process, remote);
                }
            }
            break;
        }

        let mut payload = vec![0u8; header.length];
        if let Err(error) = reader.read_exact(&mut payload) {
            eprintln!("host {}:\ttruncated message from host {}: {}", process, remote, error);
            break;
        }

        if let Some(l) = logger.as_ref() { l.log(MessageEvent { is_send: false, length: header.length }) }

        if target.send(Bytes::from(payload)).is_err() {
            // Nobody listens any more; the host is shutting down.
            break;
        }
    }

    if let Some(l) = logger.as_ref() { l.log(StateEvent { send: false, process, remote, start: false }) }
}

/// Repeatedly sends messages into a TcpStream.
///
/// The intended communication pattern is a sequence of (header, message)^* for valid
/// messages, followed by a shutdown header once every sender of `source` has been dropped.
pub fn send_loop(
    writer: TcpStream,
    source: Receiver<Bytes>,
    process: usize,
    remote: usize,
    logger: Option<CommunicationLogger>)
{
    if let Some(l) = logger.as_ref() { l.log(StateEvent { send: true, process, remote, start: true }) }

    let mut writer = BufWriter::with_capacity(1 << 16, writer);

    let outcome = (|| -> std::io::Result<()> {
        while let Ok(message) = source.recv() {
            write_message(&mut writer, &message, logger.as_ref())?;
            // Drain whatever is already queued before paying for a flush.
            while let Ok(message) = source.try_recv() {
                write_message(&mut writer, &message, logger.as_ref())?;
            }
            writer.flush()?;
        }

        FrameHeader::shutdown().write_to(&mut writer)?;
        writer.flush()?;
        writer.get_mut().shutdown(std::net::Shutdown::Write)
    })();

    if let Err(error) = outcome {
        eprintln!("host {}:\twrite to host {} failed: {}", process, remote, error);
    }

    if let Some(l) = logger.as_ref() { l.log(StateEvent { send: true, process, remote, start: false }) }
}

fn write_message<W: Write>(writer: &mut W, message: &Bytes, logger: Option<&CommunicationLogger>) -> std::io::Result<()> {
    FrameHeader::data(message.len()).write_to(writer)?;
    writer.write_all(&message[..])?;
    if let Some(l) = logger { l.log(MessageEvent { is_send: true, length: message.len() }) }
    Ok(())
}

/// Starts send and receive threads for each connected socket, producing one link per peer.
///
/// The returned handles finish once the corresponding link has been dropped on this side
/// (send threads) and the peer has shut down its side (receive threads).
pub fn spawn_links(
    sockets: Vec<Option<TcpStream>>,
    my_index: usize,
    log_fn: Option<LogFn>,
) -> Result<(Vec<Option<Link>>, Vec<JoinHandle<()>>)> {

    let mut links = Vec::with_capacity(sockets.len());
    let mut threads = Vec::new();

    for (index, socket) in sockets.into_iter().enumerate() {
        let Some(stream) = socket else {
            links.push(None);
            continue;
        };

        let (to_remote, from_local) = crossbeam_channel::unbounded();
        let (to_local, from_remote) = crossbeam_channel::unbounded();

        let send_logger = log_fn.as_ref().and_then(|f| f(CommunicationSetup { sender: true, process: my_index, remote: Some(index) }));
        let writer = stream.try_clone()?;
        threads.push(
            std::thread::Builder::new()
                .name(format!("sluice:send-{}-{}", my_index, index))
                .spawn(move || send_loop(writer, from_local, my_index, index, send_logger))?,
        );

        let recv_logger = log_fn.as_ref().and_then(|f| f(CommunicationSetup { sender: false, process: my_index, remote: Some(index) }));
        threads.push(
            std::thread::Builder::new()
                .name(format!("sluice:recv-{}-{}", my_index, index))
                .spawn(move || recv_loop(stream, to_local, my_index, index, recv_logger))?,
        );

        links.push(Some(Link::from_parts(index, to_remote, from_remote)));
    }

    Ok((links, threads))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn messages_cross_a_socket_pair() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let connect = std::thread::spawn(move || TcpStream::connect(address).unwrap());
        let accepted = listener.accept().unwrap().0;
        let connected = connect.join().unwrap();

        let (mut left, left_threads) = spawn_links(vec![None, Some(connected)], 0, None).unwrap();
        let (mut right, right_threads) = spawn_links(vec![Some(accepted), None], 1, None).unwrap();

        let left = left[1].take().unwrap();
        let right = right[0].take().unwrap();

        left.send(Bytes::from(b"hello".to_vec())).unwrap();
        left.send(Bytes::from(Vec::new())).unwrap();
        right.send(Bytes::from(vec![9u8; 100_000])).unwrap();

        assert_eq!(&right.recv().unwrap()[..], b"hello");
        assert_eq!(right.recv().unwrap().len(), 0);
        assert_eq!(left.recv().unwrap().len(), 100_000);

        // dropping both ends shuts the connection down cleanly.
        drop(left);
        drop(right);
        for thread in left_threads.into_iter().chain(right_threads) {
            thread.join().unwrap();
        }
    }
}
