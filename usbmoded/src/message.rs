// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Wire transport primitives: a length-prefixed framing over `UnixStream`,
//! plus `SCM_RIGHTS` fd passing for the rare message that needs it. The
//! concrete request/response catalog lives in `rpc.rs`; this module only
//! knows how to move bytes and fds across the socket.

use std::{
    io::{self, IoSlice, IoSliceMut, Read, Write},
    os::{
        fd::{AsFd, BorrowedFd, OwnedFd},
        unix::net::UnixStream,
    },
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustix::{
    io::Errno,
    net::{
        RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
        SendAncillaryMessage, SendFlags,
    },
};

pub const PROTOCOL_VERSION: u8 = 1;

/// Send a list of fds to a unix socket via ancillary data attached to a single
/// byte message.
pub fn send_fds(stream: &mut UnixStream, fds: &[BorrowedFd]) -> Result<(), Errno> {
    if fds.is_empty() {
        return Ok(());
    }

    let mut space = vec![0; rustix::cmsg_space!(ScmRights(fds.len()))];
    let mut cmsg_buf = SendAncillaryBuffer::new(&mut space);

    if !cmsg_buf.push(SendAncillaryMessage::ScmRights(fds)) {
        panic!("Failed to push fd into cmsg buffer");
    }

    rustix::net::sendmsg(
        stream,
        &[IoSlice::new(&[0])],
        &mut cmsg_buf,
        SendFlags::empty(),
    )?;

    Ok(())
}

/// Receive a list of fds from a unix socket via ancillary data attached to a
/// single byte message. The number of fds to receive must be known in advance
/// in order to allocate the proper buffer size.
pub fn receive_fds(stream: &mut UnixStream, num_fds: usize) -> io::Result<Vec<OwnedFd>> {
    if num_fds == 0 {
        return Ok(vec![]);
    }

    let mut space = vec![0; rustix::cmsg_space!(ScmRights(num_fds))];
    let mut cmsg_buf = RecvAncillaryBuffer::new(&mut space);
    let ret = rustix::net::recvmsg(
        stream,
        &mut [IoSliceMut::new(&mut [0])],
        &mut cmsg_buf,
        RecvFlags::WAITALL,
    )?;
    if ret.bytes == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Received no data from socket",
        ));
    }

    let mut iter = cmsg_buf.drain();

    let Some(msg) = iter.next() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Ancillary data has no message",
        ));
    };

    if iter.next().is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Ancillary data has more than one message",
        ));
    }

    let RecvAncillaryMessage::ScmRights(fds) = msg else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Ancillary data message does not contain fds",
        ));
    };

    if fds.len() != num_fds {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Expected {num_fds} fds, but received {}", fds.len()),
        ));
    }

    Ok(fds.collect())
}

/// Read a length-prefixed byte string from the socket.
pub fn read_data(stream: &mut UnixStream) -> io::Result<Vec<u8>> {
    let size = stream.read_u16::<LittleEndian>()?;
    let mut buf = vec![0u8; size.into()];

    stream.read_exact(&mut buf)?;

    Ok(buf)
}

/// Write a length-prefixed byte string to the socket.
pub fn write_data(stream: &mut UnixStream, buf: &[u8]) -> io::Result<()> {
    if buf.len() > u16::MAX.into() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Data length exceeds u16 bounds",
        ));
    }

    stream.write_u16::<LittleEndian>(buf.len() as u16)?;
    stream.write_all(buf)?;

    Ok(())
}

/// Read a length-prefixed UTF-8 string from the socket.
pub fn read_string(stream: &mut UnixStream) -> io::Result<String> {
    let data = read_data(stream)?;
    String::from_utf8(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a length-prefixed UTF-8 string to the socket.
pub fn write_string(stream: &mut UnixStream, s: &str) -> io::Result<()> {
    write_data(stream, s.as_bytes())
}

/// Read a comma-free list of strings, prefixed with a `u8` count.
pub fn read_string_list(stream: &mut UnixStream) -> io::Result<Vec<String>> {
    let count = stream.read_u8()?;
    (0..count).map(|_| read_string(stream)).collect()
}

/// Write a list of strings, prefixed with a `u8` count.
pub fn write_string_list(stream: &mut UnixStream, items: &[String]) -> io::Result<()> {
    if items.len() > u8::MAX.into() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "List length exceeds u8 bounds",
        ));
    }
    stream.write_u8(items.len() as u8)?;
    for item in items {
        write_string(stream, item)?;
    }
    Ok(())
}

pub trait MessageId {
    const ID: u8;

    fn id(&self) -> u8 {
        Self::ID
    }
}

pub trait FromSocket: Sized {
    fn from_socket(stream: &mut UnixStream) -> io::Result<Self>;
}

pub trait ToSocket {
    fn to_socket(&self, stream: &mut UnixStream) -> io::Result<()>;
}
