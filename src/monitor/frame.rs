//! Multipart framing over TCP.
//!
//! A message is a sequence of frames, each `flags: u8, len: u32 LE, payload`.
//! Bit 0 of `flags` is set on every frame but the last of a message.

use crate::error::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const FLAG_MORE: u8 = 1;
const FRAME_HEADER_LEN: usize = 5;

pub type Message = Vec<Bytes>;

/// Reassembles messages from a byte stream.
#[derive(Default, Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    frames: Vec<Bytes>,
}

impl FrameDecoder {
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// A complete message, if one has been received.
    pub fn next_message(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            if self.buf.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let flags = self.buf[0];
            let len = u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]])
                as usize;
            if len > MAX_FRAME_LEN {
                return Err(TransportError::FrameTooLarge(len));
            }
            if self.buf.len() < FRAME_HEADER_LEN + len {
                return Ok(None);
            }
            self.buf.advance(FRAME_HEADER_LEN);
            self.frames.push(self.buf.split_to(len).freeze());
            if flags & FLAG_MORE == 0 {
                return Ok(Some(std::mem::take(&mut self.frames)));
            }
        }
    }

    /// Whether part of a message is buffered.
    pub fn is_partial(&self) -> bool {
        !self.buf.is_empty() || !self.frames.is_empty()
    }
}

pub fn encode_message<F: AsRef<[u8]>>(frames: &[F], out: &mut BytesMut) {
    for (i, frame) in frames.iter().enumerate() {
        let payload = frame.as_ref();
        let more = i + 1 < frames.len();
        out.reserve(FRAME_HEADER_LEN + payload.len());
        out.put_u8(if more { FLAG_MORE } else { 0 });
        out.put_u32_le(payload.len() as u32);
        out.put_slice(payload);
    }
}

/// A framed TCP connection.
///
/// Reads time out after `read_timeout` with [`TransportError::Timeout`]; a partially
/// received message is kept and completed by a later [`Connection::recv`].
pub struct Connection {
    stream: TcpStream,
    decoder: FrameDecoder,
    out: BytesMut,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self, TransportError> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_write_timeout(Some(write_timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::default(),
            out: BytesMut::new(),
        })
    }

    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, TransportError> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::new(stream, timeout, timeout),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.map_or(TransportError::Closed, TransportError::from_io))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    pub fn set_read_timeout(&self, timeout: Duration) -> Result<(), TransportError> {
        Ok(self.stream.set_read_timeout(Some(timeout))?)
    }

    pub fn recv(&mut self) -> Result<Message, TransportError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(message) = self.decoder.next_message()? {
                return Ok(message);
            }
            let n = self
                .stream
                .read(&mut chunk)
                .map_err(TransportError::from_io)?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            self.decoder.extend(&chunk[..n]);
        }
    }

    pub fn send<F: AsRef<[u8]>>(&mut self, frames: &[F]) -> Result<(), TransportError> {
        self.out.clear();
        encode_message(frames, &mut self.out);
        self.stream
            .write_all(&self.out)
            .map_err(TransportError::from_io)?;
        self.stream.flush().map_err(TransportError::from_io)
    }
}
