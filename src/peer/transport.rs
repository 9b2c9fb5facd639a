use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message};
use crate::constants::{
    HANDSHAKE_LEN, MAX_MESSAGE_SIZE, PEER_READ_TIMEOUT, PEER_WRITE_TIMEOUT, READ_BUFFER_SIZE,
};

/// A framed peer wire connection over any byte stream.
///
/// The stream is usually a [`TcpStream`], but anything implementing
/// `AsyncRead + AsyncWrite` works, including an encrypting wrapper or an
/// in-memory duplex pipe. After the handshake the transport is split into a
/// [`PeerReader`] and a [`PeerWriter`] so reading and writing can proceed
/// from different tasks.
pub struct PeerTransport<S> {
    stream: S,
    read_buf: BytesMut,
}

impl PeerTransport<TcpStream> {
    /// Opens a TCP connection to the peer.
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self, PeerError> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl<S> PeerTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        write_with_timeout(&mut self.stream, &handshake.encode()).await
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        fill_to(&mut self.stream, &mut self.read_buf, HANDSHAKE_LEN).await?;
        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        write_with_timeout(&mut self.stream, &message.encode()).await
    }

    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        read_frame(&mut self.stream, &mut self.read_buf).await
    }

    /// Splits into independent halves, keeping any bytes already buffered.
    pub fn into_split(self) -> (PeerReader<ReadHalf<S>>, PeerWriter<WriteHalf<S>>) {
        let (reader, writer) = tokio::io::split(self.stream);
        (
            PeerReader {
                reader,
                read_buf: self.read_buf,
            },
            PeerWriter { writer },
        )
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Read half of a split [`PeerTransport`].
pub struct PeerReader<R> {
    reader: R,
    read_buf: BytesMut,
}

impl<R: AsyncRead + Unpin> PeerReader<R> {
    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        read_frame(&mut self.reader, &mut self.read_buf).await
    }
}

/// Write half of a split [`PeerTransport`].
pub struct PeerWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> PeerWriter<W> {
    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        write_with_timeout(&mut self.writer, &message.encode()).await
    }

    pub async fn shutdown(&mut self) -> Result<(), PeerError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

async fn write_with_timeout<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<(), PeerError> {
    timeout(PEER_WRITE_TIMEOUT, writer.write_all(data))
        .await
        .map_err(|_| PeerError::Timeout)??;
    Ok(())
}

/// Reads until `buf` holds at least `len` bytes.
async fn fill_to<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut BytesMut, len: usize) -> Result<(), PeerError> {
    while buf.len() < len {
        let n = timeout(PEER_READ_TIMEOUT, reader.read_buf(buf))
            .await
            .map_err(|_| PeerError::Timeout)??;

        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
    }
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut BytesMut) -> Result<Message, PeerError> {
    fill_to(reader, buf, 4).await?;

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(PeerError::InvalidMessage(format!("message too large: {length}")));
    }

    fill_to(reader, buf, 4 + length).await?;
    let frame = buf.split_to(4 + length);
    Message::decode(frame.freeze())
}
