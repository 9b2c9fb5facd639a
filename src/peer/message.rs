use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::capability::Capabilities;
use super::error::PeerError;
use super::peer_id::PeerId;
use crate::constants::{HANDSHAKE_LEN, PROTOCOL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    // Fast extension (BEP-6)
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // Extension protocol (BEP-10)
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            13 => MessageId::Suggest,
            14 => MessageId::HaveAll,
            15 => MessageId::HaveNone,
            16 => MessageId::Reject,
            17 => MessageId::AllowedFast,
            20 => MessageId::Extended,
            _ => return Err(PeerError::InvalidMessageId(value)),
        })
    }
}

/// The fixed 68-byte opening message of every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
    pub capabilities: Capabilities,
}

impl Handshake {
    /// A handshake advertising every capability this crate implements.
    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        Self {
            info_hash,
            peer_id,
            capabilities: Capabilities::all(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.capabilities.to_reserved());
        buf.put_slice(&self.info_hash);
        buf.put_slice(self.peer_id.as_bytes());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN
            || data[0] as usize != PROTOCOL.len()
            || &data[1..20] != PROTOCOL
        {
            return Err(PeerError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let peer_id = PeerId::from_bytes(&data[48..68]).ok_or(PeerError::InvalidHandshake)?;

        Ok(Self {
            info_hash,
            peer_id,
            capabilities: Capabilities::from_reserved(&reserved),
        })
    }
}

/// A decoded peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    // Fast extension
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast { piece: u32 },
    // Extension protocol, payload carried opaque
    Extended { id: u8, payload: Bytes },
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
            Message::Port(_) => MessageId::Port,
            Message::Suggest { .. } => MessageId::Suggest,
            Message::HaveAll => MessageId::HaveAll,
            Message::HaveNone => MessageId::HaveNone,
            Message::Reject { .. } => MessageId::Reject,
            Message::AllowedFast { .. } => MessageId::AllowedFast,
            Message::Extended { .. } => MessageId::Extended,
        })
    }

    /// Payload length after the id byte.
    fn payload_len(&self) -> usize {
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => 0,
            Message::Have { .. } | Message::Suggest { .. } | Message::AllowedFast { .. } => 4,
            Message::Request { .. } | Message::Cancel { .. } | Message::Reject { .. } => 12,
            Message::Bitfield(bits) => bits.len(),
            Message::Piece { data, .. } => 8 + data.len(),
            Message::Port(_) => 2,
            Message::Extended { payload, .. } => 1 + payload.len(),
        }
    }

    /// Encodes the message with its 4-byte length prefix.
    pub fn encode(&self) -> Bytes {
        let Some(id) = self.id() else {
            return Bytes::from_static(&[0, 0, 0, 0]);
        };

        let payload_len = self.payload_len();
        let mut buf = BytesMut::with_capacity(5 + payload_len);
        buf.put_u32(1 + payload_len as u32);
        buf.put_u8(id as u8);

        match self {
            Message::Have { piece } | Message::Suggest { piece } | Message::AllowedFast { piece } => {
                buf.put_u32(*piece);
            }
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            }
            | Message::Reject {
                index,
                begin,
                length,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Piece { index, begin, data } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Port(port) => buf.put_u16(*port),
            Message::Extended { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            _ => {}
        }

        buf.freeze()
    }

    /// Decodes one length-prefixed frame.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::InvalidMessage("too short".into()));
        }

        let length = data.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if data.remaining() < length {
            return Err(PeerError::InvalidMessage("incomplete message".into()));
        }

        let id = MessageId::try_from(data.get_u8())?;
        let mut payload = data.split_to(length - 1);

        let expect = |payload: &Bytes, len: usize, name: &str| {
            if payload.len() < len {
                Err(PeerError::InvalidMessage(format!("{name} too short")))
            } else {
                Ok(())
            }
        };

        let message = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::Have => {
                expect(&payload, 4, "have")?;
                Message::Have {
                    piece: payload.get_u32(),
                }
            }
            MessageId::Suggest => {
                expect(&payload, 4, "suggest")?;
                Message::Suggest {
                    piece: payload.get_u32(),
                }
            }
            MessageId::AllowedFast => {
                expect(&payload, 4, "allowed fast")?;
                Message::AllowedFast {
                    piece: payload.get_u32(),
                }
            }
            MessageId::Bitfield => Message::Bitfield(payload),
            MessageId::Request => {
                expect(&payload, 12, "request")?;
                Message::Request {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            MessageId::Cancel => {
                expect(&payload, 12, "cancel")?;
                Message::Cancel {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            MessageId::Reject => {
                expect(&payload, 12, "reject")?;
                Message::Reject {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            MessageId::Piece => {
                expect(&payload, 8, "piece")?;
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: payload,
                }
            }
            MessageId::Port => {
                expect(&payload, 2, "port")?;
                Message::Port(payload.get_u16())
            }
            MessageId::Extended => {
                expect(&payload, 1, "extended")?;
                let id = payload.get_u8();
                Message::Extended { id, payload }
            }
        };

        Ok(message)
    }
}
