use super::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

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
    type Error = ProtocolError;

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
            _ => return Err(ProtocolError::UnknownMessageId(value)),
        })
    }
}

/// A chunk of a piece: the triple carried by request, cancel and reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }
}

/// A peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request(Request),
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel(Request),
    Port(u16),
    // Fast extension
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject(Request),
    AllowedFast { piece: u32 },
    // Extension protocol
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// Messages that are only legal once the fast extension is negotiated.
    pub fn is_fast_only(&self) -> bool {
        matches!(
            self,
            Message::Suggest { .. }
                | Message::HaveAll
                | Message::HaveNone
                | Message::Reject(_)
                | Message::AllowedFast { .. }
        )
    }

    /// Size of the frame including its length prefix.
    pub fn wire_len(&self) -> usize {
        4 + match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => 1,
            Message::Have { .. } | Message::Suggest { .. } | Message::AllowedFast { .. } => 5,
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Request(_) | Message::Cancel(_) | Message::Reject(_) => 13,
            Message::Piece { data, .. } => 9 + data.len(),
            Message::Port(_) => 3,
            Message::Extended { payload, .. } => 2 + payload.len(),
        }
    }

    /// Appends the length-prefixed frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.wire_len());
        buf.put_u32((self.wire_len() - 4) as u32);
        match self {
            Message::KeepAlive => {}
            Message::Choke => buf.put_u8(MessageId::Choke as u8),
            Message::Unchoke => buf.put_u8(MessageId::Unchoke as u8),
            Message::Interested => buf.put_u8(MessageId::Interested as u8),
            Message::NotInterested => buf.put_u8(MessageId::NotInterested as u8),
            Message::HaveAll => buf.put_u8(MessageId::HaveAll as u8),
            Message::HaveNone => buf.put_u8(MessageId::HaveNone as u8),
            Message::Have { piece } => {
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece);
            }
            Message::Suggest { piece } => {
                buf.put_u8(MessageId::Suggest as u8);
                buf.put_u32(*piece);
            }
            Message::AllowedFast { piece } => {
                buf.put_u8(MessageId::AllowedFast as u8);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request(r) => put_request(buf, MessageId::Request, r),
            Message::Cancel(r) => put_request(buf, MessageId::Cancel, r),
            Message::Reject(r) => put_request(buf, MessageId::Reject, r),
            Message::Piece { index, begin, data } => {
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Port(port) => {
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(*port);
            }
            Message::Extended { id, payload } => {
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decodes a frame body, i.e. everything after the length prefix.
    pub fn decode(mut body: Bytes) -> Result<Self, ProtocolError> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let id = MessageId::try_from(body.get_u8())?;
        let len = body.len();
        let expect = |kind: &'static str, want: usize| {
            if len == want {
                Ok(())
            } else {
                Err(ProtocolError::BadLength { kind, length: len })
            }
        };

        Ok(match id {
            MessageId::Choke => {
                expect("choke", 0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect("unchoke", 0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect("interested", 0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect("not interested", 0)?;
                Message::NotInterested
            }
            MessageId::HaveAll => {
                expect("have all", 0)?;
                Message::HaveAll
            }
            MessageId::HaveNone => {
                expect("have none", 0)?;
                Message::HaveNone
            }
            MessageId::Have => {
                expect("have", 4)?;
                Message::Have {
                    piece: body.get_u32(),
                }
            }
            MessageId::Suggest => {
                expect("suggest", 4)?;
                Message::Suggest {
                    piece: body.get_u32(),
                }
            }
            MessageId::AllowedFast => {
                expect("allowed fast", 4)?;
                Message::AllowedFast {
                    piece: body.get_u32(),
                }
            }
            MessageId::Bitfield => Message::Bitfield(body),
            MessageId::Request => {
                expect("request", 12)?;
                Message::Request(get_request(&mut body))
            }
            MessageId::Cancel => {
                expect("cancel", 12)?;
                Message::Cancel(get_request(&mut body))
            }
            MessageId::Reject => {
                expect("reject", 12)?;
                Message::Reject(get_request(&mut body))
            }
            MessageId::Piece => {
                if len < 8 {
                    return Err(ProtocolError::BadLength {
                        kind: "piece",
                        length: len,
                    });
                }
                let index = body.get_u32();
                let begin = body.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: body,
                }
            }
            MessageId::Port => {
                expect("port", 2)?;
                Message::Port(body.get_u16())
            }
            MessageId::Extended => {
                if len < 1 {
                    return Err(ProtocolError::BadLength {
                        kind: "extended",
                        length: len,
                    });
                }
                let id = body.get_u8();
                Message::Extended { id, payload: body }
            }
        })
    }
}

fn put_request(buf: &mut BytesMut, id: MessageId, r: &Request) {
    buf.put_u8(id as u8);
    buf.put_u32(r.index);
    buf.put_u32(r.begin);
    buf.put_u32(r.length);
}

fn get_request(body: &mut Bytes) -> Request {
    Request::new(body.get_u32(), body.get_u32(), body.get_u32())
}
