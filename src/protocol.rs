/*!
 * @file protocol.rs
 * @brief Wire message header parsing and opcode dispatch
 */

use crate::error::{MockError, Result};
use bson::Document;

/// Fixed wire message header: four little-endian int32 fields.
pub const MESSAGE_HEADER_SIZE: usize = 16;

/// Default upper bound on a single wire message (48 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// Known wire protocol opcodes.
///
/// `Reply` is only ever produced by the server; a client sending it is a
/// protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
}

impl OpCode {
    pub fn from_i32(code: i32) -> Option<OpCode> {
        match code {
            1 => Some(OpCode::Reply),
            2001 => Some(OpCode::Update),
            2002 => Some(OpCode::Insert),
            2004 => Some(OpCode::Query),
            2005 => Some(OpCode::GetMore),
            2006 => Some(OpCode::Delete),
            2007 => Some(OpCode::KillCursors),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            OpCode::Reply => 1,
            OpCode::Update => 2001,
            OpCode::Insert => 2002,
            OpCode::Query => 2004,
            OpCode::GetMore => 2005,
            OpCode::Delete => 2006,
            OpCode::KillCursors => 2007,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Result<MessageHeader> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(MockError::Frame(format!(
                "message too short for header: {} bytes",
                buf.len()
            )));
        }

        let message_length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let request_id = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let response_to = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let op_code = i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        Ok(MessageHeader {
            message_length,
            request_id,
            response_to,
            op_code,
        })
    }
}

/// Fully parsed OP_QUERY message.
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub header: MessageHeader,
    pub flags: i32,
    pub namespace: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub projection: Option<Document>,
}

/// Recognized but not fully parsed message; carries the raw body so a test
/// that cares can pick it apart itself.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub header: MessageHeader,
    pub body: Vec<u8>,
}

/// One complete incoming wire message, immutable once parsed.
#[derive(Debug, Clone)]
pub enum WireMessage {
    Query(QueryMessage),
    Update(RawMessage),
    Insert(RawMessage),
    GetMore(RawMessage),
    Delete(RawMessage),
    KillCursors(RawMessage),
}

impl WireMessage {
    pub fn header(&self) -> &MessageHeader {
        match self {
            WireMessage::Query(m) => &m.header,
            WireMessage::Update(m)
            | WireMessage::Insert(m)
            | WireMessage::GetMore(m)
            | WireMessage::Delete(m)
            | WireMessage::KillCursors(m) => &m.header,
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            WireMessage::Query(_) => OpCode::Query,
            WireMessage::Update(_) => OpCode::Update,
            WireMessage::Insert(_) => OpCode::Insert,
            WireMessage::GetMore(_) => OpCode::GetMore,
            WireMessage::Delete(_) => OpCode::Delete,
            WireMessage::KillCursors(_) => OpCode::KillCursors,
        }
    }

    /// Primary document of the message, if the opcode's body parser decodes
    /// one (only OP_QUERY today).
    pub fn document(&self) -> Option<&Document> {
        match self {
            WireMessage::Query(m) => Some(&m.query),
            _ => None,
        }
    }
}

/// Parses a buffer holding exactly one complete wire message.
///
/// The declared length must match the buffer length; the frame decoder
/// guarantees this for messages it emits, but the check also catches callers
/// handing in sliced garbage.
pub fn parse_message(buf: &[u8]) -> Result<WireMessage> {
    let header = MessageHeader::parse(buf)?;

    if header.message_length as usize != buf.len() {
        return Err(MockError::Frame(format!(
            "corrupt wire protocol message: declared {} bytes, received {}",
            header.message_length,
            buf.len()
        )));
    }

    let opcode = OpCode::from_i32(header.op_code)
        .ok_or(MockError::UnknownOpcode(header.op_code))?;
    let body = &buf[MESSAGE_HEADER_SIZE..];

    match opcode {
        OpCode::Query => Ok(WireMessage::Query(parse_query(header, body)?)),
        OpCode::Update => Ok(WireMessage::Update(raw(header, body))),
        OpCode::Insert => Ok(WireMessage::Insert(raw(header, body))),
        OpCode::GetMore => Ok(WireMessage::GetMore(raw(header, body))),
        OpCode::Delete => Ok(WireMessage::Delete(raw(header, body))),
        OpCode::KillCursors => Ok(WireMessage::KillCursors(raw(header, body))),
        OpCode::Reply => Err(MockError::Frame(
            "OP_REPLY is not valid as a request".to_string(),
        )),
    }
}

fn raw(header: MessageHeader, body: &[u8]) -> RawMessage {
    RawMessage {
        header,
        body: body.to_vec(),
    }
}

/// OP_QUERY body: int32 flags, cstring namespace, int32 numberToSkip,
/// int32 numberToReturn, query document, optional projection document.
///
/// The projection is read iff bytes remain after the query document. There
/// is no length-prefixed indication of its presence on the wire, so a
/// corrupt query document size would mis-frame it; this matches how drivers
/// actually write the message.
fn parse_query(header: MessageHeader, body: &[u8]) -> Result<QueryMessage> {
    if body.len() < 4 {
        return Err(MockError::Document("query body too short".to_string()));
    }

    let flags = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);

    let rest = &body[4..];
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| MockError::Document("namespace missing NUL terminator".to_string()))?;
    let namespace = std::str::from_utf8(&rest[..nul])
        .map_err(|_| MockError::Document("namespace is not valid UTF-8".to_string()))?
        .to_string();

    let mut offset = 4 + nul + 1;
    if body.len() < offset + 8 {
        return Err(MockError::Document(
            "query body truncated before cursor fields".to_string(),
        ));
    }

    let number_to_skip = i32::from_le_bytes([
        body[offset],
        body[offset + 1],
        body[offset + 2],
        body[offset + 3],
    ]);
    let number_to_return = i32::from_le_bytes([
        body[offset + 4],
        body[offset + 5],
        body[offset + 6],
        body[offset + 7],
    ]);
    offset += 8;

    let (query, used) = read_document(&body[offset..])?;
    offset += used;

    let projection = if offset < body.len() {
        Some(read_document(&body[offset..])?.0)
    } else {
        None
    };

    Ok(QueryMessage {
        header,
        flags,
        namespace,
        number_to_skip,
        number_to_return,
        query,
        projection,
    })
}

/// Reads one BSON document sized by its own embedded length prefix.
/// Returns the document and the number of bytes consumed.
pub(crate) fn read_document(buf: &[u8]) -> Result<(Document, usize)> {
    if buf.len() < 4 {
        return Err(MockError::Document(
            "document length prefix truncated".to_string(),
        ));
    }

    let len = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len < 5 || len as usize > buf.len() {
        return Err(MockError::Document(format!(
            "invalid BSON document length {} ({} bytes available)",
            len,
            buf.len()
        )));
    }

    let len = len as usize;
    let doc = bson::from_slice(&buf[..len])?;
    Ok((doc, len))
}
