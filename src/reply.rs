/*!
 * @file reply.rs
 * @brief OP_REPLY encoding and a reference decoder
 */

use crate::error::{MockError, Result};
use crate::protocol::{self, MessageHeader, OpCode, MESSAGE_HEADER_SIZE};
use bson::Document;

/// Response flag bits carried in an OP_REPLY.
pub mod response_flags {
    pub const CURSOR_NOT_FOUND: i32 = 1;
    pub const QUERY_FAILURE: i32 = 2;
    pub const SHARD_CONFIG_STALE: i32 = 4;
    pub const AWAIT_CAPABLE: i32 = 8;
}

/// Message header plus the fixed OP_REPLY fields (flags, cursor id,
/// starting-from, number-returned).
pub const REPLY_HEADER_SIZE: usize = MESSAGE_HEADER_SIZE + 20;

/// Reply metadata, constructed fresh per reply.
#[derive(Debug, Clone, Default)]
pub struct ReplyOptions {
    pub cursor_id: i64,
    pub response_flags: i32,
    pub starting_from: i32,
    /// Fault injection: write only this many bytes of the serialized reply,
    /// then force-close the connection. Simulates a peer dying mid-response.
    pub kill_connection_after_n_bytes: Option<usize>,
}

/// Normalizes the `reply()` payload: a single document becomes a
/// one-element list.
pub trait IntoDocuments {
    fn into_documents(self) -> Vec<Document>;
}

impl IntoDocuments for Document {
    fn into_documents(self) -> Vec<Document> {
        vec![self]
    }
}

impl IntoDocuments for Vec<Document> {
    fn into_documents(self) -> Vec<Document> {
        self
    }
}

/// Serializes documents and reply metadata into a framed OP_REPLY.
///
/// The total length field is computed from the actual serialized document
/// lengths, never assumed.
pub fn encode_reply(
    request_id: i32,
    response_to: i32,
    documents: &[Document],
    options: &ReplyOptions,
) -> Result<Vec<u8>> {
    let mut docs_buf = Vec::new();
    for doc in documents {
        let bytes = bson::to_vec(doc).map_err(|e| {
            MockError::Document(format!("failed to serialize reply document: {}", e))
        })?;
        docs_buf.extend_from_slice(&bytes);
    }

    let message_length = REPLY_HEADER_SIZE + docs_buf.len();

    let mut out = Vec::with_capacity(message_length);
    out.extend_from_slice(&(message_length as i32).to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&response_to.to_le_bytes());
    out.extend_from_slice(&OpCode::Reply.as_i32().to_le_bytes());
    out.extend_from_slice(&options.response_flags.to_le_bytes());
    out.extend_from_slice(&options.cursor_id.to_le_bytes());
    out.extend_from_slice(&options.starting_from.to_le_bytes());
    out.extend_from_slice(&(documents.len() as i32).to_le_bytes());
    out.extend_from_slice(&docs_buf);
    Ok(out)
}

/// Decoded OP_REPLY, as a driver would see it. Used by tests to round-trip
/// what the mock wrote to the wire.
#[derive(Debug, Clone)]
pub struct ReplyMessage {
    pub header: MessageHeader,
    pub response_flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

pub fn decode_reply(buf: &[u8]) -> Result<ReplyMessage> {
    let header = MessageHeader::parse(buf)?;

    if header.message_length as usize != buf.len() {
        return Err(MockError::Frame(format!(
            "corrupt reply: declared {} bytes, received {}",
            header.message_length,
            buf.len()
        )));
    }
    if header.op_code != OpCode::Reply.as_i32() {
        return Err(MockError::Frame(format!(
            "expected OP_REPLY, got opcode {}",
            header.op_code
        )));
    }
    if buf.len() < REPLY_HEADER_SIZE {
        return Err(MockError::Frame("reply too short".to_string()));
    }

    let response_flags = i32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
    let cursor_id = i64::from_le_bytes([
        buf[20], buf[21], buf[22], buf[23], buf[24], buf[25], buf[26], buf[27],
    ]);
    let starting_from = i32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]);
    let number_returned = i32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]);

    let mut documents = Vec::new();
    let mut offset = REPLY_HEADER_SIZE;
    while offset < buf.len() {
        let (doc, used) = protocol::read_document(&buf[offset..])?;
        documents.push(doc);
        offset += used;
    }

    if documents.len() != number_returned as usize {
        return Err(MockError::Document(format!(
            "reply declared {} documents, found {}",
            number_returned,
            documents.len()
        )));
    }

    Ok(ReplyMessage {
        header,
        response_flags,
        cursor_id,
        starting_from,
        number_returned,
        documents,
    })
}
