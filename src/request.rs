/*!
 * @file request.rs
 * @brief Test-facing request wrapper with reply and fault injection
 */

use crate::connection::ConnectionHandle;
use crate::error::Result;
use crate::protocol::{OpCode, WireMessage};
use crate::reply::{self, IntoDocuments, ReplyOptions};
use bson::Document;

/// One fully parsed incoming message paired with the connection it arrived
/// on. Created by the server, consumed by test code: inspect `document()`,
/// then `reply()`.
#[derive(Debug)]
pub struct Request {
    message: WireMessage,
    connection: ConnectionHandle,
}

impl Request {
    pub(crate) fn new(message: WireMessage, connection: ConnectionHandle) -> Request {
        Request {
            message,
            connection,
        }
    }

    /// Primary decoded document of the message. `None` for opcodes whose
    /// body parser is a stub (everything except OP_QUERY).
    pub fn document(&self) -> Option<&Document> {
        self.message.document()
    }

    pub fn opcode(&self) -> OpCode {
        self.message.opcode()
    }

    pub fn message(&self) -> &WireMessage {
        &self.message
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Serializes and writes an OP_REPLY back on the originating connection.
    ///
    /// The reply's response-to field is the request's id; the reply gets a
    /// fresh id of request id + 1. With
    /// `options.kill_connection_after_n_bytes = Some(n)` and a reply longer
    /// than `n`, exactly `n` bytes are written and the connection is then
    /// force-closed; the rest is never sent.
    pub async fn reply<D: IntoDocuments>(
        &self,
        documents: D,
        options: &ReplyOptions,
    ) -> Result<()> {
        let documents = documents.into_documents();
        let response_to = self.message.header().request_id;
        let request_id = response_to.wrapping_add(1);
        let bytes = reply::encode_reply(request_id, response_to, &documents, options)?;

        if let Some(limit) = options.kill_connection_after_n_bytes {
            if bytes.len() > limit {
                self.connection.write_bytes(&bytes[..limit]).await?;
                self.connection.destroy().await;
                return Ok(());
            }
        }

        self.connection.write_bytes(&bytes).await
    }
}
