/*!
 * @file lib.rs
 * @brief mongomock library entry point
 *
 * A scriptable mock MongoDB wire-protocol server for driver testing. The
 * mock accepts real TCP connections, reassembles and parses wire messages
 * (OP_QUERY fully, legacy write opcodes as recognized stubs), and hands each
 * one to test code as a [`Request`] that can be inspected and replied to,
 * including deliberate misbehavior such as truncated replies and forced
 * disconnects.
 */

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod reply;
pub mod request;
pub mod server;

// Re-export main types for external use
pub use config::ServerOptions;
pub use connection::ConnectionHandle;
pub use error::{MockError, Result};
pub use frame::{FrameDecoder, FrameEvent};
pub use protocol::{MessageHeader, OpCode, QueryMessage, RawMessage, WireMessage};
pub use reply::{
    decode_reply, encode_reply, response_flags, IntoDocuments, ReplyMessage, ReplyOptions,
};
pub use request::Request;
pub use server::{cleanup, MessageHandler, MockServer, ParseErrorEvent};
