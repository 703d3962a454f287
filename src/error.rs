/*!
 * @file error.rs
 * @brief mongomock error handling
 */

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MockError {
    #[error("frame error: {0}")]
    Frame(String),

    #[error("bad document: {0}")]
    Document(String),

    #[error("BSON error: {0}")]
    Bson(#[from] bson::de::Error),

    #[error("unknown wire protocol message type: {0}")]
    UnknownOpcode(i32),

    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("mock server is in destroyed state")]
    ServerDestroyed,
}

pub type Result<T> = std::result::Result<T, MockError>;
