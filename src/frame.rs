/*!
 * @file frame.rs
 * @brief Incremental wire message framing over a byte stream
 */

use bytes::{Bytes, BytesMut};

/// Events produced while feeding raw transport bytes into the decoder.
#[derive(Debug)]
pub enum FrameEvent {
    /// One complete, length-validated wire message.
    Message(Bytes),
    /// The declared message length was out of bounds. Decoder state has been
    /// reset and the remainder of the offending chunk dropped; later chunks
    /// parse as a fresh message stream.
    BadLength { declared: i64, bin: Bytes },
}

#[derive(Debug)]
struct PendingFrame {
    declared: usize,
    buf: BytesMut,
}

/// Per-connection incremental frame decoder.
///
/// TCP makes no framing guarantee, so chunk boundaries fall anywhere
/// relative to message boundaries: the decoder keeps a stub buffer while
/// fewer than four bytes of the next message have arrived (not enough to
/// read the length prefix), then accumulates into a message-sized buffer
/// until the declared length is reached. A single chunk may complete zero,
/// one, or many messages.
///
/// State is exclusively owned by one connection's reader; nothing leaks
/// across connections.
#[derive(Debug)]
pub struct FrameDecoder {
    max_message_size: usize,
    stub: BytesMut,
    pending: Option<PendingFrame>,
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> FrameDecoder {
        FrameDecoder {
            max_message_size,
            stub: BytesMut::new(),
            pending: None,
        }
    }

    /// Feeds one chunk of transport bytes, returning the events it produced
    /// in order.
    pub fn push(&mut self, data: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();

        if self.pending.is_none() && !self.stub.is_empty() {
            // Merge the stashed prefix with the new chunk before parsing.
            let mut merged = std::mem::take(&mut self.stub);
            merged.extend_from_slice(data);
            let merged = merged.freeze();
            self.consume(&merged, &mut events);
        } else {
            self.consume(data, &mut events);
        }

        events
    }

    fn consume(&mut self, mut data: &[u8], events: &mut Vec<FrameEvent>) {
        while !data.is_empty() {
            // Finish an in-progress message first.
            if let Some(mut pending) = self.pending.take() {
                let remaining = pending.declared - pending.buf.len();
                if remaining > data.len() {
                    pending.buf.extend_from_slice(data);
                    self.pending = Some(pending);
                    return;
                }

                pending.buf.extend_from_slice(&data[..remaining]);
                data = &data[remaining..];
                events.push(FrameEvent::Message(pending.buf.freeze()));
                continue;
            }

            // Not enough bytes to learn the next message's size yet.
            if data.len() <= 4 {
                self.stub.extend_from_slice(data);
                return;
            }

            let declared =
                i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64;
            if declared <= 4 || declared > self.max_message_size as i64 {
                events.push(FrameEvent::BadLength {
                    declared,
                    bin: Bytes::copy_from_slice(data),
                });
                self.reset();
                return;
            }

            let declared = declared as usize;
            if declared <= data.len() {
                events.push(FrameEvent::Message(Bytes::copy_from_slice(&data[..declared])));
                data = &data[declared..];
                continue;
            }

            let mut buf = BytesMut::with_capacity(declared);
            buf.extend_from_slice(data);
            self.pending = Some(PendingFrame { declared, buf });
            return;
        }
    }

    fn reset(&mut self) {
        self.stub.clear();
        self.pending = None;
    }
}
