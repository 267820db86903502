//! Tokio codec for framing IRC messages over a byte stream.
//!
//! Lines are delimited by `\n` (tolerating bare-LF peers) with a trailing
//! `\r` stripped. Outgoing messages are always CRLF-terminated. The line
//! length cap is the IRCv3 limit of 8191 bytes so that message-tags fit;
//! RFC 1459 specified 512 but modern IRC requires more.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::Message;

/// Maximum accepted line length, tags included.
pub const MAX_LINE_LEN: usize = 8191;

/// Codec turning a byte stream into [`Message`]s and back.
#[derive(Debug, Clone)]
pub struct IrcCodec {
    max_line_len: usize,
    /// Scan position into the buffer, so repeated decode calls do not
    /// re-scan bytes already known to contain no newline.
    next_index: usize,
}

impl IrcCodec {
    /// Create a codec with the default line length cap.
    pub fn new() -> Self {
        Self {
            max_line_len: MAX_LINE_LEN,
            next_index: 0,
        }
    }
}

impl Default for IrcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let newline = src[self.next_index..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| self.next_index + pos);

        match newline {
            Some(pos) => {
                self.next_index = 0;
                let line = src.split_to(pos + 1);
                let line = &line[..pos];
                let line = line.strip_suffix(b"\r").unwrap_or(line);

                if line.len() > self.max_line_len {
                    return Err(ProtocolError::MessageTooLong {
                        actual: line.len(),
                        limit: self.max_line_len,
                    });
                }

                // Empty lines between messages are tolerated.
                if line.is_empty() {
                    return self.decode(src);
                }

                let text = String::from_utf8_lossy(line);
                text.parse::<Message>().map(Some)
            }
            None => {
                if src.len() > self.max_line_len {
                    return Err(ProtocolError::MessageTooLong {
                        actual: src.len(),
                        limit: self.max_line_len,
                    });
                }
                self.next_index = src.len();
                Ok(None)
            }
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let line = msg.to_string();
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
