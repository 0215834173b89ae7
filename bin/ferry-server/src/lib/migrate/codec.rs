// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Framing for messages exchanged on migration connections.
//!
//! Every message travels in one binary websocket frame whose last byte is a
//! tag identifying the message type. Structured data (control messages and
//! the headers of transferred items) is serialized to RON text; payload data
//! is carried as uninterpreted blobs.
//!
//! A content connection carries a sequence of items, each one a
//! `Serialized` header followed by any number of `Blob`s and an `End`, and
//! is terminated by `Done`. The control connection carries `Serialized`
//! control messages and exactly one terminal `Okay` or `Error` per
//! direction.

use std::convert::TryFrom;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use super::MigrateError;

/// Migration framing errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// We received an unexpected message type
    #[error("couldn't decode message type ({0})")]
    InvalidMessageType(u8),

    /// The message received on the wire wasn't the expected length
    #[error("unexpected message length {1} for type {0:?}")]
    UnexpectedMessageLen(u8, usize),

    /// Failed to serialize a message
    #[error("serialization error: {0}")]
    Ron(#[from] ron::Error),

    /// Failed to deserialize a message
    #[error("deserialization error: {0}")]
    RonSpanned(#[from] ron::error::SpannedError),

    /// Received non-UTF8 string
    #[error("non-UTF8 string: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Nothing, not even a tag byte
    #[error("received empty message with no discriminant")]
    EmptyMessage,

    /// All our codec's messages should be tungstenite::Message::Binary
    #[error("received non-binary websocket message: {0:?}")]
    UnexpectedWebsocketMessage(tungstenite::Message),
}

/// The frame types exchanged on migration connections.
#[derive(Debug)]
pub(crate) enum Message {
    /// Terminal success status.
    Okay,
    /// Terminal failure status.
    Error(MigrateError),
    Serialized(String),
    Blob(Vec<u8>),
    /// End of one transferred item.
    End,
    /// End of a content stream.
    Done,
}

impl Message {
    /// A short name for log messages, omitting any payload.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Message::Okay => "okay",
            Message::Error(_) => "error",
            Message::Serialized(_) => "serialized",
            Message::Blob(_) => "blob",
            Message::End => "end",
            Message::Done => "done",
        }
    }
}

/// Wire tags for [`Message`]. These must stay in bijection with its
/// variants.
#[derive(Clone, Copy, Debug, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum MessageType {
    Okay,
    Error,
    Serialized,
    Blob,
    End,
    Done,
}

impl From<&Message> for MessageType {
    fn from(m: &Message) -> MessageType {
        match m {
            Message::Okay => MessageType::Okay,
            Message::Error(_) => MessageType::Error,
            Message::Serialized(_) => MessageType::Serialized,
            Message::Blob(_) => MessageType::Blob,
            Message::End => MessageType::End,
            Message::Done => MessageType::Done,
        }
    }
}

impl TryFrom<Message> for tungstenite::Message {
    type Error = ProtocolError;

    fn try_from(m: Message) -> Result<tungstenite::Message, ProtocolError> {
        let tag: u8 = MessageType::from(&m).into();
        let mut dst = match m {
            Message::Okay | Message::End | Message::Done => {
                Vec::with_capacity(1)
            }
            Message::Error(e) => ron::ser::to_string(&e)?.into_bytes(),
            Message::Serialized(s) => s.into_bytes(),
            Message::Blob(bytes) => bytes,
        };
        // The tag goes last so that blobs can be sent without copying.
        dst.push(tag);
        Ok(tungstenite::Message::Binary(dst))
    }
}

fn expect_empty(tag: MessageType, body: &[u8]) -> Result<(), ProtocolError> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedMessageLen(tag.into(), body.len()))
    }
}

impl TryFrom<tungstenite::Message> for Message {
    type Error = ProtocolError;

    fn try_from(m: tungstenite::Message) -> Result<Message, ProtocolError> {
        let mut body = match m {
            tungstenite::Message::Binary(v) => v,
            x => return Err(ProtocolError::UnexpectedWebsocketMessage(x)),
        };

        let tag_byte = body.pop().ok_or(ProtocolError::EmptyMessage)?;
        let tag = MessageType::try_from(tag_byte)
            .map_err(|_| ProtocolError::InvalidMessageType(tag_byte))?;

        let m = match tag {
            MessageType::Okay => {
                expect_empty(tag, &body)?;
                Message::Okay
            }
            MessageType::End => {
                expect_empty(tag, &body)?;
                Message::End
            }
            MessageType::Done => {
                expect_empty(tag, &body)?;
                Message::Done
            }
            MessageType::Error => {
                let e = ron::de::from_str(std::str::from_utf8(&body)?)?;
                Message::Error(e)
            }
            MessageType::Serialized => {
                Message::Serialized(std::str::from_utf8(&body)?.to_string())
            }
            MessageType::Blob => Message::Blob(body),
        };
        Ok(m)
    }
}

#[cfg(test)]
mod encoder_tests {
    use super::*;

    fn encode(m: Message) -> Vec<u8> {
        match tungstenite::Message::try_from(m).unwrap() {
            tungstenite::Message::Binary(bytes) => bytes,
            other => panic!("unexpected websocket message {other:?}"),
        }
    }

    #[test]
    fn encode_okay() {
        let bytes = encode(Message::Okay);
        assert_eq!(&bytes[..], &[MessageType::Okay as u8]);
    }

    #[test]
    fn encode_error() {
        let mut bytes = encode(Message::Error(MigrateError::InvalidSecret));
        assert_eq!(bytes.pop(), Some(MessageType::Error as u8));
        assert_eq!(&bytes[..], b"InvalidSecret");
    }

    #[test]
    fn encode_blob_keeps_payload_in_front_of_tag() {
        let bytes = encode(Message::Blob(vec![1, 2, 3, 4]));
        assert_eq!(&bytes[..], &[1, 2, 3, 4, MessageType::Blob as u8]);
    }

    #[test]
    fn encode_markers_are_tag_only() {
        assert_eq!(encode(Message::End), vec![MessageType::End as u8]);
        assert_eq!(encode(Message::Done), vec![MessageType::Done as u8]);
    }
}
