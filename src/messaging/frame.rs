use std::fmt::{Display, Formatter};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const DELIMITER: u8 = b'|';

/// Sequence id carried by frames that are not sequenced (everything except `text` frames)
pub const CONTROL_SEQUENCE_ID: u64 = 0;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("unknown header kind {0:?}")]
    UnknownHeaderKind(String),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum FrameKind {
    /// application message, sequenced per peer
    Data,
    /// request to re-send the message with the sequence id in the payload
    Request,
    KeepAlive,
    /// negative reply to a request: the message with the sequence id in the payload can not be
    ///  re-sent because it is no longer buffered
    Unavailable,
}

impl FrameKind {
    const LABEL_DATA: &'static [u8] = b"text";
    const LABEL_REQUEST: &'static [u8] = b"request";
    const LABEL_KEEP_ALIVE: &'static [u8] = b"keep_alive";
    const LABEL_UNAVAILABLE: &'static [u8] = b"unavailable";

    pub fn label(&self) -> &'static [u8] {
        match self {
            FrameKind::Data => Self::LABEL_DATA,
            FrameKind::Request => Self::LABEL_REQUEST,
            FrameKind::KeepAlive => Self::LABEL_KEEP_ALIVE,
            FrameKind::Unavailable => Self::LABEL_UNAVAILABLE,
        }
    }

    fn from_label(label: &[u8]) -> Result<FrameKind, FrameError> {
        match label {
            Self::LABEL_DATA => Ok(FrameKind::Data),
            Self::LABEL_REQUEST => Ok(FrameKind::Request),
            Self::LABEL_KEEP_ALIVE => Ok(FrameKind::KeepAlive),
            Self::LABEL_UNAVAILABLE => Ok(FrameKind::Unavailable),
            other => Err(FrameError::UnknownHeaderKind(String::from_utf8_lossy(other).into_owned())),
        }
    }

    pub fn is_sequenced(&self) -> bool {
        *self == FrameKind::Data
    }
}

impl Display for FrameKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.label()))
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub sequence_id: u64,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(sequence_id: u64, payload: Bytes) -> Frame {
        Frame {
            sequence_id,
            kind: FrameKind::Data,
            payload,
        }
    }

    pub fn request(missing_id: u64) -> Frame {
        Self::control(FrameKind::Request, Bytes::from(missing_id.to_string()))
    }

    pub fn unavailable(missing_id: u64) -> Frame {
        Self::control(FrameKind::Unavailable, Bytes::from(missing_id.to_string()))
    }

    pub fn keep_alive() -> Frame {
        Self::control(FrameKind::KeepAlive, Bytes::new())
    }

    fn control(kind: FrameKind, payload: Bytes) -> Frame {
        Frame {
            sequence_id: CONTROL_SEQUENCE_ID,
            kind,
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        let sequence_id = self.sequence_id.to_string();
        let label = self.kind.label();

        let mut buf = BytesMut::with_capacity(sequence_id.len() + label.len() + self.payload.len() + 2);
        buf.put_slice(sequence_id.as_bytes());
        buf.put_u8(DELIMITER);
        buf.put_slice(label);
        buf.put_u8(DELIMITER);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// The payload is everything after the second delimiter, so it may contain delimiters
    ///  itself
    pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
        let mut parts = buf.splitn(3, |&b| b == DELIMITER);

        // splitn yields at least one (possibly empty) part, so the id is always there
        let raw_id = parts.next().unwrap_or_default();
        let raw_kind = parts.next()
            .ok_or(FrameError::Malformed("missing header delimiter"))?;
        let payload = parts.next()
            .ok_or(FrameError::Malformed("missing payload delimiter"))?;

        Ok(Frame {
            sequence_id: parse_sequence_id(raw_id)?,
            kind: FrameKind::from_label(raw_kind)?,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// control frames referring to a sequenced message carry its id as their payload
    pub fn referenced_sequence_id(&self) -> Result<u64, FrameError> {
        parse_sequence_id(&self.payload)
    }
}

fn parse_sequence_id(raw: &[u8]) -> Result<u64, FrameError> {
    if raw.is_empty() || !raw.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::Malformed("sequence id is not a decimal number"));
    }

    // all ASCII digits, so this is valid UTF-8
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(FrameError::Malformed("sequence id is out of range"))
}
