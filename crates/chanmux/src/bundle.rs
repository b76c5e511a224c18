//! Tagged records carried on the shared channel.

use std::fmt;

/// Identifier of one logical stream within a Muxer/Demuxer pairing.
///
/// Assigned by the [`Muxer`](crate::Muxer) from 0 upwards and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(u64);

impl Identifier {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for Identifier {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One record on the shared channel: a payload for a logical stream, or
/// that stream's close marker when `payload` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle<T> {
    id: Identifier,
    payload: Option<T>,
}

impl<T> Bundle<T> {
    pub const fn payload(id: Identifier, item: T) -> Self {
        Self {
            id,
            payload: Some(item),
        }
    }

    /// End-of-stream marker for `id`.
    pub const fn close(id: Identifier) -> Self {
        Self { id, payload: None }
    }

    pub const fn id(&self) -> Identifier {
        self.id
    }

    pub const fn is_close(&self) -> bool {
        self.payload.is_none()
    }

    pub const fn item(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    pub fn into_parts(self) -> (Identifier, Option<T>) {
        (self.id, self.payload)
    }
}
