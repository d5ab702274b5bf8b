use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};

use super::message::MessageError;

/// Build identity exchanged during the handshake: a one-character product kind
/// plus major/minor numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VersionInfo {
    pub kind: u8,
    pub major: u8,
    pub minor: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionVerdict {
    Accept,
    TypeMismatch,
    VersionMismatch,
}

impl VersionInfo {
    pub const fn new(kind: u8, major: u8, minor: u8) -> Self {
        Self { kind, major, minor }
    }

    pub fn same_kind(&self, other: &VersionInfo) -> bool {
        self.kind.eq_ignore_ascii_case(&other.kind)
    }

    /// Compares major/minor only.
    pub fn compare(&self, other: &VersionInfo) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }

    pub fn is_newer_than(&self, other: &VersionInfo) -> bool {
        self.compare(other) == Ordering::Greater
    }

    /// Exact-match policy: same kind and same version.
    pub fn check(&self, peer: &VersionInfo) -> VersionVerdict {
        if !self.same_kind(peer) {
            VersionVerdict::TypeMismatch
        } else if self.compare(peer) != Ordering::Equal {
            VersionVerdict::VersionMismatch
        } else {
            VersionVerdict::Accept
        }
    }

    pub(crate) fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_u8(self.major);
        buf.put_u8(self.minor);
    }

    pub(crate) fn read(buf: &mut impl Buf) -> Result<Self, MessageError> {
        if buf.remaining() < 3 {
            return Err(MessageError::Truncated("version"));
        }
        Ok(Self::new(buf.get_u8(), buf.get_u8(), buf.get_u8()))
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}.{:02}", self.kind as char, self.major, self.minor)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("malformed version string: {0:?}")]
pub struct ParseVersionError(String);

impl FromStr for VersionInfo {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError(s.to_string());
        let mut chars = s.chars();
        let kind = chars.next().filter(char::is_ascii_alphabetic).ok_or_else(err)?;
        let (major, minor) = chars.as_str().split_once('.').ok_or_else(err)?;
        Ok(Self::new(
            kind as u8,
            major.parse().map_err(|_| err())?,
            minor.parse().map_err(|_| err())?,
        ))
    }
}
