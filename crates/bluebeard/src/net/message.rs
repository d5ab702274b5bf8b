use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::info::{ServerInfo, read_addr, read_string, write_addr, write_string};
use super::version::VersionInfo;

/// First byte of every message.
pub mod tag {
    pub const REQUEST_AUTH_TOKEN: u8 = 100;
    pub const AUTH_TOKEN: u8 = 101;
    pub const HEARTBEAT: u8 = 102;
    pub const REMOVE_SERVER: u8 = 103;
    pub const REQUEST_SERVER_LIST: u8 = 104;
    pub const REQUEST_NAT_PUNCHTHROUGH: u8 = 105;
    pub const CUSTOM_MESSAGE: u8 = 106;
    pub const SERVER_LIST: u8 = 107;
    pub const NAT_PUNCH_READY: u8 = 108;

    pub const VERSION_INFO_INTERNAL: u8 = 116;
    pub const VERSION_ACK: u8 = 117;
    pub const VERSION_MISMATCH: u8 = 118;
    pub const TYPE_MISMATCH: u8 = 119;
    pub const VERSION_INFO: u8 = 120;

    pub const FIRST_USER_MESSAGE: u8 = 121;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("empty message")]
    Empty,
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),
    #[error("string is not valid UTF-8")]
    InvalidString,
    #[error("unknown address family {0}")]
    AddressFamily(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RequestAuthToken,
    AuthToken { token: u32 },
    Heartbeat { token: u32, info: ServerInfo },
    RemoveServer { token: u32, internal_port: u16 },
    RequestServerList { token: u32, version: VersionInfo },
    RequestNatPunchthrough { token: u32, server: SocketAddr },
    CustomMessage { text: String },
    ServerList { info: ServerInfo },
    NatPunchReady { peer: SocketAddr },
    VersionInfoInternal(VersionInfo),
    VersionAck,
    VersionMismatch(VersionInfo),
    TypeMismatch(VersionInfo),
    VersionInfo(VersionInfo),
    User { tag: u8, payload: Bytes },
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::RequestAuthToken => tag::REQUEST_AUTH_TOKEN,
            Message::AuthToken { .. } => tag::AUTH_TOKEN,
            Message::Heartbeat { .. } => tag::HEARTBEAT,
            Message::RemoveServer { .. } => tag::REMOVE_SERVER,
            Message::RequestServerList { .. } => tag::REQUEST_SERVER_LIST,
            Message::RequestNatPunchthrough { .. } => tag::REQUEST_NAT_PUNCHTHROUGH,
            Message::CustomMessage { .. } => tag::CUSTOM_MESSAGE,
            Message::ServerList { .. } => tag::SERVER_LIST,
            Message::NatPunchReady { .. } => tag::NAT_PUNCH_READY,
            Message::VersionInfoInternal(_) => tag::VERSION_INFO_INTERNAL,
            Message::VersionAck => tag::VERSION_ACK,
            Message::VersionMismatch(_) => tag::VERSION_MISMATCH,
            Message::TypeMismatch(_) => tag::TYPE_MISMATCH,
            Message::VersionInfo(_) => tag::VERSION_INFO,
            Message::User { tag, .. } => *tag,
        }
    }

    pub fn peek_tag(data: &[u8]) -> Option<u8> {
        data.first().copied()
    }

    /// Messages that must carry a live auth token.
    pub fn auth_token(&self) -> Option<u32> {
        match self {
            Message::Heartbeat { token, .. }
            | Message::RequestServerList { token, .. }
            | Message::RequestNatPunchthrough { token, .. } => Some(*token),
            _ => None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(self.tag());

        match self {
            Message::RequestAuthToken | Message::VersionAck => {}
            Message::AuthToken { token } => buf.put_u32(*token),
            Message::Heartbeat { token, info } => {
                buf.put_u32(*token);
                info.write(&mut buf);
            }
            Message::RemoveServer {
                token,
                internal_port,
            } => {
                buf.put_u32(*token);
                buf.put_u16(*internal_port);
            }
            Message::RequestServerList { token, version } => {
                buf.put_u32(*token);
                version.write(&mut buf);
            }
            Message::RequestNatPunchthrough { token, server } => {
                buf.put_u32(*token);
                write_addr(&mut buf, server);
            }
            Message::CustomMessage { text } => write_string(&mut buf, text),
            Message::ServerList { info } => info.write(&mut buf),
            Message::NatPunchReady { peer } => write_addr(&mut buf, peer),
            Message::VersionInfoInternal(v)
            | Message::VersionMismatch(v)
            | Message::TypeMismatch(v)
            | Message::VersionInfo(v) => v.write(&mut buf),
            Message::User { payload, .. } => buf.put_slice(payload),
        }

        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        let mut buf = data;
        if !buf.has_remaining() {
            return Err(MessageError::Empty);
        }

        let message = match buf.get_u8() {
            tag::REQUEST_AUTH_TOKEN => Message::RequestAuthToken,
            tag::AUTH_TOKEN => Message::AuthToken {
                token: read_u32(&mut buf)?,
            },
            tag::HEARTBEAT => Message::Heartbeat {
                token: read_u32(&mut buf)?,
                info: ServerInfo::read(&mut buf)?,
            },
            tag::REMOVE_SERVER => {
                let token = read_u32(&mut buf)?;
                if buf.remaining() < 2 {
                    return Err(MessageError::Truncated("internal port"));
                }
                Message::RemoveServer {
                    token,
                    internal_port: buf.get_u16(),
                }
            }
            tag::REQUEST_SERVER_LIST => Message::RequestServerList {
                token: read_u32(&mut buf)?,
                version: VersionInfo::read(&mut buf)?,
            },
            tag::REQUEST_NAT_PUNCHTHROUGH => Message::RequestNatPunchthrough {
                token: read_u32(&mut buf)?,
                server: read_addr(&mut buf)?,
            },
            tag::CUSTOM_MESSAGE => Message::CustomMessage {
                text: read_string(&mut buf)?,
            },
            tag::SERVER_LIST => Message::ServerList {
                info: ServerInfo::read(&mut buf)?,
            },
            tag::NAT_PUNCH_READY => Message::NatPunchReady {
                peer: read_addr(&mut buf)?,
            },
            tag::VERSION_INFO_INTERNAL => Message::VersionInfoInternal(VersionInfo::read(&mut buf)?),
            tag::VERSION_ACK => Message::VersionAck,
            tag::VERSION_MISMATCH => Message::VersionMismatch(VersionInfo::read(&mut buf)?),
            tag::TYPE_MISMATCH => Message::TypeMismatch(VersionInfo::read(&mut buf)?),
            tag::VERSION_INFO => Message::VersionInfo(VersionInfo::read(&mut buf)?),
            tag if tag >= tag::FIRST_USER_MESSAGE => Message::User {
                tag,
                payload: Bytes::copy_from_slice(buf),
            },
            tag => return Err(MessageError::UnknownTag(tag)),
        };

        Ok(message)
    }
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, MessageError> {
    if buf.remaining() < 4 {
        return Err(MessageError::Truncated("token"));
    }
    Ok(buf.get_u32())
}
