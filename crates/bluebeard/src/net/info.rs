use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

use super::message::MessageError;
use super::version::VersionInfo;

pub const MAX_STRING_LEN: usize = 254;

/// What a game server advertises about itself to the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub level_name: String,
    pub game_mode: String,
    pub max_players: u8,
    pub num_players: u8,
    pub version: VersionInfo,
    /// Address the server believes it has, usually a LAN address.
    pub address: SocketAddr,
    pub internal_port: u16,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            level_name: String::new(),
            game_mode: String::new(),
            max_players: 0,
            num_players: 0,
            version: VersionInfo::default(),
            address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            internal_port: 0,
        }
    }
}

impl ServerInfo {
    pub(crate) fn write(&self, buf: &mut impl BufMut) {
        write_string(buf, &self.name);
        write_string(buf, &self.level_name);
        write_string(buf, &self.game_mode);
        buf.put_u8(self.max_players);
        buf.put_u8(self.num_players);
        self.version.write(buf);
        write_addr(buf, &self.address);
        buf.put_u16(self.internal_port);
    }

    pub(crate) fn read(buf: &mut impl Buf) -> Result<Self, MessageError> {
        let name = read_string(buf)?;
        let level_name = read_string(buf)?;
        let game_mode = read_string(buf)?;
        if buf.remaining() < 2 {
            return Err(MessageError::Truncated("player counts"));
        }
        let max_players = buf.get_u8();
        let num_players = buf.get_u8();
        let version = VersionInfo::read(buf)?;
        let address = read_addr(buf)?;
        if buf.remaining() < 2 {
            return Err(MessageError::Truncated("internal port"));
        }
        Ok(Self {
            name,
            level_name,
            game_mode,
            max_players,
            num_players,
            version,
            address,
            internal_port: buf.get_u16(),
        })
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {} {}/{} {} at {} (internal port {})",
            self.name,
            self.version,
            self.level_name,
            self.num_players,
            self.max_players,
            self.game_mode,
            self.address,
            self.internal_port
        )
    }
}

fn truncated(s: &str) -> &str {
    if s.len() <= MAX_STRING_LEN {
        return s;
    }
    let mut end = MAX_STRING_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

pub(crate) fn write_string(buf: &mut impl BufMut, s: &str) {
    let s = truncated(s);
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn read_string(buf: &mut impl Buf) -> Result<String, MessageError> {
    if !buf.has_remaining() {
        return Err(MessageError::Truncated("string length"));
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(MessageError::Truncated("string"));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| MessageError::InvalidString)
}

pub(crate) fn write_addr(buf: &mut impl BufMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

pub(crate) fn read_addr(buf: &mut impl Buf) -> Result<SocketAddr, MessageError> {
    if !buf.has_remaining() {
        return Err(MessageError::Truncated("address family"));
    }
    let ip = match buf.get_u8() {
        4 => {
            if buf.remaining() < 4 + 2 {
                return Err(MessageError::Truncated("address"));
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            if buf.remaining() < 16 + 2 {
                return Err(MessageError::Truncated("address"));
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        family => return Err(MessageError::AddressFamily(family)),
    };
    Ok(SocketAddr::new(ip, buf.get_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_long_strings_truncated() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, &"é".repeat(200));
        let s = read_string(&mut buf.freeze()).unwrap();
        assert!(s.len() <= MAX_STRING_LEN);
        assert_eq!(s.chars().count(), 127);
    }

    #[test]
    fn test_ipv6_address() {
        let addr: SocketAddr = "[::1]:27016".parse().unwrap();
        let mut buf = BytesMut::new();
        write_addr(&mut buf, &addr);
        assert_eq!(buf.len(), 1 + 16 + 2);
        assert_eq!(read_addr(&mut buf.freeze()).unwrap(), addr);
    }

    #[test]
    fn test_unknown_family() {
        let mut data: &[u8] = &[9, 0, 0];
        assert_eq!(read_addr(&mut data), Err(MessageError::AddressFamily(9)));
    }
}
