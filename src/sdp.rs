//! Line-oriented SDP codec.
//!
//! Only the pieces the relay engine touches are structured: connection lines
//! and media lines. Every other line is kept verbatim so that printing a parsed
//! description reproduces the original body.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::SdpError;

pub const APPLICATION_SDP: &str = "application/sdp";

/// Returns true when `content_type` names an SDP body, ignoring parameters.
pub fn is_sdp(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|value| value.trim().eq_ignore_ascii_case(APPLICATION_SDP))
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
    /// TTL / address count suffix (`/127`, `/127/3`), without the leading slash.
    pub suffix: Option<String>,
}

impl Connection {
    fn parse(value: &str, line: usize) -> Result<Self, SdpError> {
        let mut parts = value.split_whitespace();
        let (Some(net_type), Some(addr_type), Some(address), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SdpError::Malformed {
                line,
                text: format!("c={value}"),
            });
        };
        let (address, suffix) = match address.split_once('/') {
            Some((addr, rest)) => (addr.to_string(), Some(rest.to_string())),
            None => (address.to_string(), None),
        };
        Ok(Self {
            net_type: net_type.to_string(),
            addr_type: addr_type.to_string(),
            address,
            suffix,
        })
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }

    pub fn set_ip(&mut self, ip: IpAddr) {
        self.addr_type = match ip {
            IpAddr::V4(_) => "IP4".to_string(),
            IpAddr::V6(_) => "IP6".to_string(),
        };
        self.address = ip.to_string();
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c={} {} {}", self.net_type, self.addr_type, self.address)?;
        if let Some(suffix) = &self.suffix {
            write!(f, "/{suffix}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpLine {
    Connection(Connection),
    Other(String),
}

impl fmt::Display for SdpLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpLine::Connection(conn) => write!(f, "{conn}"),
            SdpLine::Other(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub kind: String,
    pub port: u16,
    pub port_count: Option<u16>,
    pub proto: String,
    pub formats: Vec<String>,
    /// Lines following the m= line up to the next media section.
    pub lines: Vec<SdpLine>,
}

impl MediaDescription {
    fn parse(value: &str, line: usize) -> Result<Self, SdpError> {
        let mut parts = value.split_whitespace();
        let malformed = || SdpError::Malformed {
            line,
            text: format!("m={value}"),
        };
        let kind = parts.next().ok_or_else(malformed)?;
        let port_spec = parts.next().ok_or_else(malformed)?;
        let proto = parts.next().ok_or_else(malformed)?;

        let invalid_port = || SdpError::InvalidPort {
            line,
            text: port_spec.to_string(),
        };
        let (port, port_count) = match port_spec.split_once('/') {
            Some((port, count)) => (
                port.parse::<u16>().map_err(|_| invalid_port())?,
                Some(count.parse::<u16>().map_err(|_| invalid_port())?),
            ),
            None => (port_spec.parse::<u16>().map_err(|_| invalid_port())?, None),
        };

        Ok(Self {
            kind: kind.to_string(),
            port,
            port_count,
            proto: proto.to_string(),
            formats: parts.map(str::to_string).collect(),
            lines: Vec::new(),
        })
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.lines.iter().find_map(|line| match line {
            SdpLine::Connection(conn) => Some(conn),
            SdpLine::Other(_) => None,
        })
    }

    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.lines.iter_mut().filter_map(|line| match line {
            SdpLine::Connection(conn) => Some(conn),
            SdpLine::Other(_) => None,
        })
    }

    fn fmt_header(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={} {}", self.kind, self.port)?;
        if let Some(count) = self.port_count {
            write!(f, "/{count}")?;
        }
        write!(f, " {}", self.proto)?;
        for format in &self.formats {
            write!(f, " {format}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// Session-level lines, starting with v=.
    pub session: Vec<SdpLine>,
    pub media: Vec<MediaDescription>,
    newline: &'static str,
    trailing_newline: bool,
}

impl SessionDescription {
    pub fn parse(body: &str) -> Result<Self, SdpError> {
        if body.trim().is_empty() {
            return Err(SdpError::Empty);
        }

        let newline = if body.contains("\r\n") { "\r\n" } else { "\n" };
        let mut session = Vec::new();
        let mut media: Vec<MediaDescription> = Vec::new();

        for (idx, raw) in body.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(SdpError::Malformed {
                    line: line_no,
                    text: line.to_string(),
                });
            };
            if key.len() != 1 || !key.as_bytes()[0].is_ascii_alphabetic() {
                return Err(SdpError::Malformed {
                    line: line_no,
                    text: line.to_string(),
                });
            }

            if session.is_empty() && key != "v" {
                return Err(SdpError::MissingVersion);
            }

            let parsed = match key {
                "m" => {
                    media.push(MediaDescription::parse(value, line_no)?);
                    continue;
                }
                "c" => SdpLine::Connection(Connection::parse(value, line_no)?),
                _ => SdpLine::Other(line.to_string()),
            };

            match media.last_mut() {
                Some(current) => current.lines.push(parsed),
                None => session.push(parsed),
            }
        }

        Ok(Self {
            session,
            media,
            newline,
            trailing_newline: body.ends_with('\n'),
        })
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.session.iter().find_map(|line| match line {
            SdpLine::Connection(conn) => Some(conn),
            SdpLine::Other(_) => None,
        })
    }

    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.session.iter_mut().find_map(|line| match line {
            SdpLine::Connection(conn) => Some(conn),
            SdpLine::Other(_) => None,
        })
    }

    /// Remote transport address of media line `index`, falling back to the
    /// session-level connection when the media section has none.
    pub fn media_endpoint(&self, index: usize) -> Option<SocketAddr> {
        let media = self.media.get(index)?;
        let ip = media
            .connection()
            .or_else(|| self.connection())
            .and_then(Connection::ip)?;
        Some(SocketAddr::new(ip, media.port))
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if !first {
                f.write_str(self.newline)?;
            }
            first = false;
            Ok(())
        };

        for line in &self.session {
            sep(f)?;
            write!(f, "{line}")?;
        }
        for media in &self.media {
            sep(f)?;
            media.fmt_header(f)?;
            for line in &media.lines {
                sep(f)?;
                write!(f, "{line}")?;
            }
        }
        if self.trailing_newline {
            f.write_str(self.newline)?;
        }
        Ok(())
    }
}
