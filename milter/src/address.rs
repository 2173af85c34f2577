use super::*;
use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::{char, digit1},
    combinator::{all_consuming, map, map_res, rest, verify},
    sequence::{preceded, separated_pair},
    IResult, Parser,
};
use std::net::{SocketAddrV4, SocketAddrV6};

/// Where a filter listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketSpec {
    /// Local domain socket path
    Unix(String),
    /// IPv4 host and port
    Inet { host: String, port: u16 },
    /// IPv6 host and port
    Inet6 { host: String, port: u16 },
}

impl SocketSpec {
    /// Parses `unix:/path`, `local:/path`, `inet:port@host` or
    /// `inet6:port@host`.
    pub fn parse(input: &str) -> Result<Self, MilterError> {
        let trimmed = input.trim();
        all_consuming(socket_spec)
            .parse(trimmed)
            .map(|(_, spec)| spec)
            .map_err(|e| MilterError::parse(e.to_string(), input))
    }
}

impl std::fmt::Display for SocketSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketSpec::Unix(path) => write!(f, "unix:{}", path),
            SocketSpec::Inet { host, port } => write!(f, "inet:{}@{}", port, host),
            SocketSpec::Inet6 { host, port } => write!(f, "inet6:{}@{}", port, host),
        }
    }
}

fn socket_spec(input: &str) -> IResult<&str, SocketSpec> {
    alt((parse_local, parse_inet6, parse_inet)).parse(input)
}

fn parse_local(input: &str) -> IResult<&str, SocketSpec> {
    map(
        preceded(
            alt((tag_no_case("unix:"), tag_no_case("local:"))),
            verify(rest, |path: &str| path.starts_with('/')),
        ),
        |path: &str| SocketSpec::Unix(path.to_string()),
    )
    .parse(input)
}

fn parse_inet(input: &str) -> IResult<&str, SocketSpec> {
    map(preceded(tag_no_case("inet:"), port_at_host), |(port, host)| {
        SocketSpec::Inet { host, port }
    })
    .parse(input)
}

fn parse_inet6(input: &str) -> IResult<&str, SocketSpec> {
    map(preceded(tag_no_case("inet6:"), port_at_host), |(port, host)| {
        SocketSpec::Inet6 { host, port }
    })
    .parse(input)
}

fn port_at_host(input: &str) -> IResult<&str, (u16, String)> {
    map(
        separated_pair(
            map_res(digit1, |port: &str| port.parse::<u16>()),
            char('@'),
            take_while1(|c: char| !c.is_whitespace()),
        ),
        |(port, host): (u16, &str)| {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            (port, host.to_string())
        },
    )
    .parse(input)
}

/// Address of the SMTP client as reported in the CONNECT phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAddr {
    Unknown,
    Local(String),
    Inet(SocketAddrV4),
    Inet6(SocketAddrV6),
}

impl ClientAddr {
    pub fn family(&self) -> u8 {
        match self {
            ClientAddr::Unknown => b'U',
            ClientAddr::Local(_) => b'L',
            ClientAddr::Inet(_) => b'4',
            ClientAddr::Inet6(_) => b'6',
        }
    }
}

impl From<std::net::SocketAddr> for ClientAddr {
    fn from(addr: std::net::SocketAddr) -> Self {
        match addr {
            std::net::SocketAddr::V4(v4) => ClientAddr::Inet(v4),
            std::net::SocketAddr::V6(v6) => ClientAddr::Inet6(v6),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local() {
        assert_eq!(
            SocketSpec::parse("unix:/var/run/milter.sock").unwrap(),
            SocketSpec::Unix("/var/run/milter.sock".to_string())
        );
        assert_eq!(
            SocketSpec::parse("LOCAL:/tmp/f.sock").unwrap(),
            SocketSpec::Unix("/tmp/f.sock".to_string())
        );
        assert!(SocketSpec::parse("unix:relative.sock").is_err());
    }

    #[test]
    fn test_parse_inet() {
        assert_eq!(
            SocketSpec::parse("inet:8891@localhost").unwrap(),
            SocketSpec::Inet {
                host: "localhost".to_string(),
                port: 8891
            }
        );
        assert_eq!(
            SocketSpec::parse(" inet6:2525@[::1] ").unwrap(),
            SocketSpec::Inet6 {
                host: "::1".to_string(),
                port: 2525
            }
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!(SocketSpec::parse("inet:99999@localhost").is_err());
        assert!(SocketSpec::parse("inet:@localhost").is_err());
        assert!(SocketSpec::parse("inet:25").is_err());
        assert!(SocketSpec::parse("tcp:25@localhost").is_err());
        assert!(SocketSpec::parse("").is_err());
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let spec = SocketSpec::Inet {
            host: "10.0.0.5".to_string(),
            port: 1234,
        };
        assert_eq!(spec.to_string(), "inet:1234@10.0.0.5");
        assert_eq!(SocketSpec::parse(&spec.to_string()).unwrap(), spec);
    }

    #[test]
    fn test_client_addr_family() {
        let addr: std::net::SocketAddr = "192.0.2.10:25".parse().unwrap();
        assert_eq!(ClientAddr::from(addr).family(), b'4');
        assert_eq!(ClientAddr::Unknown.family(), b'U');
        assert_eq!(ClientAddr::Local("/tmp/s".to_string()).family(), b'L');
    }
}
