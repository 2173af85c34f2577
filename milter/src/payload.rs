use super::*;
use bytes::{BufMut, Bytes, BytesMut};

/// CONNECT payload: hostname, family tag and, for known families, the
/// port and textual address.
pub fn connect_payload(hostname: &str, addr: &ClientAddr) -> Bytes {
    let mut buf = BytesMut::with_capacity(hostname.len() + 64);
    put_cstring(&mut buf, hostname);
    buf.put_u8(addr.family());
    match addr {
        ClientAddr::Unknown => {}
        ClientAddr::Local(path) => {
            buf.put_u16(0);
            put_cstring(&mut buf, path);
        }
        ClientAddr::Inet(v4) => {
            buf.put_u16(v4.port());
            put_cstring(&mut buf, &v4.ip().to_string());
        }
        ClientAddr::Inet6(v6) => {
            buf.put_u16(v6.port());
            put_cstring(&mut buf, &v6.ip().to_string());
        }
    }
    buf.freeze()
}

/// Concatenated NUL terminated strings, as used by HELO, MAIL and RCPT.
pub fn strings_payload<S: AsRef<str>>(args: &[S]) -> Bytes {
    let mut buf = BytesMut::new();
    for arg in args {
        put_cstring(&mut buf, arg.as_ref());
    }
    buf.freeze()
}

pub fn header_payload(name: &str, value: &str) -> Bytes {
    strings_payload(&[name, value])
}

/// MACRO payload: the tag of the command the macros belong to followed by
/// name/value pairs.
pub fn macro_payload(command: Command, macros: &[(String, String)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(command.code());
    for (name, value) in macros {
        put_cstring(&mut buf, name);
        put_cstring(&mut buf, value);
    }
    buf.freeze()
}

fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_inet() {
        let addr: std::net::SocketAddr = "192.0.2.7:4321".parse().unwrap();
        let payload = connect_payload("client.example.net", &addr.into());
        let mut expected = b"client.example.net\x004".to_vec();
        expected.extend_from_slice(&4321u16.to_be_bytes());
        expected.extend_from_slice(b"192.0.2.7\0");
        assert_eq!(&payload[..], &expected[..]);
    }

    #[test]
    fn test_connect_unknown_family() {
        let payload = connect_payload("localhost", &ClientAddr::Unknown);
        assert_eq!(&payload[..], b"localhost\0U");
    }

    #[test]
    fn test_connect_local() {
        let payload = connect_payload("localhost", &ClientAddr::Local("/tmp/smtp".to_string()));
        assert_eq!(&payload[..], b"localhost\0L\0\0/tmp/smtp\0");
    }

    #[test]
    fn test_strings() {
        assert_eq!(
            &strings_payload(&["<a@example.org>", "SIZE=100"])[..],
            b"<a@example.org>\0SIZE=100\0"
        );
        assert_eq!(&header_payload("Subject", "hi")[..], b"Subject\0hi\0");
        assert!(strings_payload::<&str>(&[]).is_empty());
    }

    #[test]
    fn test_macros() {
        let macros = vec![
            ("j".to_string(), "mx.example.org".to_string()),
            ("{daemon_name}".to_string(), "MTA".to_string()),
        ];
        assert_eq!(
            &macro_payload(Command::Connect, &macros)[..],
            b"Cj\0mx.example.org\0{daemon_name}\0MTA\0"
        );
    }
}
