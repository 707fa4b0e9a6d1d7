use std::net::{SocketAddr, ToSocketAddrs};

use super::ArgumentsError;

/// Expands the short address forms accepted on the command line: `:port` and a bare `port` get
/// `default_host`, anything else is returned unchanged.
pub fn normalize_address(addr: &str, default_host: &str) -> String {
    let addr = addr.trim();
    if let Some(port) = addr.strip_prefix(':') {
        return format!("{default_host}:{port}");
    }

    match addr.parse::<u16>() {
        Ok(port) => format!("{default_host}:{port}"),
        Err(_) => addr.to_string(),
    }
}

/// Parses an address to listen on, where the short forms mean all interfaces. Domain names are
/// resolved and the first address is used.
pub fn parse_listen_address(arg: &'static str, value: &str) -> Result<SocketAddr, ArgumentsError> {
    let normalized = normalize_address(value, "0.0.0.0");
    let invalid = || ArgumentsError::InvalidSocketAddress {
        arg,
        value: value.to_string(),
    };

    normalized.to_socket_addrs().map_err(|_| invalid())?.next().ok_or_else(invalid)
}

/// Normalizes the address of the local service, where the short forms mean this machine. The
/// address is resolved on every dial, so only its shape is checked here.
pub fn parse_local_address(arg: &'static str, value: &str) -> Result<String, ArgumentsError> {
    let normalized = normalize_address(value, "127.0.0.1");
    let valid = match normalized.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };

    match valid {
        true => Ok(normalized),
        false => Err(ArgumentsError::InvalidSocketAddress {
            arg,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address(":443", "0.0.0.0"), "0.0.0.0:443");
        assert_eq!(normalize_address("8000", "0.0.0.0"), "0.0.0.0:8000");
        assert_eq!(normalize_address("example.com:80", "0.0.0.0"), "example.com:80");
        assert_eq!(normalize_address("[::1]:80", "0.0.0.0"), "[::1]:80");
    }

    #[test]
    fn test_parse_listen_address() {
        assert_eq!(
            parse_listen_address("--listen", ":443").unwrap(),
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 443))
        );
        assert_eq!(
            parse_listen_address("--public", "127.0.0.1:8000").unwrap(),
            SocketAddr::from((Ipv4Addr::LOCALHOST, 8000))
        );
        assert_eq!(
            parse_listen_address("--public", "not an address"),
            Err(ArgumentsError::InvalidSocketAddress {
                arg: "--public",
                value: "not an address".to_string()
            })
        );
        assert!(parse_listen_address("--listen", ":99999").is_err());
    }

    #[test]
    fn test_parse_local_address() {
        assert_eq!(parse_local_address("--local", "22").unwrap(), "127.0.0.1:22");
        assert_eq!(parse_local_address("--local", ":8080").unwrap(), "127.0.0.1:8080");
        assert_eq!(parse_local_address("--local", "db.internal:5432").unwrap(), "db.internal:5432");
        assert!(parse_local_address("--local", "db.internal").is_err());
        assert!(parse_local_address("--local", ":http").is_err());
    }
}
