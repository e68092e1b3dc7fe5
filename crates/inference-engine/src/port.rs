//! Loopback port allocation
//!
//! This module picks a free TCP port for a worker by binding an ephemeral
//! listener and releasing it. Another process may grab the port before the
//! worker binds it; the health deadline covers that case.

use std::net::{IpAddr, SocketAddr, TcpListener};

use common::error::{Error, Result};

/// Returns `host` paired with a currently free port
pub fn allocate(host: &str) -> Result<SocketAddr> {
    let ip: IpAddr = host
        .parse()
        .map_err(|_| Error::Config(format!("runner host {:?} is not an IP address", host)))?;

    let listener = TcpListener::bind(SocketAddr::new(ip, 0))
        .map_err(|e| Error::Spawn(format!("failed to allocate a port on {}: {}", host, e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Spawn(format!("failed to read allocated port: {}", e)))?
        .port();

    Ok(SocketAddr::new(ip, port))
}

/// HTTP base URL of a worker listening on `addr`
///
/// IPv6 addresses are bracketed.
pub fn base_url(addr: SocketAddr) -> String {
    format!("http://{}", addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocated_port_is_bindable() {
        let addr = allocate("127.0.0.1").unwrap();
        assert_ne!(addr.port(), 0);
        TcpListener::bind(addr).unwrap();
    }

    #[test]
    fn test_base_url_brackets_ipv6() {
        let v4 = SocketAddr::new("127.0.0.1".parse().unwrap(), 4242);
        let v6 = SocketAddr::new("::1".parse().unwrap(), 4242);
        assert_eq!(base_url(v4), "http://127.0.0.1:4242");
        assert_eq!(base_url(v6), "http://[::1]:4242");
    }

    #[test]
    fn test_hostname_is_rejected() {
        assert!(matches!(allocate("localhost"), Err(Error::Config(_))));
    }
}
