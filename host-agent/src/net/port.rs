//! Ephemeral port probing and primary-interface IP detection, the same
//! bind-to-0 / connect-UDP trick as `original_source/utilities/sockets.py`.

use std::net::{IpAddr, SocketAddr, TcpListener, UdpSocket};

use anyhow::{Context, Result};

/// Binds to an OS-chosen TCP port on every interface, reads it back, and
/// drops the listener. Callers that hand the port to a child process must
/// tolerate the race window between this return and the child's bind.
pub fn get_available_port() -> Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", 0)).context("binding ephemeral port")?;
    let port = listener.local_addr().context("reading bound port")?.port();
    Ok(port)
}

/// Opens a UDP socket "connected" to a public address without sending any
/// packet, then reads back the local address the kernel picked for that
/// route. This is the conventional no-traffic trick for primary-interface
/// detection.
pub fn get_primary_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).context("binding probe socket")?;
    socket.connect(("8.8.8.8", 80)).context("connecting probe socket")?;
    let addr: SocketAddr = socket.local_addr().context("reading local address")?;
    Ok(addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_available_port_returns_nonzero() {
        let port = get_available_port().unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn get_available_port_is_rebindable() {
        let port = get_available_port().unwrap();
        let listener = TcpListener::bind(("127.0.0.1", port));
        assert!(listener.is_ok());
    }

    #[test]
    fn get_primary_ip_resolves() {
        // Requires routing table entries; skip gracefully if the sandbox
        // has none configured.
        if let Ok(ip) = get_primary_ip() {
            assert!(!ip.is_unspecified());
        }
    }
}
