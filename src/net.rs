//! Socket construction helpers.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Creates a UDP socket that receives broadcast traffic on `addr`.
///
/// SO_REUSEADDR (and SO_REUSEPORT on unix) let other listeners share the
/// discovery port, as the vendor's own tooling expects.
pub fn broadcast_listener(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let socket = UdpSocket::from_std(socket.into())?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Creates an ephemeral UDP socket with broadcast transmission enabled.
pub async fn ephemeral_broadcast_socket() -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_listener_port_is_shareable() {
        let first =
            broadcast_listener(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
        let addr = first.local_addr().unwrap();

        // A second listener on the same port must succeed.
        let second = broadcast_listener(addr);
        assert!(second.is_ok(), "second bind failed: {:?}", second.err());
    }

    #[tokio::test]
    async fn test_ephemeral_socket_binds_any_port() {
        let socket = ephemeral_broadcast_socket().await.unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }
}
