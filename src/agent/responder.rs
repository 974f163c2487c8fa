//! Responder agent: runs on the network of the discoverable devices.
//!
//! Accepts the tunnel from the capture agent, re-broadcasts each tunneled
//! query on its own network, and relays every reply that arrives within the
//! collection window back through the tunnel.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ResponderConfig;
use crate::error::Result;
use crate::net;
use crate::protocol::{Envelope, FrameCodec};

/// The device-side half of the bridge.
///
/// Single-tenant by design: one capture agent per responder. A newly
/// accepted tunnel connection replaces the live one.
pub struct ResponderAgent {
    listener: TcpListener,
    config: ResponderConfig,
}

impl ResponderAgent {
    /// Binds the tunnel listener. A port already in use is a fatal
    /// configuration error and surfaces here.
    pub async fn bind(config: ResponderConfig) -> Result<Self> {
        let addr = SocketAddr::from((config.bind_addr, config.tunnel_port));
        let listener = TcpListener::bind(addr).await?;
        info!("tunnel listener on {}", listener.local_addr()?);
        Ok(Self { listener, config })
    }

    /// Address the tunnel listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts tunnel connections and serves them one at a time.
    pub async fn run(&self) -> Result<()> {
        let (mut stream, mut peer) = self.listener.accept().await?;

        loop {
            info!("capture agent at {} connected", peer);
            match self.serve(stream).await {
                Some((next_stream, next_peer)) => {
                    info!("replacing live tunnel with new connection");
                    (stream, peer) = (next_stream, next_peer);
                }
                None => {
                    info!("tunnel connection closed");
                    (stream, peer) = self.listener.accept().await?;
                }
            }
        }
    }

    /// Serves one tunnel connection until it dies or a replacement
    /// connection arrives, in which case the replacement is returned.
    async fn serve(&self, mut stream: TcpStream) -> Option<(TcpStream, SocketAddr)> {
        let (mut reader, mut writer) = stream.split();
        let mut codec = FrameCodec::new();
        // Window tasks funnel their framed replies here; dropping the
        // receiver on connection loss swallows late replies.
        let (reply_tx, mut reply_rx) = mpsc::channel::<Bytes>(64);
        let mut buf = vec![0u8; 4096];

        loop {
            tokio::select! {
                res = reader.read(&mut buf) => {
                    match res {
                        Ok(0) => return None,
                        Ok(n) => {
                            let mut bodies = Vec::new();
                            codec.decode(&buf[..n], |body| bodies.push(body));

                            for body in bodies {
                                match Envelope::decode(&body) {
                                    Ok(query) => self.spawn_query(query, reply_tx.clone()),
                                    Err(e) => warn!("dropping malformed envelope: {}", e),
                                }
                            }
                        }
                        Err(e) => {
                            debug!("tunnel read error: {}", e);
                            return None;
                        }
                    }
                }
                Some(frame) = reply_rx.recv() => {
                    if let Err(e) = writer.write_all(&frame).await {
                        debug!("tunnel write error: {}", e);
                        return None;
                    }
                }
                res = self.listener.accept() => {
                    match res {
                        Ok(replacement) => return Some(replacement),
                        Err(e) => debug!("accept error: {}", e),
                    }
                }
            }
        }
    }

    /// Starts an independent collection window for one query. Each query
    /// gets its own ephemeral socket, so overlapping windows never mix.
    fn spawn_query(&self, query: Envelope, reply_tx: mpsc::Sender<Bytes>) {
        let target = SocketAddr::from((self.config.broadcast_addr, self.config.discovery_port));
        let window = self.config.reply_window;

        tokio::spawn(async move {
            if let Err(e) = run_query_window(query, target, window, reply_tx).await {
                debug!("query relay failed: {}", e);
            }
        });
    }
}

/// Broadcasts one query and relays every reply received before the window
/// elapses, each re-wrapped with the query's original source address so the
/// capture agent can route it back. Replies after the window are lost.
async fn run_query_window(
    query: Envelope,
    target: SocketAddr,
    window: Duration,
    reply_tx: mpsc::Sender<Bytes>,
) -> Result<()> {
    let socket = net::ephemeral_broadcast_socket().await?;
    socket.send_to(&query.payload, target).await?;
    debug!(
        "broadcast {} bytes on behalf of {}",
        query.payload.len(),
        query.source
    );

    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    let mut buf = vec![0u8; 2048];

    loop {
        tokio::select! {
            _ = &mut deadline => return Ok(()),
            res = socket.recv_from(&mut buf) => {
                let (len, from) = res?;
                debug!("reply of {} bytes from {} for {}", len, from, query.source);

                let reply = Envelope::new(query.source, Bytes::copy_from_slice(&buf[..len]));
                let frame = FrameCodec::encode(&reply.encode())?;

                // A closed or replaced tunnel swallows the reply.
                if reply_tx.send(frame).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tokio::net::UdpSocket;

    async fn start_agent(window: Duration) -> (SocketAddr, UdpSocket) {
        let device = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let config = ResponderConfig {
            bind_addr: Ipv4Addr::LOCALHOST,
            tunnel_port: 0,
            broadcast_addr: Ipv4Addr::LOCALHOST,
            discovery_port: device.local_addr().unwrap().port(),
            reply_window: window,
        };

        let agent = ResponderAgent::bind(config).await.unwrap();
        let addr = agent.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = agent.run().await;
        });
        (addr, device)
    }

    async fn send_query(tunnel: &mut TcpStream, source: SocketAddrV4, payload: &'static [u8]) {
        let query = Envelope::new(source, Bytes::from_static(payload));
        let frame = FrameCodec::encode(&query.encode()).unwrap();
        tunnel.write_all(&frame).await.unwrap();
    }

    async fn next_frames(stream: &mut TcpStream, codec: &mut FrameCodec, n: usize) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut buf = [0u8; 2048];
        while out.len() < n {
            let read = stream.read(&mut buf).await.unwrap();
            assert!(read > 0, "tunnel closed before {} frames arrived", n);
            codec.decode(&buf[..read], |body| out.push(body));
        }
        out
    }

    const CLIENT: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 54321);

    #[tokio::test]
    async fn test_single_query_single_reply() {
        let (addr, device) = start_agent(Duration::from_millis(300)).await;
        let mut tunnel = TcpStream::connect(addr).await.unwrap();

        send_query(&mut tunnel, CLIENT, b"QUERY").await;

        // The device sees the re-broadcast query and answers.
        let mut buf = [0u8; 64];
        let (len, from) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"QUERY");
        device.send_to(b"REPLY", from).await.unwrap();

        // The reply comes back tagged with the original client address.
        let mut codec = FrameCodec::new();
        let frames = next_frames(&mut tunnel, &mut codec, 1).await;
        let reply = Envelope::decode(&frames[0]).unwrap();
        assert_eq!(reply.source, CLIENT);
        assert_eq!(&reply.payload[..], b"REPLY");
    }

    #[tokio::test]
    async fn test_multiple_replies_all_relayed() {
        let (addr, device) = start_agent(Duration::from_millis(300)).await;
        let mut tunnel = TcpStream::connect(addr).await.unwrap();

        send_query(&mut tunnel, CLIENT, b"QUERY").await;

        let mut buf = [0u8; 64];
        let (_, from) = device.recv_from(&mut buf).await.unwrap();
        // Three devices answering one broadcast.
        for reply in [b"R1", b"R2", b"R3"] {
            device.send_to(reply, from).await.unwrap();
        }

        let mut codec = FrameCodec::new();
        let frames = next_frames(&mut tunnel, &mut codec, 3).await;
        let mut payloads = Vec::new();
        for frame in &frames {
            let envelope = Envelope::decode(frame).unwrap();
            assert_eq!(envelope.source, CLIENT);
            payloads.push(envelope.payload);
        }
        payloads.sort();
        assert_eq!(payloads, vec![Bytes::from_static(b"R1"), Bytes::from_static(b"R2"), Bytes::from_static(b"R3")]);
    }

    #[tokio::test]
    async fn test_reply_after_window_not_relayed() {
        let (addr, device) = start_agent(Duration::from_millis(100)).await;
        let mut tunnel = TcpStream::connect(addr).await.unwrap();

        send_query(&mut tunnel, CLIENT, b"QUERY").await;

        let mut buf = [0u8; 64];
        let (_, from) = device.recv_from(&mut buf).await.unwrap();

        // Miss the window, then reply.
        tokio::time::sleep(Duration::from_millis(250)).await;
        device.send_to(b"LATE", from).await.unwrap();

        let mut read_buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_millis(300), tunnel.read(&mut read_buf));
        assert!(read.await.is_err(), "late reply was relayed");
    }

    #[tokio::test]
    async fn test_concurrent_windows_are_independent() {
        let (addr, device) = start_agent(Duration::from_millis(300)).await;
        let mut tunnel = TcpStream::connect(addr).await.unwrap();

        let other = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 40000);
        send_query(&mut tunnel, CLIENT, b"Q1").await;
        send_query(&mut tunnel, other, b"Q2").await;

        // Answer both queries from their own ephemeral sockets.
        let mut buf = [0u8; 64];
        for _ in 0..2 {
            let (len, from) = device.recv_from(&mut buf).await.unwrap();
            match &buf[..len] {
                b"Q1" => device.send_to(b"A1", from).await.unwrap(),
                b"Q2" => device.send_to(b"A2", from).await.unwrap(),
                otherwise => panic!("unexpected query {:?}", otherwise),
            };
        }

        let mut codec = FrameCodec::new();
        let frames = next_frames(&mut tunnel, &mut codec, 2).await;
        let mut routed = Vec::new();
        for frame in &frames {
            let envelope = Envelope::decode(frame).unwrap();
            routed.push((envelope.source, envelope.payload));
        }
        routed.sort();
        assert_eq!(
            routed,
            vec![
                (CLIENT, Bytes::from_static(b"A1")),
                (other, Bytes::from_static(b"A2")),
            ]
        );
    }

    #[tokio::test]
    async fn test_new_connection_replaces_live_tunnel() {
        let (addr, device) = start_agent(Duration::from_millis(300)).await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();

        // The first tunnel is dropped in favor of the second.
        let mut eof_buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_millis(500), first.read(&mut eof_buf));
        assert_eq!(read.await.expect("first tunnel not closed").unwrap(), 0);

        // The second tunnel carries traffic normally.
        send_query(&mut second, CLIENT, b"QUERY").await;
        let mut buf = [0u8; 64];
        let (len, from) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"QUERY");
        device.send_to(b"REPLY", from).await.unwrap();

        let mut codec = FrameCodec::new();
        let frames = next_frames(&mut second, &mut codec, 1).await;
        assert_eq!(&Envelope::decode(&frames[0]).unwrap().payload[..], b"REPLY");
    }

    #[tokio::test]
    async fn test_malformed_envelope_dropped_connection_survives() {
        let (addr, device) = start_agent(Duration::from_millis(300)).await;
        let mut tunnel = TcpStream::connect(addr).await.unwrap();

        // A frame whose body is shorter than the envelope header.
        let bad = FrameCodec::encode(&[1, 2, 3]).unwrap();
        tunnel.write_all(&bad).await.unwrap();

        // A well-formed query on the same connection still works.
        send_query(&mut tunnel, CLIENT, b"QUERY").await;
        let mut buf = [0u8; 64];
        let (len, _) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"QUERY");
    }
}
