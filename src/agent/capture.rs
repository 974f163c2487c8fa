//! Capture agent: runs on the network of the discovering clients.
//!
//! Listens for broadcast discovery queries, tunnels each one to the
//! responder agent, and unicasts relayed replies back to the client that
//! issued the query.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::config::CaptureConfig;
use crate::error::{BridgeError, Result};
use crate::net;
use crate::protocol::{Envelope, FrameCodec};

/// The client-side half of the bridge.
///
/// The broadcast listener is bound once and survives tunnel reconnects;
/// queries arriving while the tunnel is down are drained and dropped,
/// matching the discovery protocol's own at-most-once semantics.
pub struct CaptureAgent {
    discovery: UdpSocket,
    reply: UdpSocket,
    peer_host: String,
    config: CaptureConfig,
}

impl CaptureAgent {
    /// Binds the broadcast listener and the reply socket.
    pub async fn bind(peer_host: impl Into<String>, config: CaptureConfig) -> Result<Self> {
        let listen = SocketAddr::from((config.listen_addr, config.discovery_port));
        let discovery = net::broadcast_listener(listen)?;
        let reply = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;

        info!("discovery listener on {}", discovery.local_addr()?);

        Ok(Self {
            discovery,
            reply,
            peer_host: peer_host.into(),
            config,
        })
    }

    /// Address the broadcast listener is bound to.
    pub fn discovery_addr(&self) -> Result<SocketAddr> {
        Ok(self.discovery.local_addr()?)
    }

    /// Runs the connect/serve/reconnect loop.
    ///
    /// Returns only on a fatal configuration error; transient connection
    /// failures are retried after the configured delay. The discovery
    /// socket is drained in every disconnected phase, including while a
    /// connection attempt is in flight, so no query is ever queued for a
    /// tunnel that was not up when it arrived.
    pub async fn run(&self) -> Result<()> {
        let mut ever_resolved = false;

        loop {
            let connected = tokio::select! {
                res = self.connect(&mut ever_resolved) => res?,
                _ = self.drain_discovery() => continue,
            };

            if let Some(stream) = connected {
                // Queries that slipped in as the connect resolved are
                // still pre-tunnel traffic; drop them before serving.
                self.flush_pending();
                info!("tunnel connected");
                if let Err(e) = self.serve(stream).await {
                    debug!("tunnel error: {}", e);
                }
                info!(
                    "tunnel connection lost, reconnecting in {:?}",
                    self.config.reconnect_delay
                );
            }

            self.drain_while_disconnected().await;
        }
    }

    /// Resolves the responder host and opens the tunnel. `Ok(None)` is a
    /// transient failure the caller should retry after the backoff.
    ///
    /// A hostname that has never resolved is a configuration error and
    /// fatal; once it has resolved, later resolution failures are treated
    /// as transient (a DNS outage, not a bad hostname) and retried.
    async fn connect(&self, ever_resolved: &mut bool) -> Result<Option<TcpStream>> {
        let peer = match self.resolve_peer().await {
            Ok(peer) => {
                *ever_resolved = true;
                peer
            }
            Err(e) if !*ever_resolved => return Err(e),
            Err(e) => {
                info!(
                    "peer resolution failed: {}; retrying in {:?}",
                    e, self.config.reconnect_delay
                );
                return Ok(None);
            }
        };

        info!("connecting to responder at {}", peer);
        match TcpStream::connect(peer).await {
            Ok(stream) => Ok(Some(stream)),
            Err(e) => {
                info!(
                    "connect to {} failed: {}; retrying in {:?}",
                    peer, e, self.config.reconnect_delay
                );
                Ok(None)
            }
        }
    }

    /// Resolves the responder host.
    async fn resolve_peer(&self) -> Result<SocketAddr> {
        let target = format!("{}:{}", self.peer_host, self.config.tunnel_port);
        lookup_host(&target)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| BridgeError::UnresolvedHost(self.peer_host.clone()))
    }

    /// Shuttles datagrams and frames while the tunnel is up. Returns `Ok`
    /// on orderly peer close, `Err` on any tunnel IO failure.
    async fn serve(&self, mut stream: TcpStream) -> Result<()> {
        let (mut reader, mut writer) = stream.split();
        let mut codec = FrameCodec::new();
        let mut udp_buf = vec![0u8; 2048];
        let mut tcp_buf = vec![0u8; 4096];

        loop {
            tokio::select! {
                res = self.discovery.recv_from(&mut udp_buf) => {
                    let (len, addr) = res?;
                    let SocketAddr::V4(source) = addr else {
                        debug!("ignoring non-IPv4 query from {}", addr);
                        continue;
                    };

                    debug!("query of {} bytes from {}", len, source);
                    let envelope = Envelope::new(source, Bytes::copy_from_slice(&udp_buf[..len]));
                    let frame = FrameCodec::encode(&envelope.encode())?;
                    writer.write_all(&frame).await?;
                }
                res = reader.read(&mut tcp_buf) => {
                    let n = res?;
                    if n == 0 {
                        return Ok(());
                    }

                    let mut bodies = Vec::new();
                    codec.decode(&tcp_buf[..n], |body| bodies.push(body));

                    for body in bodies {
                        match Envelope::decode(&body) {
                            Ok(envelope) => self.relay_reply(envelope).await,
                            Err(e) => warn!("dropping malformed envelope: {}", e),
                        }
                    }
                }
            }
        }
    }

    /// Unicasts a relayed reply back to the client that sent the query.
    async fn relay_reply(&self, envelope: Envelope) {
        debug!(
            "relaying {} bytes to {}",
            envelope.payload.len(),
            envelope.source
        );
        if let Err(e) = self
            .reply
            .send_to(&envelope.payload, SocketAddr::V4(envelope.source))
            .await
        {
            debug!("reply to {} failed: {}", envelope.source, e);
        }
    }

    /// Receives and drops queries for as long as it runs. Nothing is
    /// queued: a query the tunnel cannot carry is lost, exactly as it
    /// would be if no device were listening. Returns only on a socket
    /// error.
    async fn drain_discovery(&self) {
        let mut buf = [0u8; 2048];
        loop {
            match self.discovery.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    debug!("dropping {}-byte query from {} while disconnected", len, addr)
                }
                Err(e) => {
                    debug!("discovery socket error while disconnected: {}", e);
                    return;
                }
            }
        }
    }

    /// Drops any queries already sitting in the socket buffer.
    fn flush_pending(&self) {
        let mut buf = [0u8; 2048];
        while let Ok((len, addr)) = self.discovery.try_recv_from(&mut buf) {
            debug!("dropping {}-byte query from {} while disconnected", len, addr);
        }
    }

    /// Sits out the reconnect delay, dropping any queries that arrive.
    async fn drain_while_disconnected(&self) {
        let backoff = tokio::time::sleep(self.config.reconnect_delay);
        tokio::pin!(backoff);

        tokio::select! {
            _ = &mut backoff => {}
            _ = self.drain_discovery() => {
                // Socket error; still honor the backoff before reconnecting.
                backoff.await;
            }
        }
    }
}
