//! SOCKS5 front-end and its remote counterpart.
//!
//! [`SocksProxy`] listens on a local port, accepts SOCKS5 CONNECT requests,
//! and tunnels each client over its own data channel on a peer connection.
//! [`serve_peer_channels`] is the other end: it answers peer-opened
//! channels by dialing the requested destination and relaying bytes.
//!
//! The request/response handshake rides the channel as JSON, followed by
//! raw bytes in both directions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Error, Result};
use crate::socks::{
    self, AuthMethod, Command, Endpoint, Reply, Request, Response,
};
use crate::transport::{DataChannel, PeerConnection, MAX_CHANNEL_PAYLOAD};
use crate::HANDSHAKE_TIMEOUT_MS;

/// A local SOCKS5 endpoint tunneling clients over a peer connection.
pub struct SocksProxy {
    listener: TcpListener,
    connection: Arc<PeerConnection>,
    /// Consent gate: sessions are refused with NOT_ALLOWED while false.
    authorized: Arc<AtomicBool>,
    next_session: AtomicU64,
}

impl SocksProxy {
    /// Bind the local listener. The connection should already be
    /// negotiating or connected.
    pub async fn bind(
        listen_addr: &str,
        connection: Arc<PeerConnection>,
        authorized: Arc<AtomicBool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        tracing::info!("SOCKS5 proxy listening on {}", listener.local_addr()?);
        Ok(SocksProxy {
            listener,
            connection,
            authorized,
            next_session: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept SOCKS5 clients until the peer connection dies.
    pub async fn run(self) -> Result<()> {
        let accept_loop = async {
            loop {
                match self.listener.accept().await {
                    Ok((client, peer)) => {
                        tracing::debug!("SOCKS5 connection from {}", peer);
                        let session = self.next_session.fetch_add(1, Ordering::SeqCst);
                        let connection = Arc::clone(&self.connection);
                        let authorized = Arc::clone(&self.authorized);
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_socks_client(client, session, connection, authorized).await
                            {
                                tracing::debug!("SOCKS5 session {} error: {}", session, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept error: {}", e);
                    }
                }
            }
        };

        tokio::select! {
            _ = accept_loop => {}
            _ = self.connection.once_disconnected() => {
                tracing::info!("Peer connection closed, stopping proxy");
            }
        }
        Ok(())
    }
}

/// Handle one SOCKS5 client: auth handshake, request, channel handshake,
/// then bidirectional relay.
async fn handle_socks_client(
    mut client: TcpStream,
    session: u64,
    connection: Arc<PeerConnection>,
    authorized: Arc<AtomicBool>,
) -> Result<()> {
    // === Auth method negotiation ===
    let methods = read_auth_handshake(&mut client).await?;
    if !methods.contains(&AuthMethod::NoAuth) {
        client
            .write_all(&socks::compose_auth_response(AuthMethod::NoneAcceptable))
            .await?;
        return Err(Error::protocol("client requires authentication"));
    }
    client
        .write_all(&socks::compose_auth_response(AuthMethod::NoAuth))
        .await?;

    // === Request ===
    let request = match read_request(&mut client).await {
        Ok(request) => request,
        Err(e) => {
            reply(&mut client, Reply::Failure).await?;
            return Err(e);
        }
    };

    if !authorized.load(Ordering::Relaxed) {
        reply(&mut client, Reply::NotAllowed).await?;
        return Err(Error::protocol("session not authorized"));
    }
    if request.command != Command::Connect {
        reply(&mut client, Reply::UnsupportedCommand).await?;
        return Err(Error::protocol(format!(
            "unsupported SOCKS command: {:?}",
            request.command
        )));
    }
    tracing::info!(session, destination = %request.endpoint, "SOCKS session starting");

    // === Channel handshake with the peer ===
    let channel = match connection.open_data_channel(&format!("socks-{session}")) {
        Ok(channel) => channel,
        Err(e) => {
            reply(&mut client, Reply::Failure).await?;
            return Err(e);
        }
    };

    let response = match forward_request(&channel, &request).await {
        Ok(response) => response,
        Err(e) => {
            channel.close();
            reply(&mut client, Reply::Failure).await?;
            return Err(e);
        }
    };

    client.write_all(&socks::compose_response(&response)?).await?;
    if response.reply != Reply::Succeeded {
        channel.close();
        return Err(Error::transport(format!(
            "peer refused connection: {:?}",
            response.reply
        )));
    }

    relay(client, channel).await;
    Ok(())
}

/// Read the client greeting: fixed 2-byte header, then exactly the listed
/// method bytes. Frames split across TCP segments or pipelined with the
/// request both parse cleanly.
async fn read_auth_handshake(client: &mut TcpStream) -> Result<Vec<AuthMethod>> {
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await?;
    let mut frame = header.to_vec();
    frame.resize(2 + header[1] as usize, 0);
    client.read_exact(&mut frame[2..]).await?;
    socks::interpret_auth_handshake(&frame)
}

/// Read one request frame: fixed 4-byte header, then the address by type.
async fn read_request(client: &mut TcpStream) -> Result<Request> {
    let mut header = [0u8; 4];
    client.read_exact(&mut header).await?;
    let mut frame = header.to_vec();
    match header[3] {
        // IPv4: 4 address bytes + 2 port bytes
        0x01 => {
            let mut rest = [0u8; 6];
            client.read_exact(&mut rest).await?;
            frame.extend_from_slice(&rest);
        }
        // Domain: 1 length byte + name + 2 port bytes
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            frame.push(len[0]);
            let mut rest = vec![0u8; len[0] as usize + 2];
            client.read_exact(&mut rest).await?;
            frame.extend_from_slice(&rest);
        }
        // IPv6: 16 address bytes + 2 port bytes
        0x04 => {
            let mut rest = [0u8; 18];
            client.read_exact(&mut rest).await?;
            frame.extend_from_slice(&rest);
        }
        other => {
            return Err(Error::malformed(format!(
                "unsupported SOCKS address type: {other}"
            )));
        }
    }
    socks::interpret_request(&frame)
}

/// Send the parsed request over the channel as JSON and wait for the peer's
/// JSON response.
async fn forward_request(channel: &Arc<DataChannel>, request: &Request) -> Result<Response> {
    let encoded = serde_json::to_vec(request).map_err(|e| Error::protocol(e.to_string()))?;
    channel.send(Bytes::from(encoded))?;

    let raw = tokio::time::timeout(
        Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
        channel.receive_next(),
    )
    .await
    .map_err(|_| Error::transport("timed out waiting for peer response"))??;

    serde_json::from_slice(&raw).map_err(|e| Error::malformed(e.to_string()))
}

async fn reply(client: &mut TcpStream, code: Reply) -> Result<()> {
    client
        .write_all(&socks::compose_response(&Response::failure(code))?)
        .await?;
    Ok(())
}

/// Serve channels the peer opens toward us: read the JSON request, dial the
/// destination, answer with a JSON response, then relay bytes.
///
/// Attaches the handler on `peer_opened_channel_queue`; one task per
/// channel.
pub fn serve_peer_channels(connection: &Arc<PeerConnection>) {
    connection
        .peer_opened_channel_queue
        .set_handler(move |channel: Arc<DataChannel>| {
            tokio::spawn(async move {
                let label = channel.label().to_string();
                if let Err(e) = handle_peer_channel(channel).await {
                    tracing::debug!("channel {} service error: {}", label, e);
                }
            });
        });
}

async fn handle_peer_channel(channel: Arc<DataChannel>) -> Result<()> {
    let raw = tokio::time::timeout(
        Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
        channel.receive_next(),
    )
    .await
    .map_err(|_| Error::transport("timed out waiting for request"))??;
    let request: Request =
        serde_json::from_slice(&raw).map_err(|e| Error::malformed(e.to_string()))?;

    if request.command != Command::Connect {
        answer(&channel, &Response::failure(Reply::UnsupportedCommand))?;
        channel.close();
        return Err(Error::protocol("only CONNECT is served"));
    }

    let stream = match TcpStream::connect((request.endpoint.address.as_str(), request.endpoint.port))
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            let code = match e.kind() {
                std::io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
                std::io::ErrorKind::TimedOut => Reply::TtlExpired,
                _ => Reply::Failure,
            };
            answer(&channel, &Response::failure(code))?;
            channel.close();
            return Err(e.into());
        }
    };

    let local = stream.local_addr()?;
    answer(
        &channel,
        &Response {
            reply: Reply::Succeeded,
            endpoint: Endpoint::new(local.ip().to_string(), local.port()),
        },
    )?;

    relay(stream, channel).await;
    Ok(())
}

fn answer(channel: &Arc<DataChannel>, response: &Response) -> Result<()> {
    let encoded = serde_json::to_vec(response).map_err(|e| Error::protocol(e.to_string()))?;
    channel.send(Bytes::from(encoded))?;
    Ok(())
}

/// Bidirectional relay: socket ↔ data channel, until either side finishes.
///
/// Inbound bytes are pulled off the channel one message at a time; a slow
/// client socket backpressures into the channel queue instead of shedding
/// payload.
async fn relay(stream: TcpStream, channel: Arc<DataChannel>) {
    let (mut reader, mut writer) = stream.into_split();

    // Channel → socket.
    let inbound = Arc::clone(&channel);
    let write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                result = inbound.receive_next() => match result {
                    Ok(data) => {
                        if writer.write_all(&data).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                },
                _ = inbound.once_closed() => break,
            }
        }
        // Flush whatever arrived ahead of the close.
        while !inbound.data_from_peer_queue.is_empty() {
            match inbound.receive_next().await {
                Ok(data) => {
                    if writer.write_all(&data).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    });

    // Socket → channel.
    let outbound = Arc::clone(&channel);
    let mut read_task = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_CHANNEL_PAYLOAD];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => match outbound.send(Bytes::copy_from_slice(&buf[..n])) {
                    Ok(true) => {}
                    // Drop is an admission verdict; the stream keeps going.
                    Ok(false) => tracing::debug!("outbound payload dropped by queue management"),
                    Err(_) => break,
                },
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {}
        _ = channel.once_closed() => {
            read_task.abort();
        }
    }

    channel.close();
    let _ = write_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AqmPolicy, PeerConnectionConfig};

    fn make_connection(name: &str, port: u16) -> Arc<PeerConnection> {
        PeerConnection::new(PeerConnectionConfig {
            peer_name: Some(name.to_string()),
            local_endpoint: Endpoint::new("127.0.0.1", port),
            aqm: AqmPolicy::Null,
        })
    }

    fn link(a: &Arc<PeerConnection>, b: &Arc<PeerConnection>) {
        let to_b = Arc::clone(b);
        a.signal_for_peer_queue.set_handler(move |signal| {
            let _ = to_b.handle_signal_message(signal);
        });
        let to_a = Arc::clone(a);
        b.signal_for_peer_queue.set_handler(move |signal| {
            let _ = to_a.handle_signal_message(signal);
        });
        let frames_to_b = Arc::clone(b);
        a.outbound_frames().set_handler(move |frame| {
            let _ = frames_to_b.handle_frame(frame);
        });
        let frames_to_a = Arc::clone(a);
        b.outbound_frames().set_handler(move |frame| {
            let _ = frames_to_a.handle_frame(frame);
        });
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn socks_connect(proxy_addr: SocketAddr, destination: &Endpoint) -> (TcpStream, Response) {
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();

        client
            .write_all(&socks::compose_auth_handshake(&[AuthMethod::NoAuth]).unwrap())
            .await
            .unwrap();
        let mut auth = [0u8; 2];
        client.read_exact(&mut auth).await.unwrap();
        assert_eq!(
            socks::interpret_auth_response(&auth).unwrap(),
            AuthMethod::NoAuth
        );

        let request = Request {
            command: Command::Connect,
            endpoint: destination.clone(),
        };
        client
            .write_all(&socks::compose_request(&request).unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 262];
        let n = client.read(&mut buf).await.unwrap();
        let response = socks::interpret_response(&buf[..n]).unwrap();
        (client, response)
    }

    #[tokio::test]
    async fn test_proxy_end_to_end() {
        let a = make_connection("proxy-side", 5001);
        let b = make_connection("server-side", 5002);
        link(&a, &b);
        a.negotiate_connection().await.unwrap();
        serve_peer_channels(&b);

        let echo_addr = echo_server().await;
        let authorized = Arc::new(AtomicBool::new(true));
        let proxy = SocksProxy::bind("127.0.0.1:0", Arc::clone(&a), authorized)
            .await
            .unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(proxy.run());

        let destination = Endpoint::new(echo_addr.ip().to_string(), echo_addr.port());
        let (mut client, response) = socks_connect(proxy_addr, &destination).await;
        assert_eq!(response.reply, Reply::Succeeded);

        client.write_all(b"ping over the tunnel").await.unwrap();
        let mut echoed = [0u8; 20];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"ping over the tunnel");
    }

    #[tokio::test]
    async fn test_proxy_rejects_unauthorized_session() {
        let a = make_connection("gated-proxy", 5011);
        let b = make_connection("gated-server", 5012);
        link(&a, &b);
        a.negotiate_connection().await.unwrap();
        serve_peer_channels(&b);

        let authorized = Arc::new(AtomicBool::new(false));
        let proxy = SocksProxy::bind("127.0.0.1:0", Arc::clone(&a), authorized)
            .await
            .unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(proxy.run());

        let destination = Endpoint::new("127.0.0.1", 80);
        let (_client, response) = socks_connect(proxy_addr, &destination).await;
        assert_eq!(response.reply, Reply::NotAllowed);
    }

    /// Bind a proxy-served echo destination: linked connection pair,
    /// authorized proxy on an ephemeral port, echo server behind the peer.
    async fn proxied_echo(port_a: u16, port_b: u16) -> (SocketAddr, Endpoint) {
        let a = make_connection("front", port_a);
        let b = make_connection("back", port_b);
        link(&a, &b);
        a.negotiate_connection().await.unwrap();
        serve_peer_channels(&b);

        let echo_addr = echo_server().await;
        let authorized = Arc::new(AtomicBool::new(true));
        let proxy = SocksProxy::bind("127.0.0.1:0", Arc::clone(&a), authorized)
            .await
            .unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(proxy.run());
        (
            proxy_addr,
            Endpoint::new(echo_addr.ip().to_string(), echo_addr.port()),
        )
    }

    /// A server that writes the whole payload at once and closes.
    async fn flood_server(payload: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(&payload).await;
                let _ = socket.shutdown().await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_remote_service_refuses_dead_destination() {
        let a = make_connection("refused-proxy", 5021);
        let b = make_connection("refused-server", 5022);
        link(&a, &b);
        a.negotiate_connection().await.unwrap();
        serve_peer_channels(&b);

        let authorized = Arc::new(AtomicBool::new(true));
        let proxy = SocksProxy::bind("127.0.0.1:0", Arc::clone(&a), authorized)
            .await
            .unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(proxy.run());

        // Port 1 on loopback is almost certainly closed.
        let destination = Endpoint::new("127.0.0.1", 1);
        let (_client, response) = socks_connect(proxy_addr, &destination).await;
        assert_ne!(response.reply, Reply::Succeeded);
    }

    #[tokio::test]
    async fn test_relay_preserves_bulk_stream_with_slow_reader() {
        let a = make_connection("bulk-proxy", 5031);
        let b = make_connection("bulk-server", 5032);
        link(&a, &b);
        a.negotiate_connection().await.unwrap();
        serve_peer_channels(&b);

        let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let server_addr = flood_server(payload.clone()).await;

        let authorized = Arc::new(AtomicBool::new(true));
        let proxy = SocksProxy::bind("127.0.0.1:0", Arc::clone(&a), authorized)
            .await
            .unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(proxy.run());

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(&socks::compose_auth_handshake(&[AuthMethod::NoAuth]).unwrap())
            .await
            .unwrap();
        let mut auth = [0u8; 2];
        client.read_exact(&mut auth).await.unwrap();

        let request = Request {
            command: Command::Connect,
            endpoint: Endpoint::new(server_addr.ip().to_string(), server_addr.port()),
        };
        client
            .write_all(&socks::compose_request(&request).unwrap())
            .await
            .unwrap();
        // The reply is a fixed 10-byte IPv4 frame; relayed payload may
        // already be queued right behind it.
        let mut raw = [0u8; 10];
        client.read_exact(&mut raw).await.unwrap();
        let response = socks::interpret_response(&raw).unwrap();
        assert_eq!(response.reply, Reply::Succeeded);

        // Let the whole stream pile up before the client starts reading.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut received = vec![0u8; payload.len()];
        tokio::time::timeout(Duration::from_secs(30), client.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received == payload, "relayed stream lost or reordered bytes");
    }

    #[tokio::test]
    async fn test_handshake_tolerates_split_writes() {
        let (proxy_addr, destination) = proxied_echo(5041, 5042).await;
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();

        // Greeting one byte at a time.
        for byte in socks::compose_auth_handshake(&[AuthMethod::NoAuth]).unwrap() {
            client.write_all(&[byte]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut auth = [0u8; 2];
        client.read_exact(&mut auth).await.unwrap();
        assert_eq!(
            socks::interpret_auth_response(&auth).unwrap(),
            AuthMethod::NoAuth
        );

        // Request split mid-address.
        let request = Request {
            command: Command::Connect,
            endpoint: destination,
        };
        let encoded = socks::compose_request(&request).unwrap();
        let (head, tail) = encoded.split_at(5);
        client.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        client.write_all(tail).await.unwrap();

        let mut buf = [0u8; 262];
        let n = client.read(&mut buf).await.unwrap();
        let response = socks::interpret_response(&buf[..n]).unwrap();
        assert_eq!(response.reply, Reply::Succeeded);

        client.write_all(b"split").await.unwrap();
        let mut echoed = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"split");
    }

    #[tokio::test]
    async fn test_handshake_accepts_pipelined_greeting_and_request() {
        let (proxy_addr, destination) = proxied_echo(5051, 5052).await;
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();

        // Greeting and request in a single segment.
        let request = Request {
            command: Command::Connect,
            endpoint: destination,
        };
        let mut burst = socks::compose_auth_handshake(&[AuthMethod::NoAuth]).unwrap();
        burst.extend_from_slice(&socks::compose_request(&request).unwrap());
        client.write_all(&burst).await.unwrap();

        let mut auth = [0u8; 2];
        client.read_exact(&mut auth).await.unwrap();
        assert_eq!(
            socks::interpret_auth_response(&auth).unwrap(),
            AuthMethod::NoAuth
        );

        let mut buf = [0u8; 262];
        let n = client.read(&mut buf).await.unwrap();
        let response = socks::interpret_response(&buf[..n]).unwrap();
        assert_eq!(response.reply, Reply::Succeeded);

        client.write_all(b"pipelined").await.unwrap();
        let mut echoed = [0u8; 9];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"pipelined");
    }
}
