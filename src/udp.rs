use crate::address::{Address, parse_address_from_packet};
use crate::conn::{LocalConnection, describe_peer};
use crate::pool::BufferPool;
use crate::protocol::{MAX_DGRAM, ReplyCode};
use crate::reply::{put_address, send_reply};
use anyhow::{Result, anyhow, bail};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc::{self, UnboundedSender, error::TrySendError, unbounded_channel};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info};

/// Associations idle for longer than this are dropped
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How often idle associations are looked for
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Datagrams queued per association before new ones are dropped
const OUTBOUND_QUEUE: usize = 64;

/// (payload, target it came from, association it belongs to)
type Response = (Vec<u8>, SocketAddr, UdpAssociationKey);

/// UdpAssociationKey is the key for tracking UDP associations
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct UdpAssociationKey {
    client_addr: SocketAddr,
    target: Address,
}

/// Outbound feeds datagrams to the task that owns the socket for one
/// client-target pair. Dropping it stops that task.
struct Outbound {
    datagrams: mpsc::Sender<Vec<u8>>,
    last_activity: Instant,
    _stop: DropGuard,
}

/// associate serves a UDP ASSOCIATE request: it binds a relay socket, tells
/// the client where it is, and relays datagrams until the control connection
/// closes or shutdown fires
pub async fn associate<C>(mut conn: C, pool: &BufferPool, shutdown: &CancellationToken) -> Result<()>
where
    C: LocalConnection,
{
    let peer = describe_peer(&conn);
    let unspecified = Address::Socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

    // Datagrams are only accepted from the IP of the control connection
    let peer_ip = match conn.peer_addr()? {
        Address::Socket(addr) => addr.ip(),
        other => {
            send_reply(&mut conn, ReplyCode::ServerFailure, &unspecified, pool).await?;
            bail!("[ERR] UDP ASSOCIATE needs an IP client, got {other}");
        }
    };

    let bind_ip = match conn.local_addr()? {
        Address::Socket(addr) => addr.ip(),
        Address::Domain(..) => Ipv4Addr::UNSPECIFIED.into(),
    };

    let server_socket = match UdpSocket::bind((bind_ip, 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            send_reply(&mut conn, ReplyCode::ServerFailure, &unspecified, pool).await?;
            return Err(e.into());
        }
    };
    let server_addr = server_socket.local_addr()?;

    send_reply(
        &mut conn,
        ReplyCode::Succeeded,
        &Address::Socket(server_addr),
        pool,
    )
    .await?;

    info!("SOCKS5 UDP relay for {peer} listening on {server_addr}");

    let mut outbound: HashMap<UdpAssociationKey, Outbound> = HashMap::new();
    let (response_tx, mut response_rx) = unbounded_channel::<Response>();
    let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
    let mut buffer = vec![0u8; MAX_DGRAM];
    let mut probe = [0u8; 1];

    loop {
        select! {
            // The association lives as long as the TCP connection
            read = conn.read(&mut probe) => match read {
                Ok(0) => {
                    info!("client {peer} disconnected: terminating UDP association");
                    break;
                }
                Ok(_) => debug!("unexpected data on TCP connection during UDP association"),
                Err(e) => {
                    error!("TCP read error for {peer}: {e}");
                    break;
                }
            },

            _ = shutdown.cancelled() => {
                debug!("SOCKS5 UDP association for {peer} closed due to shutdown");
                break;
            }

            // Client -> target
            incoming = server_socket.recv_from(&mut buffer) => match incoming {
                Ok((len, client_addr)) => {
                    if client_addr.ip() != peer_ip {
                        error!("rejected UDP from unauthorized client: {client_addr}");
                        continue;
                    }

                    if let Err(e) = forward_client_datagram(&mut outbound, &buffer[..len], client_addr, &response_tx) {
                        error!("failed to handle client datagram from {client_addr}: {e}");
                    }
                }
                Err(e) => {
                    error!("UDP receive error: {e}");
                    break;
                }
            },

            // Target -> client
            Some((data, target_addr, key)) = response_rx.recv() => {
                if let Some(entry) = outbound.get_mut(&key) {
                    entry.last_activity = Instant::now();
                }

                let client_addr = key.client_addr;

                if let Err(e) = send_response_to_client(&server_socket, &data, target_addr, client_addr).await {
                    error!("error sending response to client {client_addr}: {e}");
                }
            }

            _ = cleanup.tick() => cleanup_expired_associations(&mut outbound, IDLE_TIMEOUT),
        }
    }

    Ok(())
}

/// forward_client_datagram parses a client datagram and queues its payload
/// on the association for that client-target pair, opening one if needed.
/// It never waits on the network.
fn forward_client_datagram(
    outbound: &mut HashMap<UdpAssociationKey, Outbound>,
    packet: &[u8],
    client_addr: SocketAddr,
    response_tx: &UnboundedSender<Response>,
) -> Result<()> {
    // SOCKS5 UDP Request Header
    // +----+------+------+----------+----------+----------+
    // |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
    // +----+------+------+----------+----------+----------+
    // | 2  |  1   |  1   | Variable |    2     | Variable |
    // +----+------+------+----------+----------+----------+
    if packet.len() < 4 {
        bail!("UDP packet too short");
    }

    if packet[2] != 0x00 {
        bail!("UDP fragmentation not supported");
    }

    let (target, addr_len) = parse_address_from_packet(packet, 4, packet[3])?;
    let offset = 4 + addr_len;

    if offset >= packet.len() {
        bail!("no data in UDP packet");
    }

    let data = &packet[offset..];
    let key = UdpAssociationKey {
        client_addr,
        target,
    };

    let entry = outbound
        .entry(key.clone())
        .or_insert_with(|| open_outbound(&key, response_tx));
    let queued = entry.datagrams.try_send(data.to_vec());
    if queued.is_ok() {
        entry.last_activity = Instant::now();
    }

    match queued {
        Ok(()) => {
            debug!("queued {} bytes: {client_addr} -> {}", data.len(), key.target);
            Ok(())
        }
        Err(TrySendError::Full(_)) => bail!("UDP relay to {} is backed up, dropping datagram", key.target),
        Err(TrySendError::Closed(_)) => {
            outbound.remove(&key);
            bail!("UDP relay to {} has stopped", key.target)
        }
    }
}

/// open_outbound starts the task serving one client-target pair
fn open_outbound(key: &UdpAssociationKey, response_tx: &UnboundedSender<Response>) -> Outbound {
    let (datagrams_tx, datagrams_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let stop = CancellationToken::new();

    tokio::spawn(run_outbound(
        key.clone(),
        datagrams_rx,
        response_tx.clone(),
        stop.clone(),
    ));

    Outbound {
        datagrams: datagrams_tx,
        last_activity: Instant::now(),
        _stop: stop.drop_guard(),
    }
}

/// resolve turns a datagram target into a socket address
async fn resolve(target: &Address) -> Result<SocketAddr> {
    match target {
        Address::Socket(addr) => Ok(*addr),
        Address::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
            .await
            .map_err(|e| anyhow!("failed to resolve host '{host}': {e}"))?
            .next()
            .ok_or_else(|| anyhow!("no IP address found for '{host}'")),
    }
}

/// bind_outbound resolves the target and binds a socket of the matching family
async fn bind_outbound(target: &Address) -> Result<(UdpSocket, SocketAddr)> {
    let target_addr = resolve(target).await?;
    let bind_addr: SocketAddr = if target_addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    Ok((UdpSocket::bind(bind_addr).await?, target_addr))
}

/// run_outbound sends queued datagrams to the target and forwards its
/// responses to the relay loop
async fn run_outbound(
    key: UdpAssociationKey,
    mut datagrams: mpsc::Receiver<Vec<u8>>,
    response_tx: UnboundedSender<Response>,
    stop: CancellationToken,
) {
    let client_addr = key.client_addr;

    let (socket, target_addr) = select! {
        _ = stop.cancelled() => return,
        bound = bind_outbound(&key.target) => match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!("failed to open UDP relay {client_addr} -> {}: {e}", key.target);
                return;
            }
        },
    };

    match socket.local_addr() {
        Ok(local) => info!("created new UDP relay: {client_addr} -> {target_addr} (via {local})"),
        Err(_) => info!("created new UDP relay: {client_addr} -> {target_addr}"),
    }

    let mut buffer = vec![0u8; MAX_DGRAM];

    loop {
        select! {
            _ = stop.cancelled() => break,

            datagram = datagrams.recv() => match datagram {
                Some(data) => match socket.send_to(&data, target_addr).await {
                    Ok(_) => debug!("forwarded {} bytes: {client_addr} -> {target_addr}", data.len()),
                    Err(e) => error!("failed to forward datagram to {target_addr}: {e}"),
                },
                None => break,
            },

            received = socket.recv_from(&mut buffer) => match received {
                Ok((len, from_addr)) => {
                    if from_addr != target_addr {
                        error!("unexpected response from {from_addr} (expected {target_addr})");
                        continue;
                    }

                    // Relay loop is gone
                    if response_tx.send((buffer[..len].to_vec(), from_addr, key.clone())).is_err() {
                        break;
                    }

                    debug!("received {len} bytes from {from_addr}");
                }
                Err(e) => {
                    error!("error receiving from outbound socket: {e}");
                    break;
                }
            },
        }
    }

    debug!("stopped UDP relay for {client_addr} -> {target_addr}");
}

/// create_response_packet builds a SOCKS5 UDP response packet
fn create_response_packet(data: &[u8], from_addr: SocketAddr) -> Result<Vec<u8>> {
    //  +----+------+------+----------+----------+----------+
    //  |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
    //  +----+------+------+----------+----------+----------+
    //  | 2  |  1   |  1   | Variable |    2     | Variable |
    //  +----+------+------+----------+----------+----------+
    let mut packet = Vec::with_capacity(data.len() + 22);

    // RSV (2 bytes) and FRAG
    packet.extend_from_slice(&[0x00, 0x00, 0x00]);
    put_address(&mut packet, &Address::Socket(from_addr))?;
    packet.extend_from_slice(data);

    Ok(packet)
}

/// send_response_to_client wraps a target's response and sends it to the client
async fn send_response_to_client(
    server_socket: &UdpSocket,
    data: &[u8],
    target_addr: SocketAddr,
    client_addr: SocketAddr,
) -> Result<()> {
    let response = create_response_packet(data, target_addr)?;
    server_socket.send_to(&response, client_addr).await?;

    debug!(
        "sent {} bytes from {target_addr} to client {client_addr}",
        data.len()
    );

    Ok(())
}

/// cleanup_expired_associations drops outbound sockets idle for longer than `timeout`
fn cleanup_expired_associations(
    outbound: &mut HashMap<UdpAssociationKey, Outbound>,
    timeout: Duration,
) {
    let now = Instant::now();

    outbound.retain(|key, entry| {
        let keep = now.duration_since(entry.last_activity) <= timeout;
        if !keep {
            info!(
                "removed expired UDP relay: {} -> {}",
                key.client_addr, key.target
            );
        }
        keep
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tcp_pair;

    #[test]
    fn response_packet_has_socks_header() {
        let packet = create_response_packet(b"pong", "10.0.0.2:53".parse().unwrap()).unwrap();
        assert_eq!(packet, [0, 0, 0, 0x01, 10, 0, 0, 2, 0x00, 0x35, b'p', b'o', b'n', b'g']);
    }

    #[test]
    fn fragmented_datagram_is_rejected() {
        let (tx, _rx) = unbounded_channel();
        let mut outbound = HashMap::new();
        let packet = [0x00, 0x00, 0x01, 0x01, 127, 0, 0, 1, 0x00, 0x35, b'x'];

        let err = forward_client_datagram(&mut outbound, &packet, "127.0.0.1:5000".parse().unwrap(), &tx)
            .unwrap_err();
        assert!(err.to_string().contains("fragmentation"));
        assert!(outbound.is_empty());
    }

    #[tokio::test]
    async fn idle_associations_are_reaped() {
        let (tx, _rx) = unbounded_channel();
        let mut outbound = HashMap::new();
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut packet = vec![0x00, 0x00, 0x00];
        put_address(&mut packet, &Address::Socket(target.local_addr().unwrap())).unwrap();
        packet.extend_from_slice(b"hello");

        forward_client_datagram(&mut outbound, &packet, "127.0.0.1:5000".parse().unwrap(), &tx).unwrap();
        assert_eq!(outbound.len(), 1);

        cleanup_expired_associations(&mut outbound, IDLE_TIMEOUT);
        assert_eq!(outbound.len(), 1);

        cleanup_expired_associations(&mut outbound, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(1)).await;
        cleanup_expired_associations(&mut outbound, Duration::ZERO);
        assert!(outbound.is_empty());
    }

    #[tokio::test]
    async fn slow_resolve_does_not_stall_the_association() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let pool = BufferPool::default();
        let shutdown = CancellationToken::new();
        let (mut client, server) = tcp_pair().await;
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { associate(server, &pool, &shutdown).await })
        };

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        let relay_port = u16::from_be_bytes([reply[8], reply[9]]);
        let relay_addr = SocketAddr::from(([127, 0, 0, 1], relay_port));
        let udp_client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Resolving this name may take long or never finish
        let mut unresolvable = vec![0x00, 0x00, 0x00];
        put_address(&mut unresolvable, &Address::Domain("relay-test.invalid".into(), 9)).unwrap();
        unresolvable.extend_from_slice(b"lost");
        udp_client.send_to(&unresolvable, relay_addr).await.unwrap();

        // Other targets are still served meanwhile
        let mut datagram = vec![0x00, 0x00, 0x00];
        put_address(&mut datagram, &Address::Socket(echo_addr)).unwrap();
        datagram.extend_from_slice(b"marco");
        udp_client.send_to(&datagram, relay_addr).await.unwrap();

        let mut buf = [0u8; 1500];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), udp_client.recv_from(&mut buf))
            .await
            .expect("no UDP response")
            .unwrap();
        assert_eq!(&buf[..n], datagram.as_slice());

        // And shutdown ends the association right away
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("association did not end on shutdown")
            .unwrap()
            .unwrap();
        drop(client);
    }
}
