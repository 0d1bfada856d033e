/*!
 * JSON over UDP transport.
 *
 * Request/response datagram exchange with a per-attempt timeout and retry
 * budget, plus a multicast listener for unsolicited gateway reports. Both
 * ends decode a nested `data` field that arrives as a JSON string, the
 * framing used by multicast hub protocols.
 */
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use domoflow_core::config::NetworkConfig;
use domoflow_core::error::Error as CoreError;
use domoflow_core::types::{value_map_from_json, ValueMap};
use domoflow_core::utils::with_retry;

use crate::device::{DeviceError, Result};

/// Hub replies fit in a single datagram
const REPLY_BUFFER: usize = 1024;

/// Parse a datagram into a [`ValueMap`], decoding a string-typed `data`
/// field as nested JSON in place
fn decode_datagram(bytes: &[u8]) -> Result<ValueMap> {
    let mut msg: JsonValue = serde_json::from_slice(bytes)?;
    if let Some(obj) = msg.as_object_mut() {
        if let Some(JsonValue::String(raw)) = obj.get("data") {
            let nested: JsonValue = serde_json::from_str(raw)?;
            obj.insert("data".to_string(), nested);
        }
    }
    Ok(value_map_from_json(msg))
}

/// A request/response JSON datagram client.
///
/// One socket serves any number of peers; every request awaits a single
/// reply datagram from the addressed peer. Attempts that produce no reply
/// within the configured timeout are retried, and an exhausted retry
/// budget reports the peer as offline.
#[derive(Debug)]
pub struct UdpJsonClient {
    socket: UdpSocket,
    timeout: Duration,
    retries: usize,
}

impl UdpJsonClient {
    /// Create a new client bound to an ephemeral local port
    pub async fn bind(network: &NetworkConfig) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        Ok(Self {
            socket,
            timeout: network.udp_timeout(),
            retries: network.retries,
        })
    }

    /// Send a JSON request to a peer and await its reply
    pub async fn send(&self, payload: &JsonValue, addr: SocketAddr) -> Result<ValueMap> {
        let bytes = serde_json::to_vec(payload)?;
        let socket = &self.socket;
        let request = bytes.as_slice();

        let exchange = with_retry(self.timeout, self.retries, || async move {
            socket.send_to(request, addr).await?;
            let mut buf = vec![0u8; REPLY_BUFFER];
            let (len, _peer) = socket.recv_from(&mut buf).await?;
            buf.truncate(len);
            Ok(buf)
        })
        .await;

        match exchange {
            Ok(reply) => decode_datagram(&reply),
            Err(CoreError::Timeout(_)) => {
                Err(DeviceError::offline(format!("No reply from {}", addr)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send a probe and collect every reply that arrives within the window.
    ///
    /// Malformed datagrams are skipped. An empty result is not an error;
    /// discovery decides what silence means.
    pub async fn collect(
        &self,
        payload: &JsonValue,
        addr: SocketAddr,
        window: Duration,
    ) -> Result<Vec<ValueMap>> {
        let bytes = serde_json::to_vec(payload)?;
        self.socket.send_to(&bytes, addr).await?;

        let mut replies = Vec::new();
        let deadline = Instant::now() + window;
        let mut buf = vec![0u8; REPLY_BUFFER];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, self.socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok((len, peer))) => match decode_datagram(&buf[..len]) {
                    Ok(msg) => replies.push(msg),
                    Err(e) => debug!("Skipping malformed datagram from {}: {}", peer, e),
                },
            }
        }
        Ok(replies)
    }
}

/// A listener joined to a multicast group.
///
/// Hubs announce state changes on a well-known multicast address; the
/// listener yields each announcement as a decoded [`ValueMap`].
#[derive(Debug)]
pub struct UdpMulticastListener {
    socket: UdpSocket,
}

impl UdpMulticastListener {
    /// Create a new listener joined to `group` on `port`
    pub async fn bind(group: Ipv4Addr, port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        Ok(Self { socket })
    }

    /// Get the local address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive the next announcement
    pub async fn recv(&self) -> Result<(ValueMap, SocketAddr)> {
        let mut buf = vec![0u8; REPLY_BUFFER];
        let (len, peer) = self.socket.recv_from(&mut buf).await?;
        let msg = decode_datagram(&buf[..len])?;
        Ok((msg, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domoflow_core::types::Value;
    use serde_json::json;

    fn test_network(timeout_ms: u64, retries: usize) -> NetworkConfig {
        NetworkConfig {
            udp_timeout_ms: timeout_ms,
            retries,
            ..NetworkConfig::default()
        }
    }

    /// Bind a fake hub socket and hand its traffic to `behavior`
    async fn spawn_hub<F, Fut>(behavior: F) -> SocketAddr
    where
        F: FnOnce(UdpSocket) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move { behavior(socket).await });
        addr
    }

    #[tokio::test]
    async fn test_send_decodes_nested_data() {
        let hub = spawn_hub(|socket| async move {
            let mut buf = vec![0u8; 1024];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request: JsonValue = serde_json::from_slice(&buf[..len]).unwrap();
            assert_eq!(request["cmd"], "read");

            let reply = json!({
                "cmd": "read_ack",
                "sid": "158d0001a2b3c4",
                "data": r#"{"power": "on", "bright": 80}"#,
            });
            socket
                .send_to(reply.to_string().as_bytes(), peer)
                .await
                .unwrap();
        })
        .await;

        let client = UdpJsonClient::bind(&test_network(1_000, 0)).await.unwrap();
        let reply = client
            .send(&json!({"cmd": "read", "sid": "158d0001a2b3c4"}), hub)
            .await
            .unwrap();

        assert_eq!(reply["cmd"], Value::from("read_ack"));
        let data = reply["data"].as_map().unwrap();
        assert_eq!(data["power"], Value::from("on"));
        assert_eq!(data["bright"], Value::from(80));
    }

    #[tokio::test]
    async fn test_send_retries_after_dropped_datagram() {
        let hub = spawn_hub(|socket| async move {
            let mut buf = vec![0u8; 1024];
            // Swallow the first request, answer the second
            socket.recv_from(&mut buf).await.unwrap();
            let (_, peer) = socket.recv_from(&mut buf).await.unwrap();
            socket
                .send_to(br#"{"cmd": "read_ack"}"#, peer)
                .await
                .unwrap();
        })
        .await;

        let client = UdpJsonClient::bind(&test_network(200, 2)).await.unwrap();
        let reply = client.send(&json!({"cmd": "read"}), hub).await.unwrap();
        assert_eq!(reply["cmd"], Value::from("read_ack"));
    }

    #[tokio::test]
    async fn test_send_reports_silent_peer_offline() {
        let hub = spawn_hub(|socket| async move {
            let mut buf = vec![0u8; 1024];
            loop {
                if socket.recv_from(&mut buf).await.is_err() {
                    break;
                }
            }
        })
        .await;

        let client = UdpJsonClient::bind(&test_network(100, 1)).await.unwrap();
        let err = client.send(&json!({"cmd": "read"}), hub).await.unwrap_err();
        assert!(matches!(err, DeviceError::Offline(_)));
    }

    #[tokio::test]
    async fn test_collect_gathers_probe_replies() {
        let hub = spawn_hub(|socket| async move {
            let mut buf = vec![0u8; 1024];
            let (_, peer) = socket.recv_from(&mut buf).await.unwrap();
            socket
                .send_to(br#"{"cmd": "iam", "ip": "10.0.0.7"}"#, peer)
                .await
                .unwrap();
            socket.send_to(b"not json at all", peer).await.unwrap();
            socket
                .send_to(br#"{"cmd": "iam", "ip": "10.0.0.8"}"#, peer)
                .await
                .unwrap();
        })
        .await;

        let client = UdpJsonClient::bind(&test_network(1_000, 0)).await.unwrap();
        let replies = client
            .collect(&json!({"cmd": "whois"}), hub, Duration::from_millis(300))
            .await
            .unwrap();

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["ip"], Value::from("10.0.0.7"));
        assert_eq!(replies[1]["ip"], Value::from("10.0.0.8"));
    }

    #[tokio::test]
    async fn test_listener_yields_decoded_announcements() {
        let listener = UdpMulticastListener::bind(Ipv4Addr::new(224, 0, 0, 50), 0)
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let announcement = json!({
            "cmd": "report",
            "sid": "158d0001a2b3c4",
            "data": r#"{"status": "motion"}"#,
        });
        sender
            .send_to(
                announcement.to_string().as_bytes(),
                SocketAddr::from(([127, 0, 0, 1], port)),
            )
            .await
            .unwrap();

        let (msg, _peer) = listener.recv().await.unwrap();
        assert_eq!(msg["cmd"], Value::from("report"));
        assert_eq!(
            msg["data"].as_map().unwrap()["status"],
            Value::from("motion")
        );
    }
}
