/*!
 * Line-framed JSON over TCP.
 *
 * The request/answer protocol Wi-Fi bulbs speak: each request is one JSON
 * object carrying a climbing `id`, terminated by CRLF. Answers and
 * unsolicited notifications share the connection, so replies are matched
 * back to their request by `id` and everything else is skipped.
 */
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use domoflow_core::config::NetworkConfig;
use domoflow_core::error::{Error as CoreError, Result as CoreResult};
use domoflow_core::utils::with_retry;

use crate::device::{DeviceError, Result};

/// Answer ids wrap back to 1 past this point
const ID_ROLLOVER: u64 = 1000;

/// A request/answer client for one line-framed JSON endpoint.
///
/// Every call opens a fresh connection, sends the request and reads reply
/// lines until the matching answer arrives. Timed-out attempts are
/// retried; a refused connection reports the device as offline.
#[derive(Debug)]
pub struct TcpJsonClient {
    addr: SocketAddr,
    timeout: Duration,
    retries: usize,
    counter: Mutex<u64>,
}

impl TcpJsonClient {
    /// Create a new client for the endpoint at `addr`
    pub fn new(addr: SocketAddr, network: &NetworkConfig) -> Self {
        Self {
            addr,
            timeout: network.tcp_timeout(),
            retries: network.retries,
            counter: Mutex::new(1),
        }
    }

    /// Get the endpoint address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn next_id(&self) -> u64 {
        let mut counter = self.counter.lock().unwrap_or_else(PoisonError::into_inner);
        if *counter > ID_ROLLOVER {
            *counter = 1;
        }
        let id = *counter;
        *counter += 1;
        id
    }

    /// Invoke `method` with a JSON array of `params`, returning the full
    /// answer object
    pub async fn call(&self, method: &str, params: JsonValue) -> Result<JsonValue> {
        let id = self.next_id();
        let payload = serde_json::to_vec(&json!({
            "id": id,
            "method": method,
            "params": params,
        }))?;
        let request = payload.as_slice();

        match with_retry(self.timeout, self.retries, || self.exchange(request, id)).await {
            Ok(answer) => Ok(answer),
            Err(CoreError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Err(DeviceError::offline(format!(
                    "Connection refused by {}",
                    self.addr
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exchange(&self, payload: &[u8], id: u64) -> CoreResult<JsonValue> {
        let mut stream = TcpStream::connect(self.addr).await?;
        stream.write_all(payload).await?;
        // Desk lamps stall unless the terminator arrives as its own write
        stream.write_all(b"\r\n").await?;

        let mut lines = BufReader::new(stream).lines();
        while let Some(line) = lines.next_line().await? {
            let msg: JsonValue = match serde_json::from_str(&line) {
                Ok(msg) => msg,
                Err(_) => continue,
            };
            if msg.get("id").and_then(JsonValue::as_u64) == Some(id) {
                return Ok(msg);
            }
        }
        Err(CoreError::other(format!(
            "{} closed the connection before answering",
            self.addr
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn test_network(timeout_ms: u64, retries: usize) -> NetworkConfig {
        NetworkConfig {
            tcp_timeout_ms: timeout_ms,
            retries,
            ..NetworkConfig::default()
        }
    }

    /// Answer `connections` requests, echoing each request id back through
    /// `extra_lines` first
    async fn spawn_lamp(
        connections: usize,
        extra_lines: Vec<&'static str>,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<JsonValue>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for _ in 0..connections {
                let (stream, _) = listener.accept().await.unwrap();
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half).lines();
                let line = reader.next_line().await.unwrap().unwrap();
                let request: JsonValue = serde_json::from_str(&line).unwrap();
                let id = request["id"].as_u64().unwrap();
                tx.send(request).unwrap();

                for extra in &extra_lines {
                    write_half.write_all(extra.as_bytes()).await.unwrap();
                    write_half.write_all(b"\r\n").await.unwrap();
                }
                let answer = json!({"id": id, "result": ["ok"]});
                write_half
                    .write_all(answer.to_string().as_bytes())
                    .await
                    .unwrap();
                write_half.write_all(b"\r\n").await.unwrap();
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn test_call_matches_answer_by_id() {
        let (addr, mut requests) = spawn_lamp(
            1,
            vec![
                r#"{"method": "props", "params": {"power": "on"}}"#,
                r#"{"id": 999, "result": ["stale"]}"#,
                "not json",
            ],
        )
        .await;

        let client = TcpJsonClient::new(addr, &test_network(1_000, 0));
        let answer = client
            .call("get_prop", json!(["power", "bright"]))
            .await
            .unwrap();

        assert_eq!(answer["id"], json!(1));
        assert_eq!(answer["result"], json!(["ok"]));

        let request = requests.recv().await.unwrap();
        assert_eq!(request["method"], json!("get_prop"));
        assert_eq!(request["params"], json!(["power", "bright"]));
    }

    #[tokio::test]
    async fn test_call_ids_climb_across_requests() {
        let (addr, mut requests) = spawn_lamp(2, vec![]).await;

        let client = TcpJsonClient::new(addr, &test_network(1_000, 0));
        client.call("toggle", json!([])).await.unwrap();
        client
            .call("set_bright", json!([50, "smooth", 500]))
            .await
            .unwrap();

        assert_eq!(requests.recv().await.unwrap()["id"], json!(1));
        assert_eq!(requests.recv().await.unwrap()["id"], json!(2));
    }

    #[tokio::test]
    async fn test_refused_connection_is_offline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = TcpJsonClient::new(addr, &test_network(200, 0));
        let err = client.call("toggle", json!([])).await.unwrap_err();
        assert!(matches!(err, DeviceError::Offline(_)));
    }

    #[tokio::test]
    async fn test_silent_endpoint_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = TcpJsonClient::new(addr, &test_network(100, 0));
        let err = client.call("toggle", json!([])).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_id_rollover_resets_to_one() {
        let (addr, mut requests) = spawn_lamp(1, vec![]).await;

        let client = TcpJsonClient::new(addr, &test_network(1_000, 0));
        {
            let mut counter = client.counter.lock().unwrap();
            *counter = ID_ROLLOVER + 1;
        }
        client.call("toggle", json!([])).await.unwrap();
        assert_eq!(requests.recv().await.unwrap()["id"], json!(1));
    }
}
