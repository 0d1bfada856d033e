/*!
 * JSON over HTTP transport.
 *
 * A thin wrapper around a pooled HTTP client with the request shape LAN
 * device APIs expect: JSON bodies both ways, an overall request timeout
 * and optional basic auth.
 */
use serde_json::Value as JsonValue;

use domoflow_core::config::NetworkConfig;
use domoflow_core::types::{value_map_from_json, ValueMap};

use crate::device::{DeviceError, Result};

/// Map a client error onto the transport error vocabulary
fn map_error(err: reqwest::Error) -> DeviceError {
    if err.is_timeout() {
        DeviceError::timeout(err.to_string())
    } else if err.is_connect() {
        DeviceError::offline(err.to_string())
    } else {
        DeviceError::transport(err.to_string())
    }
}

/// A JSON request/response client for one device endpoint.
///
/// The base URL names the device (scheme, host and port); request paths
/// are joined onto it. Timeouts map to [`DeviceError::Timeout`] and
/// connection failures to [`DeviceError::Offline`].
#[derive(Debug, Clone)]
pub struct HttpJsonClient {
    client: reqwest::Client,
    base_url: String,
    auth: Option<(String, String)>,
}

impl HttpJsonClient {
    /// Create a new client for the endpoint at `base_url`
    pub fn new<S: Into<String>>(base_url: S, network: &NetworkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(network.http_timeout())
            .build()
            .map_err(|e| DeviceError::transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth: None,
        })
    }

    /// Attach basic auth credentials to every request
    pub fn with_basic_auth<S: Into<String>>(mut self, user: S, password: S) -> Self {
        self.auth = Some((user.into(), password.into()));
        self
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    /// Issue a GET request and parse the JSON reply
    pub async fn get_json(&self, path: &str) -> Result<ValueMap> {
        let request = self.apply_auth(self.client.get(self.url_for(path)));
        let response = request.send().await.map_err(map_error)?;
        read_json(response).await
    }

    /// Issue a POST request with a JSON body and parse the JSON reply
    pub async fn post_json(&self, path: &str, body: &JsonValue) -> Result<ValueMap> {
        let request = self.apply_auth(self.client.post(self.url_for(path)).json(body));
        let response = request.send().await.map_err(map_error)?;
        read_json(response).await
    }
}

async fn read_json(response: reqwest::Response) -> Result<ValueMap> {
    let status = response.status();
    if !status.is_success() {
        return Err(DeviceError::transport(format!("HTTP status {}", status)));
    }
    let body: JsonValue = response.json().await.map_err(map_error)?;
    Ok(value_map_from_json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use domoflow_core::types::Value;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    fn test_network(timeout_ms: u64) -> NetworkConfig {
        NetworkConfig {
            http_timeout_ms: timeout_ms,
            ..NetworkConfig::default()
        }
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(head_end) = text.find("\r\n\r\n") {
                let content_length = text
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if data.len() >= head_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    /// Serve a single canned response, handing back the raw request text
    async fn spawn_http_device(
        status: &'static str,
        body: &'static str,
    ) -> (SocketAddr, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(request);
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn test_get_json_parses_reply() {
        let (addr, _rx) =
            spawn_http_device("200 OK", r#"{"deviceid": "1000abc", "data": {"switch": "on"}}"#)
                .await;

        let client = HttpJsonClient::new(format!("http://{}", addr), &test_network(1_000)).unwrap();
        let reply = client.get_json("zeroconf/info").await.unwrap();

        assert_eq!(reply["deviceid"], Value::from("1000abc"));
        assert_eq!(
            reply["data"].as_map().unwrap()["switch"],
            Value::from("on")
        );
    }

    #[tokio::test]
    async fn test_post_json_sends_body_and_auth() {
        let (addr, rx) = spawn_http_device("200 OK", r#"{"error": 0}"#).await;

        let client = HttpJsonClient::new(format!("http://{}", addr), &test_network(1_000))
            .unwrap()
            .with_basic_auth("foo", "bar");
        let reply = client
            .post_json("zeroconf/switch", &json!({"deviceid": "1000abc"}))
            .await
            .unwrap();
        assert_eq!(reply["error"], Value::from(0));

        let request = rx.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("post /zeroconf/switch"));
        assert!(request.contains("content-type: application/json"));
        assert!(request.contains("authorization: basic zm9vomjhcg=="));
        assert!(request.contains(r#""deviceid":"1000abc""#));
    }

    #[tokio::test]
    async fn test_error_status_is_a_transport_error() {
        let (addr, _rx) = spawn_http_device("404 Not Found", "{}").await;

        let client = HttpJsonClient::new(format!("http://{}", addr), &test_network(1_000)).unwrap();
        let err = client.get_json("missing").await.unwrap_err();
        assert!(matches!(err, DeviceError::Transport(_)));
    }

    #[tokio::test]
    async fn test_stalled_endpoint_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            // Hold the connection open without answering
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let client = HttpJsonClient::new(format!("http://{}", addr), &test_network(100)).unwrap();
        let err = client.get_json("zeroconf/info").await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_refused_connection_is_offline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpJsonClient::new(format!("http://{}", addr), &test_network(1_000)).unwrap();
        let err = client.get_json("zeroconf/info").await.unwrap_err();
        assert!(matches!(err, DeviceError::Offline(_)));
    }
}
