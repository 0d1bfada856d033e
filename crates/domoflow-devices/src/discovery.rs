/*!
 * Network discovery for DomoFlow.
 *
 * The discovery contract every probe implements, plus the SSDP search
 * used by Wi-Fi lamps. Probes are bounded by a collection window and
 * report what they heard; silence yields an empty result, never an
 * error.
 */
use std::fmt::Debug;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use domoflow_core::config::DiscoveryConfig;
use domoflow_core::types::{Sid, Value, ValueMap};

use crate::device::Result;

/// A device found on the network.
///
/// `sid` is always present; address fields depend on what the probe
/// reply carried. Everything else lands in `extra` under its wire name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Device id
    pub sid: Sid,
    /// Address the device answers on, when the reply named one
    pub ip: Option<String>,
    /// Service port, when the reply named one
    pub port: Option<u16>,
    /// Vendor model string
    pub model: Option<String>,
    /// Remaining reply fields under their wire names
    pub extra: ValueMap,
}

impl DiscoveredDevice {
    /// The device's socket address, when the reply carried both parts
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip = self.ip.as_ref()?.parse().ok()?;
        Some(SocketAddr::new(ip, self.port?))
    }
}

/// The contract every network probe implements.
///
/// Probes collect answers for a bounded window and never block past it;
/// a device that stays silent is simply absent from the result.
#[async_trait]
pub trait Discovery: Send + Sync + Debug {
    /// Probe the network and return every device that answered
    async fn find_all(&self) -> Result<Vec<DiscoveredDevice>>;

    /// Probe the network for one device id
    async fn find_by_sid(&self, sid: &Sid) -> Result<Option<DiscoveredDevice>> {
        let devices = self.find_all().await?;
        Ok(devices.into_iter().find(|d| d.sid == *sid))
    }
}

/// Well-known SSDP group lamps listen on
const SSDP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const SSDP_PORT: u16 = 1982;
const SSDP_SEARCH_TARGET: &str = "wifi_bulb";
const REPLY_BUFFER: usize = 1024;

/// The multicast M-SEARCH probe Wi-Fi lamps answer.
///
/// Replies are HTTP-shaped header blocks; each is parsed into a
/// [`DiscoveredDevice`] keyed by its `id` header, with the advertised
/// `Location` split into address and port.
#[derive(Debug, Clone)]
pub struct SsdpDiscovery {
    target: SocketAddr,
    window: Duration,
}

impl SsdpDiscovery {
    /// Create a probe against the well-known lamp group
    pub fn new(discovery: &DiscoveryConfig) -> Self {
        Self {
            target: SocketAddr::from((SSDP_GROUP, SSDP_PORT)),
            window: discovery.timeout(),
        }
    }

    /// Create a probe against a specific responder address
    pub fn with_target(target: SocketAddr, window: Duration) -> Self {
        Self { target, window }
    }

    fn search_request() -> String {
        format!(
            "M-SEARCH * HTTP/1.1\r\nHOST: {}:{}\r\nMAN: \"ssdp:discover\"\r\nST: {}\r\n",
            SSDP_GROUP, SSDP_PORT, SSDP_SEARCH_TARGET
        )
    }
}

#[async_trait]
impl Discovery for SsdpDiscovery {
    async fn find_all(&self) -> Result<Vec<DiscoveredDevice>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_multicast_ttl_v4(32)?;
        socket
            .send_to(Self::search_request().as_bytes(), self.target)
            .await?;

        let mut devices: Vec<DiscoveredDevice> = Vec::new();
        let deadline = Instant::now() + self.window;
        let mut buf = vec![0u8; REPLY_BUFFER];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok((len, peer))) => {
                    let text = String::from_utf8_lossy(&buf[..len]);
                    match parse_ssdp_response(&text) {
                        Some(device) if devices.iter().all(|d| d.sid != device.sid) => {
                            devices.push(device);
                        }
                        Some(_) => {}
                        None => debug!("Skipping unparseable probe reply from {}", peer),
                    }
                }
            }
        }
        Ok(devices)
    }
}

/// Parse one SSDP header block; `None` when no `id` header is present
fn parse_ssdp_response(text: &str) -> Option<DiscoveredDevice> {
    let mut sid = None;
    let mut ip = None;
    let mut port = None;
    let mut model = None;
    let mut extra = ValueMap::new();

    for line in text.split("\r\n") {
        let mut parts = line.splitn(2, ':');
        let key = match parts.next() {
            Some(k) => k.to_ascii_lowercase(),
            None => continue,
        };
        let value = match parts.next() {
            Some(v) => v.trim(),
            None => continue,
        };
        if key.starts_with("cache-control") || key.starts_with("date") || key.starts_with("ext") {
            continue;
        }
        match key.as_str() {
            "id" => sid = Some(Sid::new(value)),
            "model" => model = Some(value.to_string()),
            "location" => {
                if let Some((host, service_port)) = parse_location(value) {
                    ip = Some(host);
                    port = Some(service_port);
                }
            }
            "support" => {
                let commands: Vec<Value> = value.split(' ').map(Value::from).collect();
                extra.insert(key, Value::List(commands));
            }
            "rgb" | "hue" | "sat" => match value.parse::<i64>() {
                Ok(n) => {
                    extra.insert(key, Value::from(n));
                }
                Err(_) => {
                    extra.insert(key, Value::from(value));
                }
            },
            _ => {
                extra.insert(key, Value::from(value));
            }
        }
    }

    sid.map(|sid| DiscoveredDevice {
        sid,
        ip,
        port,
        model,
        extra,
    })
}

/// Split a `Location` header like `yeelight://192.168.1.45:55443`
fn parse_location(value: &str) -> Option<(String, u16)> {
    let rest = match value.split_once("://") {
        Some((_, rest)) => rest,
        None => value,
    };
    let (host, port) = rest.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}
