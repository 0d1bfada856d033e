/*!
 * LAN hub gateway in the Lumi/Aqara style.
 *
 * The hub mediates Zigbee sub-devices over JSON datagrams: a `whois`
 * multicast probe locates it, unicast `read`/`write`/`get_id_list`
 * requests drive it, and a multicast group carries push reports and
 * heartbeats. Writes must attach a key derived from the rolling token
 * the hub rotates with every heartbeat; deriving the key from the token
 * is delegated to a [`TokenSigner`] collaborator.
 */
use std::fmt::Debug;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use domoflow_core::config::{DiscoveryConfig, NetworkConfig};
use domoflow_core::types::{Sid, Value, ValueMap};

use crate::device::{BaseDevice, DeviceError, Result};
use crate::gateway::{Gateway, SubDeviceTable};
use crate::transport::udp::{UdpJsonClient, UdpMulticastListener};
use crate::vendors::{wire_int, wire_str};
use crate::watcher::{Report, Watcher, WatcherDriver};

/// Multicast group the hub family announces on
const LUMI_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 50);
/// Port the hub answers `whois` probes on
const WHOIS_PORT: u16 = 4321;
/// Unicast command port and multicast report port
const HUB_PORT: u16 = 9898;

/// Derives the write key the hub expects from its rolling token.
///
/// The hub family encrypts the token with a per-hub password; the cipher
/// is the integrator's concern, so the gateway only defines the seam.
pub trait TokenSigner: Send + Sync + Debug {
    /// Derive the write key for the current token
    fn sign(&self, token: &str) -> String;
}

/// Pick the hub out of `whois` probe replies
fn hub_from_replies(replies: &[ValueMap]) -> Result<(SocketAddr, Sid)> {
    let hub = replies
        .iter()
        .find(|r| wire_str(r, "cmd") == Some("iam"))
        .ok_or_else(|| DeviceError::offline("No hub answered the whois probe"))?;
    let ip = wire_str(hub, "ip")
        .ok_or_else(|| DeviceError::transport("Hub reply carries no address"))?;
    let port = wire_int(hub, "port").unwrap_or(i64::from(HUB_PORT));
    let addr = format!("{}:{}", ip, port)
        .parse()
        .map_err(|e| DeviceError::transport(format!("Bad hub address: {}", e)))?;
    let sid = Sid::new(wire_str(hub, "sid").unwrap_or_default());
    Ok((addr, sid))
}

/// Shape a multicast announcement into a [`Report`].
///
/// The rolling `token` rides on heartbeat announcements as a top-level
/// field; it is folded into the report data so handlers see one map.
fn wire_report(msg: &ValueMap) -> Option<Report> {
    let sid = wire_str(msg, "sid")?;
    let mut data = match msg.get("data").and_then(Value::as_map) {
        Some(map) => map.clone(),
        None => ValueMap::new(),
    };
    if let Some(token) = wire_str(msg, "token") {
        data.insert("token".to_string(), Value::from(token));
    }
    let report = match wire_str(msg, "cmd") {
        Some("heartbeat") => Report::heartbeat(sid, data),
        _ => Report::new(sid, data),
    };
    match wire_str(msg, "model") {
        Some(model) if !model.is_empty() => Some(report.with_model(model)),
        _ => Some(report),
    }
}

/// Watcher driver fed by the hub's multicast report group.
#[derive(Debug)]
pub struct MulticastDriver {
    listener: UdpMulticastListener,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl MulticastDriver {
    /// Create a driver over an already-joined listener
    pub fn new(listener: UdpMulticastListener) -> Self {
        Self {
            listener,
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }
}

#[async_trait]
impl WatcherDriver for MulticastDriver {
    async fn watch(&self, tx: mpsc::Sender<Report>) -> Result<()> {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
            let received = tokio::select! {
                _ = self.stop_notify.notified() => return Ok(()),
                received = self.listener.recv() => received,
            };
            let (msg, peer) = match received {
                Ok(pair) => pair,
                Err(DeviceError::Serialization(e)) => {
                    debug!("Skipping malformed announcement: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            match wire_report(&msg) {
                Some(report) => {
                    if tx.send(report).await.is_err() {
                        return Ok(());
                    }
                }
                None => debug!("Skipping announcement without sid from {}", peer),
            }
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
    }
}

/// A LAN Zigbee hub driven over JSON datagrams.
///
/// The gateway owns the unicast socket all sub-devices share and the
/// multicast watcher; inbound reports are routed into sub-device
/// registries by `sid`, and hub heartbeats keep the write token fresh.
#[derive(Debug)]
pub struct LumiGateway {
    conn: UdpJsonClient,
    addr: SocketAddr,
    sid: Sid,
    report_addr: SocketAddr,
    token: Arc<RwLock<String>>,
    signer: Arc<dyn TokenSigner>,
    devices: Arc<SubDeviceTable>,
    watcher: Watcher,
}

impl LumiGateway {
    /// Locate the hub with a `whois` probe and connect to it
    pub async fn discover(
        network: &NetworkConfig,
        discovery: &DiscoveryConfig,
        signer: Arc<dyn TokenSigner>,
    ) -> Result<Self> {
        let conn = UdpJsonClient::bind(network).await?;
        let group = SocketAddr::from((LUMI_GROUP, WHOIS_PORT));
        let replies = conn
            .collect(&json!({"cmd": "whois"}), group, discovery.timeout())
            .await?;
        let (addr, sid) = hub_from_replies(&replies)?;
        let listener = UdpMulticastListener::bind(LUMI_GROUP, HUB_PORT).await?;
        Self::with_parts(conn, addr, sid, signer, listener)
    }

    /// Connect to a hub at a known address
    pub async fn connect<S: Into<Sid>>(
        addr: SocketAddr,
        sid: S,
        network: &NetworkConfig,
        signer: Arc<dyn TokenSigner>,
    ) -> Result<Self> {
        let conn = UdpJsonClient::bind(network).await?;
        let listener = UdpMulticastListener::bind(LUMI_GROUP, HUB_PORT).await?;
        Self::with_parts(conn, addr, sid.into(), signer, listener)
    }

    fn with_parts(
        conn: UdpJsonClient,
        addr: SocketAddr,
        sid: Sid,
        signer: Arc<dyn TokenSigner>,
        listener: UdpMulticastListener,
    ) -> Result<Self> {
        let report_addr = listener.local_addr()?;
        let watcher = Watcher::start(Arc::new(MulticastDriver::new(listener)));
        let devices = Arc::new(SubDeviceTable::new());
        let token = Arc::new(RwLock::new(String::new()));

        let routing_devices = Arc::clone(&devices);
        let routing_token = Arc::clone(&token);
        let hub_sid = sid.clone();
        watcher.add_report_handler(move |report| {
            if report.sid == hub_sid {
                if let Some(t) = report.data.get("token").and_then(Value::as_str) {
                    *routing_token
                        .write()
                        .unwrap_or_else(PoisonError::into_inner) = t.to_string();
                }
            }
            routing_devices.update(&report.sid, &report.data);
        });

        Ok(Self {
            conn,
            addr,
            sid,
            report_addr,
            token,
            signer,
            devices,
            watcher,
        })
    }

    /// Get the hub's own device id
    pub fn sid(&self) -> &Sid {
        &self.sid
    }

    /// Get the local address hub announcements arrive on
    pub fn report_addr(&self) -> SocketAddr {
        self.report_addr
    }

    /// Get the current rolling token
    pub fn token(&self) -> String {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Detach a sub-device from the routing table
    pub fn unregister_sub_device(&self, sid: &Sid) -> bool {
        self.devices.unregister(sid)
    }

    /// Ask the hub for a fresh token
    pub async fn refresh_token(&self) -> Result<()> {
        self.id_list().await?;
        Ok(())
    }

    async fn id_list(&self) -> Result<Vec<String>> {
        let reply = self
            .conn
            .send(&json!({"cmd": "get_id_list"}), self.addr)
            .await?;
        if let Some(token) = wire_str(&reply, "token") {
            *self.token.write().unwrap_or_else(PoisonError::into_inner) = token.to_string();
        }
        let sids = match reply.get("data").and_then(Value::as_list) {
            Some(list) => list
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };
        Ok(sids)
    }

    async fn write_key(&self) -> Result<String> {
        let token = self.token();
        if token.is_empty() {
            self.refresh_token().await?;
        }
        Ok(self.signer.sign(&self.token()))
    }
}

#[async_trait]
impl Gateway for LumiGateway {
    async fn set_device(&self, sid: &Sid, mut payload: ValueMap) -> Result<()> {
        payload.insert("key".to_string(), Value::from(self.write_key().await?));
        let data = serde_json::Value::from(Value::Map(payload));
        let reply = self
            .conn
            .send(
                &json!({"cmd": "write", "sid": sid.as_str(), "data": data}),
                self.addr,
            )
            .await?;
        let rejected = reply
            .get("data")
            .and_then(Value::as_map)
            .and_then(|data| wire_str(data, "error").map(str::to_string));
        match rejected {
            Some(error) => Err(DeviceError::transport(format!(
                "Hub rejected write: {}",
                error
            ))),
            None => Ok(()),
        }
    }

    async fn get_device(&self, sid: &Sid) -> Result<ValueMap> {
        self.conn
            .send(&json!({"cmd": "read", "sid": sid.as_str()}), self.addr)
            .await
    }

    async fn get_device_list(&self) -> Result<Vec<ValueMap>> {
        let sids = self.id_list().await?;
        // Sequential reads; the socket carries one exchange at a time
        let mut devices = Vec::with_capacity(sids.len());
        for sid in sids {
            devices.push(self.get_device(&Sid::new(&sid)).await?);
        }
        Ok(devices)
    }

    async fn set_accept_join(&self, allow: bool) -> Result<()> {
        let permission = if allow { "yes" } else { "no" };
        let mut payload = ValueMap::new();
        payload.insert("join_permission".to_string(), Value::from(permission));
        self.set_device(&self.sid, payload).await
    }

    async fn remove_device(&self, sid: &Sid) -> Result<()> {
        let mut payload = ValueMap::new();
        payload.insert("remove_device".to_string(), Value::from(sid.as_str()));
        self.set_device(&self.sid, payload).await
    }

    fn register_sub_device(&self, device: &BaseDevice) {
        self.devices.register(device);
    }

    fn watcher(&self) -> &Watcher {
        &self.watcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use once_cell::sync::OnceCell;
    use tokio::net::UdpSocket;

    use crate::device::DeviceDescriptor;
    use crate::gateway::ZigbeeDevice;
    use crate::traits::ON_OFF;

    const HUB_SID: &str = "7811dcb28a91";

    #[derive(Debug)]
    struct TestSigner;

    impl TokenSigner for TestSigner {
        fn sign(&self, token: &str) -> String {
            format!("signed:{}", token)
        }
    }

    fn switch_descriptor() -> &'static DeviceDescriptor {
        static DESCRIPTOR: OnceCell<DeviceDescriptor> = OnceCell::new();
        DESCRIPTOR
            .get_or_try_init(|| DeviceDescriptor::assemble(&[&ON_OFF]))
            .unwrap()
    }

    fn test_network() -> NetworkConfig {
        NetworkConfig {
            udp_timeout_ms: 1_000,
            retries: 0,
            ..NetworkConfig::default()
        }
    }

    /// Fake hub answering the unicast command vocabulary, echoing every
    /// received `write` through the channel
    async fn spawn_hub() -> (SocketAddr, mpsc::UnboundedReceiver<serde_json::Value>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let request: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
                let reply = match request["cmd"].as_str().unwrap() {
                    "get_id_list" => json!({
                        "cmd": "get_id_list_ack",
                        "sid": HUB_SID,
                        "token": "tok123",
                        "data": r#"["158d0001aaaa01", "158d0001aaaa02"]"#,
                    }),
                    "read" => json!({
                        "cmd": "read_ack",
                        "sid": request["sid"],
                        "data": r#"{"power": "on", "voltage": 2985}"#,
                    }),
                    "write" => {
                        tx.send(request.clone()).unwrap();
                        json!({
                            "cmd": "write_ack",
                            "sid": request["sid"],
                            "data": "{}",
                        })
                    }
                    other => panic!("unexpected hub command {}", other),
                };
                socket
                    .send_to(reply.to_string().as_bytes(), peer)
                    .await
                    .unwrap();
            }
        });
        (addr, rx)
    }

    async fn test_gateway(addr: SocketAddr) -> LumiGateway {
        let conn = UdpJsonClient::bind(&test_network()).await.unwrap();
        let listener = UdpMulticastListener::bind(LUMI_GROUP, 0).await.unwrap();
        LumiGateway::with_parts(conn, addr, Sid::new(HUB_SID), Arc::new(TestSigner), listener)
            .unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn test_hub_from_replies_picks_iam() {
        let noise = domoflow_core::types::value_map_from_json(json!({"cmd": "report"}));
        let iam = domoflow_core::types::value_map_from_json(json!({
            "cmd": "iam",
            "ip": "192.168.1.10",
            "port": "9898",
            "sid": HUB_SID,
        }));

        let (addr, sid) = hub_from_replies(&[noise, iam]).unwrap();
        assert_eq!(addr, SocketAddr::from(([192, 168, 1, 10], 9898)));
        assert_eq!(sid, Sid::new(HUB_SID));

        let err = hub_from_replies(&[]).unwrap_err();
        assert!(matches!(err, DeviceError::Offline(_)));
    }

    #[tokio::test]
    async fn test_get_device_list_reads_each_sub_device() {
        let (addr, _writes) = spawn_hub().await;
        let gateway = test_gateway(addr).await;

        let devices = gateway.get_device_list().await.unwrap();
        assert_eq!(devices.len(), 2);
        for device in &devices {
            let data = device["data"].as_map().unwrap();
            assert_eq!(data["power"], Value::from("on"));
        }
        // The id list ack carried the rolling token
        assert_eq!(gateway.token(), "tok123");

        gateway.watcher().stop().await;
    }

    #[tokio::test]
    async fn test_set_device_attaches_signed_key() {
        let (addr, mut writes) = spawn_hub().await;
        let gateway = test_gateway(addr).await;

        let mut payload = ValueMap::new();
        payload.insert("channel_0".to_string(), Value::from("on"));
        gateway
            .set_device(&Sid::new("158d0001aaaa01"), payload)
            .await
            .unwrap();

        let write = writes.recv().await.unwrap();
        assert_eq!(write["cmd"], json!("write"));
        assert_eq!(write["sid"], json!("158d0001aaaa01"));
        assert_eq!(write["data"]["channel_0"], json!("on"));
        // Empty token forced a refresh before signing
        assert_eq!(write["data"]["key"], json!("signed:tok123"));

        gateway.watcher().stop().await;
    }

    #[tokio::test]
    async fn test_join_and_remove_write_to_hub_sid() {
        let (addr, mut writes) = spawn_hub().await;
        let gateway = test_gateway(addr).await;

        gateway.set_accept_join(true).await.unwrap();
        let join = writes.recv().await.unwrap();
        assert_eq!(join["sid"], json!(HUB_SID));
        assert_eq!(join["data"]["join_permission"], json!("yes"));

        gateway
            .remove_device(&Sid::new("158d0001aaaa02"))
            .await
            .unwrap();
        let removal = writes.recv().await.unwrap();
        assert_eq!(removal["sid"], json!(HUB_SID));
        assert_eq!(removal["data"]["remove_device"], json!("158d0001aaaa02"));

        gateway.watcher().stop().await;
    }

    #[tokio::test]
    async fn test_reports_route_to_sub_devices() {
        let (addr, _writes) = spawn_hub().await;
        let gateway = Arc::new(test_gateway(addr).await);

        let device = ZigbeeDevice::new(
            "158d0001aaaa01",
            switch_descriptor(),
            gateway.clone() as Arc<dyn Gateway>,
        )
        .unwrap();

        let announcement = json!({
            "cmd": "report",
            "model": "ctrl_neutral1",
            "sid": "158d0001aaaa01",
            "data": r#"{"power": "on"}"#,
        });
        let listener_addr = SocketAddr::from(([127, 0, 0, 1], gateway.report_addr().port()));
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(announcement.to_string().as_bytes(), listener_addr)
            .await
            .unwrap();

        let status = device.base().shared_status();
        wait_until("report to land in the registry", || {
            status.get_str("power") == "on"
        })
        .await;

        // A hub heartbeat refreshes the rolling token
        let heartbeat = json!({
            "cmd": "heartbeat",
            "model": "gateway",
            "sid": HUB_SID,
            "token": "tok456",
            "data": r#"{"ip": "192.168.1.10"}"#,
        });
        sender
            .send_to(heartbeat.to_string().as_bytes(), listener_addr)
            .await
            .unwrap();
        wait_until("heartbeat to refresh the token", || {
            gateway.token() == "tok456"
        })
        .await;

        gateway.watcher().stop().await;
    }

    #[tokio::test]
    async fn test_rejected_write_surfaces_hub_error() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let request: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
                let reply = match request["cmd"].as_str().unwrap() {
                    "get_id_list" => json!({
                        "cmd": "get_id_list_ack",
                        "sid": HUB_SID,
                        "token": "tok123",
                        "data": "[]",
                    }),
                    _ => json!({
                        "cmd": "write_ack",
                        "sid": request["sid"],
                        "data": r#"{"error": "Invalid key"}"#,
                    }),
                };
                socket
                    .send_to(reply.to_string().as_bytes(), peer)
                    .await
                    .unwrap();
            }
        });

        let gateway = test_gateway(addr).await;
        let err = gateway
            .set_device(&Sid::new("158d0001aaaa01"), ValueMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Transport(_)));
        assert!(err.to_string().contains("Invalid key"));

        gateway.watcher().stop().await;
    }
}
