/*!
 * Zigbee bridge gateway over MQTT, in the zigbee2mqtt topic dialect.
 *
 * The bridge publishes device reports under `<base>/<sid>` and its own
 * chatter under `<base>/bridge/...`; commands go to `<base>/<sid>/set`
 * and `<base>/<sid>/get`. Because MQTT has no request/response pairing,
 * `get_device` resolves against the next report the bridge publishes
 * for that sid, and `get_device_list` serves the retained
 * `bridge/devices` list. Wire field names are translated per model by
 * the gateway's [`Converter`] in both directions.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::debug;
use uuid::Uuid;

use domoflow_core::config::{MqttConfig, NetworkConfig};
use domoflow_core::error::Error as CoreError;
use domoflow_core::types::{value_map_from_json, AttrKind, Sid, Value, ValueMap};
use domoflow_core::utils::with_timeout;

use crate::device::{BaseDevice, Device, DeviceDescriptor, DeviceError, Result};
use crate::gateway::{Converter, Gateway, SubDeviceTable, ZigbeeDevice};
use crate::status::Attribute;
use crate::traits::{Climate, Contact, OnOff, Toggle, CLIMATE, CONTACT, ON_OFF, TOGGLE};
use crate::watcher::{Report, Watcher, WatcherDriver};

/// Topic root the bridge publishes under unless configured otherwise
const DEFAULT_BASE_TOPIC: &str = "zigbee2mqtt";
/// Broker keep-alive interval
const KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Pause before re-polling after a broker connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// What one inbound publish means to the gateway.
#[derive(Debug)]
enum Inbound {
    /// A device state report under `<base>/<sid>`
    Report(Report),
    /// The bridge's retained device list
    BridgeDevices(Vec<ValueMap>),
    /// Bridge chatter, command echoes or non-JSON payloads
    Skip,
}

/// Sort an inbound publish by its topic under the bridge's root.
fn classify(base_topic: &str, topic: &str, payload: &[u8]) -> Inbound {
    let suffix = match topic
        .strip_prefix(base_topic)
        .and_then(|t| t.strip_prefix('/'))
    {
        Some(suffix) => suffix,
        None => return Inbound::Skip,
    };
    let parsed: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(parsed) => parsed,
        // Availability topics carry bare strings
        Err(_) => return Inbound::Skip,
    };
    if suffix == "bridge/devices" {
        return match parsed {
            serde_json::Value::Array(items) => {
                Inbound::BridgeDevices(items.into_iter().map(value_map_from_json).collect())
            }
            _ => Inbound::Skip,
        };
    }
    if suffix.contains('/') {
        // bridge/* internals and set/get echoes
        return Inbound::Skip;
    }
    if !parsed.is_object() {
        return Inbound::Skip;
    }
    Inbound::Report(Report::new(suffix, value_map_from_json(parsed)))
}

/// Waiters armed by `get_device`, completed by the next report per sid.
type PendingReads = Mutex<HashMap<Sid, Vec<oneshot::Sender<ValueMap>>>>;

/// Translate a report per the target device's model and deliver it to
/// the sub-device registry and any armed read waiters.
fn route_report(
    devices: &SubDeviceTable,
    converter: &Converter,
    pending: &PendingReads,
    report: &Report,
) {
    let fields = match devices.status_of(&report.sid) {
        Some(status) => {
            let fields = converter.to_status(&status.get_str("model"), &report.data);
            status.update(&fields);
            fields
        }
        None => report.data.clone(),
    };
    let waiters = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&report.sid);
    if let Some(waiters) = waiters {
        for waiter in waiters {
            let _ = waiter.send(fields.clone());
        }
    }
}

/// Watcher driver fed by the broker event loop.
pub struct MqttDriver {
    eventloop: tokio::sync::Mutex<EventLoop>,
    base_topic: String,
    bridge_devices: watch::Sender<Vec<ValueMap>>,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl MqttDriver {
    fn new(
        eventloop: EventLoop,
        base_topic: String,
        bridge_devices: watch::Sender<Vec<ValueMap>>,
    ) -> Self {
        Self {
            eventloop: tokio::sync::Mutex::new(eventloop),
            base_topic,
            bridge_devices,
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }
}

impl fmt::Debug for MqttDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttDriver")
            .field("base_topic", &self.base_topic)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl WatcherDriver for MqttDriver {
    async fn watch(&self, tx: mpsc::Sender<Report>) -> Result<()> {
        let mut eventloop = self.eventloop.lock().await;
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
            let polled = tokio::select! {
                _ = self.stop_notify.notified() => return Ok(()),
                polled = eventloop.poll() => polled,
            };
            let event = match polled {
                Ok(event) => event,
                Err(e) => {
                    debug!("Broker connection lost, retrying: {}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            let publish = match event {
                Event::Incoming(Packet::Publish(publish)) => publish,
                _ => continue,
            };
            match classify(&self.base_topic, &publish.topic, &publish.payload) {
                Inbound::Report(report) => {
                    if tx.send(report).await.is_err() {
                        return Ok(());
                    }
                }
                Inbound::BridgeDevices(list) => {
                    let _ = self.bridge_devices.send(list);
                }
                Inbound::Skip => {}
            }
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
    }
}

/// A Zigbee bridge driven over an MQTT broker.
///
/// The gateway subscribes to the whole bridge topic tree once; inbound
/// reports are translated per model and routed into sub-device
/// registries by `sid`, and bridge management commands are published to
/// the `bridge/request` endpoints.
pub struct Zigbee2MqttGateway {
    client: AsyncClient,
    base_topic: String,
    timeout: Duration,
    converter: Arc<Converter>,
    devices: Arc<SubDeviceTable>,
    pending: Arc<PendingReads>,
    bridge_devices: watch::Receiver<Vec<ValueMap>>,
    watcher: Watcher,
}

impl fmt::Debug for Zigbee2MqttGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zigbee2MqttGateway")
            .field("base_topic", &self.base_topic)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Zigbee2MqttGateway {
    /// Connect to the broker and subscribe under the default topic root
    pub async fn connect(mqtt: &MqttConfig, network: &NetworkConfig) -> Result<Self> {
        Self::connect_to(mqtt, network, DEFAULT_BASE_TOPIC).await
    }

    /// Connect to the broker and subscribe under `base_topic`
    pub async fn connect_to(
        mqtt: &MqttConfig,
        network: &NetworkConfig,
        base_topic: &str,
    ) -> Result<Self> {
        let client_id = format!("{}-{}", mqtt.client_id_prefix, Uuid::new_v4());
        let mut options = MqttOptions::new(&client_id, &mqtt.host, mqtt.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let (Some(user), Some(pass)) = (&mqtt.username, &mqtt.password) {
            options.set_credentials(user, pass);
        }
        let (client, eventloop) = AsyncClient::new(options, 10);
        client
            .subscribe(format!("{}/#", base_topic), QoS::AtLeastOnce)
            .await
            .map_err(|e| DeviceError::transport(format!("Subscribe failed: {}", e)))?;

        let (bridge_tx, bridge_rx) = watch::channel(Vec::new());
        let driver = MqttDriver::new(eventloop, base_topic.to_string(), bridge_tx);
        let watcher = Watcher::start(Arc::new(driver));
        Ok(Self::assemble(
            client,
            base_topic,
            network.tcp_timeout(),
            watcher,
            bridge_rx,
        ))
    }

    fn assemble(
        client: AsyncClient,
        base_topic: &str,
        timeout: Duration,
        watcher: Watcher,
        bridge_devices: watch::Receiver<Vec<ValueMap>>,
    ) -> Self {
        let devices = Arc::new(SubDeviceTable::new());
        let converter = Arc::new(Converter::new());
        let pending: Arc<PendingReads> = Arc::new(Mutex::new(HashMap::new()));

        let routing_devices = Arc::clone(&devices);
        let routing_converter = Arc::clone(&converter);
        let routing_pending = Arc::clone(&pending);
        watcher.add_report_handler(move |report| {
            route_report(
                &routing_devices,
                &routing_converter,
                &routing_pending,
                &report,
            );
        });

        Self {
            client,
            base_topic: base_topic.to_string(),
            timeout,
            converter,
            devices,
            pending,
            bridge_devices,
            watcher,
        }
    }

    /// Get the per-model field-name translator
    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    /// Detach a sub-device from report routing
    pub fn unregister_sub_device(&self, sid: &Sid) -> bool {
        self.devices.unregister(sid)
    }

    fn device_topic(&self, sid: &Sid, action: &str) -> String {
        format!("{}/{}/{}", self.base_topic, sid, action)
    }

    fn bridge_topic(&self, request: &str) -> String {
        format!("{}/bridge/request/{}", self.base_topic, request)
    }

    /// Translate attribute names to the target device's wire vocabulary
    fn wire_payload(&self, sid: &Sid, payload: ValueMap) -> ValueMap {
        match self.devices.status_of(sid) {
            Some(status) => self.converter.to_gateway(&status.get_str("model"), &payload),
            None => payload,
        }
    }

    /// Arm a waiter completed by the next report for `sid`
    fn subscribe_read(&self, sid: &Sid) -> oneshot::Receiver<ValueMap> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let waiters = pending.entry(sid.clone()).or_default();
        // Callers that timed out leave a closed sender behind
        waiters.retain(|waiter| !waiter.is_closed());
        waiters.push(tx);
        rx
    }

    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_string())
            .await
            .map_err(|e| DeviceError::transport(format!("Publish to {} failed: {}", topic, e)))
    }
}

#[async_trait]
impl Gateway for Zigbee2MqttGateway {
    async fn set_device(&self, sid: &Sid, payload: ValueMap) -> Result<()> {
        let fields = self.wire_payload(sid, payload);
        let body = serde_json::Value::from(Value::Map(fields));
        self.publish(&self.device_topic(sid, "set"), &body).await
    }

    async fn get_device(&self, sid: &Sid) -> Result<ValueMap> {
        let rx = self.subscribe_read(sid);
        self.publish(&self.device_topic(sid, "get"), &json!({"state": ""}))
            .await?;
        let fields = with_timeout(self.timeout, async {
            rx.await
                .map_err(|_| CoreError::other("Read waiter dropped"))
        })
        .await?;
        Ok(fields)
    }

    async fn get_device_list(&self) -> Result<Vec<ValueMap>> {
        let mut rx = self.bridge_devices.clone();
        let current = rx.borrow_and_update().clone();
        if !current.is_empty() {
            return Ok(current);
        }
        // The retained list may still be in flight right after connecting
        let waited = with_timeout(self.timeout, async {
            rx.changed()
                .await
                .map_err(|_| CoreError::other("Bridge list channel closed"))
        })
        .await;
        match waited {
            Ok(()) => Ok(rx.borrow().clone()),
            Err(CoreError::Timeout(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_accept_join(&self, allow: bool) -> Result<()> {
        self.publish(&self.bridge_topic("permit_join"), &json!({"value": allow}))
            .await
    }

    async fn remove_device(&self, sid: &Sid) -> Result<()> {
        self.publish(
            &self.bridge_topic("device/remove"),
            &json!({"id": sid.as_str()}),
        )
        .await
    }

    fn register_sub_device(&self, device: &BaseDevice) {
        self.devices.register(device);
    }

    fn watcher(&self) -> &Watcher {
        &self.watcher
    }
}

/// A mains-powered switch paired through the bridge.
///
/// The bridge's `state` field is translated to the `power` attribute;
/// reported values keep the bridge's uppercase spelling.
#[derive(Debug)]
pub struct WallSwitch {
    core: ZigbeeDevice,
}

impl WallSwitch {
    fn descriptor() -> Result<&'static DeviceDescriptor> {
        static DESCRIPTOR: OnceCell<DeviceDescriptor> = OnceCell::new();
        DESCRIPTOR.get_or_try_init(|| DeviceDescriptor::assemble(&[&ON_OFF, &TOGGLE]))
    }

    /// Pair with the bridge under `sid`, translating fields per `model`
    pub fn new<S: Into<Sid>>(
        sid: S,
        model: &str,
        gateway: Arc<Zigbee2MqttGateway>,
    ) -> Result<Self> {
        gateway.converter().add_model(model, &[("power", "state")]);
        let core = ZigbeeDevice::new(sid, Self::descriptor()?, gateway as Arc<dyn Gateway>)?;
        core.base().status().set("model", model)?;
        Ok(Self { core })
    }

    /// Pull the current switch state from the bridge
    pub async fn init(&self) -> Result<()> {
        self.core.init().await
    }

    async fn set_power(&self, value: &str) -> Result<()> {
        let mut payload = ValueMap::new();
        payload.insert("power".to_string(), Value::from(value));
        self.core.write(payload).await
    }
}

#[async_trait]
impl Device for WallSwitch {
    fn base(&self) -> &BaseDevice {
        self.core.base()
    }

    async fn invoke(&self, cmd: &str, args: &[Value]) -> Result<()> {
        if let Some(res) = OnOff::dispatch(self, cmd, args).await {
            return res;
        }
        if let Some(res) = Toggle::dispatch(self, cmd, args).await {
            return res;
        }
        Err(DeviceError::UnknownCommand(cmd.to_string()))
    }
}

#[async_trait]
impl OnOff for WallSwitch {
    async fn on(&self) -> Result<()> {
        self.set_power("ON").await
    }

    async fn off(&self) -> Result<()> {
        self.set_power("OFF").await
    }

    // The bridge reports power states uppercase
    fn is_on(&self) -> bool {
        self.status().get_str("power").eq_ignore_ascii_case("on")
    }

    fn is_off(&self) -> bool {
        self.status().get_str("power").eq_ignore_ascii_case("off")
    }
}

#[async_trait]
impl Toggle for WallSwitch {
    async fn toggle(&self) -> Result<()> {
        self.set_power("TOGGLE").await
    }
}

/// A door/window contact sensor paired through the bridge.
///
/// Every report carrying a `contact` reading also stamps a `when`
/// attribute with the report's receive time.
#[derive(Debug)]
pub struct ContactSensor {
    core: ZigbeeDevice,
}

impl ContactSensor {
    fn descriptor() -> Result<&'static DeviceDescriptor> {
        static DESCRIPTOR: OnceCell<DeviceDescriptor> = OnceCell::new();
        DESCRIPTOR.get_or_try_init(|| DeviceDescriptor::assemble(&[&CONTACT]))
    }

    /// Pair with the bridge under `sid`
    pub fn new<S: Into<Sid>>(
        sid: S,
        model: &str,
        gateway: Arc<Zigbee2MqttGateway>,
    ) -> Result<Self> {
        let core = ZigbeeDevice::new(
            sid,
            Self::descriptor()?,
            Arc::clone(&gateway) as Arc<dyn Gateway>,
        )?;
        let status = core.base().status();
        status.register(Attribute::new("when", AttrKind::Str))?;
        status.set("model", model)?;

        let sid = core.base().sid().clone();
        let stamp = core.base().shared_status();
        gateway.watcher().add_report_handler(move |report| {
            if report.sid == sid && report.data.contains_key("contact") {
                let _ = stamp.set("when", report.ts.to_rfc3339());
            }
        });
        Ok(Self { core })
    }

    /// When the last contact reading arrived, as an RFC 3339 stamp
    pub fn when(&self) -> String {
        self.status().get_str("when")
    }
}

#[async_trait]
impl Device for ContactSensor {
    fn base(&self) -> &BaseDevice {
        self.core.base()
    }

    async fn invoke(&self, cmd: &str, _args: &[Value]) -> Result<()> {
        Err(DeviceError::UnknownCommand(cmd.to_string()))
    }
}

impl Contact for ContactSensor {}

/// A temperature/humidity sensor paired through the bridge; models with
/// a barometer also report `pressure`.
#[derive(Debug)]
pub struct ClimateSensor {
    core: ZigbeeDevice,
}

impl ClimateSensor {
    fn descriptor() -> Result<&'static DeviceDescriptor> {
        static DESCRIPTOR: OnceCell<DeviceDescriptor> = OnceCell::new();
        DESCRIPTOR.get_or_try_init(|| DeviceDescriptor::assemble(&[&CLIMATE]))
    }

    /// Pair with the bridge under `sid`
    pub fn new<S: Into<Sid>>(
        sid: S,
        model: &str,
        gateway: Arc<Zigbee2MqttGateway>,
    ) -> Result<Self> {
        let core = ZigbeeDevice::new(sid, Self::descriptor()?, gateway as Arc<dyn Gateway>)?;
        let status = core.base().status();
        status.register(Attribute::new("pressure", AttrKind::Float))?;
        status.set("model", model)?;
        Ok(Self { core })
    }

    /// Last reported air pressure, in hPa
    pub fn pressure(&self) -> f64 {
        self.status().get_float("pressure")
    }
}

#[async_trait]
impl Device for ClimateSensor {
    fn base(&self) -> &BaseDevice {
        self.core.base()
    }

    async fn invoke(&self, cmd: &str, _args: &[Value]) -> Result<()> {
        Err(DeviceError::UnknownCommand(cmd.to_string()))
    }
}

impl Climate for ClimateSensor {}
