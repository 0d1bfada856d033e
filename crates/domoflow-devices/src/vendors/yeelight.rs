/*!
 * Wi-Fi lamp control in the Yeelight style.
 *
 * Lamps speak the line-framed JSON protocol on port 55443 and announce
 * themselves over SSDP. Commands ride [`TcpJsonClient`]; state flows
 * back over a persistent notification connection every connected client
 * shares, so local writes never touch the registry directly. Color
 * temperature is exposed as a percentage of the model's Kelvin range,
 * with the absolute `ct` kept alongside.
 */
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use domoflow_core::config::{DiscoveryConfig, NetworkConfig};
use domoflow_core::types::{value_map_from_json, AttrKind, Sid, Value, ValueMap};

use crate::device::{BaseDevice, Device, DeviceDescriptor, DeviceError, Result};
use crate::discovery::{Discovery, SsdpDiscovery};
use crate::status::Attribute;
use crate::traits::{
    ColorTemperature, Dimmer, OnOff, Scene, Toggle, COLOR_TEMPERATURE, DIMMER, ON_OFF, SCENE,
    TOGGLE,
};
use crate::transport::tcp::TcpJsonClient;
use crate::vendors::{wire_int, wire_str};
use crate::watcher::{Report, Watcher, WatcherDriver};

/// Transition effect sent with every state change
const EFFECT: &str = "smooth";
/// Transition duration sent with every state change, in milliseconds
const DURATION_MS: i64 = 500;
/// Pause before redialing a broken notification connection
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// The Kelvin span a lamp model supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CtRange {
    min: i64,
    max: i64,
}

impl CtRange {
    /// Desk lamps start at 2700 K; every other model spans the full range
    fn for_model(model: &str) -> Self {
        if model == "desklamp" {
            Self {
                min: 2700,
                max: 6500,
            }
        } else {
            Self {
                min: 1700,
                max: 6500,
            }
        }
    }

    fn to_kelvin(self, percent: i64) -> i64 {
        self.min + ((self.max - self.min) as f64 * percent as f64 / 100.0) as i64
    }

    fn to_percent(self, kelvin: i64) -> i64 {
        let span = (self.max - self.min) as f64;
        (100.0 - (self.max - kelvin) as f64 / span * 100.0) as i64
    }
}

/// Normalize a raw lamp map into typed registry fields.
///
/// The wire carries numbers and numeric strings interchangeably; `ct`
/// additionally yields the percentage the registry tracks.
fn lamp_fields(ct_range: CtRange, raw: &ValueMap) -> ValueMap {
    let mut fields = ValueMap::new();
    if let Some(power) = wire_str(raw, "power") {
        fields.insert("power".to_string(), Value::from(power));
    }
    if let Some(bright) = wire_int(raw, "bright") {
        fields.insert("bright".to_string(), Value::from(bright));
    }
    if let Some(ct) = wire_int(raw, "ct") {
        fields.insert("ct".to_string(), Value::from(ct));
        fields.insert("ct_pc".to_string(), Value::from(ct_range.to_percent(ct)));
    }
    fields
}

fn check_range(value: i64, low: i64, high: i64, what: &str) -> Result<()> {
    if (low..=high).contains(&value) {
        return Ok(());
    }
    Err(DeviceError::invalid_argument(format!(
        "{} must be between {} and {}",
        what, low, high
    )))
}

/// Watcher driver fed by the lamp's notification stream.
///
/// Lamps push a `props` notification to every connected client whenever
/// their state changes; the driver keeps one connection open for that
/// purpose and redials when it breaks.
#[derive(Debug)]
pub struct NotificationDriver {
    addr: SocketAddr,
    sid: Sid,
    model: String,
    ct_range: CtRange,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl NotificationDriver {
    fn new(addr: SocketAddr, sid: Sid, model: &str, ct_range: CtRange) -> Self {
        Self {
            addr,
            sid,
            model: model.to_string(),
            ct_range,
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    /// Shape one notification line into a [`Report`]; answers and other
    /// chatter yield `None`
    fn wire_report(&self, line: &str) -> Option<Report> {
        let msg: JsonValue = serde_json::from_str(line).ok()?;
        let params = msg.get("params")?;
        if !params.is_object() {
            return None;
        }
        let mut data = value_map_from_json(params.clone());
        if let Some(ct) = wire_int(&data, "ct") {
            data.insert("ct_pc".to_string(), Value::from(self.ct_range.to_percent(ct)));
        }
        let report = Report::new(self.sid.clone(), data);
        if self.model.is_empty() {
            Some(report)
        } else {
            Some(report.with_model(self.model.as_str()))
        }
    }
}

#[async_trait]
impl WatcherDriver for NotificationDriver {
    async fn watch(&self, tx: mpsc::Sender<Report>) -> Result<()> {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
            let stream = tokio::select! {
                _ = self.stop_notify.notified() => return Ok(()),
                connected = TcpStream::connect(self.addr) => match connected {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!("Dialing lamp {} failed: {}", self.addr, e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                },
            };
            let mut lines = BufReader::new(stream).lines();
            loop {
                let line = tokio::select! {
                    _ = self.stop_notify.notified() => return Ok(()),
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        if let Some(report) = self.wire_report(&line) {
                            if tx.send(report).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Notification stream from {} broke: {}", self.addr, e);
                        break;
                    }
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
    }
}

/// A Wi-Fi lamp with power, brightness, color temperature and scenes.
#[derive(Debug)]
pub struct YeelightLamp {
    base: BaseDevice,
    conn: TcpJsonClient,
    ct_range: CtRange,
    watcher: Watcher,
}

impl YeelightLamp {
    fn descriptor() -> Result<&'static DeviceDescriptor> {
        static DESCRIPTOR: OnceCell<DeviceDescriptor> = OnceCell::new();
        DESCRIPTOR.get_or_try_init(|| {
            DeviceDescriptor::assemble(&[&ON_OFF, &DIMMER, &COLOR_TEMPERATURE, &SCENE, &TOGGLE])
        })
    }

    /// Locate the lamp with an SSDP probe and connect to it
    pub async fn discover<S: Into<Sid>>(
        sid: S,
        network: &NetworkConfig,
        discovery: &DiscoveryConfig,
    ) -> Result<Self> {
        let probe = SsdpDiscovery::new(discovery);
        Self::with_probe(&probe, sid.into(), network).await
    }

    /// Locate the lamp through `probe` and connect to it
    pub async fn with_probe(
        probe: &dyn Discovery,
        sid: Sid,
        network: &NetworkConfig,
    ) -> Result<Self> {
        let found = probe.find_by_sid(&sid).await?;
        let device = match found {
            Some(device) => device,
            None => {
                return Err(DeviceError::offline(format!(
                    "No lamp answered the probe for {}",
                    sid
                )))
            }
        };
        let addr = match device.socket_addr() {
            Some(addr) => addr,
            None => {
                return Err(DeviceError::transport(format!(
                    "Probe reply for {} carries no address",
                    sid
                )))
            }
        };
        let model = device.model.clone().unwrap_or_default();
        let lamp = Self::connect(addr, sid, &model, network)?;
        // The probe reply doubles as the first state snapshot
        lamp.base
            .status()
            .update(&lamp_fields(lamp.ct_range, &device.extra));
        Ok(lamp)
    }

    /// Connect to a lamp at a known address
    pub fn connect<S: Into<Sid>>(
        addr: SocketAddr,
        sid: S,
        model: &str,
        network: &NetworkConfig,
    ) -> Result<Self> {
        let sid = sid.into();
        let ct_range = CtRange::for_model(model);
        let base = BaseDevice::new(sid.clone(), Self::descriptor()?)?;
        base.status().register(Attribute::new("ct", AttrKind::Int))?;
        if !model.is_empty() {
            base.status().set("model", model)?;
        }

        let conn = TcpJsonClient::new(addr, network);
        let driver = NotificationDriver::new(addr, sid, model, ct_range);
        let watcher = Watcher::start(Arc::new(driver));
        let status = base.shared_status();
        watcher.add_report_handler(move |report| {
            status.update(&lamp_fields(ct_range, &report.data));
        });

        Ok(Self {
            base,
            conn,
            ct_range,
            watcher,
        })
    }

    /// Get the watcher fed by the lamp's notification stream
    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    /// Last reported color temperature, in Kelvin
    pub fn ct(&self) -> i64 {
        self.base.status().get_int("ct")
    }

    /// Pull the lamp's current properties into the registry
    pub async fn refresh(&self) -> Result<()> {
        let props = ["power", "bright", "ct"];
        let answer = self.conn.call("get_prop", json!(props)).await?;
        let result = match answer.get("result").and_then(JsonValue::as_array) {
            Some(result) => result,
            None => {
                return Err(DeviceError::transport(
                    "Lamp answered get_prop without a result",
                ))
            }
        };
        let mut raw = ValueMap::new();
        for (name, value) in props.iter().zip(result) {
            raw.insert(name.to_string(), Value::from(value.clone()));
        }
        self.base.status().update(&lamp_fields(self.ct_range, &raw));
        Ok(())
    }

    /// Set the absolute color temperature, in Kelvin
    pub async fn set_ct_abx(&self, kelvin: i64) -> Result<()> {
        check_range(kelvin, self.ct_range.min, self.ct_range.max, "ct")?;
        self.command("set_ct_abx", json!([kelvin, EFFECT, DURATION_MS]))
            .await
    }

    async fn set_power(&self, state: &str) -> Result<()> {
        self.command("set_power", json!([state, EFFECT, DURATION_MS, 0]))
            .await
    }

    /// Invoke `method` and surface an `error` answer as a failure
    async fn command(&self, method: &str, params: JsonValue) -> Result<()> {
        let answer = self.conn.call(method, params).await?;
        match answer.get("error") {
            Some(error) => Err(DeviceError::transport(format!(
                "Lamp rejected {}: {}",
                method, error
            ))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Device for YeelightLamp {
    fn base(&self) -> &BaseDevice {
        &self.base
    }

    async fn invoke(&self, cmd: &str, args: &[Value]) -> Result<()> {
        if let Some(res) = OnOff::dispatch(self, cmd, args).await {
            return res;
        }
        if let Some(res) = Dimmer::dispatch(self, cmd, args).await {
            return res;
        }
        if let Some(res) = ColorTemperature::dispatch(self, cmd, args).await {
            return res;
        }
        if let Some(res) = Scene::dispatch(self, cmd, args).await {
            return res;
        }
        if let Some(res) = Toggle::dispatch(self, cmd, args).await {
            return res;
        }
        Err(DeviceError::UnknownCommand(cmd.to_string()))
    }
}

#[async_trait]
impl OnOff for YeelightLamp {
    async fn on(&self) -> Result<()> {
        self.set_power("on").await
    }

    async fn off(&self) -> Result<()> {
        self.set_power("off").await
    }
}

#[async_trait]
impl Toggle for YeelightLamp {
    async fn toggle(&self) -> Result<()> {
        self.command("toggle", json!([])).await
    }
}

#[async_trait]
impl Dimmer for YeelightLamp {
    async fn set_bright(&self, value: i64) -> Result<()> {
        check_range(value, 1, 100, "brightness")?;
        self.command("set_bright", json!([value, EFFECT, DURATION_MS]))
            .await
    }
}

#[async_trait]
impl ColorTemperature for YeelightLamp {
    async fn set_ct_pc(&self, percent: i64) -> Result<()> {
        check_range(percent, 0, 100, "percent")?;
        self.set_ct_abx(self.ct_range.to_kelvin(percent)).await
    }
}

#[async_trait]
impl Scene for YeelightLamp {
    async fn set_scene(&self, scene: &str, args: &[Value]) -> Result<()> {
        let mut params = vec![JsonValue::from(scene)];
        params.extend(args.iter().cloned().map(JsonValue::from));
        self.command("set_scene", JsonValue::Array(params)).await?;
        // Scenes are not echoed back over the notification stream
        self.base.status().set("scene", scene)
    }
}
