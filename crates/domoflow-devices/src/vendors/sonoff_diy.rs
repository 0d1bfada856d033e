/*!
 * DIY-mode switch control in the Sonoff style.
 *
 * DIY-mode firmware exposes a small HTTP API on port 8081: every
 * command is a POST to `/zeroconf/<action>` with a
 * `{"deviceid": .., "data": {..}}` body, and `/zeroconf/info` returns
 * the full relay state. The firmware offers no push channel, so state
 * rides a [`PollingDriver`] that also wakes right after each local
 * write. The vendor reports power under `switch`; the registry aliases
 * it to `power`.
 */
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::{json, Value as JsonValue};

use domoflow_core::config::NetworkConfig;
use domoflow_core::types::{value_map_from_json, AttrKind, Sid, Value, ValueMap};

use crate::device::{BaseDevice, Device, DeviceDescriptor, DeviceError, Result};
use crate::status::{Attribute, DeviceStatus};
use crate::traits::{OnOff, ON_OFF};
use crate::transport::http::HttpJsonClient;
use crate::vendors::wire_int;
use crate::watcher::{Pollable, PollingDriver, PollSignal, Watcher};

/// Poll spacing when no local write forces an earlier cycle
const POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Inching durations the firmware accepts, in milliseconds
const PULSE_WIDTH_STEP: i64 = 500;
const PULSE_WIDTH_MAX: i64 = 36_000_000;

/// What the relay should do when mains power returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// Switch on
    On,
    /// Stay off
    Off,
    /// Restore the state from before the outage
    Stay,
}

impl PowerState {
    fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Stay => "stay",
        }
    }
}

/// Whether the inching function is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulse {
    /// Flip the relay back after the pulse width elapses
    On,
    /// Leave the relay alone
    Off,
}

impl Pulse {
    fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

/// Shape an info answer into registry fields.
///
/// Recent firmware nests the state under a `data` object; older builds
/// send the same object serialized into a string.
fn info_fields(reply: &ValueMap) -> ValueMap {
    match reply.get("data") {
        Some(Value::Map(fields)) => fields.clone(),
        Some(Value::Str(nested)) => match serde_json::from_str::<JsonValue>(nested) {
            Ok(parsed) => value_map_from_json(parsed),
            Err(_) => ValueMap::new(),
        },
        _ => ValueMap::new(),
    }
}

/// The firmware answers 200 even for failures; the body carries the code
fn check_error(reply: &ValueMap) -> Result<()> {
    let code = wire_int(reply, "error").unwrap_or(0);
    if code == 0 {
        return Ok(());
    }
    Err(DeviceError::transport(format!(
        "Device answered error {}",
        code
    )))
}

/// Registry plus HTTP endpoint, shared between the plug and its poller.
#[derive(Debug)]
struct PlugCore {
    base: BaseDevice,
    conn: HttpJsonClient,
}

impl PlugCore {
    async fn zeroconf(&self, action: &str, fields: JsonValue) -> Result<ValueMap> {
        let body = json!({"deviceid": self.base.sid().as_str(), "data": fields});
        self.conn
            .post_json(&format!("zeroconf/{}", action), &body)
            .await
    }
}

#[async_trait]
impl Pollable for PlugCore {
    fn sid(&self) -> &Sid {
        self.base.sid()
    }

    fn status(&self) -> &DeviceStatus {
        self.base.status()
    }

    async fn refresh(&self) -> Result<()> {
        let reply = self.zeroconf("info", json!({})).await?;
        check_error(&reply)?;
        self.base.status().update(&info_fields(&reply));
        Ok(())
    }
}

/// A relay running the DIY-mode firmware.
///
/// State stays empty until the first poll lands; call [`DiyPlug::refresh`]
/// to fill it eagerly.
#[derive(Debug)]
pub struct DiyPlug {
    core: Arc<PlugCore>,
    watcher: Watcher,
    signal: PollSignal,
}

impl DiyPlug {
    fn descriptor() -> Result<&'static DeviceDescriptor> {
        static DESCRIPTOR: OnceCell<DeviceDescriptor> = OnceCell::new();
        DESCRIPTOR.get_or_try_init(|| DeviceDescriptor::assemble(&[&ON_OFF]))
    }

    /// Connect to a plug at a known address
    pub fn connect<S: Into<Sid>>(addr: SocketAddr, sid: S, network: &NetworkConfig) -> Result<Self> {
        Self::with_interval(addr, sid, network, POLL_INTERVAL)
    }

    /// Connect with a custom poll spacing
    pub fn with_interval<S: Into<Sid>>(
        addr: SocketAddr,
        sid: S,
        network: &NetworkConfig,
        interval: Duration,
    ) -> Result<Self> {
        let base = BaseDevice::new(sid, Self::descriptor()?)?;
        let status = base.status();
        status.register(Attribute::new("ip", AttrKind::Str))?;
        status.register(Attribute::new("port", AttrKind::Int))?;
        status.register(Attribute::new("startup", AttrKind::Str))?;
        status.register(Attribute::new("pulse", AttrKind::Str))?;
        status.register(Attribute::new("pulseWidth", AttrKind::Int))?;
        status.register(Attribute::new("ssid", AttrKind::Str))?;
        status.register(Attribute::new("sledOnline", AttrKind::Str))?;
        status.register(Attribute::new("signalStrength", AttrKind::Int))?;
        status.add_alias("switch", "power")?;
        status.set("ip", addr.ip().to_string())?;
        status.set("port", i64::from(addr.port()))?;

        let conn = HttpJsonClient::new(format!("http://{}", addr), network)?;
        let core = Arc::new(PlugCore { base, conn });
        let driver = PollingDriver::new(core.clone(), interval);
        let signal = driver.signal();
        let watcher = Watcher::start(Arc::new(driver));
        Ok(Self {
            core,
            watcher,
            signal,
        })
    }

    /// Get the watcher fed by the poll loop
    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    /// Fetch the relay state now instead of waiting for the next poll
    pub async fn refresh(&self) -> Result<()> {
        self.core.refresh().await?;
        self.signal.poke();
        Ok(())
    }

    /// Set what the relay does when power supply is recovered
    pub async fn set_power_on_state(&self, state: PowerState) -> Result<()> {
        self.command("startup", json!({"startup": state.as_str()}))
            .await
    }

    /// Configure the inching function.
    ///
    /// `width_ms` is the pulse length; the firmware only accepts
    /// multiples of 500 ms up to ten hours.
    pub async fn set_pulse(&self, pulse: Pulse, width_ms: i64) -> Result<()> {
        if width_ms < PULSE_WIDTH_STEP
            || width_ms > PULSE_WIDTH_MAX
            || width_ms % PULSE_WIDTH_STEP != 0
        {
            return Err(DeviceError::invalid_argument(format!(
                "pulse width must be a multiple of {} ms up to {}",
                PULSE_WIDTH_STEP, PULSE_WIDTH_MAX
            )));
        }
        self.command(
            "pulse",
            json!({"pulse": pulse.as_str(), "pulseWidth": width_ms}),
        )
        .await
    }

    /// Point the device at another wireless network
    pub async fn set_wifi(&self, ssid: &str, password: &str) -> Result<()> {
        self.command("wifi", json!({"ssid": ssid, "password": password}))
            .await
    }

    /// Get the WiFi signal strength seen by the device, in dBm
    pub async fn signal_strength(&self) -> Result<i64> {
        let reply = self.core.zeroconf("signal_strength", json!({})).await?;
        check_error(&reply)?;
        Ok(wire_int(&info_fields(&reply), "signalStrength").unwrap_or(0))
    }

    async fn set_switch(&self, state: &str) -> Result<()> {
        self.command("switch", json!({"switch": state})).await
    }

    /// Post one command, then wake the poller so the change shows up
    async fn command(&self, action: &str, fields: JsonValue) -> Result<()> {
        let reply = self.core.zeroconf(action, fields).await?;
        check_error(&reply)?;
        self.signal.poke();
        Ok(())
    }
}

#[async_trait]
impl Device for DiyPlug {
    fn base(&self) -> &BaseDevice {
        &self.core.base
    }

    async fn invoke(&self, cmd: &str, args: &[Value]) -> Result<()> {
        if let Some(res) = OnOff::dispatch(self, cmd, args).await {
            return res;
        }
        Err(DeviceError::UnknownCommand(cmd.to_string()))
    }
}

#[async_trait]
impl OnOff for DiyPlug {
    async fn on(&self) -> Result<()> {
        self.set_switch("on").await
    }

    async fn off(&self) -> Result<()> {
        self.set_switch("off").await
    }
}
