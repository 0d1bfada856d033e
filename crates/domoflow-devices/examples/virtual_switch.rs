/*!
 * Hardware-free smoke test: a virtual switch, a polling watcher and the
 * status registry wired together.
 *
 * Run with `cargo run --example virtual_switch`.
 */
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::info;

use domoflow_core::types::{Sid, Value};
use domoflow_devices::device::Result as DeviceResult;
use domoflow_devices::device::{BaseDevice, Device, DeviceDescriptor, DeviceError};
use domoflow_devices::status::DeviceStatus;
use domoflow_devices::traits::{OnOff, ON_OFF};
use domoflow_devices::watcher::{Pollable, PollingDriver, Watcher};

/// A switch that exists only in memory.
#[derive(Debug)]
struct VirtualSwitch {
    base: BaseDevice,
}

impl VirtualSwitch {
    fn descriptor() -> DeviceResult<&'static DeviceDescriptor> {
        static DESCRIPTOR: OnceCell<DeviceDescriptor> = OnceCell::new();
        DESCRIPTOR.get_or_try_init(|| DeviceDescriptor::assemble(&[&ON_OFF]))
    }

    fn new(sid: &str) -> DeviceResult<Self> {
        Ok(Self {
            base: BaseDevice::new(sid, Self::descriptor()?)?,
        })
    }
}

#[async_trait]
impl Device for VirtualSwitch {
    fn base(&self) -> &BaseDevice {
        &self.base
    }

    async fn invoke(&self, cmd: &str, args: &[Value]) -> DeviceResult<()> {
        if let Some(res) = OnOff::dispatch(self, cmd, args).await {
            return res;
        }
        Err(DeviceError::UnknownCommand(cmd.to_string()))
    }
}

#[async_trait]
impl OnOff for VirtualSwitch {
    async fn on(&self) -> DeviceResult<()> {
        self.base.status().set("power", "on")
    }

    async fn off(&self) -> DeviceResult<()> {
        self.base.status().set("power", "off")
    }
}

#[async_trait]
impl Pollable for VirtualSwitch {
    fn sid(&self) -> &Sid {
        self.base.sid()
    }

    fn status(&self) -> &DeviceStatus {
        self.base.status()
    }

    // State only changes through local writes
    async fn refresh(&self) -> DeviceResult<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    domoflow_core::init()?;

    let switch = Arc::new(VirtualSwitch::new("demo-switch-1")?);
    let driver = PollingDriver::new(switch.clone(), Duration::from_secs(1));
    let signal = driver.signal();
    let watcher = Watcher::start(Arc::new(driver));
    watcher.add_report_handler(|report| {
        info!(sid = %report.sid, "state changed: {:?}", report.data);
    });

    switch.on().await?;
    signal.poke();
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("switch reports on: {}", switch.is_on());

    switch.off().await?;
    signal.poke();
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("switch reports on: {}", switch.is_on());

    watcher.stop().await;
    Ok(())
}
