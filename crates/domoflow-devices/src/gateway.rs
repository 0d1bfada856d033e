/*!
 * Hub-mediated device plumbing for DomoFlow.
 *
 * A gateway owns the single transport a fleet of sub-devices shares (a
 * Zigbee coordinator's MQTT bridge, a LAN hub's UDP socket) and routes
 * inbound events to each sub-device's registry by `sid`. This module
 * holds the gateway contract, the per-model field-name converter for
 * bridges whose wire vocabulary differs from the attribute vocabulary,
 * the demultiplexing table and the sub-device core shared by Zigbee
 * radios.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use domoflow_core::types::{AttrKind, Sid, Value, ValueMap};

use crate::device::{BaseDevice, DeviceDescriptor, Result};
use crate::status::{Attribute, DeviceStatus};
use crate::watcher::Watcher;

/// The contract every hub-mediated transport implements.
///
/// One gateway instance serves all sub-devices registered under it; the
/// gateway demultiplexes inbound traffic by `sid` into the registries it
/// holds in its [`SubDeviceTable`].
#[async_trait]
pub trait Gateway: Send + Sync + Debug {
    /// Write attribute values to a sub-device through the hub
    async fn set_device(&self, sid: &Sid, payload: ValueMap) -> Result<()>;

    /// Read a sub-device's current state from the hub
    async fn get_device(&self, sid: &Sid) -> Result<ValueMap>;

    /// List the sub-devices the hub knows about
    async fn get_device_list(&self) -> Result<Vec<ValueMap>>;

    /// Allow or disallow new sub-devices joining the hub
    async fn set_accept_join(&self, allow: bool) -> Result<()>;

    /// Remove a sub-device from the hub
    async fn remove_device(&self, sid: &Sid) -> Result<()>;

    /// Attach a sub-device's registry to the gateway's routing table
    fn register_sub_device(&self, device: &BaseDevice);

    /// Get the watcher fed by the gateway's shared transport
    fn watcher(&self) -> &Watcher;
}

/// The sid-to-registry routing table behind a gateway.
#[derive(Debug, Default)]
pub struct SubDeviceTable {
    devices: RwLock<HashMap<Sid, Arc<DeviceStatus>>>,
}

impl SubDeviceTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Sid, Arc<DeviceStatus>>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a device's registry under its sid
    pub fn register(&self, device: &BaseDevice) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.sid().clone(), device.shared_status());
    }

    /// Detach a sid; returns whether it was present
    pub fn unregister(&self, sid: &Sid) -> bool {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sid)
            .is_some()
    }

    /// Get the registry attached under `sid`
    pub fn status_of(&self, sid: &Sid) -> Option<Arc<DeviceStatus>> {
        self.read().get(sid).cloned()
    }

    /// Merge `data` into the registry attached under `sid`; returns
    /// whether the event was routed
    pub fn update(&self, sid: &Sid, data: &ValueMap) -> bool {
        match self.status_of(sid) {
            Some(status) => {
                status.update(data);
                true
            }
            None => false,
        }
    }

    /// List the registered sids
    pub fn sids(&self) -> Vec<Sid> {
        self.read().keys().cloned().collect()
    }
}

/// Field-name translation for bridges whose wire vocabulary differs per
/// device model.
///
/// Mappings are registered per model before first translation; fields
/// and models without a mapping pass through unchanged, so translation
/// never fails.
#[derive(Debug, Default)]
pub struct Converter {
    models: RwLock<HashMap<String, FieldMap>>,
}

#[derive(Debug, Default, Clone)]
struct FieldMap {
    to_wire: HashMap<String, String>,
    to_attr: HashMap<String, String>,
}

impl Converter {
    /// Create an empty converter
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the `(attribute name, wire name)` pairs for a model
    pub fn add_model<S: Into<String>>(&self, model: S, fields: &[(&str, &str)]) {
        let mut map = FieldMap::default();
        for (attr, wire) in fields {
            map.to_wire.insert((*attr).to_string(), (*wire).to_string());
            map.to_attr.insert((*wire).to_string(), (*attr).to_string());
        }
        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model.into(), map);
    }

    /// Translate attribute-named fields into the model's wire names
    pub fn to_gateway(&self, model: &str, fields: &ValueMap) -> ValueMap {
        self.translate(model, fields, |map| &map.to_wire)
    }

    /// Translate wire-named fields into the model's attribute names
    pub fn to_status(&self, model: &str, fields: &ValueMap) -> ValueMap {
        self.translate(model, fields, |map| &map.to_attr)
    }

    fn translate<F>(&self, model: &str, fields: &ValueMap, direction: F) -> ValueMap
    where
        F: Fn(&FieldMap) -> &HashMap<String, String>,
    {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        let map = match models.get(model) {
            Some(map) => map,
            None => return fields.clone(),
        };
        let names = direction(map);
        fields
            .iter()
            .map(|(k, v)| {
                let name = names.get(k).cloned().unwrap_or_else(|| k.clone());
                (name, v.clone())
            })
            .collect()
    }
}

/// Millivolt floor below which a battery radio reports low voltage
const LOW_VOLTAGE_MV: i64 = 2800;

/// Radio bookkeeping attributes every Zigbee sub-device carries
pub fn zigbee_attributes() -> Vec<Attribute> {
    vec![
        Attribute::new("voltage", AttrKind::Int),
        Attribute::new("linkquality", AttrKind::Int),
        Attribute::oneshot("short_id", AttrKind::Int),
        Attribute::readonly("low_voltage", AttrKind::Int).with_value(LOW_VOLTAGE_MV),
    ]
}

/// The core embedded in every hub-mediated Zigbee sub-device.
///
/// Construction registers the radio bookkeeping attributes and attaches
/// the registry to the gateway's routing table, so watcher events start
/// flowing before the first explicit read.
#[derive(Debug)]
pub struct ZigbeeDevice {
    base: BaseDevice,
    gateway: Arc<dyn Gateway>,
}

impl ZigbeeDevice {
    /// Build the core for a new sub-device instance
    pub fn new<S: Into<Sid>>(
        sid: S,
        descriptor: &'static DeviceDescriptor,
        gateway: Arc<dyn Gateway>,
    ) -> Result<Self> {
        let base = BaseDevice::new(sid, descriptor)?;
        for attr in zigbee_attributes() {
            base.status().register(attr)?;
        }
        gateway.register_sub_device(&base);
        Ok(Self { base, gateway })
    }

    /// Get the embedded device core
    pub fn base(&self) -> &BaseDevice {
        &self.base
    }

    /// Get the hub this sub-device is routed through
    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    /// Pull the sub-device's current state from the hub into the registry
    pub async fn init(&self) -> Result<()> {
        let reply = self.gateway.get_device(self.base.sid()).await?;
        match reply.get("data").and_then(Value::as_map) {
            Some(data) => self.base.status().update(data),
            None => self.base.status().update(&reply),
        }
        Ok(())
    }

    /// Write attribute values to the sub-device through the hub
    pub async fn write(&self, payload: ValueMap) -> Result<()> {
        self.gateway.set_device(self.base.sid(), payload).await
    }
}
