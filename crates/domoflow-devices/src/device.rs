/*!
 * Device base, capability assembly and the device-facing error type.
 *
 * A concrete device type lists the capabilities it mixes in, assembles them
 * once into a [`DeviceDescriptor`] cached per type, and embeds a
 * [`BaseDevice`] carrying its identity and attribute registry. The
 * [`Device`] trait is the uniform surface applications and hubs talk to.
 */
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use domoflow_core::error::Error as CoreError;
use domoflow_core::types::{AttrKind, Sid, Value, ValueMap};

use crate::status::{Attribute, DeviceStatus};

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A write hit a read-only or already-locked attribute
    #[error("Attribute '{0}' is read-only")]
    ReadOnly(String),

    /// The command is not in the device's assembled command set
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    /// An attribute or alias name is already taken
    #[error("Attribute '{0}' is already registered")]
    AlreadyRegistered(String),

    /// An alias could not be registered
    #[error("Alias error: {0}")]
    Alias(String),

    /// Capability templates could not be merged into one device type
    #[error("Capability assembly error: {0}")]
    CapabilityAssembly(String),

    /// A command argument is missing or has the wrong type
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The device did not answer within its retry budget
    #[error("Device is offline: {0}")]
    Offline(String),

    /// A single operation timed out
    #[error("Device timed out: {0}")]
    Timeout(String),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// A payload could not be serialized or parsed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new capability assembly error
    pub fn capability_assembly<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::CapabilityAssembly(msg.as_ref().to_string())
    }

    /// Create a new invalid argument error
    pub fn invalid_argument<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::InvalidArgument(msg.as_ref().to_string())
    }

    /// Create a new offline error
    pub fn offline<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Offline(msg.as_ref().to_string())
    }

    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Timeout(msg.as_ref().to_string())
    }

    /// Create a new transport error
    pub fn transport<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Transport(msg.as_ref().to_string())
    }

    /// Create a new serialization error
    pub fn serialization<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Serialization(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Other(msg.as_ref().to_string())
    }
}

impl From<CoreError> for DeviceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Timeout(msg) => DeviceError::Timeout(msg),
            CoreError::Io(e) => DeviceError::Transport(e.to_string()),
            CoreError::Serialization(msg) => DeviceError::Serialization(msg),
            other => DeviceError::Other(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::Transport(err.to_string())
    }
}

/// A reusable capability mixed into device types.
///
/// A capability names the commands it contributes and carries a factory for
/// the attribute templates it needs in the owning device's registry. The
/// interface contract lives in the matching trait in [`crate::traits`]; a
/// device type listing a capability here implements that trait.
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    /// Capability name as reported in `device_status()["traits"]`.
    pub name: &'static str,
    /// Commands the capability contributes to the device command set.
    pub commands: &'static [&'static str],
    /// Factory producing the capability's attribute templates.
    pub attributes: fn() -> Vec<Attribute>,
}

/// The merged per-type description of a device's capabilities.
///
/// Assembled once per concrete device type and cached in a static
/// `OnceCell`, so every instance of the type shares one descriptor:
///
/// ```ignore
/// fn descriptor() -> Result<&'static DeviceDescriptor> {
///     static DESCRIPTOR: OnceCell<DeviceDescriptor> = OnceCell::new();
///     DESCRIPTOR.get_or_try_init(|| DeviceDescriptor::assemble(&[&ON_OFF, &DIMMER]))
/// }
/// ```
#[derive(Debug)]
pub struct DeviceDescriptor {
    capabilities: Vec<&'static Capability>,
    traits: Vec<&'static str>,
    commands: BTreeSet<&'static str>,
}

impl DeviceDescriptor {
    /// Merge the command sets and attribute templates of `capabilities`.
    ///
    /// Command names are unioned and a capability listed twice contributes
    /// once. Two distinct capabilities declaring an attribute of the same
    /// name cannot be mixed into one device type and fail the assembly.
    pub fn assemble(capabilities: &[&'static Capability]) -> Result<Self> {
        let mut merged = Vec::new();
        let mut traits = Vec::new();
        let mut commands = BTreeSet::new();
        let mut owners: HashMap<String, &'static str> = HashMap::new();
        for cap in capabilities {
            if traits.contains(&cap.name) {
                continue;
            }
            traits.push(cap.name);
            merged.push(*cap);
            commands.extend(cap.commands.iter().copied());
            for attr in (cap.attributes)() {
                if let Some(owner) = owners.insert(attr.name().to_string(), cap.name) {
                    return Err(DeviceError::capability_assembly(format!(
                        "attribute '{}' is declared by both '{}' and '{}'",
                        attr.name(),
                        owner,
                        cap.name
                    )));
                }
            }
        }
        Ok(Self {
            capabilities: merged,
            traits,
            commands,
        })
    }

    /// Capability names in declaration order.
    pub fn traits(&self) -> &[&'static str] {
        &self.traits
    }

    /// The merged command set, sorted by name.
    pub fn commands(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.commands.iter().copied()
    }

    /// Whether `cmd` is part of the merged command set.
    pub fn has_command(&self, cmd: &str) -> bool {
        self.commands.contains(cmd)
    }

    /// Fresh attribute templates for a new device instance.
    pub fn attributes(&self) -> Vec<Attribute> {
        self.capabilities
            .iter()
            .flat_map(|cap| (cap.attributes)())
            .collect()
    }
}

/// Identity, descriptor and attribute registry shared by all device types.
///
/// Construction merges the descriptor's attribute templates into a fresh
/// registry and then registers the identity attributes: a constant `sid`,
/// mutable `name` and `place`, and a write-once `model`.
#[derive(Debug)]
pub struct BaseDevice {
    sid: Sid,
    descriptor: &'static DeviceDescriptor,
    status: Arc<DeviceStatus>,
}

impl BaseDevice {
    /// Build the registry for a new device instance.
    pub fn new<S: Into<Sid>>(sid: S, descriptor: &'static DeviceDescriptor) -> Result<Self> {
        let sid = sid.into();
        let status = DeviceStatus::new();
        for attr in descriptor.attributes() {
            status.register(attr)?;
        }
        status.register(Attribute::readonly("sid", AttrKind::Str).with_value(sid.as_str()))?;
        status.register(Attribute::new("name", AttrKind::Str))?;
        status.register(Attribute::new("place", AttrKind::Str))?;
        status.register(Attribute::oneshot("model", AttrKind::Str))?;
        Ok(Self {
            sid,
            descriptor,
            status: Arc::new(status),
        })
    }

    /// Get the device id.
    pub fn sid(&self) -> &Sid {
        &self.sid
    }

    /// Get the per-type capability descriptor.
    pub fn descriptor(&self) -> &'static DeviceDescriptor {
        self.descriptor
    }

    /// Get the attribute registry.
    pub fn status(&self) -> &DeviceStatus {
        &self.status
    }

    /// Get a shareable handle on the registry for watchers and gateways.
    pub fn shared_status(&self) -> Arc<DeviceStatus> {
        Arc::clone(&self.status)
    }
}

/// The uniform surface every device exposes to applications and hubs.
#[async_trait]
pub trait Device: Send + Sync + Debug {
    /// Get the embedded device core.
    fn base(&self) -> &BaseDevice;

    /// Dispatch a command already validated against the command set.
    ///
    /// Implementations chain their capability dispatchers and fall through
    /// to [`DeviceError::UnknownCommand`] for commands no capability
    /// routes. Callers go through [`Device::execute`] instead.
    async fn invoke(&self, cmd: &str, args: &[Value]) -> Result<()>;

    /// Get the device id.
    fn sid(&self) -> &Sid {
        self.base().sid()
    }

    /// Get the attribute registry.
    fn status(&self) -> &DeviceStatus {
        self.base().status()
    }

    /// Capability names in declaration order.
    fn traits(&self) -> &[&'static str] {
        self.base().descriptor().traits()
    }

    /// The assembled command set, sorted by name.
    fn commands(&self) -> Vec<&'static str> {
        self.base().descriptor().commands().collect()
    }

    /// Run a named command with positional arguments.
    ///
    /// A command outside the assembled set fails with
    /// [`DeviceError::UnknownCommand`] before anything touches the device.
    async fn execute(&self, cmd: &str, args: &[Value]) -> Result<()> {
        if !self.base().descriptor().has_command(cmd) {
            return Err(DeviceError::UnknownCommand(cmd.to_string()));
        }
        debug!(sid = %self.base().sid(), command = cmd, "executing command");
        self.invoke(cmd, args).await
    }

    /// Read one attribute; unknown names yield [`Value::Null`].
    fn query(&self, attribute: &str) -> Value {
        self.status().get(attribute)
    }

    /// The hub-facing description: capability names, command set and the
    /// full attribute snapshot.
    fn device_status(&self) -> ValueMap {
        let descriptor = self.base().descriptor();
        let mut map = ValueMap::new();
        map.insert(
            "traits".to_string(),
            Value::List(descriptor.traits().iter().map(|t| Value::from(*t)).collect()),
        );
        map.insert(
            "commands".to_string(),
            Value::List(descriptor.commands().map(Value::from).collect()),
        );
        for (name, value) in self.status().snapshot() {
            map.insert(name, value);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use once_cell::sync::OnceCell;

    use crate::traits::{Dimmer, OnOff, DIMMER, ON_OFF};

    use super::*;

    fn power_attribute() -> Vec<Attribute> {
        vec![Attribute::new("power", AttrKind::Str)]
    }

    const LEFT: Capability = Capability {
        name: "Left",
        commands: &["left"],
        attributes: power_attribute,
    };

    const RIGHT: Capability = Capability {
        name: "Right",
        commands: &["right"],
        attributes: power_attribute,
    };

    #[derive(Debug)]
    struct VirtualLamp {
        base: BaseDevice,
        on_calls: AtomicUsize,
        off_calls: AtomicUsize,
    }

    impl VirtualLamp {
        fn descriptor() -> Result<&'static DeviceDescriptor> {
            static DESCRIPTOR: OnceCell<DeviceDescriptor> = OnceCell::new();
            DESCRIPTOR.get_or_try_init(|| DeviceDescriptor::assemble(&[&ON_OFF, &DIMMER]))
        }

        fn new(sid: &str) -> Result<Self> {
            Ok(Self {
                base: BaseDevice::new(sid, Self::descriptor()?)?,
                on_calls: AtomicUsize::new(0),
                off_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Device for VirtualLamp {
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
            Err(DeviceError::UnknownCommand(cmd.to_string()))
        }
    }

    #[async_trait]
    impl OnOff for VirtualLamp {
        async fn on(&self) -> Result<()> {
            self.on_calls.fetch_add(1, Ordering::SeqCst);
            self.base.status().set("power", "on")
        }

        async fn off(&self) -> Result<()> {
            self.off_calls.fetch_add(1, Ordering::SeqCst);
            self.base.status().set("power", "off")
        }
    }

    #[async_trait]
    impl Dimmer for VirtualLamp {
        async fn set_bright(&self, value: i64) -> Result<()> {
            self.base.status().set("bright", value)
        }
    }

    #[test]
    fn test_assembly_is_independent_of_declaration_order() {
        let a = DeviceDescriptor::assemble(&[&ON_OFF, &DIMMER]).unwrap();
        let b = DeviceDescriptor::assemble(&[&DIMMER, &ON_OFF]).unwrap();

        let commands: Vec<&str> = a.commands().collect();
        assert_eq!(commands, vec!["off", "on", "set_bright"]);
        assert_eq!(b.commands().collect::<Vec<&str>>(), commands);

        let mut traits_a = a.traits().to_vec();
        let mut traits_b = b.traits().to_vec();
        traits_a.sort_unstable();
        traits_b.sort_unstable();
        assert_eq!(traits_a, vec!["Dimmer", "OnOff"]);
        assert_eq!(traits_b, traits_a);
    }

    #[test]
    fn test_assembly_rejects_duplicate_attribute_names() {
        let err = DeviceDescriptor::assemble(&[&LEFT, &RIGHT]).unwrap_err();
        assert!(matches!(err, DeviceError::CapabilityAssembly(_)));
    }

    #[test]
    fn test_assembly_ignores_a_capability_listed_twice() {
        let desc = DeviceDescriptor::assemble(&[&ON_OFF, &ON_OFF]).unwrap();
        assert_eq!(desc.traits(), &["OnOff"]);
        assert_eq!(desc.attributes().len(), 1);
    }

    #[test]
    fn test_descriptor_is_assembled_once_per_type() {
        let a = VirtualLamp::descriptor().unwrap();
        let b = VirtualLamp::descriptor().unwrap();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn test_identity_attributes() {
        let lamp = VirtualLamp::new("0x1234").unwrap();
        let status = lamp.base.status();

        assert_eq!(status.get_str("sid"), "0x1234");
        assert!(status.set("sid", "0x9999").is_err());

        status.set("name", "desk lamp").unwrap();
        status.set("name", "shelf lamp").unwrap();

        status.set("model", "virtual.lamp.v1").unwrap();
        assert!(status.set("model", "virtual.lamp.v2").is_err());
    }

    #[tokio::test]
    async fn test_execute_runs_the_named_command_once() {
        let lamp = VirtualLamp::new("0x1234").unwrap();
        lamp.execute("off", &[]).await.unwrap();
        assert_eq!(lamp.off_calls.load(Ordering::SeqCst), 1);
        assert_eq!(lamp.on_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_rejects_unknown_commands() {
        let lamp = VirtualLamp::new("0x1234").unwrap();
        let before = lamp.status().snapshot();

        let err = lamp.execute("frobnicate", &[]).await.unwrap_err();
        assert!(matches!(err, DeviceError::UnknownCommand(cmd) if cmd == "frobnicate"));
        assert_eq!(lamp.status().snapshot(), before);
    }

    #[tokio::test]
    async fn test_end_to_end_power_cycle() {
        let lamp = VirtualLamp::new("0x1234").unwrap();
        assert_eq!(lamp.query("power"), Value::from(""));

        lamp.execute("on", &[]).await.unwrap();
        assert_eq!(lamp.query("power"), Value::from("on"));
        assert_eq!(lamp.on_calls.load(Ordering::SeqCst), 1);

        lamp.execute("set_bright", &[Value::from(40)]).await.unwrap();
        assert_eq!(lamp.query("bright"), Value::from(40));

        let report = lamp.device_status();
        assert_eq!(
            report["traits"],
            Value::List(vec![Value::from("OnOff"), Value::from("Dimmer")])
        );
        let commands = report["commands"].as_list().unwrap();
        assert!(commands.contains(&Value::from("on")));
        assert!(commands.contains(&Value::from("off")));
        assert_eq!(report["sid"], Value::from("0x1234"));
    }
}
