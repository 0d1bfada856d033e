/*!
 * Attributes and the per-device status registry.
 *
 * Every device owns a [`DeviceStatus`] registry holding its [`Attribute`]s.
 * Attributes enforce a write policy (mutable, one-shot or constant) and the
 * registry resolves vendor aliases so callers never need to know which
 * spelling a vendor uses for a field.
 */
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use indexmap::IndexMap;
use tracing::trace;

use domoflow_core::types::{AttrKind, Value, ValueMap};

use crate::device::{DeviceError, Result};

/// A single named device attribute with a typed value and a write policy.
///
/// The policy is fixed at construction time:
/// - [`Attribute::new`] builds a mutable attribute that accepts any number
///   of writes.
/// - [`Attribute::oneshot`] builds a read-only attribute that accepts writes
///   only while its value is still the zero value of its kind; the first
///   non-zero write locks it.
/// - [`Attribute::readonly`] builds a constant attribute that rejects every
///   write (its value is supplied with [`Attribute::with_value`]).
#[derive(Debug, Clone)]
pub struct Attribute {
    name: String,
    kind: AttrKind,
    readonly: bool,
    oneshot: bool,
    value: Value,
}

impl Attribute {
    /// Create a mutable attribute initialized to the zero value of `kind`.
    pub fn new<S: Into<String>>(name: S, kind: AttrKind) -> Self {
        Self {
            name: name.into(),
            kind,
            readonly: false,
            oneshot: false,
            value: kind.zero(),
        }
    }

    /// Create a constant attribute; every call to [`Attribute::set`] fails.
    pub fn readonly<S: Into<String>>(name: S, kind: AttrKind) -> Self {
        Self {
            name: name.into(),
            kind,
            readonly: true,
            oneshot: false,
            value: kind.zero(),
        }
    }

    /// Create a write-once attribute; it accepts writes until its value is
    /// no longer the zero value of its kind.
    pub fn oneshot<S: Into<String>>(name: S, kind: AttrKind) -> Self {
        Self {
            name: name.into(),
            kind,
            readonly: true,
            oneshot: true,
            value: kind.zero(),
        }
    }

    /// Set the initial value, bypassing the write policy.
    pub fn with_value<V: Into<Value>>(mut self, value: V) -> Self {
        self.value = value.into();
        self
    }

    /// Get the attribute name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the declared value kind.
    pub fn kind(&self) -> AttrKind {
        self.kind
    }

    /// Whether the attribute rejects writes once set.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Whether the attribute is a write-once attribute.
    pub fn is_oneshot(&self) -> bool {
        self.oneshot
    }

    /// Get the current value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Write a new value, enforcing the write policy.
    ///
    /// Mutable attributes always accept the write. One-shot attributes
    /// accept it only while the current value is still the zero value of
    /// their kind. Constant attributes never accept it.
    pub fn set<V: Into<Value>>(&mut self, value: V) -> Result<()> {
        if self.readonly && !(self.oneshot && self.value.is_empty()) {
            return Err(DeviceError::ReadOnly(self.name.clone()));
        }
        self.value = value.into();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StatusInner {
    /// Canonical names and aliases, in registration order, each pointing at
    /// a slot in `attrs`. An alias and its target share a slot id.
    names: IndexMap<String, u32>,
    attrs: HashMap<u32, Attribute>,
    next_id: u32,
}

/// The attribute registry owned by every device.
///
/// Lookups accept canonical names and aliases interchangeably; an alias is
/// another name for the same attribute slot, so a write through one name is
/// visible through all of them. All methods take `&self` and serialize
/// access internally, so a device command task and a watcher task may use
/// the registry concurrently.
#[derive(Debug, Default)]
pub struct DeviceStatus {
    inner: RwLock<StatusInner>,
}

impl DeviceStatus {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attribute under its own name.
    ///
    /// Fails if the name is already taken by an attribute or an alias.
    pub fn register(&self, attr: Attribute) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.names.contains_key(attr.name()) {
            return Err(DeviceError::AlreadyRegistered(attr.name().to_string()));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.names.insert(attr.name().to_string(), id);
        inner.attrs.insert(id, attr);
        Ok(())
    }

    /// Remove an attribute along with every name and alias that refers to
    /// it. Returns whether anything was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = match inner.names.get(name) {
            Some(id) => *id,
            None => return false,
        };
        inner.names.retain(|_, slot| *slot != id);
        inner.attrs.remove(&id);
        true
    }

    /// Register `alias` as another name for the existing attribute `name`.
    ///
    /// Fails if `name` is unknown or `alias` is already taken.
    pub fn add_alias(&self, alias: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.names.contains_key(alias) {
            return Err(DeviceError::AlreadyRegistered(alias.to_string()));
        }
        let id = match inner.names.get(name) {
            Some(id) => *id,
            None => {
                return Err(DeviceError::Alias(format!(
                    "cannot alias '{alias}' to unknown attribute '{name}'"
                )))
            }
        };
        inner.names.insert(alias.to_string(), id);
        Ok(())
    }

    /// Whether `name` resolves to an attribute (directly or via an alias).
    pub fn has(&self, name: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.names.contains_key(name)
    }

    /// Get the current value of an attribute.
    ///
    /// Unknown names yield [`Value::Null`]; this never fails.
    pub fn get(&self, name: &str) -> Value {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .names
            .get(name)
            .and_then(|id| inner.attrs.get(id))
            .map(|attr| attr.value().clone())
            .unwrap_or(Value::Null)
    }

    /// Get an attribute value as a string, defaulting to `""`.
    pub fn get_str(&self, name: &str) -> String {
        match self.get(name) {
            Value::Str(s) => s,
            _ => String::new(),
        }
    }

    /// Get an attribute value as an integer, defaulting to `0`.
    pub fn get_int(&self, name: &str) -> i64 {
        self.get(name).as_int().unwrap_or_default()
    }

    /// Get an attribute value as a float, defaulting to `0.0`.
    pub fn get_float(&self, name: &str) -> f64 {
        self.get(name).as_float().unwrap_or_default()
    }

    /// Get an attribute value as a boolean, defaulting to `false`.
    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name).as_bool().unwrap_or_default()
    }

    /// Write an attribute value, enforcing the attribute's write policy.
    ///
    /// Unknown names are a no-op; a policy violation on a known name is an
    /// error the caller must handle.
    pub fn set<V: Into<Value>>(&self, name: &str, value: V) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = match inner.names.get(name) {
            Some(id) => *id,
            None => return Ok(()),
        };
        match inner.attrs.get_mut(&id) {
            Some(attr) => attr.set(value),
            None => Ok(()),
        }
    }

    /// Apply a bulk update from a vendor report.
    ///
    /// Unknown keys and write-policy violations are skipped; this never
    /// fails, so a report carrying extra or locked fields cannot poison the
    /// delivery path.
    pub fn update(&self, data: &ValueMap) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for (name, value) in data {
            let id = match inner.names.get(name) {
                Some(id) => *id,
                None => continue,
            };
            if let Some(attr) = inner.attrs.get_mut(&id) {
                if let Err(e) = attr.set(value.clone()) {
                    trace!(attribute = %name, "skipping update: {}", e);
                }
            }
        }
    }

    /// All registered names, aliases included, in registration order.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.names.keys().cloned().collect()
    }

    /// A point-in-time copy of every name (aliases included) and its value,
    /// in registration order.
    pub fn snapshot(&self) -> IndexMap<String, Value> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .names
            .iter()
            .filter_map(|(name, id)| {
                inner
                    .attrs
                    .get(id)
                    .map(|attr| (name.clone(), attr.value().clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutable_attribute_accepts_every_write() {
        let mut attr = Attribute::new("bright", AttrKind::Int);
        assert_eq!(*attr.value(), Value::Int(0));
        attr.set(10).unwrap();
        attr.set(55).unwrap();
        assert_eq!(*attr.value(), Value::Int(55));
    }

    #[test]
    fn test_readonly_attribute_rejects_every_write() {
        let mut attr = Attribute::readonly("sid", AttrKind::Str).with_value("0x1234");
        let err = attr.set("0x9999").unwrap_err();
        assert!(matches!(err, DeviceError::ReadOnly(name) if name == "sid"));
        assert_eq!(attr.value().as_str(), Some("0x1234"));
    }

    #[test]
    fn test_oneshot_attribute_accepts_exactly_one_write() {
        let mut attr = Attribute::oneshot("model", AttrKind::Str);
        attr.set("lumi.plug").unwrap();
        assert_eq!(attr.value().as_str(), Some("lumi.plug"));
        let err = attr.set("other.model").unwrap_err();
        assert!(matches!(err, DeviceError::ReadOnly(_)));
        assert_eq!(attr.value().as_str(), Some("lumi.plug"));
    }

    #[test]
    fn test_oneshot_stays_open_while_value_is_zero() {
        let mut attr = Attribute::oneshot("short_id", AttrKind::Int);
        attr.set(0).unwrap();
        attr.set(4344).unwrap();
        assert!(attr.set(1).is_err());
    }

    #[test]
    fn test_register_rejects_duplicate_names() {
        let status = DeviceStatus::new();
        status.register(Attribute::new("power", AttrKind::Str)).unwrap();
        let err = status
            .register(Attribute::new("power", AttrKind::Str))
            .unwrap_err();
        assert!(matches!(err, DeviceError::AlreadyRegistered(name) if name == "power"));
    }

    #[test]
    fn test_alias_round_trip() {
        let status = DeviceStatus::new();
        status.register(Attribute::new("power", AttrKind::Str)).unwrap();
        status.add_alias("switch", "power").unwrap();

        status.set("switch", "on").unwrap();
        assert_eq!(status.get_str("power"), "on");

        status.set("power", "off").unwrap();
        assert_eq!(status.get_str("switch"), "off");
    }

    #[test]
    fn test_alias_to_unknown_attribute_fails() {
        let status = DeviceStatus::new();
        let err = status.add_alias("switch", "power").unwrap_err();
        assert!(matches!(err, DeviceError::Alias(_)));
    }

    #[test]
    fn test_alias_name_collision_fails() {
        let status = DeviceStatus::new();
        status.register(Attribute::new("power", AttrKind::Str)).unwrap();
        status.register(Attribute::new("switch", AttrKind::Str)).unwrap();
        let err = status.add_alias("switch", "power").unwrap_err();
        assert!(matches!(err, DeviceError::AlreadyRegistered(_)));
    }

    #[test]
    fn test_set_on_unknown_name_is_a_noop() {
        let status = DeviceStatus::new();
        assert!(status.set("nope", 1).is_ok());
        assert_eq!(status.get("nope"), Value::Null);
    }

    #[test]
    fn test_direct_set_on_readonly_attribute_fails() {
        let status = DeviceStatus::new();
        status
            .register(Attribute::readonly("sid", AttrKind::Str).with_value("0x1234"))
            .unwrap();
        assert!(status.set("sid", "0x9999").is_err());
        assert_eq!(status.get_str("sid"), "0x1234");
    }

    #[test]
    fn test_update_swallows_unknown_and_readonly_keys() {
        let status = DeviceStatus::new();
        status
            .register(Attribute::readonly("sid", AttrKind::Str).with_value("0x1234"))
            .unwrap();
        status.register(Attribute::new("power", AttrKind::Str)).unwrap();

        let mut data = ValueMap::new();
        data.insert("unknown_key".to_string(), Value::from(1));
        data.insert("sid".to_string(), Value::from("ignored"));
        data.insert("power".to_string(), Value::from("on"));
        status.update(&data);

        assert_eq!(status.get_str("sid"), "0x1234");
        assert_eq!(status.get_str("power"), "on");
    }

    #[test]
    fn test_update_applies_through_aliases() {
        let status = DeviceStatus::new();
        status.register(Attribute::new("power", AttrKind::Str)).unwrap();
        status.add_alias("switch", "power").unwrap();

        let mut data = ValueMap::new();
        data.insert("switch".to_string(), Value::from("on"));
        status.update(&data);
        assert_eq!(status.get_str("power"), "on");
    }

    #[test]
    fn test_unregister_removes_aliases_too() {
        let status = DeviceStatus::new();
        status.register(Attribute::new("power", AttrKind::Str)).unwrap();
        status.add_alias("switch", "power").unwrap();

        assert!(status.unregister("power"));
        assert!(!status.has("power"));
        assert!(!status.has("switch"));
        assert!(!status.unregister("power"));
    }

    #[test]
    fn test_snapshot_lists_aliases_in_registration_order() {
        let status = DeviceStatus::new();
        status.register(Attribute::new("power", AttrKind::Str)).unwrap();
        status.register(Attribute::new("bright", AttrKind::Int)).unwrap();
        status.add_alias("switch", "power").unwrap();
        status.set("power", "on").unwrap();

        let snap = status.snapshot();
        let names: Vec<&str> = snap.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["power", "bright", "switch"]);
        assert_eq!(snap["switch"], Value::from("on"));
    }

    #[test]
    fn test_snapshot_diff_is_confined_to_the_changed_key() {
        let status = DeviceStatus::new();
        status.register(Attribute::new("power", AttrKind::Str)).unwrap();
        status.register(Attribute::new("bright", AttrKind::Int)).unwrap();

        let before = status.snapshot();
        status.set("bright", 40).unwrap();
        let after = status.snapshot();

        assert_ne!(before, after);
        assert_eq!(before["power"], after["power"]);
        assert_ne!(before["bright"], after["bright"]);
    }

    #[test]
    fn test_typed_getters_default_to_zero_values() {
        let status = DeviceStatus::new();
        assert_eq!(status.get_str("missing"), "");
        assert_eq!(status.get_int("missing"), 0);
        assert_eq!(status.get_float("missing"), 0.0);
        assert!(!status.get_bool("missing"));
    }
}
