/*!
 * Capability declarations and their interface traits.
 *
 * Each capability is a constant [`Capability`] table (commands plus
 * attribute templates) paired with a trait a device type implements to
 * satisfy the contract. The traits ship a provided `dispatch` method so a
 * device's [`crate::device::Device::invoke`] can chain its capabilities
 * without hand-written command routing:
 *
 * ```ignore
 * async fn invoke(&self, cmd: &str, args: &[Value]) -> Result<()> {
 *     if let Some(res) = OnOff::dispatch(self, cmd, args).await {
 *         return res;
 *     }
 *     if let Some(res) = Dimmer::dispatch(self, cmd, args).await {
 *         return res;
 *     }
 *     Err(DeviceError::UnknownCommand(cmd.to_string()))
 * }
 * ```
 */
use async_trait::async_trait;

use domoflow_core::types::{AttrKind, Value};

use crate::device::{Capability, Device, DeviceError, Result};
use crate::status::Attribute;

/// Extract a required integer argument from a command's positional args.
pub fn int_arg(args: &[Value], index: usize, what: &str) -> Result<i64> {
    args.get(index).and_then(Value::as_int).ok_or_else(|| {
        DeviceError::invalid_argument(format!("expected integer '{what}' at position {index}"))
    })
}

/// Extract a required string argument from a command's positional args.
pub fn str_arg(args: &[Value], index: usize, what: &str) -> Result<String> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s.clone()),
        _ => Err(DeviceError::invalid_argument(format!(
            "expected string '{what}' at position {index}"
        ))),
    }
}

fn on_off_attributes() -> Vec<Attribute> {
    vec![Attribute::new("power", AttrKind::Str)]
}

fn dimmer_attributes() -> Vec<Attribute> {
    vec![Attribute::new("bright", AttrKind::Int)]
}

fn color_temperature_attributes() -> Vec<Attribute> {
    vec![Attribute::new("ct_pc", AttrKind::Int)]
}

fn scene_attributes() -> Vec<Attribute> {
    vec![Attribute::new("scene", AttrKind::Str)]
}

fn no_attributes() -> Vec<Attribute> {
    Vec::new()
}

fn multi_switch_attributes() -> Vec<Attribute> {
    vec![Attribute::new("switches", AttrKind::List)]
}

fn contact_attributes() -> Vec<Attribute> {
    vec![Attribute::new("contact", AttrKind::Bool)]
}

fn climate_attributes() -> Vec<Attribute> {
    vec![
        Attribute::new("temperature", AttrKind::Float),
        Attribute::new("humidity", AttrKind::Float),
    ]
}

/// Power switching over a `power` attribute.
pub const ON_OFF: Capability = Capability {
    name: "OnOff",
    commands: &["on", "off"],
    attributes: on_off_attributes,
};

/// Brightness control over a `bright` attribute.
pub const DIMMER: Capability = Capability {
    name: "Dimmer",
    commands: &["set_bright"],
    attributes: dimmer_attributes,
};

/// Color temperature control, expressed as a percentage of the device's
/// supported range in a `ct_pc` attribute.
pub const COLOR_TEMPERATURE: Capability = Capability {
    name: "ColorTemperature",
    commands: &["set_ct_pc"],
    attributes: color_temperature_attributes,
};

/// Named light scenes over a `scene` attribute.
pub const SCENE: Capability = Capability {
    name: "Scene",
    commands: &["set_scene"],
    attributes: scene_attributes,
};

/// Power state flip without knowing the current state.
pub const TOGGLE: Capability = Capability {
    name: "Toggle",
    commands: &["toggle"],
    attributes: no_attributes,
};

/// Several independently switched channels on one device; the channel
/// names live in a `switches` list attribute.
pub const MULTI_SWITCH: Capability = Capability {
    name: "MultiSwitch",
    commands: &["on", "off"],
    attributes: multi_switch_attributes,
};

/// Open/close state pushed by a contact sensor; contributes no commands.
pub const CONTACT: Capability = Capability {
    name: "Contact",
    commands: &[],
    attributes: contact_attributes,
};

/// Temperature and humidity readings pushed by a climate sensor;
/// contributes no commands.
pub const CLIMATE: Capability = Capability {
    name: "Climate",
    commands: &[],
    attributes: climate_attributes,
};

/// Interface contract for [`ON_OFF`].
#[async_trait]
pub trait OnOff: Device {
    /// Power the device on.
    async fn on(&self) -> Result<()>;

    /// Power the device off.
    async fn off(&self) -> Result<()>;

    /// Whether the device currently reports `power == "on"`.
    fn is_on(&self) -> bool {
        self.status().get_str("power") == "on"
    }

    /// Whether the device currently reports `power == "off"`.
    fn is_off(&self) -> bool {
        self.status().get_str("power") == "off"
    }

    /// Route `cmd` to this capability's methods if it owns the name.
    async fn dispatch(&self, cmd: &str, _args: &[Value]) -> Option<Result<()>> {
        let res = match cmd {
            "on" => self.on().await,
            "off" => self.off().await,
            _ => return None,
        };
        Some(res)
    }
}

/// Interface contract for [`DIMMER`].
#[async_trait]
pub trait Dimmer: Device {
    /// Set the brightness level.
    async fn set_bright(&self, value: i64) -> Result<()>;

    /// Route `cmd` to this capability's methods if it owns the name.
    async fn dispatch(&self, cmd: &str, args: &[Value]) -> Option<Result<()>> {
        let res = match cmd {
            "set_bright" => match int_arg(args, 0, "brightness") {
                Ok(value) => self.set_bright(value).await,
                Err(e) => Err(e),
            },
            _ => return None,
        };
        Some(res)
    }
}

/// Interface contract for [`COLOR_TEMPERATURE`].
#[async_trait]
pub trait ColorTemperature: Device {
    /// Set the color temperature as a percentage of the supported range.
    async fn set_ct_pc(&self, percent: i64) -> Result<()>;

    /// Route `cmd` to this capability's methods if it owns the name.
    async fn dispatch(&self, cmd: &str, args: &[Value]) -> Option<Result<()>> {
        let res = match cmd {
            "set_ct_pc" => match int_arg(args, 0, "percent") {
                Ok(percent) => self.set_ct_pc(percent).await,
                Err(e) => Err(e),
            },
            _ => return None,
        };
        Some(res)
    }
}

/// Interface contract for [`SCENE`].
#[async_trait]
pub trait Scene: Device {
    /// Activate a named scene; `args` carry scene-specific parameters.
    async fn set_scene(&self, scene: &str, args: &[Value]) -> Result<()>;

    /// Route `cmd` to this capability's methods if it owns the name.
    async fn dispatch(&self, cmd: &str, args: &[Value]) -> Option<Result<()>> {
        let res = match cmd {
            "set_scene" => match str_arg(args, 0, "scene") {
                Ok(scene) => self.set_scene(&scene, &args[1..]).await,
                Err(e) => Err(e),
            },
            _ => return None,
        };
        Some(res)
    }
}

/// Interface contract for [`TOGGLE`].
#[async_trait]
pub trait Toggle: Device {
    /// Flip the power state.
    async fn toggle(&self) -> Result<()>;

    /// Route `cmd` to this capability's methods if it owns the name.
    async fn dispatch(&self, cmd: &str, _args: &[Value]) -> Option<Result<()>> {
        let res = match cmd {
            "toggle" => self.toggle().await,
            _ => return None,
        };
        Some(res)
    }
}

/// Interface contract for [`MULTI_SWITCH`].
#[async_trait]
pub trait MultiSwitch: Device {
    /// Power one channel on.
    async fn on(&self, switch: &str) -> Result<()>;

    /// Power one channel off.
    async fn off(&self, switch: &str) -> Result<()>;

    /// Whether the channel currently reports `"on"`.
    fn is_on(&self, switch: &str) -> bool {
        self.status().get_str(switch) == "on"
    }

    /// Whether the channel currently reports `"off"`.
    fn is_off(&self, switch: &str) -> bool {
        self.status().get_str(switch) == "off"
    }

    /// Route `cmd` to this capability's methods if it owns the name.
    async fn dispatch(&self, cmd: &str, args: &[Value]) -> Option<Result<()>> {
        let res = match cmd {
            "on" => match str_arg(args, 0, "switch") {
                Ok(switch) => self.on(&switch).await,
                Err(e) => Err(e),
            },
            "off" => match str_arg(args, 0, "switch") {
                Ok(switch) => self.off(&switch).await,
                Err(e) => Err(e),
            },
            _ => return None,
        };
        Some(res)
    }
}

/// Interface contract for [`CONTACT`]; push-only, so no commands and no
/// dispatch.
pub trait Contact: Device {
    /// Whether the sensor reports the contact closed.
    fn is_closed(&self) -> bool {
        self.status().get_bool("contact")
    }

    /// Whether the sensor reports the contact open.
    fn is_open(&self) -> bool {
        !self.is_closed()
    }
}

/// Interface contract for [`CLIMATE`]; push-only, so no commands and no
/// dispatch.
pub trait Climate: Device {
    /// Last reported temperature, in degrees Celsius.
    fn temperature(&self) -> f64 {
        self.status().get_float("temperature")
    }

    /// Last reported relative humidity, in percent.
    fn humidity(&self) -> f64 {
        self.status().get_float("humidity")
    }
}
