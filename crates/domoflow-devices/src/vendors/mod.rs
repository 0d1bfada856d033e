/*!
 * Vendor integrations for DomoFlow.
 *
 * Each submodule binds one vendor ecosystem onto the device core: the
 * LAN hub family speaking JSON over UDP, the Zigbee bridge over MQTT,
 * Wi-Fi lamps over the TCP line protocol and DIY-mode switches over
 * HTTP.
 */
use domoflow_core::types::{Value, ValueMap};

// Export vendor integrations
pub mod lumi;
pub mod yeelight;

#[cfg(feature = "mqtt")]
pub mod zigbee2mqtt;

#[cfg(feature = "http")]
pub mod sonoff_diy;

// Re-export the entry points for convenience
pub use lumi::{LumiGateway, TokenSigner};
pub use yeelight::YeelightLamp;

#[cfg(feature = "mqtt")]
pub use zigbee2mqtt::Zigbee2MqttGateway;

#[cfg(feature = "http")]
pub use sonoff_diy::DiyPlug;

/// Read a wire field that may arrive as a number or a numeric string
pub(crate) fn wire_int(map: &ValueMap, key: &str) -> Option<i64> {
    match map.get(key) {
        Some(Value::Int(i)) => Some(*i),
        Some(Value::Str(s)) => s.parse().ok(),
        _ => None,
    }
}

/// Read a wire field as a string slice
pub(crate) fn wire_str<'a>(map: &'a ValueMap, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}
