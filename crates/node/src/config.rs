//! Environment configuration for the field device / simulator.

use irrigation_proto::MqttSettings;

use crate::sim::Scenario;

#[derive(Debug, Clone)]
pub(crate) struct NodeConfig {
    pub(crate) mqtt: MqttSettings,
    pub(crate) scenario: Scenario,
    pub(crate) relay_gpio_pin: u8,
    pub(crate) relay_active_low: bool,
}

impl NodeConfig {
    pub(crate) fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup so tests need not touch the process env.
    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let host = get("MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port: u16 = get("MQTT_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1883);

        // Random suffix so a simulator and a real device can share a broker.
        let node_id = get("NODE_ID").unwrap_or_else(|| format!("{:06x}", fastrand::u32(..0x100_0000)));

        let mut mqtt = MqttSettings::new(format!("ESP32_SIM_{node_id}"), host, port);
        mqtt.username = get("MQTT_USERNAME");
        mqtt.password = get("MQTT_PASSWORD");

        let scenario = get("SIM_SCENARIO")
            .map(|s| Scenario::from_str_lossy(&s))
            .unwrap_or(Scenario::Normal);

        let relay_gpio_pin = get("RELAY_GPIO_PIN")
            .and_then(|s| s.parse().ok())
            .unwrap_or(17);

        // Many common relay boards are active-low. If yours is active-high, set false.
        let relay_active_low = get("RELAY_ACTIVE_LOW")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        Self {
            mqtt,
            scenario,
            relay_gpio_pin,
            relay_active_low,
        }
    }
}
