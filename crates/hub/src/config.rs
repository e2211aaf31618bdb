//! Hub configuration: TOML file, environment overrides, validation.
//!
//! Every field has a default, so a missing file is not an error.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::FixedOffset;
use irrigation_proto::MqttSettings;
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttSection,
    pub db_url: String,
    pub web: WebSection,
    pub scheduler: SchedulerSection,
    pub weather: WeatherSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Offset applied to every stored schedule time.  No DST.
    pub utc_offset_minutes: i32,
    pub resync_interval_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherSection {
    pub api_key: Option<String>,
    pub location: String,
    pub base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt: MqttSection::default(),
            db_url: "sqlite:irrigation.db?mode=rwc".to_string(),
            web: WebSection::default(),
            scheduler: SchedulerSection::default(),
            weather: WeatherSection::default(),
        }
    }
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "irrigation-hub".to_string(),
            username: None,
            password: None,
        }
    }
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 7 * 60,
            resync_interval_sec: 30,
        }
    }
}

impl Default for WeatherSection {
    fn default() -> Self {
        Self {
            api_key: None,
            location: "auto:ip".to_string(),
            base_url: "http://api.weatherapi.com".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived settings
// ---------------------------------------------------------------------------

impl Config {
    pub fn mqtt_settings(&self) -> MqttSettings {
        let mut s = MqttSettings::new(&self.mqtt.client_id, &self.mqtt.host, self.mqtt.port);
        s.username = self.mqtt.username.clone();
        s.password = self.mqtt.password.clone();
        s
    }

    /// Only meaningful after [`Config::validate`].
    pub fn scheduler_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.scheduler.utc_offset_minutes * 60)
    }

    /// `None` when no API key is set: history rows get no weather.
    pub fn weather_api_key(&self) -> Option<&str> {
        self.weather
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply `MQTT_HOST`-style overrides from any key lookup.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = get("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = get("MQTT_PORT") {
            self.mqtt.port = v
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {v}"))?;
        }
        if let Some(v) = get("MQTT_USERNAME") {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = get("MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = get("DB_URL") {
            self.db_url = v;
        }
        if let Some(v) = get("WEB_PORT") {
            self.web.port = v
                .parse()
                .with_context(|| format!("WEB_PORT is not a port number: {v}"))?;
        }
        if let Some(v) = get("WEATHER_API_KEY") {
            self.weather.api_key = Some(v);
        }
        if let Some(v) = get("SCHEDULER_UTC_OFFSET_MIN") {
            self.scheduler.utc_offset_minutes = v
                .parse()
                .with_context(|| format!("SCHEDULER_UTC_OFFSET_MIN is not an integer: {v}"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all settings. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if self.mqtt.port == 0 {
            errors.push("mqtt.port must be non-zero".to_string());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }
        if self.mqtt.username.is_some() != self.mqtt.password.is_some() {
            errors.push("mqtt.username and mqtt.password must be set together".to_string());
        }

        if !self.db_url.starts_with("sqlite:") {
            errors.push(format!(
                "db_url must be a sqlite: url, got '{}'",
                self.db_url
            ));
        }

        if self.web.port == 0 {
            errors.push("web.port must be non-zero".to_string());
        }

        // UTC-12:00 .. UTC+14:00 covers every zone in use.
        if !(-12 * 60..=14 * 60).contains(&self.scheduler.utc_offset_minutes) {
            errors.push(format!(
                "scheduler.utc_offset_minutes {} out of range [-720, 840]",
                self.scheduler.utc_offset_minutes
            ));
        }
        if self.scheduler.resync_interval_sec == 0 {
            errors.push("scheduler.resync_interval_sec must be positive".to_string());
        }

        if self.weather.location.trim().is_empty() {
            errors.push("weather.location is empty".to_string());
        }
        if !(self.weather.base_url.starts_with("http://")
            || self.weather.base_url.starts_with("https://"))
        {
            errors.push(format!(
                "weather.base_url must be an http(s) url, got '{}'",
                self.weather.base_url
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read `path` (defaults if it does not exist), apply environment
/// overrides from `get`, and validate.
pub fn load_with(path: &str, get: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "no config file, using defaults");
        Config::default()
    };

    config.apply_env(get)?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

pub fn load(path: &str) -> Result<Config> {
    load_with(path, |k| std::env::var(k).ok())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
db_url = "sqlite:/var/lib/irrigation/hub.db?mode=rwc"

[mqtt]
host = "broker.local"
port = 8883
client_id = "hub-1"
username = "hub"
password = "secret"

[web]
port = 9090

[scheduler]
utc_offset_minutes = 60
resync_interval_sec = 10

[weather]
api_key = "abc"
location = "Hanoi"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.web.port, 9090);
        assert_eq!(config.scheduler.utc_offset_minutes, 60);
        assert_eq!(config.weather.location, "Hanoi");
        assert_eq!(config.weather.base_url, "http://api.weatherapi.com");

        let mqtt = config.mqtt_settings();
        assert_eq!(mqtt.client_id, "hub-1");
        assert_eq!(mqtt.username.as_deref(), Some("hub"));
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.web.port, 8080);
        assert_eq!(config.scheduler.utc_offset_minutes, 420);
        assert_eq!(config.scheduler.resync_interval_sec, 30);
        assert_eq!(
            config.scheduler_offset(),
            FixedOffset::east_opt(7 * 3600)
        );
        assert_eq!(config.weather_api_key(), None);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = load_with("/nonexistent/hub.toml", lookup(&[])).unwrap();
        assert_eq!(config.db_url, "sqlite:irrigation.db?mode=rwc");
    }

    // -- Environment -------------------------------------------------------

    #[test]
    fn env_overrides_file() {
        let mut config = Config::default();
        config
            .apply_env(lookup(&[
                ("MQTT_HOST", "10.0.0.2"),
                ("MQTT_PORT", "1884"),
                ("DB_URL", "sqlite::memory:"),
                ("WEB_PORT", "3000"),
                ("WEATHER_API_KEY", " key "),
                ("SCHEDULER_UTC_OFFSET_MIN", "-300"),
            ]))
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.db_url, "sqlite::memory:");
        assert_eq!(config.web.port, 3000);
        assert_eq!(config.weather_api_key(), Some("key"));
        assert_eq!(config.scheduler_offset(), FixedOffset::west_opt(5 * 3600));
    }

    #[test]
    fn env_bad_number_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(lookup(&[("WEB_PORT", "eighty")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("WEB_PORT"));
    }

    // -- Validation --------------------------------------------------------

    #[test]
    fn offset_out_of_range() {
        let mut config = Config::default();
        config.scheduler.utc_offset_minutes = 15 * 60;
        assert_validation_err(&config, "utc_offset_minutes");
    }

    #[test]
    fn credentials_must_pair() {
        let mut config = Config::default();
        config.mqtt.username = Some("hub".into());
        assert_validation_err(&config, "username and mqtt.password");
    }

    #[test]
    fn non_sqlite_url_rejected() {
        let mut config = Config::default();
        config.db_url = "postgres://localhost/irrigation".into();
        assert_validation_err(&config, "db_url");
    }

    #[test]
    fn reports_every_violation() {
        let mut config = Config::default();
        config.mqtt.host = " ".into();
        config.web.port = 0;
        config.scheduler.resync_interval_sec = 0;
        assert_validation_err(&config, "3 errors");
    }
}
