//! Current-conditions lookup attached to each history row.
//!
//! Weather is best-effort: any failure yields an all-empty snapshot and a
//! warning, never an error, so history is still written.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WeatherSnapshot {
    pub temperature: Option<f64>,
    pub humidity: Option<i64>,
    pub condition: Option<String>,
    pub wind_speed: Option<f64>,
    pub location: Option<String>,
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn current(&self) -> WeatherSnapshot;
}

/// Always empty.  Used when no API key is configured.
#[derive(Debug, Default)]
pub struct NoWeather;

#[async_trait]
impl WeatherProvider for NoWeather {
    async fn current(&self) -> WeatherSnapshot {
        WeatherSnapshot::default()
    }
}

// ---------------------------------------------------------------------------
// weatherapi.com
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CurrentResponse {
    location: ApiLocation,
    current: ApiCurrent,
}

#[derive(Debug, Deserialize)]
struct ApiLocation {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiCurrent {
    temp_c: f64,
    humidity: i64,
    wind_kph: f64,
    condition: ApiCondition,
}

#[derive(Debug, Deserialize)]
struct ApiCondition {
    text: String,
}

impl From<CurrentResponse> for WeatherSnapshot {
    fn from(r: CurrentResponse) -> Self {
        Self {
            temperature: Some(r.current.temp_c),
            humidity: Some(r.current.humidity),
            condition: Some(r.current.condition.text),
            wind_speed: Some(r.current.wind_kph),
            location: Some(r.location.name),
        }
    }
}

#[derive(Debug)]
pub struct WeatherApi {
    client: Client,
    base_url: String,
    api_key: String,
    location: String,
}

impl WeatherApi {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        location: impl Into<String>,
    ) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            location: location.into(),
        })
    }

    async fn fetch(&self) -> reqwest::Result<WeatherSnapshot> {
        let url = format!("{}/v1/current.json", self.base_url);
        let resp: CurrentResponse = self
            .client
            .get(&url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("q", self.location.as_str()),
                ("aqi", "no"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.into())
    }
}

#[async_trait]
impl WeatherProvider for WeatherApi {
    async fn current(&self) -> WeatherSnapshot {
        match self.fetch().await {
            Ok(w) => {
                debug!(location = ?w.location, temp = ?w.temperature, "weather fetched");
                w
            }
            Err(e) => {
                warn!("weather lookup failed: {e}");
                WeatherSnapshot::default()
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn body() -> serde_json::Value {
        serde_json::json!({
            "location": { "name": "Hanoi", "country": "Vietnam" },
            "current": {
                "temp_c": 31.2,
                "humidity": 74,
                "wind_kph": 11.9,
                "condition": { "text": "Partly cloudy", "code": 1003 }
            }
        })
    }

    #[tokio::test]
    async fn maps_current_conditions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/current.json"))
            .and(query_param("key", "secret"))
            .and(query_param("q", "auto:ip"))
            .and(query_param("aqi", "no"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body()))
            .expect(1)
            .mount(&server)
            .await;

        let api = WeatherApi::new(server.uri(), "secret", "auto:ip").unwrap();
        let w = api.current().await;

        assert_eq!(w.temperature, Some(31.2));
        assert_eq!(w.humidity, Some(74));
        assert_eq!(w.condition.as_deref(), Some("Partly cloudy"));
        assert_eq!(w.wind_speed, Some(11.9));
        assert_eq!(w.location.as_deref(), Some("Hanoi"));
    }

    #[tokio::test]
    async fn http_error_gives_empty_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/current.json"))
            .respond_with(ResponseTemplate::new(401).set_body_string("API key invalid"))
            .mount(&server)
            .await;

        let api = WeatherApi::new(server.uri(), "bad", "auto:ip").unwrap();
        assert_eq!(api.current().await, WeatherSnapshot::default());
    }

    #[tokio::test]
    async fn unexpected_body_gives_empty_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/current.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "error": "nope" })),
            )
            .mount(&server)
            .await;

        let api = WeatherApi::new(format!("{}/", server.uri()), "k", "Hanoi").unwrap();
        assert_eq!(api.current().await, WeatherSnapshot::default());
    }

    #[tokio::test]
    async fn no_weather_is_empty() {
        assert_eq!(NoWeather.current().await, WeatherSnapshot::default());
    }
}
