use crate::env;
use crate::weather::{IpLocator, Location, RainForecast, WeatherError, WeatherGate};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

/// Location and thresholds for the Open-Meteo forecast gate
#[derive(Debug, Clone, PartialEq)]
pub struct OpenMeteoSettings {
    pub endpoint: String,
    /// Fixed location. When unset it is looked up by IP on first use.
    pub location: Option<Location>,
    pub geolocation_endpoint: String,
    pub timeout: Duration,
    /// Water only when today's forecast rain stays below this many millimetres
    pub rain_threshold_mm: f64,
}

/// Weather gate backed by the Open-Meteo hourly rain forecast
#[derive(Debug)]
pub struct OpenMeteoGate {
    client: reqwest::Client,
    settings: OpenMeteoSettings,
    locator: IpLocator,
    location: OnceCell<Location>,
}

#[derive(Debug, Deserialize)]
struct Forecast {
    hourly: Option<Hourly>,
}

#[derive(Debug, Deserialize)]
struct Hourly {
    #[serde(default)]
    rain: Vec<Option<f64>>,
}

impl Default for OpenMeteoSettings {
    fn default() -> Self {
        Self {
            endpoint: env::weather::DEFAULT_ENDPOINT.to_string(),
            location: None,
            geolocation_endpoint: env::weather::DEFAULT_GEOLOCATION_ENDPOINT.to_string(),
            timeout: Duration::from_secs(env::weather::DEFAULT_TIMEOUT_SECS),
            rain_threshold_mm: env::weather::DEFAULT_RAIN_THRESHOLD_MM,
        }
    }
}

impl OpenMeteoSettings {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            location: Some(Location { latitude, longitude }),
            ..Self::default()
        }
    }
}

impl OpenMeteoGate {
    pub fn new(settings: OpenMeteoSettings) -> Result<Self, WeatherError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| WeatherError::Request(e.to_string()))?;
        let locator = IpLocator::new(client.clone(), settings.geolocation_endpoint.clone());
        Ok(Self {
            client,
            location: OnceCell::new_with(settings.location),
            locator,
            settings,
        })
    }

    pub fn settings(&self) -> &OpenMeteoSettings {
        &self.settings
    }

    /// Configured location, or the IP lookup's answer once it has succeeded
    pub async fn location(&self) -> Result<Location, WeatherError> {
        let location = self
            .location
            .get_or_try_init(|| async {
                let found = self.locator.locate().await?;
                info!(
                    latitude = found.latitude,
                    longitude = found.longitude,
                    "Location resolved by IP"
                );
                Ok::<_, WeatherError>(found)
            })
            .await?;
        Ok(*location)
    }

    fn forecast_url(&self, location: Location) -> Result<Url, WeatherError> {
        let mut url = Url::parse(&self.settings.endpoint)
            .and_then(|base| base.join("/v1/forecast"))
            .map_err(|e| WeatherError::InvalidEndpoint(format!("{}: {}", self.settings.endpoint, e)))?;
        url.query_pairs_mut()
            .append_pair("latitude", &location.latitude.to_string())
            .append_pair("longitude", &location.longitude.to_string())
            .append_pair("hourly", "rain")
            .append_pair("timezone", "auto")
            .append_pair("forecast_days", "1");
        Ok(url)
    }

    async fn rain_today(&self) -> Result<f64, WeatherError> {
        let url = self.forecast_url(self.location().await?)?;
        debug!(%url, "Requesting rain forecast");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| WeatherError::Request(e.to_string()))?;
        let forecast: Forecast = response
            .json()
            .await
            .map_err(|e| WeatherError::Response(e.to_string()))?;

        total_rain(&forecast)
    }
}

fn total_rain(forecast: &Forecast) -> Result<f64, WeatherError> {
    let hourly = forecast
        .hourly
        .as_ref()
        .ok_or_else(|| WeatherError::Response("missing hourly forecast".to_string()))?;
    Ok(hourly.rain.iter().flatten().sum())
}

impl WeatherGate for OpenMeteoGate {
    fn forecast(&self) -> BoxFuture<'_, Result<RainForecast, WeatherError>> {
        Box::pin(async move {
            let rain_mm = self.rain_today().await?;
            Ok(RainForecast {
                rain_mm,
                threshold_mm: self.settings.rain_threshold_mm,
            })
        })
    }

    fn name(&self) -> &'static str {
        "open-meteo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Serve one canned JSON response on a local port. The handle yields the
    /// request head that was received.
    async fn serve_once(body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (format!("http://{}", addr), served)
    }

    fn gate(endpoint: String) -> OpenMeteoGate {
        OpenMeteoGate::new(OpenMeteoSettings {
            endpoint,
            timeout: Duration::from_secs(2),
            ..OpenMeteoSettings::new(52.2, 21.0)
        })
        .unwrap()
    }

    fn unlocated_gate(endpoint: String, geolocation_endpoint: String) -> OpenMeteoGate {
        OpenMeteoGate::new(OpenMeteoSettings {
            endpoint,
            geolocation_endpoint,
            timeout: Duration::from_secs(2),
            ..OpenMeteoSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn test_forecast_url_carries_location() {
        let location = Location {
            latitude: 52.2,
            longitude: 21.0,
        };
        let url = gate("https://api.open-meteo.com".into())
            .forecast_url(location)
            .unwrap();
        assert_eq!(url.path(), "/v1/forecast");
        let query = url.query().unwrap();
        assert!(query.contains("latitude=52.2"));
        assert!(query.contains("longitude=21"));
        assert!(query.contains("hourly=rain"));
        assert!(query.contains("forecast_days=1"));
    }

    #[tokio::test]
    async fn test_light_rain_means_water() {
        let (endpoint, _) = serve_once(r#"{"hourly":{"time":["t0","t1"],"rain":[0.5,1.5,null]}}"#).await;
        let forecast = gate(endpoint).forecast().await.unwrap();
        assert_eq!(forecast.rain_mm, 2.0);
        assert!(forecast.should_water());
    }

    #[tokio::test]
    async fn test_heavy_rain_means_skip() {
        let (endpoint, _) = serve_once(r#"{"hourly":{"rain":[4.0,4.0,4.0]}}"#).await;
        assert!(!gate(endpoint).forecast().await.unwrap().should_water());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = gate(format!("http://{}", addr)).forecast().await;
        assert!(matches!(result, Err(WeatherError::Request(_))));
    }

    #[tokio::test]
    async fn test_missing_location_is_looked_up_by_ip() {
        let (geolocation, _) = serve_once(r#"{"status":"success","lat":50.06,"lon":19.94}"#).await;
        let (endpoint, forecast_request) = serve_once(r#"{"hourly":{"rain":[0.0]}}"#).await;
        let gate = unlocated_gate(endpoint, geolocation);

        assert!(gate.forecast().await.unwrap().should_water());
        let request = forecast_request.await.unwrap();
        assert!(request.contains("latitude=50.06"));
        assert!(request.contains("longitude=19.94"));

        // The lookup server is gone; the resolved location is kept
        assert_eq!(
            gate.location().await.unwrap(),
            Location {
                latitude: 50.06,
                longitude: 19.94
            }
        );
    }

    #[tokio::test]
    async fn test_failed_ip_lookup_is_an_error() {
        let (geolocation, _) = serve_once(r#"{"status":"fail","message":"reserved range"}"#).await;
        let gate = unlocated_gate("http://127.0.0.1:9".into(), geolocation);

        assert!(matches!(
            gate.forecast().await,
            Err(WeatherError::Response(_))
        ));
    }
}
