//! Location lookup by public IP, used when no coordinates are configured.

use crate::weather::WeatherError;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

/// Where the rig stands, in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// ip-api.com style answer: `{"status": "success", "lat": .., "lon": ..}`
#[derive(Debug, Deserialize)]
struct IpLookup {
    status: Option<String>,
    message: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
}

/// Resolves the host's location from its public IP address
#[derive(Debug, Clone)]
pub struct IpLocator {
    client: reqwest::Client,
    endpoint: String,
}

impl IpLocator {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub async fn locate(&self) -> Result<Location, WeatherError> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| WeatherError::InvalidEndpoint(format!("{}: {}", self.endpoint, e)))?;
        debug!(%url, "Looking up location by IP");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| WeatherError::Request(e.to_string()))?;
        let lookup: IpLookup = response
            .json()
            .await
            .map_err(|e| WeatherError::Response(e.to_string()))?;

        location_of(lookup)
    }
}

fn location_of(lookup: IpLookup) -> Result<Location, WeatherError> {
    if let Some(status) = lookup.status.as_deref().filter(|s| *s != "success") {
        return Err(WeatherError::Response(format!(
            "location lookup {}: {}",
            status,
            lookup.message.as_deref().unwrap_or("no reason given")
        )));
    }
    match (lookup.lat, lookup.lon) {
        (Some(latitude), Some(longitude)) => Ok(Location { latitude, longitude }),
        _ => Err(WeatherError::Response("location lookup without coordinates".to_string())),
    }
}
