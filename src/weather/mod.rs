//! Weather gate consulted before scheduled watering.
//!
//! The gate is advisory. When it cannot answer, the rig waters anyway. Every
//! forecast it does return is kept as a [`WeatherPrediction`].

pub mod locate;
pub mod open_meteo;

pub use locate::*;
pub use open_meteo::*;

use crate::repository::Repository;
use chrono::NaiveDateTime;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, thiserror::Error)]
pub enum WeatherError {
    #[error("Invalid weather endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Weather request failed: {0}")]
    Request(String),
    #[error("Unexpected weather response: {0}")]
    Response(String),
}

/// Today's forecast rain against the gate's threshold
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RainForecast {
    pub rain_mm: f64,
    pub threshold_mm: f64,
}

impl RainForecast {
    pub fn should_water(&self) -> bool {
        self.rain_mm < self.threshold_mm
    }
}

pub type PredictionId = u32;

/// A forecast the gate returned, as kept in the repository
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeatherPrediction {
    pub id: PredictionId,
    pub recorded_at: NaiveDateTime,
    pub rain_mm: f64,
    pub threshold_mm: f64,
    pub should_water: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewWeatherPrediction {
    pub recorded_at: NaiveDateTime,
    pub forecast: RainForecast,
}

/// Source of the "should we water today" forecast
pub trait WeatherGate: Send + Sync {
    fn forecast(&self) -> BoxFuture<'_, Result<RainForecast, WeatherError>>;

    fn name(&self) -> &'static str;
}

/// Ask `gate`, watering when there is no gate or it fails. A forecast that
/// could not be recorded in `history` still decides.
pub async fn should_water(
    gate: Option<&dyn WeatherGate>,
    history: &dyn Repository,
    now: NaiveDateTime,
) -> bool {
    let Some(gate) = gate else {
        debug!("No weather gate configured, watering");
        return true;
    };

    let forecast = match gate.forecast().await {
        Ok(forecast) => forecast,
        Err(e) => {
            warn!(gate = gate.name(), "Weather gate unavailable, watering anyway: {}", e);
            return true;
        }
    };

    let water = forecast.should_water();
    debug!(
        gate = gate.name(),
        rain_mm = forecast.rain_mm,
        threshold_mm = forecast.threshold_mm,
        water,
        "Weather gate answered"
    );

    let prediction = NewWeatherPrediction {
        recorded_at: now,
        forecast,
    };
    if let Err(e) = history.add_weather_prediction(&prediction).await {
        warn!(gate = gate.name(), "Could not record weather prediction: {}", e);
    }
    water
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::FileRepository;
    use chrono::NaiveDate;

    struct Fixed(Result<RainForecast, WeatherError>);

    impl WeatherGate for Fixed {
        fn forecast(&self) -> BoxFuture<'_, Result<RainForecast, WeatherError>> {
            let answer = self.0.clone();
            Box::pin(async move { answer })
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn rain(rain_mm: f64) -> Fixed {
        Fixed(Ok(RainForecast {
            rain_mm,
            threshold_mm: 10.0,
        }))
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_gate_failures_are_fail_open() {
        let history = FileRepository::in_memory();
        assert!(should_water(None, &history, noon()).await);
        assert!(should_water(Some(&rain(2.0)), &history, noon()).await);
        assert!(!should_water(Some(&rain(10.0)), &history, noon()).await);

        let offline = Fixed(Err(WeatherError::Request("offline".into())));
        assert!(should_water(Some(&offline), &history, noon()).await);
    }

    #[tokio::test]
    async fn test_answered_forecasts_are_recorded() {
        let history = FileRepository::in_memory();
        should_water(Some(&rain(12.5)), &history, noon()).await;
        should_water(Some(&Fixed(Err(WeatherError::Request("offline".into())))), &history, noon()).await;
        should_water(None, &history, noon()).await;

        let predictions = history.get_weather_predictions().await.unwrap();
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].recorded_at, noon());
        assert_eq!(predictions[0].rain_mm, 12.5);
        assert!(!predictions[0].should_water);
    }
}
