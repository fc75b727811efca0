//! Weather push.
//!
//! A provider produces the current conditions for the phone's location, and
//! the pusher sends them to the watch as a `"type":"weather"` JSON packet on a
//! fixed interval.

use crate::domain::commands::OutboundSink;
use crate::domain::device::DeviceProfile;
use crate::domain::location::{Location, LocationError, LocationRequests};
use crate::domain::models::unix_millis;
use crate::domain::settings::WeatherSettings;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("no location fix: {0}")]
    Location(#[from] LocationError),
    #[error("weather unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode weather packet: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "weather", rename_all = "camelCase")]
pub struct WeatherPayload {
    pub latitude: f64,
    pub longitude: f64,
    pub city: Option<String>,
    pub region: Option<String>,
    pub temperature_c: f64,
    pub condition: String,
    pub symbol: String,
    /// Unix milliseconds
    pub timestamp: u64,
}

impl WeatherPayload {
    pub fn to_json(&self) -> Result<String, WeatherError> {
        Ok(serde_json::to_string(self)?)
    }
}

pub trait WeatherProvider: Send + Sync {
    fn current(&self) -> impl Future<Output = Result<WeatherPayload, WeatherError>> + Send;
}

/// Reports the conditions from the settings file at the current location.
pub struct ConfiguredWeatherProvider {
    settings: WeatherSettings,
    locations: Arc<LocationRequests>,
}

impl ConfiguredWeatherProvider {
    pub fn new(settings: WeatherSettings, locations: Arc<LocationRequests>) -> Self {
        Self {
            settings,
            locations,
        }
    }
}

impl WeatherProvider for ConfiguredWeatherProvider {
    async fn current(&self) -> Result<WeatherPayload, WeatherError> {
        let location = self.locations.request().await?;
        Ok(WeatherPayload {
            latitude: location.latitude,
            longitude: location.longitude,
            city: self.settings.city.clone(),
            region: self.settings.region.clone(),
            temperature_c: self.settings.temperature_c,
            condition: self.settings.condition.clone(),
            symbol: self.settings.symbol.clone(),
            timestamp: unix_millis(SystemTime::now()),
        })
    }
}

/// Answers every location request with a fixed position.
pub async fn serve_fixed_location(requests: Arc<LocationRequests>, location: Location) {
    loop {
        requests.wanted().await;
        if requests.resolve(location) {
            debug!("Served configured location");
        }
    }
}

pub struct WeatherPusher<P, S> {
    provider: P,
    sink: S,
    profile: DeviceProfile,
    interval: Duration,
}

impl<P: WeatherProvider, S: OutboundSink> WeatherPusher<P, S> {
    pub fn new(provider: P, sink: S, profile: DeviceProfile, interval: Duration) -> Self {
        Self {
            provider,
            sink,
            profile,
            interval,
        }
    }

    /// Fetch and send one report.
    pub async fn push_once(&self) -> Result<(), WeatherError> {
        let payload = self.provider.current().await?;
        let json = payload.to_json()?;
        info!(
            "Pushing weather: {} C, {}",
            payload.temperature_c, payload.condition
        );
        self.sink.send(&json);
        Ok(())
    }

    /// Push now and then every interval, forever.
    pub async fn run(self) {
        if !self.profile.accepts_weather() {
            info!("{} does not take weather updates", self.profile.display_name);
            return;
        }
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.push_once().await {
                warn!("Weather push failed: {}", e);
            }
        }
    }
}
