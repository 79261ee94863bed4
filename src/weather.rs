//! Weather feed: turns the external forecast source into friction observations.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    feed::FeedError,
    friction::{self, WeatherCode, CLEAR_FRICTION},
    scenario::{WeatherConfig, WeatherMode},
};

pub const TEST_WEATHER_CODE: WeatherCode = 99;
pub const TEST_FRICTION: f64 = 0.25;
pub const TEST_WEATHER_LABEL: &str = "TEST: Heavy Thunderstorm with Hail";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub code: WeatherCode,
    pub label: String,
    pub coefficient: f64,
    pub observed_at: DateTime<Utc>,
}

impl WeatherObservation {
    pub fn from_code(code: WeatherCode, observed_at: DateTime<Utc>) -> Self {
        let entry = friction::lookup(code);
        Self {
            code,
            label: entry.label.to_string(),
            coefficient: entry.coefficient,
            observed_at,
        }
    }

    /// Dry, clear conditions. Used before the first successful live poll.
    pub fn clear(observed_at: DateTime<Utc>) -> Self {
        Self {
            code: 0,
            label: "Clear (default)".to_string(),
            coefficient: CLEAR_FRICTION,
            observed_at,
        }
    }

    pub fn test_scenario() -> Self {
        Self {
            code: TEST_WEATHER_CODE,
            label: TEST_WEATHER_LABEL.to_string(),
            coefficient: TEST_FRICTION,
            observed_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Same road condition, ignoring when it was observed.
    pub fn same_conditions(&self, other: &WeatherObservation) -> bool {
        self.code == other.code && self.coefficient == other.coefficient
    }
}

/// Anything that can report the current weather classification code.
pub trait WeatherSource {
    fn current_code(&mut self) -> Result<WeatherCode, FeedError>;
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current_weather: Option<CurrentWeather>,
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    weathercode: Option<f64>,
}

/// Extracts `current_weather.weathercode` from an Open-Meteo forecast payload.
pub fn parse_forecast(body: &str) -> Result<WeatherCode, FeedError> {
    let response: ForecastResponse =
        serde_json::from_str(body).map_err(|err| FeedError::Shape(err.to_string()))?;
    let code = response
        .current_weather
        .and_then(|current| current.weathercode)
        .ok_or_else(|| FeedError::Shape("missing current_weather.weathercode".into()))?;
    if !code.is_finite() || code.fract() != 0.0 {
        return Err(FeedError::Shape(format!("weather code {code} is not an integer")));
    }
    Ok(code as WeatherCode)
}

/// Open-Meteo `current_weather` endpoint for a fixed point.
pub struct OpenMeteoSource {
    client: reqwest::blocking::Client,
    url: String,
    latitude: f64,
    longitude: f64,
}

impl OpenMeteoSource {
    pub fn new(config: &WeatherConfig) -> Result<Self, FeedError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_secs))
            .build()
            .map_err(|err| FeedError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            url: config.endpoint.clone(),
            latitude: config.latitude,
            longitude: config.longitude,
        })
    }
}

impl WeatherSource for OpenMeteoSource {
    fn current_code(&mut self) -> Result<WeatherCode, FeedError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("latitude", self.latitude.to_string()),
                ("longitude", self.longitude.to_string()),
                ("current_weather", "true".to_string()),
            ])
            .send()
            .map_err(FeedError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status.as_u16()));
        }
        let body = response.text().map_err(FeedError::from_reqwest)?;
        parse_forecast(&body)
    }
}

enum Mode {
    Live {
        source: Box<dyn WeatherSource + Send>,
        poll_interval_ticks: u64,
    },
    Test,
}

/// Weather feed client. The operating mode is fixed at construction.
pub struct WeatherFeed {
    mode: Mode,
    current: WeatherObservation,
    failures: u64,
}

impl WeatherFeed {
    pub fn live(source: Box<dyn WeatherSource + Send>, poll_interval_ticks: u64) -> Self {
        Self {
            mode: Mode::Live {
                source,
                poll_interval_ticks: poll_interval_ticks.max(1),
            },
            current: WeatherObservation::clear(Utc::now()),
            failures: 0,
        }
    }

    pub fn test() -> Self {
        info!("weather feed in test mode: {TEST_WEATHER_LABEL} (friction {TEST_FRICTION})");
        Self {
            mode: Mode::Test,
            current: WeatherObservation::test_scenario(),
            failures: 0,
        }
    }

    /// Builds the feed for the configured mode, with the HTTP source in live mode.
    pub fn from_config(config: &WeatherConfig) -> Result<Self, FeedError> {
        match config.mode {
            WeatherMode::Test => Ok(Self::test()),
            WeatherMode::Live => {
                let source = OpenMeteoSource::new(config)?;
                Ok(Self::live(Box::new(source), config.poll_interval_ticks))
            }
        }
    }

    pub fn is_test_mode(&self) -> bool {
        matches!(self.mode, Mode::Test)
    }

    pub fn current(&self) -> &WeatherObservation {
        &self.current
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Observation in effect at `tick`. Live mode only reaches the network on
    /// ticks that are a multiple of the poll interval; a failed request keeps
    /// the previous observation.
    pub fn poll(&mut self, tick: u64) -> WeatherObservation {
        let Mode::Live {
            source,
            poll_interval_ticks,
        } = &mut self.mode
        else {
            return self.current.clone();
        };
        if tick % *poll_interval_ticks != 0 {
            return self.current.clone();
        }

        match source.current_code() {
            Ok(code) => {
                let observation = WeatherObservation::from_code(code, Utc::now());
                if !observation.same_conditions(&self.current) {
                    debug!(
                        "tick {tick}: weather code {code} ({}) -> friction {}",
                        observation.label, observation.coefficient
                    );
                }
                self.current = observation;
            }
            Err(err) => {
                self.failures += 1;
                warn!(
                    "tick {tick}: weather poll failed ({err}); keeping stale observation '{}' (friction {})",
                    self.current.label, self.current.coefficient
                );
            }
        }
        self.current.clone()
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use std::collections::VecDeque;

    use super::*;

    /// Replays a fixed list of poll outcomes, then repeats the last one.
    pub struct ScriptedWeather {
        outcomes: VecDeque<Result<WeatherCode, FeedError>>,
        last: Result<WeatherCode, FeedError>,
        pub calls: usize,
    }

    impl ScriptedWeather {
        pub fn new(outcomes: Vec<Result<WeatherCode, FeedError>>) -> Self {
            Self {
                outcomes: outcomes.into(),
                last: Err(FeedError::Transport("script exhausted".into())),
                calls: 0,
            }
        }
    }

    impl WeatherSource for ScriptedWeather {
        fn current_code(&mut self) -> Result<WeatherCode, FeedError> {
            self.calls += 1;
            if let Some(outcome) = self.outcomes.pop_front() {
                self.last = outcome.clone();
            }
            self.last.clone()
        }
    }
}
