use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listen_addr: String,
    pub metrics_addr: Option<String>,
    pub feed: FeedConfig,
    pub results: ResultsConfig,
    pub statistics: StatisticsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub files: Vec<String>,
    /// Replace the recorded session date with today's date.
    pub rebase_to_today: bool,
    pub utc_offset_hours: i32,
    pub cadence_ms: u64,
    pub subscriber_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    pub buffer_size: usize,
    pub backpressure: Backpressure,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub interval_secs: u32,
    pub buffer_size: usize,
}

/// What a full per-broker fill queue does with the next fill.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Wait for the broker to drain; stalls matching meanwhile.
    #[default]
    Block,
    DropOldest,
    Error,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8082".to_string(),
            metrics_addr: None,
            feed: FeedConfig::default(),
            results: ResultsConfig::default(),
            statistics: StatisticsConfig::default(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            rebase_to_today: true,
            utc_offset_hours: 3,
            cadence_ms: 1000,
            subscriber_buffer: 100,
        }
    }
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            backpressure: Backpressure::Block,
        }
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1,
            buffer_size: 100,
        }
    }
}

impl FeedConfig {
    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms.max(1))
    }
}

impl StatisticsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_secs.max(1)))
    }
}

impl Settings {
    /// Reads `path`, then applies `EXCHANGE__*` overrides from the process
    /// environment (e.g. `EXCHANGE__RESULTS__BUFFER_SIZE=64`).
    pub fn load(path: &str) -> anyhow::Result<Self> {
        Self::layered(config::File::with_name(path), environment())
    }

    fn layered<S>(file: S, env: config::Environment) -> anyhow::Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let builder = config::Config::builder().add_source(file).add_source(env);
        Ok(builder.build()?.try_deserialize()?)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("EXCHANGE").separator("__").try_parsing(true)
}
