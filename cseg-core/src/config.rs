use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Recorder configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CsegConfig {
    /// Writer target, selected by scheme: `ivr:<http-uri>` or `file:<dir>`
    pub target: String,
    pub segment: SegmentConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Nominal segment length in seconds; rotation waits for the next
    /// video key frame past this point.
    pub duration_secs: f64,
    /// Maximum number of segments held in memory at once.
    pub max_segments: usize,
    /// Size threshold in bytes forcing rotation of a still-open segment,
    /// independent of key-frame cadence. 0 disables the threshold.
    pub max_segment_bytes: usize,
    /// How far back the first segment may be backdated relative to the
    /// recording trigger ("record N seconds before the event").
    pub pre_record_secs: f64,
    /// Bounded handoff queue depth between producer and delivery worker.
    pub queue_depth: usize,
    /// How often the reconciliation sweep retries unconfirmed saves.
    pub reconcile_interval_secs: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            duration_secs: 10.0,
            max_segments: 8,
            max_segment_bytes: 16 * 1024 * 1024,
            pre_record_secs: 0.0,
            queue_depth: 4,
            reconcile_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Timeout for the segment body upload, milliseconds.
    pub timeout_ms: u64,
    /// Timeout for the create/save/fail metadata calls, milliseconds.
    pub create_timeout_ms: u64,
    /// Attempt budget per phase for transport-level failures.
    pub retries: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 20_000,
            create_timeout_ms: 10_000,
            retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl CsegConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (CSEG_TARGET, etc.)
        builder = builder.add_source(
            Environment::with_prefix("CSEG")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }
}
