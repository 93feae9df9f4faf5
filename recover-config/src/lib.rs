#![forbid(unsafe_code)]
//! Configuration of a recovery run: endpoints, pacing tunables and log setup.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use log::LevelFilter;
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        rolling_file::{
            policy::compound::{
                roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
            },
            RollingFileAppender,
        },
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
    Config,
};

use recover_sync::pacing::{PacingController, MAX_RESCALE, MIN_RESCALE, TARGET_CALL_DURATION};
use recover_sync::primitives::BatchSize;
use recover_sync::{OrchestratorSettings, RegressionPolicy};

pub const DEFAULT_LIGHTWALLETD_SERVER: &str = "https://zec.rocks:443";
pub const DEFAULT_SCAN_SERVICE: &str = "http://127.0.0.1:8234";
pub const DEFAULT_LOGFILE_NAME: &str = "zwl-recover.debug.log";
pub const DEFAULT_DATA_DIR_NAME: &str = ".zwl-recover";
pub const DEFAULT_NTADDRS: u32 = 5;
pub const DEFAULT_NZADDRS: u32 = 3;

const LIGHTWALLETD_PORT: u16 = 9067;
const TLS_PORT: u16 = 443;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid URI {uri}. {source}")]
    InvalidUri {
        uri: String,
        source: http::uri::InvalidUri,
    },
    #[error("Please provide the server as [scheme]://[host]:[port]. You provided: {0}")]
    IncompleteUri(String),
    #[error("Couldn't determine home directory")]
    NoHomeDir,
    #[error("IO error. {0}")]
    Io(#[from] io::Error),
    #[error("Log setup failed. {0}")]
    Log(String),
}

/// Parses a lightwalletd server, defaulting the scheme to `http` and the port to 443 for https
/// or 9067 otherwise.
pub fn construct_lightwalletd_uri(server: Option<String>) -> Result<http::Uri, ConfigError> {
    match server {
        Some(s) => construct_uri(&s),
        None => construct_uri(DEFAULT_LIGHTWALLETD_SERVER),
    }
}

/// Parses the scan service endpoint with the same defaults as [`construct_lightwalletd_uri`].
pub fn construct_service_uri(service: Option<String>) -> Result<http::Uri, ConfigError> {
    match service {
        Some(s) => construct_uri(&s),
        None => construct_uri(DEFAULT_SCAN_SERVICE),
    }
}

fn construct_uri(server: &str) -> Result<http::Uri, ConfigError> {
    let mut s = if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else {
        "http://".to_string() + server
    };
    let uri: http::Uri = s.parse().map_err(|source| ConfigError::InvalidUri {
        uri: server.to_string(),
        source,
    })?;
    if uri.host().is_none() {
        return Err(ConfigError::IncompleteUri(server.to_string()));
    }
    if uri.port().is_none() {
        let port = if uri.scheme_str() == Some("https") {
            TLS_PORT
        } else {
            LIGHTWALLETD_PORT
        };
        s = format!(
            "{}://{}:{}{}",
            uri.scheme_str().unwrap_or("http"),
            uri.host().unwrap_or_default(),
            port,
            uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("")
        );
    }

    s.parse().map_err(|source| ConfigError::InvalidUri {
        uri: server.to_string(),
        source,
    })
}

/// Pacing controller tunables
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PacingSettings {
    /// Target wall-clock duration of a scan step
    pub target: Duration,
    /// Batch size of the first scan step
    pub initial_batch_size: u32,
    /// Lower bound of the per-step rescale factor
    pub min_rescale: f64,
    /// Upper bound of the per-step rescale factor
    pub max_rescale: f64,
}

impl Default for PacingSettings {
    fn default() -> Self {
        PacingSettings {
            target: TARGET_CALL_DURATION,
            initial_batch_size: BatchSize::DEFAULT.get(),
            min_rescale: MIN_RESCALE,
            max_rescale: MAX_RESCALE,
        }
    }
}

/// Configuration data that is necessary and sufficient for a recovery run.
#[derive(Clone, Debug)]
pub struct RecoverConfig {
    /// Scan service JSON-RPC endpoint
    pub service_uri: http::Uri,
    /// Lightwalletd server the scan service syncs from
    pub lightwalletd_uri: http::Uri,
    /// The directory where the logfiles will be created. By default, this will be in ~/.zwl-recover
    pub data_dir: Option<PathBuf>,
    /// The filename of the logfile. This will be created in the `data_dir`.
    pub logfile_name: PathBuf,
    pub pacing: PacingSettings,
    /// Upper bound on each remote call, `None` waits indefinitely
    pub call_timeout: Option<Duration>,
    pub regression_policy: RegressionPolicy,
}

impl RecoverConfig {
    pub fn create(
        service: Option<String>,
        lightwalletd: Option<String>,
        data_dir: Option<PathBuf>,
    ) -> Result<RecoverConfig, ConfigError> {
        Ok(RecoverConfig {
            service_uri: construct_service_uri(service)?,
            lightwalletd_uri: construct_lightwalletd_uri(lightwalletd)?,
            data_dir,
            logfile_name: DEFAULT_LOGFILE_NAME.into(),
            pacing: PacingSettings::default(),
            call_timeout: None,
            regression_policy: RegressionPolicy::default(),
        })
    }

    /// Lightwalletd server as handed to the scan service, without a trailing path
    pub fn lwd_url(&self) -> String {
        match (
            self.lightwalletd_uri.scheme_str(),
            self.lightwalletd_uri.authority(),
        ) {
            (Some(scheme), Some(authority)) => format!("{scheme}://{authority}"),
            _ => self.lightwalletd_uri.to_string(),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            pacing: PacingController::new(
                self.pacing.target,
                BatchSize::new(self.pacing.initial_batch_size),
                self.pacing.min_rescale,
                self.pacing.max_rescale,
            ),
            call_timeout: self.call_timeout,
            regression_policy: self.regression_policy,
        }
    }

    /// Data directory, created if missing
    pub fn get_data_dir(&self) -> Result<PathBuf, ConfigError> {
        let data_dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => {
                let mut home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
                home.push(DEFAULT_DATA_DIR_NAME);
                home
            }
        };
        std::fs::create_dir_all(&data_dir)?;

        Ok(data_dir)
    }

    pub fn get_log_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.get_data_dir()?.join(&self.logfile_name))
    }

    /// Build the Logging config
    pub fn get_log_config(&self) -> Result<Config, ConfigError> {
        let log_path = self.get_log_path()?;
        let window_size = 3; // log0, log1, log2
        let fixed_window_roller = FixedWindowRoller::builder()
            .build(&roll_pattern(&log_path), window_size)
            .map_err(|e| ConfigError::Log(e.to_string()))?;
        let size_limit = 5 * 1024 * 1024; // 5MB as max log file size to roll
        let size_trigger = SizeTrigger::new(size_limit);
        let compound_policy =
            CompoundPolicy::new(Box::new(size_trigger), Box::new(fixed_window_roller));

        Config::builder()
            .appender(
                Appender::builder()
                    .filter(Box::new(ThresholdFilter::new(LevelFilter::Info)))
                    .build(
                        "logfile",
                        Box::new(
                            RollingFileAppender::builder()
                                .encoder(Box::new(PatternEncoder::new("{d} {l}::{m}{n}")))
                                .build(&log_path, Box::new(compound_policy))?,
                        ),
                    ),
            )
            .appender(
                Appender::builder()
                    .filter(Box::new(ThresholdFilter::new(LevelFilter::Warn)))
                    .build(
                        "stderr",
                        Box::new(
                            ConsoleAppender::builder()
                                .target(Target::Stderr)
                                .encoder(Box::new(PatternEncoder::new("{l}: {m}{n}")))
                                .build(),
                        ),
                    ),
            )
            .build(
                Root::builder()
                    .appender("logfile")
                    .appender("stderr")
                    .build(LevelFilter::Debug),
            )
            .map_err(|e| ConfigError::Log(e.to_string()))
    }
}

fn roll_pattern(log_path: &Path) -> String {
    format!("{}.{{}}", log_path.to_string_lossy())
}
