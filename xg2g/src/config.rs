//! Application configuration.
//!
//! Everything is read from `XG2G_*` environment variables. `main` loads a
//! `.env` file first, if one exists. An unset variable takes its default.
//! A malformed value is a configuration error that names the variable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::api::middleware::auth::{ApiToken, parse_api_tokens, parse_scopes};
use crate::control::{AdmissionConfig, BreakerConfig, PathMapper, PathMapping, WatchdogConfig};
use crate::executor::FfmpegConfig;
use crate::receiver::ReceiverConfig;
use crate::session::EvicterConfig;
use crate::{Error, Result};

const DEFAULT_LOG_RETENTION_DAYS: u32 = 7;
const DEFAULT_TOKEN_SCOPES: &str = "read,write";

/// Fully resolved service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen: SocketAddr,
    /// Data root. HLS output lives under `<data_dir>/hls/sessions`.
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_retention_days: u32,
    pub ffmpeg: FfmpegConfig,
    pub admission: AdmissionConfig,
    pub watchdog: WatchdogConfig,
    /// Defaults shared by every named breaker.
    pub breaker: BreakerConfig,
    pub evicter: EvicterConfig,
    /// Prefix rules, in match order.
    pub path_mappings: Vec<PathMapping>,
    pub resolve_require_existing: bool,
    /// `None` disables live intents and timer checks.
    pub receiver: Option<ReceiverConfig>,
    pub api_tokens: Vec<ApiToken>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8088)),
            data_dir: PathBuf::from("./data"),
            log_dir: PathBuf::from("./logs"),
            log_retention_days: DEFAULT_LOG_RETENTION_DAYS,
            ffmpeg: FfmpegConfig::default(),
            admission: AdmissionConfig::default(),
            watchdog: WatchdogConfig::default(),
            breaker: BreakerConfig::default(),
            evicter: EvicterConfig::default(),
            path_mappings: Vec::new(),
            resolve_require_existing: false,
            receiver: None,
            api_tokens: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let defaults = Self::default();

        let listen = env.number("XG2G_LISTEN", defaults.listen)?;

        let ffmpeg = FfmpegConfig {
            binary_path: env
                .string("XG2G_FFMPEG_BIN")
                .unwrap_or(defaults.ffmpeg.binary_path),
            ffprobe_path: env
                .string("XG2G_FFPROBE_BIN")
                .unwrap_or(defaults.ffmpeg.ffprobe_path),
            segment_seconds: env.number("XG2G_HLS_SEGMENT_SECONDS", defaults.ffmpeg.segment_seconds)?,
            kill_timeout: env.millis("XG2G_FFMPEG_KILL_TIMEOUT_MS", defaults.ffmpeg.kill_timeout)?,
            probe_timeout: env.millis("XG2G_PROBE_TIMEOUT_MS", defaults.ffmpeg.probe_timeout)?,
        };

        let admission = AdmissionConfig {
            transcode_capacity: env.number(
                "XG2G_ADMISSION_TRANSCODE",
                defaults.admission.transcode_capacity,
            )?,
            cpu_heavy_capacity: env.number(
                "XG2G_ADMISSION_CPU_HEAVY",
                defaults.admission.cpu_heavy_capacity,
            )?,
        };

        let watchdog = WatchdogConfig {
            startup_grace: env.millis("XG2G_STARTUP_GRACE_MS", defaults.watchdog.startup_grace)?,
            stall_timeout: env.millis("XG2G_STALL_TIMEOUT_MS", defaults.watchdog.stall_timeout)?,
            tick: env.millis("XG2G_WATCHDOG_TICK_MS", defaults.watchdog.tick)?,
        };

        let breaker = BreakerConfig {
            failure_threshold: env.number(
                "XG2G_BREAKER_THRESHOLD",
                defaults.breaker.failure_threshold,
            )?,
            trial_successes: env.number(
                "XG2G_BREAKER_TRIAL_SUCCESSES",
                defaults.breaker.trial_successes,
            )?,
            open_duration: env.millis("XG2G_BREAKER_OPEN_MS", defaults.breaker.open_duration)?,
            half_open_max_requests: env.number(
                "XG2G_BREAKER_HALF_OPEN_MAX",
                defaults.breaker.half_open_max_requests,
            )?,
            recover_panics: defaults.breaker.recover_panics,
        };

        let evicter = EvicterConfig {
            interval: env.millis("XG2G_EVICT_INTERVAL_MS", defaults.evicter.interval)?,
            retention: env.millis("XG2G_SESSION_RETENTION_MS", defaults.evicter.retention)?,
            sweep_orphans: defaults.evicter.sweep_orphans,
            min_free_bytes: env
                .number("XG2G_EVICT_MIN_FREE_BYTES", defaults.evicter.min_free_bytes)?,
        };

        let path_mappings = match env.string("XG2G_PATH_MAPPINGS") {
            Some(raw) => serde_json::from_str::<Vec<PathMapping>>(&raw)
                .map_err(|e| Error::config(format!("XG2G_PATH_MAPPINGS: invalid JSON: {e}")))?,
            None => Vec::new(),
        };
        PathMapper::new(&path_mappings)
            .map_err(|e| prefixed("XG2G_PATH_MAPPINGS", e))?;

        let receiver = match env.string("XG2G_OWI_BASE") {
            Some(base_url) => {
                let receiver_defaults = ReceiverConfig::default();
                url::Url::parse(&base_url).map_err(|e| {
                    Error::config(format!("XG2G_OWI_BASE: invalid URL '{base_url}': {e}"))
                })?;
                Some(ReceiverConfig {
                    base_url,
                    username: env.string("XG2G_OWI_USER"),
                    password: env.string("XG2G_OWI_PASS"),
                    timeout: env.millis("XG2G_OWI_TIMEOUT_MS", receiver_defaults.timeout)?,
                    stream_port: env.number("XG2G_STREAM_PORT", receiver_defaults.stream_port)?,
                })
            }
            None => None,
        };

        let mut api_tokens = match env.string("XG2G_API_TOKENS") {
            Some(raw) => parse_api_tokens(&raw)?,
            None => Vec::new(),
        };
        if let Some(token) = env.string("XG2G_API_TOKEN") {
            let scopes = env
                .string("XG2G_API_TOKEN_SCOPES")
                .unwrap_or_else(|| DEFAULT_TOKEN_SCOPES.to_string());
            let scopes = parse_scopes(&scopes)
                .map_err(|e| prefixed("XG2G_API_TOKEN_SCOPES", e))?;
            if scopes.is_empty() {
                return Err(Error::config("XG2G_API_TOKEN_SCOPES: no scopes given"));
            }
            api_tokens.push(ApiToken {
                name: Some("default".to_string()),
                token,
                scopes,
            });
        }

        let config = Self {
            listen,
            data_dir: env.path("XG2G_DATA").unwrap_or(defaults.data_dir),
            log_dir: env.path("XG2G_LOG_DIR").unwrap_or(defaults.log_dir),
            log_retention_days: env.number("XG2G_LOG_RETENTION_DAYS", defaults.log_retention_days)?,
            ffmpeg,
            admission,
            watchdog,
            breaker,
            evicter,
            path_mappings,
            resolve_require_existing: env.flag(
                "XG2G_RESOLVE_REQUIRE_EXISTING",
                defaults.resolve_require_existing,
            )?,
            receiver,
            api_tokens,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("XG2G_ADMISSION_TRANSCODE", self.admission.transcode_capacity),
            ("XG2G_ADMISSION_CPU_HEAVY", self.admission.cpu_heavy_capacity),
            ("XG2G_HLS_SEGMENT_SECONDS", self.ffmpeg.segment_seconds),
            ("XG2G_BREAKER_THRESHOLD", self.breaker.failure_threshold),
            ("XG2G_BREAKER_TRIAL_SUCCESSES", self.breaker.trial_successes),
            ("XG2G_BREAKER_HALF_OPEN_MAX", self.breaker.half_open_max_requests),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::config(format!("{name}: must be at least 1")));
            }
        }

        let non_zero = [
            ("XG2G_WATCHDOG_TICK_MS", self.watchdog.tick),
            ("XG2G_STALL_TIMEOUT_MS", self.watchdog.stall_timeout),
            ("XG2G_EVICT_INTERVAL_MS", self.evicter.interval),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(Error::config(format!("{name}: must be greater than 0")));
            }
        }
        Ok(())
    }

    /// Parent directory of every session's HLS output.
    pub fn hls_root(&self) -> PathBuf {
        self.data_dir.join("hls").join("sessions")
    }

    pub fn auth_enabled(&self) -> bool {
        !self.api_tokens.is_empty()
    }
}

/// Attach the variable name to a configuration error from a nested parser.
fn prefixed(name: &str, err: Error) -> Error {
    match err {
        Error::Configuration(msg) => Error::config(format!("{name}: {msg}")),
        other => other,
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed value; empty counts as unset.
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        self.string(name).map(PathBuf::from)
    }

    fn parse<T>(&self, name: &str, default: Option<T>) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(name) {
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| Error::config(format!("{name}: invalid value '{raw}': {e}"))),
            None => Ok(default),
        }
    }

    /// Parsed value or `default`. Works for any `FromStr` type.
    fn number<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse(name, None)?.unwrap_or(default))
    }

    fn millis(&self, name: &str, default: Duration) -> Result<Duration> {
        Ok(self
            .parse::<u64>(name, None)?
            .map(Duration::from_millis)
            .unwrap_or(default))
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool> {
        match self.string(name) {
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(Error::config(format!("{name}: invalid boolean '{raw}'"))),
            },
            None => Ok(default),
        }
    }
}
