//! Configuration management for the OCR server
//!
//! Configuration lives in a YAML file at `~/.ocr-server/config.yaml`, which
//! is generated from defaults on first run. Command-line flags override file
//! values; the merged configuration is immutable after startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::imgproc::ThresholdMode;

/// Errors raised while loading configuration. Fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Complete server configuration.
///
/// `scale_threshold` is reserved for a future scale-up policy; no control
/// loop currently reads it. Scale-up happens lazily in the pool instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP bind address
    pub addr: String,
    /// HTTP bind port
    pub port: u16,
    /// Path to the OCR worker executable (resolved via PATH when bare)
    pub ocr_exe_path: String,
    /// Floor of the active pool size
    pub min_processors: usize,
    /// Ceiling of the active pool size
    pub max_processors: usize,
    /// Capacity of the task intake queue
    pub queue_size: usize,
    /// Reserved; gates no behaviour
    pub scale_threshold: i64,
    /// Maximum in-flight count for a worker to be demotable
    pub degrade_threshold: i64,
    /// Minimum idle duration before a worker can be demoted, in seconds
    pub idle_timeout_secs: u64,
    /// Target number of resident idle workers
    pub warm_up_count: usize,
    /// Maximum drain time on shutdown, in seconds
    pub shutdown_timeout_secs: u64,
    /// Directory for log files
    pub log_dir: String,
    /// Log file name
    pub log_file: String,
    /// Retained old log files (recorded; pruning is outside the service)
    pub log_max_backups: usize,
    /// Retention of old log files in days (recorded; as above)
    pub log_max_age_days: usize,
    /// Binarization mode: 0 = fixed threshold, 1 = Otsu
    pub threshold_mode: u8,
    /// Fixed threshold value, used when threshold_mode = 0
    pub threshold_value: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0".to_string(),
            port: 3000,
            ocr_exe_path: "paddleocr-json".to_string(),
            min_processors: 2,
            max_processors: host_cpu_count(),
            queue_size: 100,
            scale_threshold: 75,
            degrade_threshold: 25,
            idle_timeout_secs: 300,
            warm_up_count: 2,
            shutdown_timeout_secs: 30,
            log_dir: "logs".to_string(),
            log_file: "ocr-server.log".to_string(),
            log_max_backups: 3,
            log_max_age_days: 28,
            threshold_mode: 0,
            threshold_value: 100,
        }
    }
}

/// Number of logical CPUs on the host.
pub fn host_cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

impl Config {
    /// Load configuration from the default location, generating a default
    /// config file first if none exists.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, generating it from defaults when absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let defaults = Config::default();
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(path, serde_yaml::to_string(&defaults).map_err(ConfigError::Parse)?)?;
            // The logger is not up yet at load time.
            println!("generated default config file: {}", path.display());
        }
        let text = fs::read_to_string(path)?;
        let cfg = serde_yaml::from_str(&text)?;
        Ok(cfg)
    }

    /// Default config file location: `~/.ocr-server/config.yaml`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ocr-server")
            .join("config.yaml")
    }

    /// Apply command-line overrides. A flag that was passed wins over the
    /// file value; absent flags leave the file value untouched.
    pub fn apply_overrides(&mut self, cli: &CliArgs) {
        if let Some(v) = &cli.addr {
            self.addr = v.clone();
        }
        if let Some(v) = cli.port {
            self.port = v;
        }
        if let Some(v) = &cli.ocr_exe {
            self.ocr_exe_path = v.clone();
        }
        if let Some(v) = cli.min_processors {
            self.min_processors = v;
        }
        if let Some(v) = cli.max_processors {
            self.max_processors = v;
        }
        if let Some(v) = cli.queue_size {
            self.queue_size = v;
        }
        if let Some(v) = cli.scale_threshold {
            self.scale_threshold = v;
        }
        if let Some(v) = cli.degrade_threshold {
            self.degrade_threshold = v;
        }
        if let Some(v) = cli.idle_timeout_secs {
            self.idle_timeout_secs = v;
        }
        if let Some(v) = cli.warm_up_count {
            self.warm_up_count = v;
        }
        if let Some(v) = cli.shutdown_timeout_secs {
            self.shutdown_timeout_secs = v;
        }
        if let Some(v) = &cli.log_dir {
            self.log_dir = v.clone();
        }
        if let Some(v) = &cli.log_file {
            self.log_file = v.clone();
        }
        if let Some(v) = cli.log_max_backups {
            self.log_max_backups = v;
        }
        if let Some(v) = cli.log_max_age_days {
            self.log_max_age_days = v;
        }
        if let Some(v) = cli.threshold_mode {
            self.threshold_mode = v;
        }
        if let Some(v) = cli.threshold_value {
            self.threshold_value = v;
        }
    }

    /// Lenient validation: returns human-readable warnings, never fails.
    /// Older config files keep working; the operator sees what looks off.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.port == 0 {
            warnings.push("port is 0; the OS will pick an arbitrary port".to_string());
        }
        if self.min_processors == 0 {
            warnings.push("min_processors is 0; the pool may drain to empty".to_string());
        }
        if self.max_processors < self.min_processors {
            warnings.push(format!(
                "max_processors ({}) is below min_processors ({})",
                self.max_processors, self.min_processors
            ));
        }
        if self.queue_size == 0 {
            warnings.push("queue_size is 0; every request will be rejected as busy".to_string());
        }
        if self.threshold_mode > 1 {
            warnings.push(format!(
                "threshold_mode {} is unknown; falling back to fixed thresholding",
                self.threshold_mode
            ));
        }
        warnings
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn threshold_mode(&self) -> ThresholdMode {
        match self.threshold_mode {
            1 => ThresholdMode::Otsu,
            _ => ThresholdMode::Binary,
        }
    }
}

/// Command-line arguments. Each flag overrides the corresponding config
/// file value when present.
#[derive(Parser, Debug, Default)]
#[command(name = "ocr-server", version, about = "HTTP OCR service")]
pub struct CliArgs {
    /// HTTP bind address
    #[arg(long)]
    pub addr: Option<String>,

    /// HTTP bind port
    #[arg(long)]
    pub port: Option<u16>,

    /// Path to the OCR worker executable
    #[arg(long = "ocr-exe")]
    pub ocr_exe: Option<String>,

    /// Floor of the active pool size
    #[arg(long)]
    pub min_processors: Option<usize>,

    /// Ceiling of the active pool size
    #[arg(long)]
    pub max_processors: Option<usize>,

    /// Capacity of the task intake queue
    #[arg(long)]
    pub queue_size: Option<usize>,

    /// Reserved scale-up threshold
    #[arg(long)]
    pub scale_threshold: Option<i64>,

    /// Max in-flight count for a worker to be demotable
    #[arg(long)]
    pub degrade_threshold: Option<i64>,

    /// Min idle seconds before demotion
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Target resident idle workers
    #[arg(long)]
    pub warm_up_count: Option<usize>,

    /// Max drain seconds on shutdown
    #[arg(long)]
    pub shutdown_timeout_secs: Option<u64>,

    /// Directory for log files
    #[arg(long)]
    pub log_dir: Option<String>,

    /// Log file name
    #[arg(long)]
    pub log_file: Option<String>,

    /// Retained old log files
    #[arg(long)]
    pub log_max_backups: Option<usize>,

    /// Retention of old log files in days
    #[arg(long)]
    pub log_max_age_days: Option<usize>,

    /// Binarization mode: 0 fixed, 1 Otsu
    #[arg(long)]
    pub threshold_mode: Option<u8>,

    /// Fixed binarization threshold, 0-255
    #[arg(long)]
    pub threshold_value: Option<u8>,
}
