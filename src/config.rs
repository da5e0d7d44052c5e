use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::device::{DeviceCatalog, UNKNOWN_DEVICE};

pub const DEFAULT_CONFIG_PATH: &str = "./speedtest.toml";

#[cfg(windows)]
pub const DEFAULT_OUTPUT_PATH: &str = r"C:\logs\speedtest\speedtest_results.csv";
#[cfg(not(windows))]
pub const DEFAULT_OUTPUT_PATH: &str = "/var/log/speedtest/speedtest_results.csv";

pub const DEFAULT_DEVICES: &[&str] = &["router", "pi-livingroom", "pi-office", "laptop"];

/// Run a speed test and append the results to a CSV log.
#[derive(Parser, Debug)]
#[clap(name = "pidata-speedtest", version, about)]
pub struct Cli {
    /// Device number (1-based) or device name
    pub selector: Option<String>,

    /// CSV output path
    #[clap(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Device name, overrides the positional selector
    #[clap(long, short = 'd')]
    pub device: Option<String>,

    /// Path to configuration file
    #[clap(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Override the per-request timeout in seconds
    #[clap(long)]
    pub timeout: Option<u64>,

    /// Print the known devices and exit
    #[clap(long)]
    pub list_devices: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct FileConfig {
    devices: Vec<String>,
    output: PathBuf,
    engine: EngineConfig,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            devices: DEFAULT_DEVICES.iter().map(|d| d.to_string()).collect(),
            output: PathBuf::from(DEFAULT_OUTPUT_PATH),
            engine: EngineConfig::default(),
        }
    }
}

/// Settings for the speedtest.net engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub config_url: String,
    pub servers_url: String,
    pub timeout_secs: u64,
    pub test_length_secs: u64,
    pub latency_candidates: usize,
    pub latency_samples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            config_url: "https://www.speedtest.net/speedtest-config.php".to_string(),
            servers_url: "https://www.speedtest.net/api/js/servers?engine=js&https_functional=true&limit=10"
                .to_string(),
            timeout_secs: 10,
            test_length_secs: 10,
            latency_candidates: 5,
            latency_samples: 3,
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn test_length(&self) -> Duration {
        Duration::from_secs(self.test_length_secs)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub catalog: DeviceCatalog,
    pub output: PathBuf,
    pub engine: EngineConfig,
}

pub fn load_config(cli: &Cli) -> Result<Config> {
    let file_config = if cli.config.exists() {
        let config_content = fs::read_to_string(&cli.config)
            .with_context(|| format!("Failed to read config file: {:?}", cli.config))?;
        parse_config(&config_content)?
    } else if cli.config == PathBuf::from(DEFAULT_CONFIG_PATH) {
        FileConfig::default()
    } else {
        bail!("Config file not found: {:?}", cli.config);
    };

    let catalog = DeviceCatalog::new(file_config.devices);
    validate_catalog(&catalog)?;

    let mut config = Config {
        catalog,
        output: file_config.output,
        engine: file_config.engine,
    };

    // Apply CLI overrides
    if let Some(ref output) = cli.output {
        config.output = output.clone();
    }

    if let Some(timeout) = cli.timeout {
        config.engine.timeout_secs = timeout;
    }

    Ok(config)
}

fn parse_config(content: &str) -> Result<FileConfig> {
    toml::from_str(content).context("Failed to parse config file")
}

fn validate_catalog(catalog: &DeviceCatalog) -> Result<()> {
    if catalog.is_empty() {
        bail!("Device list in config must not be empty");
    }

    let names = catalog.names();
    for (i, name) in names.iter().enumerate() {
        if name == UNKNOWN_DEVICE {
            bail!("'{}' is reserved and cannot be used as a device name", UNKNOWN_DEVICE);
        }
        if names[..i].contains(name) {
            bail!("Duplicate device name in config: {}", name);
        }
    }

    Ok(())
}
