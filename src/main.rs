mod config;
mod csv_log;
mod device;
mod engine;
mod error;
mod measure;
mod speedtest_net;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;
use std::io::{self, BufRead, Write};
use std::path::{Component, Path, PathBuf};

use crate::config::{Cli, Config, EngineConfig};
use crate::device::UNKNOWN_DEVICE;
use crate::engine::MeasurementEngine;
use crate::error::MeasurementError;
use crate::measure::FIELD_ORDER;
use crate::speedtest_net::SpeedtestNet;

#[tokio::main]
async fn main() -> Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Warn)
        .env()
        .init()
        .context("Failed to initialise logging")?;

    // Parse command-line arguments
    let cli = Cli::parse();

    // Load configuration
    let config = config::load_config(&cli)?;
    info!("Configuration loaded, {} known devices", config.catalog.len());

    if let Some(ref name) = cli.device {
        if !config.catalog.contains(name) {
            Cli::command()
                .error(
                    ErrorKind::InvalidValue,
                    format!(
                        "invalid value '{}' for '--device <DEVICE>'\n  [possible values: {}]",
                        name,
                        config.catalog.names().join(", ")
                    ),
                )
                .exit();
        }
    }

    if cli.list_devices {
        print!("{}", config.catalog.menu());
        return Ok(());
    }

    run(
        &cli,
        &config,
        SpeedtestNet::new,
        &mut io::stdin().lock(),
        &mut io::stdout(),
    )
    .await
}

/// Resolves the device, measures, and appends one row. Device and
/// measurement failures are reported on `output` and leave the log
/// untouched; filesystem failures are returned.
async fn run<E, F, R, W>(
    cli: &Cli,
    config: &Config,
    connect: F,
    input: &mut R,
    output: &mut W,
) -> Result<()>
where
    E: MeasurementEngine,
    F: FnOnce(&EngineConfig) -> Result<E, MeasurementError>,
    R: BufRead,
    W: Write,
{
    let resolved = device::resolve(
        &config.catalog,
        cli.device.as_deref(),
        cli.selector.as_deref(),
        input,
        output,
    );
    let device = match resolved {
        Ok(device) => device,
        Err(e) => {
            writeln!(output, "{}", e)?;
            return Ok(());
        }
    };
    info!("Measuring for device {}", device);

    let measured = match connect(&config.engine) {
        Ok(mut engine) => measure::run(&mut engine).await,
        Err(e) => Err(e),
    };
    let measurement = match measured {
        Ok(measurement) => measurement,
        Err(e) => {
            writeln!(output, "Speedtest failed: {}", e)?;
            return Ok(());
        }
    };

    let record = measurement.with_device(device);
    csv_log::append_with_defaults(
        &config.output,
        &record.to_row(),
        &FIELD_ORDER,
        &[("device", UNKNOWN_DEVICE)],
    )?;

    let m = &record.measurement;
    writeln!(output, "Saved results to {}", absolute_path(&config.output).display())?;
    writeln!(
        output,
        "Device: {}, Download: {} Mbps, Upload: {} Mbps, Ping: {} ms",
        record.device,
        m.download_mbps,
        m.upload_mbps,
        m.ping_ms.map(|p| p.to_string()).unwrap_or_else(|| "n/a".to_string())
    )?;

    Ok(())
}

/// Absolute form of `path` with `.` and `..` folded away.
fn absolute_path(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCatalog;
    use crate::engine::testing::FakeEngine;
    use std::fs;
    use std::io::Cursor;

    fn setup(args: &[&str]) -> (tempfile::TempDir, Cli, Config) {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("logs/speedtest.csv");
        let cli = Cli::parse_from(std::iter::once("pidata-speedtest").chain(args.iter().copied()));
        let config = Config {
            catalog: DeviceCatalog::new(vec!["A".into(), "B".into(), "C".into()]),
            output,
            engine: EngineConfig::default(),
        };
        (dir, cli, config)
    }

    async fn run_with(cli: &Cli, config: &Config, engine: FakeEngine) -> (String, bool) {
        let mut connected = false;
        let mut input = Cursor::new(Vec::new());
        let mut output = Vec::new();
        run(
            cli,
            config,
            |_: &EngineConfig| {
                connected = true;
                Ok(engine)
            },
            &mut input,
            &mut output,
        )
        .await
        .unwrap();
        (String::from_utf8(output).unwrap(), connected)
    }

    #[tokio::test]
    async fn positional_index_selects_device() {
        let (_dir, cli, config) = setup(&["2"]);
        let (output, _) = run_with(&cli, &config, FakeEngine::default()).await;

        let content = fs::read_to_string(&config.output).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], FIELD_ORDER.join(","));
        assert!(lines[1].starts_with("B,"));
        assert!(output.contains("Saved results to"));
        assert!(output.contains("Device: B, Download: 123.456 Mbps, Upload: 9.877 Mbps, Ping: 14.25 ms"));
    }

    #[tokio::test]
    async fn invalid_selector_writes_nothing() {
        for selector in ["0", "4", "Z"] {
            let (_dir, cli, config) = setup(&[selector]);
            let (output, connected) = run_with(&cli, &config, FakeEngine::default()).await;

            assert!(!connected, "engine used for {}", selector);
            assert!(!config.output.exists(), "log written for {}", selector);
            assert!(!config.output.parent().unwrap().exists());
            assert!(!output.is_empty());
        }
    }

    #[tokio::test]
    async fn unknown_name_lists_valid_devices() {
        let (_dir, cli, config) = setup(&["Z"]);
        let (output, _) = run_with(&cli, &config, FakeEngine::default()).await;
        assert_eq!(output.trim_end(), "Unknown device 'Z', valid devices: A, B, C");
    }

    #[tokio::test]
    async fn failed_measurement_writes_nothing() {
        let (_dir, cli, config) = setup(&["-d", "A"]);
        let engine = FakeEngine {
            fail_selection: true,
            ..FakeEngine::default()
        };
        let (output, connected) = run_with(&cli, &config, engine).await;

        assert!(connected);
        assert!(!config.output.exists());
        assert!(output.starts_with("Speedtest failed: No server reachable"));
    }

    #[cfg(unix)]
    #[test]
    fn saved_path_is_normalized() {
        assert_eq!(
            absolute_path(Path::new("/var/log/../tmp/./speedtest.csv")),
            PathBuf::from("/var/tmp/speedtest.csv")
        );
        assert_eq!(absolute_path(Path::new("/../x.csv")), PathBuf::from("/x.csv"));
        assert!(absolute_path(Path::new("relative.csv")).is_absolute());
    }
}
