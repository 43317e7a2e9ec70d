use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

use sensorhub::{
    boot::{self, LogOptions},
    bridge::supervisor,
    BridgeConfig,
};

fn cli() -> Command {
    Command::new("sensorhub")
        .about("Serial sensor board to Modbus/TCP bridge")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Bridge configuration file (TOML)")
                .default_value("sensorhub.toml"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .help("Serial device of the sensor board, overrides the configuration"),
        )
        .arg(
            Arg::new("baud")
                .long("baud")
                .help("Serial baud rate, overrides the configuration")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .help("Modbus/TCP listen address, overrides the configuration"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .help("Log file path, overrides the configuration"),
        )
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .short('q')
                .help("Log to the log file only")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .help("Log raw link traffic and upgrade phases")
                .action(ArgAction::SetTrue),
        )
}

/// Configuration file plus command line overrides, and whether the file existed.
fn load_config(matches: &ArgMatches) -> Result<(BridgeConfig, bool)> {
    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("sensorhub.toml"));
    let loaded = BridgeConfig::load(&config_path)?;
    let found = loaded.is_some();
    let mut config = loaded.unwrap_or_default();

    if let Some(port) = matches.get_one::<String>("port") {
        config.serial.port = port.clone();
    }
    if let Some(baud) = matches.get_one::<u32>("baud") {
        config.serial.baud_rate = *baud;
    }
    if let Some(listen) = matches.get_one::<String>("listen") {
        config.modbus.listen = listen.clone();
    }
    if let Some(file) = matches.get_one::<String>("log-file") {
        config.log.file = Some(PathBuf::from(file));
    }
    Ok((config, found))
}

fn main() -> Result<()> {
    let matches = cli().get_matches();
    let (config, found) = load_config(&matches)?;

    boot::init_logger(
        &config.log,
        LogOptions {
            quiet: matches.get_flag("quiet"),
            verbose: matches.get_flag("verbose"),
        },
    );
    log::info!("sensorhub {} starting", env!("CARGO_PKG_VERSION"));
    if !found {
        if let Some(path) = matches.get_one::<String>("config") {
            log::info!("Configuration file {path} not found, using defaults");
        }
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(supervisor::run(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let matches = cli()
            .try_get_matches_from(["sensorhub", "--port", "/dev/ttyUSB0", "--baud", "9600", "-q"])
            .unwrap();
        assert_eq!(
            matches.get_one::<String>("port").map(String::as_str),
            Some("/dev/ttyUSB0")
        );
        assert_eq!(matches.get_one::<u32>("baud"), Some(&9600));
        assert!(matches.get_flag("quiet"));
        assert!(!matches.get_flag("verbose"));
        assert_eq!(
            matches.get_one::<String>("config").map(String::as_str),
            Some("sensorhub.toml")
        );
    }

    #[test]
    fn test_missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent.toml");
        let matches = cli()
            .try_get_matches_from([
                "sensorhub",
                "--config",
                absent.to_str().unwrap(),
                "--listen",
                "127.0.0.1:1502",
            ])
            .unwrap();

        let (config, found) = load_config(&matches).unwrap();
        assert!(!found);
        assert_eq!(config.modbus.listen, "127.0.0.1:1502");
        assert_eq!(config.serial, BridgeConfig::default().serial);
    }

    #[test]
    fn test_cli_rejects_bad_baud() {
        assert!(cli()
            .try_get_matches_from(["sensorhub", "--baud", "fast"])
            .is_err());
    }
}
