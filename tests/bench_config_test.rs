//! Integration test for the shipped station configuration
//!
//! Loads `config/bench.toml` and builds bench components from it, so the
//! sample stays in step with the configuration types.

use hil_bench::{
    config::BenchConfig,
    interface::{serial::Parity, Credential, CredentialSource, PacedRestInterface},
    tracing_setup::TracingConfig,
};
use std::path::PathBuf;
use std::time::Duration;

fn sample_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/bench.toml")
}

#[test]
#[serial_test::serial]
fn test_sample_config_loads() {
    let config = BenchConfig::load_from(sample_path()).unwrap();

    assert_eq!(config.application.name, "bench-01");
    assert_eq!(config.devices.len(), 2);
    assert_eq!(config.serial.eol, "\r");
    assert_eq!(config.logger.stop_timeout, Duration::from_secs(5));
    assert_eq!(config.scpi.resources.len(), 1);

    let n5 = config.device_serial_config("N5").unwrap();
    assert_eq!(n5.baud_rate, 9600);
    assert_eq!(n5.parity, Parity::None);
    assert!(config.device_serial_config("HATI").is_some());
    assert!(config.device_serial_config("missing").is_none());

    let weather = config.rest_endpoint("weather").unwrap();
    assert_eq!(weather.min_interval, Some(Duration::from_secs(2)));
    assert!(config.rest_endpoint("platform").unwrap().min_interval.is_none());
}

#[test]
#[serial_test::serial]
fn test_config_supplies_credentials_and_log_level() {
    let config = BenchConfig::load_from(sample_path()).unwrap();

    assert!(matches!(config.credential("weather"), Some(Credential::Basic { .. })));
    let endpoint = config.rest_endpoint("weather").unwrap();
    let mut paced = PacedRestInterface::new(&endpoint.name, &endpoint.base_url, &config).unwrap();
    if let Some(interval) = endpoint.min_interval {
        paced = paced.with_min_interval(interval);
    }
    assert_eq!(paced.pacer().min_interval(), Duration::from_secs(2));

    let err = PacedRestInterface::new("platform", "https://platform.example.com", &config)
        .err()
        .unwrap();
    assert_eq!(err.origin, "platform");

    let logging = TracingConfig::from_bench_config(&config).unwrap();
    assert_eq!(logging.level, tracing::Level::INFO);
}

#[test]
#[serial_test::serial]
fn test_environment_overrides_logger_folder() {
    std::env::set_var("HIL_BENCH_LOGGER__LOG_FOLDER", "/tmp/bench-logs");
    let result = BenchConfig::load_from(sample_path());
    std::env::remove_var("HIL_BENCH_LOGGER__LOG_FOLDER");

    assert_eq!(result.unwrap().logger.log_folder, PathBuf::from("/tmp/bench-logs"));
}
