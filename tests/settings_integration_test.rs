use bulwark::error::{BulwarkError, EXIT_FATAL, EXIT_INVALID_CONFIG};
use bulwark::resilience::{SlidingWindowType, State};
use bulwark::{Registries, Settings};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const SETTINGS: &str = r#"
[circuit_breaker.configs.default]
sliding_window_size = 10
minimum_number_of_calls = 5

[circuit_breaker.configs.strict]
failure_rate_threshold = 20.0
sliding_window_type = "time_based"

[circuit_breaker.instances.inventory]
base_config = "strict"
wait_duration_in_open_state_ms = 2000

[circuit_breaker.instances.catalog]

[rate_limiter.instances.partner_api]
limit_for_period = 5
limit_refresh_period_ms = 1000
timeout_duration_ms = 0

[bulkhead.instances.db]
max_concurrent_calls = 3
max_wait_duration_ms = 50

[retry.instances.fetch]
max_attempts = 4
wait_duration_ms = 10
"#;

fn write_settings(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_registries_built_from_file() {
    let file = write_settings(SETTINGS);
    let settings = Settings::from_file(file.path()).unwrap();
    let registries = Registries::from_settings(&settings).unwrap();

    let inventory = registries.circuit_breakers.find("inventory").unwrap();
    let config = inventory.config();
    assert_eq!(config.failure_rate_threshold, 20.0);
    assert_eq!(config.sliding_window_type, SlidingWindowType::TimeBased);
    // Inherited through "strict" from the overridden default
    assert_eq!(config.sliding_window_size, 10);
    assert_eq!(config.minimum_number_of_calls, 5);
    assert_eq!(config.wait_duration_in_open_state.wait(1), Duration::from_secs(2));
    assert_eq!(inventory.state(), State::Closed);

    let catalog = registries.circuit_breakers.find("catalog").unwrap();
    assert_eq!(catalog.config().failure_rate_threshold, 50.0);
    assert_eq!(catalog.config().sliding_window_size, 10);

    let limiter = registries.rate_limiters.find("partner_api").unwrap();
    assert_eq!(limiter.config().limit_for_period, 5);
    assert_eq!(limiter.config().timeout_duration, Duration::ZERO);

    let db = registries.bulkheads.find("db").unwrap();
    assert_eq!(db.config().max_concurrent_calls, 3);
    assert_eq!(db.config().max_wait_duration, Duration::from_millis(50));

    let fetch = registries.retries.find("fetch").unwrap();
    assert_eq!(fetch.config().max_attempts, 4);
}

#[test]
fn test_instances_created_later_use_the_file_default() {
    let file = write_settings(SETTINGS);
    let settings = Settings::from_file(file.path()).unwrap();
    let registries = Registries::from_settings(&settings).unwrap();

    let adhoc = registries.circuit_breakers.get_or_create("adhoc").unwrap();
    assert_eq!(adhoc.config().sliding_window_size, 10);
    assert_eq!(adhoc.config().minimum_number_of_calls, 5);
}

#[test]
fn test_missing_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let err = Settings::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, BulwarkError::Read { .. }));
    assert_eq!(err.exit_code(), EXIT_FATAL);
}

#[test]
fn test_invalid_instance_fails_at_load() {
    let file = write_settings("[bulkhead.instances.db]\nmax_concurrent_calls = 0\n");
    let settings = Settings::from_file(file.path()).unwrap();
    let err = Registries::from_settings(&settings).unwrap_err();

    assert!(matches!(err, BulwarkError::Resilience { section: "bulkhead", .. }));
    assert_eq!(err.exit_code(), EXIT_INVALID_CONFIG);
}

#[test]
fn test_settings_file_round_trip() {
    let settings = Settings::from_toml(SETTINGS).unwrap();
    let file = write_settings(&settings.to_toml().unwrap());
    assert_eq!(Settings::from_file(file.path()).unwrap(), settings);
}
