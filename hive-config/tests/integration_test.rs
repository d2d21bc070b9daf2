//! Integration tests for hive-config

use hive_config::*;
use std::io::Write;
use std::time::Duration;
use temp_env::with_vars;

#[test]
fn test_default_config_validation() {
    let config = HiveConfig::default();
    assert!(config.validate_all().is_ok());
}

#[test]
fn test_config_loader_from_env() {
    let vars = vec![
        ("HIVE_TRANSPORT", Some("http")),
        ("HIVE_HTTP_ADDRESS", Some("127.0.0.1:9123")),
        ("HIVE_MAX_MESSAGE_SIZE", Some("4096")),
        ("HIVE_RATE_LIMIT", Some("0")),
        ("HIVE_REQUEST_TIMEOUT_MS", Some("1500")),
        ("HIVE_HEARTBEAT_INTERVAL_MS", Some("0")),
        ("HIVE_ALLOWED_PROCESSES", Some("hive-agent, hive-coordinator")),
        ("HIVE_LOG_LEVEL", Some("debug")),
    ];

    with_vars(vars, || {
        let loader = ConfigLoader::new();
        let config = loader.from_env().unwrap();

        assert_eq!(config.transport.kind, TransportKind::Http);
        assert_eq!(config.transport.http_address, "127.0.0.1:9123");
        assert_eq!(config.security.max_message_size, 4096);
        assert_eq!(config.security.rate_limit_per_second, None);
        assert_eq!(
            config.security.allowed_processes,
            vec!["hive-agent".to_string(), "hive-coordinator".to_string()]
        );
        assert_eq!(config.client.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.client.heartbeat_interval, None);
        assert_eq!(config.logging.level, LogLevel::Debug);
    });
}

#[test]
fn test_env_auth_without_token_fails_validation() {
    with_vars(
        vec![("HIVE_ENABLE_AUTH", Some("true")), ("HIVE_AUTH_TOKEN", None::<&str>)],
        || {
            let result = ConfigLoader::new().from_env();
            assert!(matches!(result, Err(ConfigError::DomainError { .. })));
        },
    );
}

#[test]
fn test_invalid_env_value() {
    with_vars(vec![("HIVE_RECONNECT_ATTEMPTS", Some("many"))], || {
        let result = ConfigLoader::new().from_env();
        assert!(matches!(result, Err(ConfigError::EnvError(_))));
    });
}

#[test]
fn test_custom_prefix() {
    with_vars(vec![("SWARM_LOG_FORMAT", Some("json"))], || {
        let config = ConfigLoader::with_prefix("SWARM").from_env().unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
    });
}

#[test]
fn test_yaml_config_serialization() {
    let yaml = HiveConfig::generate_sample();
    let parsed: HiveConfig = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(parsed, HiveConfig::default());
    assert!(parsed.validate_all().is_ok());
}

#[test]
fn test_comprehensive_config_file() {
    let yaml = r#"
transport:
  kind: http
  http_address: "127.0.0.1:47800"

security:
  enable_authentication: true
  auth_token: "swarm-secret"
  allowed_processes: ["hive-agent"]
  max_message_size: 65536
  rate_limit_per_second: 20
  rate_limit_burst: 40

server:
  handshake_timeout: 2000

client:
  reconnect_attempts: 3
  reconnect_delay: 200
  heartbeat_interval: 10000
  request_timeout: 5000
  capabilities: ["execute", "status"]

logging:
  level: warn
  format: json
  directives: ["hive_ipc=debug"]
"#;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    // Private prefix keeps parallel env-var tests from leaking in
    let config = ConfigLoader::with_prefix("HIVE_FILE_TEST").from_file(file.path()).unwrap();

    assert_eq!(config.transport.http_address, "127.0.0.1:47800");
    assert!(config.security.enable_authentication);
    assert_eq!(config.security.rate_limit_burst, Some(40));
    assert_eq!(config.server.handshake_timeout, Duration::from_secs(2));
    assert_eq!(config.client.reconnect_attempts, 3);
    assert_eq!(config.client.heartbeat_interval, Some(Duration::from_secs(10)));
    assert_eq!(config.client.capabilities, vec!["execute", "status"]);
    assert_eq!(config.logging.filter_directives(), "warn,hive_ipc=debug");
}

#[test]
fn test_empty_file_uses_defaults() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let config = ConfigLoader::with_prefix("HIVE_FILE_TEST")
        .load(Some(file.path()))
        .unwrap();
    assert_eq!(config.security.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
}

#[test]
fn test_missing_file() {
    let result = ConfigLoader::new().from_file("/nonexistent/hive.yaml");
    assert!(matches!(result, Err(ConfigError::FileReadError(_))));
}
