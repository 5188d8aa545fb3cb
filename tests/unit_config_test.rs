// tests/unit_config_test.rs

use fabricd::config::Config;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn test_defaults_without_sections() {
    let file = write_config("");
    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.log_level, "info");
    assert_eq!(config.protocol.address, "127.0.0.1:32274");
    assert_eq!(config.executor.nworkers, 5);
    assert_eq!(config.executor.shutdown_timeout, Duration::from_secs(30));
    assert_eq!(config.sharding.mysqldump_program, "/usr/bin/mysqldump");
    assert!(config.sharding.shard_busy_wait);
    assert_eq!(config.servers.connections, 4);
}

#[test]
fn test_sections_override_defaults() {
    let file = write_config(
        r#"
log_level = "debug"

[storage]
address = "meta.internal:3306"
user = "store"
password = "hunter2"

[protocol]
address = "0.0.0.0:9001"

[executor]
nworkers = 12
shutdown_timeout = "5s"

[sharding]
shard_busy_wait = false

[groups]
catchup_timeout = "750ms"

[servers]
user = "admin"
connections = 2
"#,
    );
    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.storage.address, "meta.internal:3306");
    assert_eq!(config.storage.password, "hunter2");
    assert_eq!(config.protocol.address, "0.0.0.0:9001");
    assert_eq!(config.executor.nworkers, 12);
    assert_eq!(config.executor.shutdown_timeout, Duration::from_secs(5));
    assert!(!config.sharding.shard_busy_wait);
    assert_eq!(config.groups.catchup_timeout, Duration::from_millis(750));
    assert_eq!(config.servers.user, "admin");
    assert_eq!(config.servers.connections, 2);
}

#[test]
fn test_validation_rejects_broken_values() {
    let zero_workers = write_config("[executor]\nnworkers = 0\n");
    let err = Config::from_file(zero_workers.path().to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("nworkers"));

    let bad_address = write_config("[protocol]\naddress = \"not-an-address\"\n");
    let err = Config::from_file(bad_address.path().to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("host:port"));
}

#[test]
fn test_missing_file_is_an_error() {
    assert!(Config::from_file("/nonexistent/fabric.toml").is_err());
}
