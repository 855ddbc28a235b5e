use envertech_bridge::prelude::*;
use std::io::Write;
use std::net::Ipv4Addr;
use std::time::Duration;

fn write_config(yaml: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

fn load(yaml: &str) -> Config {
    let file = write_config(yaml);
    Config::new(file.path().to_string_lossy().into_owned()).unwrap()
}

#[test]
fn full_config_parses() {
    let config = load(
        r#"
loglevel: debug
inverters:
  - host: 192.168.1.50
    serial: "30800000"
  - enabled: false
    host: 192.168.1.51
    port: 15000
    serial: "3080ffff"
    poll_interval: 2
    receive_timeout: 30
discovery:
  bind_addresses: ["192.168.1.2"]
  timeout: 5
"#,
    );

    assert_eq!(config.loglevel(), "debug");
    assert_eq!(config.inverters.len(), 2);
    assert_eq!(config.enabled_inverters().count(), 1);

    let first = &config.inverters[0];
    assert_eq!(first.host(), "192.168.1.50");
    assert_eq!(first.port(), 14889);
    assert_eq!(first.serial().to_hex(), "30800000");
    assert_eq!(first.poll_interval(), Duration::from_secs(5));
    assert_eq!(first.receive_timeout(), Duration::from_secs(10));

    let second = &config.inverters[1];
    assert!(!second.enabled());
    assert_eq!(second.port(), 15000);
    assert_eq!(second.poll_interval(), Duration::from_secs(2));
    assert_eq!(second.receive_timeout(), Duration::from_secs(30));

    assert_eq!(
        config.discovery().bind_addresses(),
        &[Ipv4Addr::new(192, 168, 1, 2)]
    );
    assert_eq!(config.discovery().timeout(), Duration::from_secs(5));
}

#[test]
fn defaults_apply_to_a_minimal_config() {
    let config = load("inverters: []\n");

    assert_eq!(config.loglevel(), "info");
    assert!(config.inverters.is_empty());
    assert!(config.discovery().enabled());
    assert_eq!(config.discovery().bind_addresses(), &[Ipv4Addr::UNSPECIFIED]);
    assert_eq!(config.discovery().timeout(), Duration::from_secs(3));
}

#[test]
fn bad_serial_is_rejected() {
    let file = write_config(
        r#"
inverters:
  - host: 192.168.1.50
    serial: "3080"
"#,
    );
    assert!(Config::new(file.path().to_string_lossy().into_owned()).is_err());
}

#[test]
fn missing_file_is_an_error() {
    assert!(Config::new("/nonexistent/config.yaml".to_string()).is_err());
}
