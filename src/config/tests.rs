//! Config module tests

use super::*;
use crate::message::QoS;
use pretty_assertions::assert_eq;

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("VIBE_RULE_TEST_UNSET");
    let result = substitute_env_vars("value = \"${VIBE_RULE_TEST_UNSET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"fallback\"");

    std::env::set_var("VIBE_RULE_TEST_SET", "from-env");
    let result = substitute_env_vars("value = \"${VIBE_RULE_TEST_SET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"from-env\"");
    std::env::remove_var("VIBE_RULE_TEST_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("VIBE_RULE_TEST_MISSING");
    let result = substitute_env_vars("value = \"${VIBE_RULE_TEST_MISSING}\"").unwrap();
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.node.name, "vibe-rule");
    assert_eq!(config.defaults.client, "baetyl-broker");
    assert_eq!(config.adapter.capacity, 1024);
    assert_eq!(config.adapter.submit, SubmitMode::Block);
    assert_eq!(config.function.timeout, Duration::from_secs(30));
    assert!(!config.metrics.enabled);
    assert!(config.clients.is_empty());
    assert!(config.rules.is_empty());
}

#[test]
fn test_parse_minimal_config() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.log.level, "info");
    assert!(config.broker.is_none());
}

#[test]
fn test_parse_full_config() {
    let toml = r##"
[log]
level = "debug"

[node]
name = "edge-1"

[function]
address = "http://127.0.0.1:50010"
timeout = "3s"

[adapter]
capacity = 16
submit = "timeout"
submit_timeout = "250ms"

[[clients]]
name = "cloud"
kind = "mqtt"
address = "ssl://cloud.example.com:8883"
ca = "/certs/ca.pem"
keepalive = "10s"

[[clients]]
name = "web"
kind = "http"
address = "http://127.0.0.1:8080"

[[rules]]
name = "up"
source = { topic = "group/+/in", qos = 1 }
target = { client = "cloud", topic = "cloud/$node/out", qos = 1 }
function = { name = "transform" }
ack = "delivered"

[[rules]]
name = "hook"
source = { topic = "hook/#" }
target = { client = "web", path = "/api/hook", method = "put" }
"##;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.node.name, "edge-1");
    assert_eq!(config.function.address.as_deref(), Some("http://127.0.0.1:50010"));
    assert_eq!(config.function.timeout, Duration::from_secs(3));
    assert_eq!(config.adapter.submit, SubmitMode::Timeout);
    assert_eq!(config.adapter.submit_timeout, Duration::from_millis(250));

    assert_eq!(config.clients.len(), 2);
    assert_eq!(config.clients[0].kind, ClientKind::Mqtt);
    let cloud: MqttClientConfig = config.clients[0].parse().unwrap();
    assert_eq!(cloud.keepalive, Duration::from_secs(10));
    assert_eq!(cloud.tls.ca.as_deref(), Some("/certs/ca.pem"));

    let up = &config.rules[0];
    assert_eq!(up.source.client, "baetyl-broker");
    assert_eq!(up.source.qos, QoS::AtLeastOnce);
    assert_eq!(up.function.as_ref().map(|f| f.name.as_str()), Some("transform"));
    assert_eq!(up.ack, AckMode::Delivered);

    let hook = &config.rules[1];
    assert_eq!(hook.ack, AckMode::Forwarded);
    let target = hook.target.as_ref().unwrap();
    assert_eq!(target.path, "/api/hook");
    assert_eq!(target.method, "put");
    assert_eq!(target.qos, QoS::AtMostOnce);
}

#[test]
fn test_default_method_is_post() {
    let toml = r#"
[[rules]]
name = "r"
source = { topic = "a" }
target = { client = "web", topic = "b" }
"#;
    let config = Config::parse(toml).unwrap();
    assert_eq!(config.rules[0].target.as_ref().unwrap().method, "POST");
}

#[test]
fn test_invalid_qos() {
    let toml = r#"
[[rules]]
name = "r"
source = { topic = "a", qos = 2 }
"#;
    assert!(matches!(Config::parse(toml), Err(ConfigError::Parse(_))));
}

#[test]
fn test_duplicate_rule_name() {
    let toml = r#"
[[rules]]
name = "r"
source = { topic = "a" }

[[rules]]
name = "r"
source = { topic = "b" }
"#;
    let err = Config::parse(toml).unwrap_err();
    assert!(err.to_string().contains("duplicate rule name 'r'"));
}

#[test]
fn test_duplicate_client_name() {
    let toml = r#"
[[clients]]
name = "c"
kind = "mqtt"
address = "tcp://a:1883"

[[clients]]
name = "c"
kind = "http"
address = "http://b"
"#;
    let err = Config::parse(toml).unwrap_err();
    assert!(err.to_string().contains("duplicate client name 'c'"));
}

#[test]
fn test_zero_capacity_rejected() {
    let toml = r#"
[adapter]
capacity = 0
"#;
    assert!(matches!(
        Config::parse(toml),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_broker_section_becomes_default_client() {
    let toml = r#"
[defaults]
client = "local"

[broker]
address = "tcp://127.0.0.1:1883"
username = "rule"
ca = "/certs/ca.pem"
"#;
    let config = Config::parse(toml).unwrap();
    assert_eq!(config.clients.len(), 1);

    let broker = &config.clients[0];
    assert_eq!(broker.name, "local");
    assert_eq!(broker.kind, ClientKind::Mqtt);

    let mqtt: MqttClientConfig = broker.parse().unwrap();
    assert_eq!(mqtt.address, "tcp://127.0.0.1:1883");
    assert_eq!(mqtt.username.as_deref(), Some("rule"));
    assert_eq!(mqtt.tls.ca.as_deref(), Some("/certs/ca.pem"));
    assert_eq!(mqtt.tls.cert, None);
}

#[test]
fn test_broker_section_does_not_replace_explicit_client() {
    let toml = r#"
[broker]
address = "tcp://127.0.0.1:1883"

[[clients]]
name = "baetyl-broker"
kind = "mqtt"
address = "tcp://10.0.0.1:1883"
"#;
    let config = Config::parse(toml).unwrap();
    assert_eq!(config.clients.len(), 1);
    let mqtt: MqttClientConfig = config.clients[0].parse().unwrap();
    assert_eq!(mqtt.address, "tcp://10.0.0.1:1883");
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rule.toml");

    std::env::set_var("VIBE_RULE_TEST_NODE", "edge-42");
    std::fs::write(
        &path,
        r#"
[node]
name = "${VIBE_RULE_TEST_NODE}"

[adapter]
capacity = ${VIBE_RULE_TEST_CAPACITY:-64}

[[clients]]
name = "ingress"
kind = "http-server"
port = 8080

[[rules]]
name = "r1"
source = { client = "ingress" }
target = { topic = "out", qos = 1 }
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    std::env::remove_var("VIBE_RULE_TEST_NODE");

    assert_eq!(config.node.name, "edge-42");
    assert_eq!(config.adapter.capacity, 64);
    assert_eq!(config.clients[0].kind, ClientKind::HttpServer);
    let server: HttpServerConfig = config.clients[0].parse().unwrap();
    assert_eq!(server.port, 8080);
    assert_eq!(server.host, "0.0.0.0");
    assert_eq!(config.rules[0].target.as_ref().unwrap().client, "baetyl-broker");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.node.name, "vibe-rule");
    assert_eq!(config.adapter.capacity, 1024);
}
