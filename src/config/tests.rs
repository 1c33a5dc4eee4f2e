use std::env;
use std::fs;

use serial_test::serial;
use tempfile::TempDir;

use super::settings::{PartialSettings, Settings};
use super::{load_config, load_config_from};
use crate::transport::packet::QoS;
use crate::utils::error::MqttError;

/// Run `f` with a fresh temporary working directory, restoring the old one
/// afterwards.
fn in_temp_dir<R>(f: impl FnOnce(&TempDir) -> R) -> R {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");
    let result = f(&tmp);
    env::set_current_dir(orig).expect("restore cwd");
    result
}

fn valid_settings() -> Settings {
    let mut settings = Settings::default();
    settings.connection.server_uris = vec!["tcp://localhost:1883".into()];
    settings
}

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert!(settings.connection.server_uris.is_empty());
    assert!(settings.connection.client_id.starts_with("mqtt-engine-"));
    assert!(settings.connection.clean_session);
    assert_eq!(settings.connection.keep_alive_secs, 60);
    assert_eq!(settings.delivery.default_qos, 1);
    assert_eq!(settings.delivery.completion_timeout_ms, 5000);
    assert!(!settings.delivery.async_mode);
    assert_eq!(settings.delivery.max_attempts, 3);
    assert!(settings.reconnect.enabled);
    assert_eq!(settings.reconnect.max_attempts, None);
    assert_eq!(settings.dispatch.worker_pool_size, 4);
}

#[test]
fn default_client_ids_differ_between_instances() {
    assert_ne!(
        Settings::default().connection.client_id,
        Settings::default().connection.client_id
    );
}

#[test]
fn partial_settings_keep_unset_defaults() {
    let base = valid_settings();
    let merged = PartialSettings::default().merge_into(base.clone());
    assert_eq!(merged, base);
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    in_temp_dir(|_| {
        fs::create_dir_all("config").expect("create config dir");
        let toml = r#"
            [connection]
            server_uris = ["tcp://primary:1883", "tcp://backup:1883"]
            client_id = "plant-7"
            username = "svc"
            password = "secret"
            clean_session = false
            keep_alive_secs = 30

            [delivery]
            default_qos = 2
            completion_timeout_ms = 5000
            async = true

            [dispatch]
            worker_pool_size = 1
        "#;
        fs::write("config/default.toml", toml).expect("write config file");

        let cfg = load_config().expect("load_config failed");
        assert_eq!(
            cfg.connection.server_uris,
            vec!["tcp://primary:1883".to_string(), "tcp://backup:1883".to_string()]
        );
        assert_eq!(cfg.connection.client_id, "plant-7");
        assert_eq!(cfg.connection.username.as_deref(), Some("svc"));
        assert_eq!(cfg.connection.password.as_deref(), Some("secret"));
        assert!(!cfg.connection.clean_session);
        assert_eq!(cfg.connection.keep_alive_secs, 30);
        assert_eq!(cfg.default_qos().unwrap(), QoS::ExactlyOnce);
        assert!(cfg.delivery.async_mode);
        assert_eq!(cfg.dispatch.worker_pool_size, 1);
        // untouched sections keep their defaults
        assert_eq!(cfg.dispatch.queue_capacity, 64);
        assert!(cfg.reconnect.enabled);
        assert!(cfg.validate().is_ok());
    });
}

#[test]
#[serial]
fn environment_overrides_file() {
    in_temp_dir(|_| {
        fs::create_dir_all("config").expect("create config dir");
        fs::write(
            "config/default.toml",
            "[connection]\nclient_id = \"from-file\"\nkeep_alive_secs = 30\n",
        )
        .expect("write config file");

        temp_env::with_vars(
            [
                ("MQTT_ENGINE_CONNECTION__CLIENT_ID", Some("from-env")),
                (
                    "MQTT_ENGINE_CONNECTION__SERVER_URIS",
                    Some("tcp://a:1883,tcp://b:1884"),
                ),
                ("MQTT_ENGINE_DELIVERY__ASYNC", Some("true")),
                ("MQTT_ENGINE_RECONNECT__MAX_ATTEMPTS", Some("5")),
            ],
            || {
                let cfg = load_config().expect("load_config failed");
                assert_eq!(cfg.connection.client_id, "from-env");
                assert_eq!(cfg.connection.keep_alive_secs, 30);
                assert_eq!(
                    cfg.connection.server_uris,
                    vec!["tcp://a:1883".to_string(), "tcp://b:1884".to_string()]
                );
                assert!(cfg.delivery.async_mode);
                assert_eq!(cfg.reconnect.max_attempts, Some(5));
            },
        );
    });
}

#[test]
#[serial]
fn explicit_config_path_is_required() {
    in_temp_dir(|tmp| {
        let path = tmp.path().join("client.toml");
        assert!(load_config_from(&path).is_err());

        fs::write(&path, "[reconnect]\nenabled = false\n").expect("write config file");
        let cfg = load_config_from(&path).expect("load_config_from failed");
        assert!(!cfg.reconnect.enabled);
    });
}

#[test]
fn validation_requires_an_endpoint() {
    let settings = Settings::default();
    assert!(matches!(
        settings.validate(),
        Err(MqttError::Configuration(msg)) if msg.contains("server URI")
    ));
    assert!(valid_settings().validate().is_ok());
}

#[test]
fn validation_rejects_bad_values() {
    let cases: Vec<(&str, Box<dyn Fn(&mut Settings)>)> = vec![
        ("bad uri", Box::new(|s| s.connection.server_uris = vec!["localhost".into()])),
        ("long id", Box::new(|s| s.connection.client_id = "x".repeat(65))),
        (
            "empty id without clean session",
            Box::new(|s| {
                s.connection.client_id.clear();
                s.connection.clean_session = false;
            }),
        ),
        ("password alone", Box::new(|s| s.connection.password = Some("pw".into()))),
        ("qos 3", Box::new(|s| s.delivery.default_qos = 3)),
        ("zero attempts", Box::new(|s| s.delivery.max_attempts = 0)),
        ("zero retry interval", Box::new(|s| s.delivery.retry_interval_ms = 0)),
        ("shrinking backoff", Box::new(|s| s.reconnect.backoff_factor = 0.5)),
        ("zero reconnect cap", Box::new(|s| s.reconnect.max_attempts = Some(0))),
        ("no workers", Box::new(|s| s.dispatch.worker_pool_size = 0)),
        ("no queue", Box::new(|s| s.dispatch.queue_capacity = 0)),
        (
            "mixed memory and tcp",
            Box::new(|s| s.connection.server_uris.push("memory://test".into())),
        ),
    ];

    for (name, mutate) in cases {
        let mut settings = valid_settings();
        mutate(&mut settings);
        assert!(
            matches!(settings.validate(), Err(MqttError::Configuration(_))),
            "{name} should be rejected"
        );
    }
}

#[test]
fn validation_accepts_edge_values() {
    let mut settings = valid_settings();
    settings.connection.client_id = "x".repeat(64);
    settings.connection.keep_alive_secs = 0;
    settings.delivery.default_qos = 0;
    assert!(settings.validate().is_ok());

    settings.connection.client_id.clear();
    assert!(settings.validate().is_ok());
}
