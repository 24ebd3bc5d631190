use control_plane::{ConfigError, SystemConfigLoader};

#[test]
fn defaults_apply_when_keys_are_absent() {
    let config = SystemConfigLoader::from_str("").expect("config");
    assert_eq!(config.get_u64("upstream.timeout_seconds"), 30);
    assert_eq!(config.get_u64("upstream.max_retries"), 2);
    assert_eq!(config.get_u64("policy_cache.ttl_seconds"), 10);
    assert_eq!(config.get_string("storage.sqlite_path"), "warden.sqlite");
    assert!(!config.get_bool("proxy.forward_authorization"));
    assert_eq!(
        config.get_list("proxy.blocked_headers"),
        vec!["cookie".to_string(), "set-cookie".to_string()]
    );
}

#[test]
fn file_values_override_defaults() {
    let input = r#"
        [upstream]
        timeout_seconds = 5
        max_retries = 0

        [proxy]
        forward_authorization = true
        blocked_headers = "cookie, set-cookie, x-internal-debug"
    "#;
    let config = SystemConfigLoader::from_str(input).expect("config");
    assert_eq!(config.get_u64("upstream.timeout_seconds"), 5);
    assert_eq!(config.get_u64("upstream.max_retries"), 0);
    assert!(config.get_bool("proxy.forward_authorization"));
    assert_eq!(
        config.get_list("proxy.blocked_headers"),
        vec![
            "cookie".to_string(),
            "set-cookie".to_string(),
            "x-internal-debug".to_string()
        ]
    );
}

#[test]
fn unknown_keys_are_rejected() {
    let result = SystemConfigLoader::from_str("[upstream]\nmystery = 1\n");
    assert!(matches!(result, Err(ConfigError::UnknownKey(key)) if key == "upstream.mystery"));
}

#[test]
fn type_mismatches_are_rejected() {
    let result = SystemConfigLoader::from_str("[upstream]\ntimeout_seconds = \"fast\"\n");
    assert!(matches!(result, Err(ConfigError::TypeMismatch(key, _)) if key == "upstream.timeout_seconds"));
}

#[test]
fn malformed_toml_is_a_parse_error() {
    assert!(matches!(
        SystemConfigLoader::from_str("upstream = ["),
        Err(ConfigError::Parse(_))
    ));
}
