// ABOUTME: Tests for configuration loading and validation
// ABOUTME: Verifies TOML parsing, env var overrides, and required field validation

use chatdesk::config::Config;
use serial_test::serial;
use std::io::Write;

fn clear_config_env_vars() {
    std::env::remove_var("HOMESERVER_URL");
    std::env::remove_var("MATRIX_USER_ID");
    std::env::remove_var("MATRIX_PASSWORD");
    std::env::remove_var("MATRIX_ACCESS_TOKEN");
    std::env::remove_var("MATRIX_DEVICE_NAME");
    std::env::remove_var("ACD_ADMINS");
    std::env::remove_var("ACD_SUPERVISORS");
    std::env::remove_var("ACD_COMMAND_PREFIX");
    std::env::remove_var("DATABASE_PATH");
    std::env::remove_var("PROVISIONING_PORT");
    std::env::remove_var("PROVISIONING_HOST");
    std::env::remove_var("PROVISIONING_API_KEY");
}

fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    (dir, path)
}

#[test]
#[serial]
fn config_loads_from_toml_file() {
    clear_config_env_vars();

    let (_dir, path) = write_config(
        r#"
[homeserver]
url = "https://matrix.example.com"
user_id = "@acd:example.com"
password = "secret123"

[acd]
admins = ["@boss:example.com"]
supervisors = ["@sup:example.com"]
command_prefix = "acd"

[distribution]
concurrency_cap = 2
default_max_wait_secs = 60

[provisioning]
port = 8080

[bridges.wa-main]
bot_user_id = "@whatsappbot:example.com"
user_prefix = "@wa_"
command_prefix = "!wa"
management_room = "!mgmt:example.com"
default_queue = "sales"
"#,
    );

    let config = Config::load_from(&path).unwrap();

    assert_eq!(config.homeserver.url, "https://matrix.example.com");
    assert_eq!(config.homeserver.password, Some("secret123".to_string()));
    assert_eq!(config.acd.admins, vec!["@boss:example.com"]);
    assert_eq!(config.provisioning.port, 8080);
    assert_eq!(config.distribution.concurrency_cap, 2);

    let engine_config = config.distribution_config();
    assert_eq!(engine_config.concurrency_cap, 2);
    assert_eq!(engine_config.default_max_wait_secs, 60);
    // Untouched fields keep their defaults.
    assert_eq!(engine_config.transfer_cooldown_secs, 300);

    let bridge = config.bridges.get("wa-main").unwrap();
    assert_eq!(bridge.user_prefix, "@wa_");
    assert_eq!(bridge.default_queue.as_deref(), Some("sales"));
}

#[test]
#[serial]
fn env_vars_override_file_values() {
    clear_config_env_vars();

    let (_dir, path) = write_config(
        r#"
[homeserver]
url = "https://original.example.com"
user_id = "@acd:example.com"
password = "secret"

[acd]
admins = ["@boss:example.com"]
"#,
    );

    std::env::set_var("HOMESERVER_URL", "https://override.example.com");
    std::env::set_var("ACD_ADMINS", "@a:example.com, @b:example.com");
    std::env::set_var("PROVISIONING_PORT", "19000");

    let config = Config::load_from(&path).unwrap();
    assert_eq!(config.homeserver.url, "https://override.example.com");
    assert_eq!(
        config.acd.admins,
        vec!["@a:example.com", "@b:example.com"]
    );
    assert_eq!(config.provisioning.port, 19000);

    clear_config_env_vars();
}

#[test]
#[serial]
fn missing_credentials_are_rejected() {
    clear_config_env_vars();

    let (_dir, path) = write_config(
        r#"
[homeserver]
url = "https://matrix.example.com"
user_id = "@acd:example.com"

[acd]
admins = ["@boss:example.com"]
"#,
    );

    let err = Config::load_from(&path).unwrap_err();
    assert!(err.to_string().contains("password"), "got: {err}");
}

#[test]
#[serial]
fn admins_are_required_and_validated() {
    clear_config_env_vars();

    let (_dir, path) = write_config(
        r#"
[homeserver]
url = "https://matrix.example.com"
user_id = "@acd:example.com"
password = "secret"
"#,
    );
    let err = Config::load_from(&path).unwrap_err();
    assert!(err.to_string().contains("acd.admins"), "got: {err}");

    let (_dir, path) = write_config(
        r#"
[homeserver]
url = "https://matrix.example.com"
user_id = "@acd:example.com"
password = "secret"

[acd]
admins = ["not-a-user-id"]
"#,
    );
    let err = Config::load_from(&path).unwrap_err();
    assert!(err.to_string().contains("Invalid Matrix user ID"), "got: {err}");
}

#[test]
#[serial]
fn bridge_sections_need_bot_and_prefix() {
    clear_config_env_vars();

    let (_dir, path) = write_config(
        r#"
[homeserver]
url = "https://matrix.example.com"
user_id = "@acd:example.com"
password = "secret"

[acd]
admins = ["@boss:example.com"]

[bridges.broken]
bot_user_id = ""
user_prefix = "@wa_"
command_prefix = "!wa"
management_room = "!mgmt:example.com"
"#,
    );
    let err = Config::load_from(&path).unwrap_err();
    assert!(err.to_string().contains("bridges.broken"), "got: {err}");
}
