use std::fs;
use std::time::Duration;

use taskboard::config::{Config, ViewKind, CONFIG_FILE_NAME};
use taskboard::error::Error;
use taskboard::task::UserId;

#[test]
fn config_defaults_when_missing() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let config = Config::load_or_default(&dir.path().join(CONFIG_FILE_NAME))?;

    assert_eq!(config, Config::default());
    assert_eq!(config.user.user_id(), None);
    assert_eq!(config.feed.channel_capacity, 256);
    assert_eq!(config.feed.reconnect_backoff_ms, 500);
    assert_eq!(config.feed.max_reconnect_attempts, 5);
    assert!(config.store.optimistic);
    assert_eq!(config.store.buffer_limit, 1024);
    assert_eq!(config.views.default_kind(), ViewKind::All);
    Ok(())
}

#[test]
fn config_overrides_from_toml() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join(CONFIG_FILE_NAME);
    let toml = r#"
[user]
id = "u1"
email = "amy@example.com"

[feed]
reconnect_backoff_ms = 250
max_reconnect_attempts = 2

[store]
optimistic = false

[views]
default = "mine"
"#;
    fs::write(&config_path, toml)?;

    let config = Config::load(&config_path)?;
    assert_eq!(config.user.user_id(), Some(UserId::new("u1")));
    assert_eq!(config.feed.reconnect_backoff(3), Duration::from_millis(750));
    assert_eq!(config.feed.max_reconnect_attempts, 2);
    assert_eq!(config.feed.channel_capacity, 256);
    assert!(!config.store.optimistic);
    assert_eq!(config.views.default_kind(), ViewKind::Mine);
    Ok(())
}

#[test]
fn config_rejects_out_of_range_values() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join(CONFIG_FILE_NAME);

    for body in [
        "[feed]\nchannel_capacity = 0\n",
        "[feed]\nreconnect_backoff_ms = 600000\n",
        "[views]\ndefault = \"kanban\"\n",
    ] {
        fs::write(&config_path, body)?;
        let err = Config::load_or_default(&config_path).expect_err(body);
        assert!(matches!(err, Error::InvalidConfig(_)), "{body}: {err}");
    }

    fs::write(&config_path, "[feed\n")?;
    assert!(matches!(
        Config::load_or_default(&config_path),
        Err(Error::TomlParse(_))
    ));
    Ok(())
}

#[test]
fn config_save_round_trips() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join(CONFIG_FILE_NAME);

    let mut config = Config::default();
    config.user.id = Some("u9".to_string());
    config.store.buffer_limit = 16;
    config.save(&config_path)?;

    assert_eq!(Config::load(&config_path)?, config);
    Ok(())
}
