use super::load::{default_config_path, resolve_config_path};
use super::schema::*;
use std::sync::{Mutex, OnceLock};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
}

struct EnvGuard {
    key: &'static str,
    old: Option<std::ffi::OsString>,
}

impl EnvGuard {
    fn set(key: &'static str, val: &str) -> Self {
        let old = std::env::var_os(key);
        unsafe {
            std::env::set_var(key, val);
        }
        Self { key, old }
    }

    fn remove(key: &'static str) -> Self {
        let old = std::env::var_os(key);
        unsafe {
            std::env::remove_var(key);
        }
        Self { key, old }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match self.old.take() {
            Some(v) => unsafe {
                std::env::set_var(self.key, v);
            },
            None => unsafe {
                std::env::remove_var(self.key);
            },
        }
    }
}

#[test]
fn resolve_config_path_prefers_wavecast_config_path() {
    let _lock = env_lock();
    let _g1 = EnvGuard::set("WAVECAST_CONFIG_PATH", "/tmp/wavecast-test-config.toml");
    assert_eq!(
        resolve_config_path().unwrap(),
        std::path::PathBuf::from("/tmp/wavecast-test-config.toml")
    );
}

#[test]
fn default_config_path_prefers_xdg_config_home() {
    let _lock = env_lock();
    let _g1 = EnvGuard::set("XDG_CONFIG_HOME", "/tmp/xdg-config-home");
    let _g2 = EnvGuard::set("HOME", "/tmp/home-should-not-win");

    let p = default_config_path().unwrap();
    assert_eq!(
        p,
        std::path::PathBuf::from("/tmp/xdg-config-home")
            .join("wavecast")
            .join("config.toml")
    );
}

#[test]
fn default_config_path_falls_back_to_home_dot_config() {
    let _lock = env_lock();
    let _g1 = EnvGuard::remove("XDG_CONFIG_HOME");
    let _g2 = EnvGuard::set("HOME", "/tmp/home-dir");

    let p = default_config_path().unwrap();
    assert_eq!(
        p,
        std::path::PathBuf::from("/tmp/home-dir")
            .join(".config")
            .join("wavecast")
            .join("config.toml")
    );
}

#[test]
fn settings_load_from_config_file() {
    let _lock = env_lock();

    let dir = tempfile::tempdir().unwrap();
    let cfg_path = dir.path().join("config.toml");
    std::fs::write(
        &cfg_path,
        r#"
[station]
name = "Night Shift FM"
description = "graveyard grooves"
bind = "127.0.0.1"
port = 8124
public = true

[library]
root = "/srv/music"
extensions = ["mp3", "flac"]

[broadcast]
capacity_bytes = 65536
pacing_window_secs = 5

[playback]
loop_catalog = false
"#,
    )
    .unwrap();

    let _g1 = EnvGuard::set("WAVECAST_CONFIG_PATH", cfg_path.to_str().unwrap());
    let _g2 = EnvGuard::remove("WAVECAST__STATION__PORT");

    let s = Settings::load().unwrap();
    assert_eq!(s.station.name, "Night Shift FM");
    assert_eq!(s.station.description, "graveyard grooves");
    assert_eq!(s.station.bind, "127.0.0.1");
    assert_eq!(s.station.port, 8124);
    assert!(s.station.public);
    assert_eq!(s.library.root, std::path::PathBuf::from("/srv/music"));
    assert_eq!(s.library.extensions, vec!["mp3".to_string(), "flac".to_string()]);
    assert_eq!(s.broadcast.capacity_bytes, 65536);
    assert_eq!(s.broadcast.pacing_window_secs, 5);
    assert!(!s.playback.loop_catalog);
}

#[test]
fn settings_env_overrides_config_file() {
    let _lock = env_lock();

    let dir = tempfile::tempdir().unwrap();
    let cfg_path = dir.path().join("config.toml");
    std::fs::write(
        &cfg_path,
        r#"
[station]
port = 8124
"#,
    )
    .unwrap();

    let _g1 = EnvGuard::set("WAVECAST_CONFIG_PATH", cfg_path.to_str().unwrap());
    let _g2 = EnvGuard::set("WAVECAST__STATION__PORT", "9000");

    let s = Settings::load().unwrap();
    assert_eq!(s.station.port, 9000);
}

#[test]
fn validate_rejects_zero_capacity_and_window() {
    let mut s = Settings::default();
    assert!(s.validate().is_ok());

    s.broadcast.capacity_bytes = 0;
    assert!(s.validate().is_err());

    s.broadcast.capacity_bytes = 1;
    s.broadcast.pacing_window_secs = 0;
    assert!(s.validate().is_err());

    s.broadcast.pacing_window_secs = 1;
    s.library.extensions.clear();
    assert!(s.validate().is_err());
}
