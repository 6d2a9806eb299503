use std::ffi::{OsStr, OsString};
use std::fs;
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use tempfile::TempDir;
use courier_config::Config;
use ortho_config::OrthoConfig;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

struct EnvOverride {
    key: &'static str,
    previous: Option<OsString>,
    guard: Option<MutexGuard<'static, ()>>,
}

impl EnvOverride {
    fn set_var(key: &'static str, value: &OsStr) -> Self {
        let guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        let previous = std::env::var_os(key);
        // Environment mutation is `unsafe` in edition 2024; the override is
        // undone in `Drop` while the mutex is still held.
        unsafe { std::env::set_var(key, value) };
        Self {
            key,
            previous,
            guard: Some(guard),
        }
    }
}

impl Drop for EnvOverride {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => unsafe { std::env::set_var(self.key, value) },
            None => unsafe { std::env::remove_var(self.key) },
        }
        drop(self.guard.take());
    }
}

#[test]
fn malformed_config_file_fails_loading() {
    let temp_dir = TempDir::new().expect("create temp dir");
    let path = temp_dir.path().join("courier.toml");
    fs::write(&path, r#"display_name = "svc" rpc_timeout_ms = "#).expect("write config");

    let args = vec![
        OsString::from("courierd"),
        OsString::from("--config-path"),
        path.into_os_string(),
    ];

    assert!(Config::load_from_iter(args).is_err());
}

#[test]
fn non_numeric_timeout_from_environment_fails_loading() {
    let _env = EnvOverride::set_var("COURIER_RPC_TIMEOUT_MS", OsStr::new("soon"));

    let args = vec![
        OsString::from("courierd"),
        OsString::from("--display-name"),
        OsString::from("svc"),
    ];

    assert!(Config::load_from_iter(args).is_err());
}

#[test]
fn loaded_config_with_bad_broker_uri_fails_validation() {
    let _env = EnvOverride::set_var("COURIER_AMQP_URI", OsStr::new("redis://localhost"));

    let args = vec![
        OsString::from("courierd"),
        OsString::from("--display-name"),
        OsString::from("svc"),
    ];

    let config = Config::load_from_iter(args).expect("config should load");
    assert!(config.validate().is_err());
}
