use courier::config::{ConfigError, ConfigLoader, RateLimitFailurePolicy, StoreBackend};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const TEST_KEY: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("COURIER_"))
        .collect();
    unsafe {
        for key in keys {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn empty_dir_loader() -> (TempDir, ConfigLoader) {
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    (temp_dir, loader)
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let (_dir, loader) = empty_dir_loader();
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.queue_backend, StoreBackend::Database);
    assert_eq!(cfg.rate_limit.failure_policy, RateLimitFailurePolicy::Open);
    assert_eq!(cfg.delivery.default_http_timeout_seconds, 30);
    assert_eq!(cfg.delivery.max_http_timeout_seconds, 60);
    assert!(cfg.crypto_key.is_none());
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "COURIER_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.staging",
        "COURIER_API_BIND_ADDR=192.168.0.10:5000\nCOURIER_WORKER_COUNT=4\n",
    );
    write_env_file(
        &temp_dir,
        ".env.staging.local",
        "COURIER_API_BIND_ADDR=10.0.0.5:6000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        &format!(
            "COURIER_PROFILE=staging\nCOURIER_API_BIND_ADDR=127.0.0.1:4000\nCOURIER_CRYPTO_KEY={TEST_KEY}\n"
        ),
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "staging");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.delivery.worker_count, 4);
    assert_eq!(cfg.crypto_key.as_deref().map(<[u8]>::len), Some(32));
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "COURIER_API_BIND_ADDR=127.0.0.1:3000\nCOURIER_RATE_LIMIT_FAILURE_POLICY=open\n",
    );

    unsafe {
        env::set_var("COURIER_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("COURIER_RATE_LIMIT_FAILURE_POLICY", "closed");
        env::set_var("COURIER_QUEUE_BACKEND", "memory");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.rate_limit.failure_policy, RateLimitFailurePolicy::Closed);
    assert_eq!(cfg.queue_backend, StoreBackend::Memory);

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("COURIER_API_BIND_ADDR", "not-an-addr");
    }
    let (_dir, loader) = empty_dir_loader();
    let err = loader.load().expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}

#[test]
fn non_local_profile_requires_crypto_key() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("COURIER_PROFILE", "production");
    }
    let (_dir, loader) = empty_dir_loader();
    let err = loader.load().expect_err("missing key should fail");
    assert!(matches!(err, ConfigError::MissingCryptoKey));

    clear_env();
}

#[test]
fn unparseable_numbers_name_the_variable() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("COURIER_WORKER_COUNT", "many");
    }
    let (_dir, loader) = empty_dir_loader();
    let err = loader.load().expect_err("bad worker count should fail");
    match err {
        ConfigError::InvalidValue { key, value } => {
            assert_eq!(key, "COURIER_WORKER_COUNT");
            assert_eq!(value, "many");
        }
        other => panic!("unexpected error: {other}"),
    }

    clear_env();
}

#[test]
fn lease_timeout_must_exceed_http_timeout() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("COURIER_QUEUE_LEASE_TIMEOUT_SECONDS", "30");
        env::set_var("COURIER_DISPATCH_MAX_TIMEOUT_SECONDS", "60");
    }
    let (_dir, loader) = empty_dir_loader();
    let err = loader.load().expect_err("short lease should fail");
    assert!(matches!(err, ConfigError::LeaseShorterThanTimeout { .. }));

    clear_env();
}
