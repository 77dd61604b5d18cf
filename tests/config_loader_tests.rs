use odata_sync::config::{ConfigError, ConfigLoader, LogFormat};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

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
    for (key, _) in env::vars() {
        if key.starts_with("SAPSYNC_") {
            unsafe {
                env::remove_var(key);
            }
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.logging.format, LogFormat::Json);
    assert!(cfg.logging.dedup);
    assert_eq!(cfg.odata.timeout_ms, 30_000);
    assert_eq!(cfg.odata.retries, 3);
    assert_eq!(cfg.database.port, 5432);
    assert_eq!(cfg.sync.page_size, 1_000);
    assert_eq!(cfg.sync.batch_size, 500);
    assert!(cfg.sync.null_if_empty);
    assert_eq!(cfg.sync.jobs_dir, PathBuf::from("jobs"));
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "SAPSYNC_PAGE_SIZE=100\nSAPSYNC_PG_HOST=db-base\n");
    write_env_file(&temp_dir, ".env.test", "SAPSYNC_PAGE_SIZE=200\n");
    write_env_file(&temp_dir, ".env.test.local", "SAPSYNC_PAGE_SIZE=300\n");

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "SAPSYNC_PROFILE=test\nSAPSYNC_PAGE_SIZE=150\nSAPSYNC_LOG_FORMAT=human\n",
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.sync.page_size, 300);
    assert_eq!(cfg.database.host, "db-base");
    assert_eq!(cfg.logging.format, LogFormat::Pretty);
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
        "SAPSYNC_BATCH_SIZE=50\nSAPSYNC_NULL_IF_EMPTY=true\n",
    );

    unsafe {
        env::set_var("SAPSYNC_BATCH_SIZE", "75");
        env::set_var("SAPSYNC_NULL_IF_EMPTY", "no");
        env::set_var("SAPSYNC_ODATA_USER", "SYNC_USER");
        env::set_var("SAPSYNC_ODATA_PASSWORD", "secret");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.sync.batch_size, 75);
    assert!(!cfg.sync.null_if_empty);
    assert_eq!(cfg.odata.user, "SYNC_USER");
    assert!(!cfg.redacted_json().unwrap().contains("secret"));

    clear_env();
}

#[test]
fn invalid_log_format_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("SAPSYNC_LOG_FORMAT", "xml");
    }
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("invalid log format should fail");
    assert!(matches!(err, ConfigError::InvalidLogFormat { .. }));
    assert!(format!("{}", err).contains("invalid log format"));

    clear_env();
}

#[test]
fn out_of_range_page_size_returns_error() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "SAPSYNC_PAGE_SIZE=0\n");

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("zero page size should fail");
    assert!(matches!(err, ConfigError::InvalidPageSize { value: 0 }));

    clear_env();
}
