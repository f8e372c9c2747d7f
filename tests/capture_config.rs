use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use vision_capture::config::CaptureConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAPTURE_CONFIG",
        "CAPTURE_DEVICE",
        "CAPTURE_WIDTH",
        "CAPTURE_HEIGHT",
        "CAPTURE_STOP_GRACE_MS",
        "CAPTURE_SNAPSHOT_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "device": "/dev/video2",
        "resolution": { "width": 800, "height": 600 },
        "stop_grace_ms": 200,
        "stats": { "interval_secs": 2 },
        "snapshot": { "path": "last.png" }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("CAPTURE_CONFIG", file.path());
    std::env::set_var("CAPTURE_DEVICE", "stub://pattern");
    std::env::set_var("CAPTURE_HEIGHT", "450");

    let cfg = CaptureConfig::load().expect("load config");

    assert_eq!(cfg.source.device, "stub://pattern");
    assert_eq!(cfg.source.width, 800);
    assert_eq!(cfg.source.height, 450);
    assert_eq!(cfg.source.stop_grace, Duration::from_millis(200));
    assert_eq!(cfg.stats_interval, Duration::from_secs(2));
    assert_eq!(cfg.snapshot_path, Some(PathBuf::from("last.png")));

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    file.write_all(
        br#"
device = "stub://fixed"

[resolution]
width = 320
height = 240
"#,
    )
    .expect("write config");

    let cfg = CaptureConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.source.device, "stub://fixed");
    assert_eq!((cfg.source.width, cfg.source.height), (320, 240));
    assert_eq!(cfg.source.stop_grace, Duration::from_millis(100));

    clear_env();
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = CaptureConfig::load().expect("load defaults");
    assert_eq!(cfg.source.device, "0");
    assert_eq!((cfg.source.width, cfg.source.height), (640, 480));
}

#[test]
fn rejects_bad_env_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAPTURE_WIDTH", "wide");
    assert!(CaptureConfig::load().is_err());
    clear_env();

    std::env::set_var("CAPTURE_WIDTH", "0");
    assert!(CaptureConfig::load().is_err());
    clear_env();

    std::env::set_var("CAPTURE_STOP_GRACE_MS", "60000");
    assert!(CaptureConfig::load().is_err());
    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let path = PathBuf::from("/nonexistent/capture.json");
    let err = CaptureConfig::load_from(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
}
