use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use feedwatch::config::ServiceConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FEEDWATCH_CONFIG",
        "BACKEND_URL",
        "FEEDWATCH_API_TOKEN",
        "FEEDWATCH_WS_URL",
        "FEEDWATCH_FRAME_INTERVAL_MS",
        "FEEDWATCH_LOCAL_DEVICE",
        "FEEDWATCH_MAX_READ_FAILURES",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ServiceConfig::load().expect("load config");
    assert_eq!(cfg.backend.url, "http://localhost:8000");
    assert!(cfg.backend.token.is_none());
    assert_eq!(cfg.sampling.interval, Duration::from_secs(1));
    assert_eq!(cfg.sampling.tick, Duration::from_millis(10));
    assert_eq!(cfg.sampling.read_retry_delay, Duration::from_secs(1));
    assert_eq!(cfg.sampling.max_read_failures, None);
    assert_eq!(cfg.sampling.jpeg_quality, 80);
    assert_eq!(cfg.sampling.local_device, "/dev/video0");
    assert_eq!(cfg.supervisor_stop_timeout, Duration::from_secs(5));
    assert_eq!(cfg.notifications.poll_interval, Duration::from_millis(100));
    assert_eq!(cfg.router.url, "ws://localhost:8000/ws");
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "backend": { "url": "http://detector:9000/", "token": "file-token", "timeout_ms": 2500 },
            "sampling": {
                "interval_ms": 500,
                "max_read_failures": 10,
                "jpeg_quality": 65,
                "local_device": "/dev/video2"
            },
            "supervisor": { "stop_timeout_ms": 2000 },
            "notifications": { "poll_interval_ms": 50 },
            "router": { "url": "ws://detector:9000/ws", "reconnect_delay_ms": 1000 }
        }"#,
    );

    std::env::set_var("FEEDWATCH_CONFIG", file.path());
    std::env::set_var("FEEDWATCH_API_TOKEN", "env-token");
    std::env::set_var("FEEDWATCH_FRAME_INTERVAL_MS", "250");
    std::env::set_var("FEEDWATCH_MAX_READ_FAILURES", "0");

    let cfg = ServiceConfig::load().expect("load config");

    assert_eq!(cfg.backend.url, "http://detector:9000");
    assert_eq!(cfg.backend.token.as_deref(), Some("env-token"));
    assert_eq!(cfg.backend.timeout, Duration::from_millis(2500));
    assert_eq!(cfg.sampling.interval, Duration::from_millis(250));
    assert_eq!(cfg.sampling.max_read_failures, None);
    assert_eq!(cfg.sampling.jpeg_quality, 65);
    assert_eq!(cfg.sampling.local_device, "/dev/video2");
    assert_eq!(cfg.supervisor_config().stop_timeout, Duration::from_secs(2));
    assert_eq!(cfg.queue_config().poll_interval, Duration::from_millis(50));
    assert_eq!(cfg.router.reconnect_delay, Duration::from_secs(1));

    let policy = cfg.read_policy();
    assert_eq!(policy.max_read_failures, None);
    assert_eq!(cfg.sampler_config().interval, Duration::from_millis(250));
    assert_eq!(cfg.capture_config().local_device, "/dev/video2");

    clear_env();
}

#[test]
fn read_failure_cap_from_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FEEDWATCH_MAX_READ_FAILURES", "5");
    let cfg = ServiceConfig::load().expect("load config");
    assert_eq!(cfg.read_policy().max_read_failures, Some(5));

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FEEDWATCH_FRAME_INTERVAL_MS", "soon");
    assert!(ServiceConfig::load().is_err());
    std::env::set_var("FEEDWATCH_FRAME_INTERVAL_MS", "0");
    assert!(ServiceConfig::load().is_err());
    clear_env();

    std::env::set_var("BACKEND_URL", "not a url");
    assert!(ServiceConfig::load().is_err());
    clear_env();

    std::env::set_var("FEEDWATCH_WS_URL", "http://localhost:8000/ws");
    let err = ServiceConfig::load().unwrap_err();
    assert!(err.to_string().contains("router url"), "{err}");
    std::env::set_var("FEEDWATCH_WS_URL", "wss://localhost:8000/ws");
    let err = ServiceConfig::load().unwrap_err();
    assert!(err.to_string().contains("must use one of: ws"), "{err}");
    std::env::set_var("FEEDWATCH_WS_URL", "ws://10.0.0.5:8000/ws");
    assert_eq!(ServiceConfig::load().unwrap().router.url, "ws://10.0.0.5:8000/ws");
    clear_env();

    let file = write_config(r#"{ "sampling": { "jpeg_quality": 0 } }"#);
    std::env::set_var("FEEDWATCH_CONFIG", file.path());
    assert!(ServiceConfig::load().is_err());
    clear_env();
}

#[test]
fn unreadable_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config("{ not json");
    std::env::set_var("FEEDWATCH_CONFIG", file.path());
    let err = ServiceConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"), "{err}");

    std::env::set_var("FEEDWATCH_CONFIG", "/nonexistent/feedwatch.json");
    let err = ServiceConfig::load().unwrap_err();
    assert!(err.to_string().contains("failed to read config file"), "{err}");

    clear_env();
}
