use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use carla_datagen::config::CaptureConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAPTURE_CONFIG",
        "CAPTURE_HOST",
        "CAPTURE_PORT",
        "CAPTURE_OUTPUT_DIR",
        "CAPTURE_FPS",
        "CAPTURE_MAPS",
        "CAPTURE_RIG",
        "CAPTURE_SEED",
        "CAPTURE_MAX_TICKS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "simulator": { "host": "stub://bench", "port": 2010, "connect_timeout_secs": 2.5 },
        "vehicle_name": "mustang",
        "fps": 10.0,
        "maps": ["Town02"],
        "start_pose": {
            "location": { "x": 10.0, "y": 20.0, "z": 0.5 },
            "rotation": { "pitch": 0.0, "yaw": 90.0, "roll": 0.0 }
        },
        "rig": { "preset": "stereo" },
        "camera": { "image_width": 1280, "image_height": 720, "fov": 110.0 },
        "output": { "root": "/srv/capture", "ground_truth_filename": "traj" },
        "frame_timeout_secs": 0.25,
        "waypoint_distance": 2.0
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("CAPTURE_CONFIG", file.path());
    std::env::set_var("CAPTURE_MAPS", "Town03, Town04");
    std::env::set_var("CAPTURE_SEED", "99");
    std::env::set_var("CAPTURE_OUTPUT_DIR", "/tmp/override");

    let cfg = CaptureConfig::load(None).expect("load config");

    assert_eq!(cfg.simulator.host, "stub://bench");
    assert_eq!(cfg.simulator.port, 2010);
    assert_eq!(cfg.simulator.connect_timeout, Duration::from_millis(2500));
    assert_eq!(cfg.vehicle_name, "mustang");
    assert_eq!(cfg.fps, 10.0);
    assert_eq!(cfg.maps, vec!["Town03", "Town04"]);
    assert_eq!(cfg.start_pose.location.y, 20.0);
    assert_eq!(cfg.rig.names().collect::<Vec<_>>(), vec!["cam1", "cam2"]);
    assert_eq!(cfg.camera.image_width, 1280);
    assert_eq!(cfg.camera.fov, 110.0);
    assert_eq!(cfg.output.root, PathBuf::from("/tmp/override"));
    assert_eq!(cfg.output.ground_truth_filename, "traj");
    assert_eq!(cfg.frame_timeout, Duration::from_millis(250));
    assert_eq!(cfg.waypoint_distance, 2.0);
    assert_eq!(cfg.seed, Some(99));
    assert_eq!(cfg.max_ticks, None);

    clear_env();
}

#[test]
fn explicit_path_wins_over_env_and_toml_is_detected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut toml_file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp toml");
    std::io::Write::write_all(
        &mut toml_file,
        b"fps = 20.0\nmaps = [\"Town10HD\"]\n\n[rig]\npreset = \"mvs\"\n",
    )
    .expect("write toml");
    std::env::set_var("CAPTURE_CONFIG", "/nonexistent/capture.json");

    let cfg = CaptureConfig::load(Some(toml_file.path())).expect("load config");
    assert_eq!(cfg.fps, 20.0);
    assert_eq!(cfg.maps, vec!["Town10HD"]);
    assert_eq!(cfg.rig.len(), 5);

    clear_env();
}

#[test]
fn env_rig_preset_and_tick_limit() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAPTURE_RIG", "mono_downward");
    std::env::set_var("CAPTURE_MAX_TICKS", "25");
    std::env::set_var("CAPTURE_FPS", "5");

    let cfg = CaptureConfig::load(None).expect("load config");
    assert_eq!(cfg.rig.len(), 1);
    assert_eq!(cfg.max_ticks, Some(25));
    assert!((cfg.delta_seconds() - 0.2).abs() < 1e-12);

    clear_env();
}

#[test]
fn rejects_invalid_env_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAPTURE_PORT", "not-a-port");
    assert!(CaptureConfig::load(None).is_err());
    clear_env();

    std::env::set_var("CAPTURE_RIG", "octocam");
    assert!(CaptureConfig::load(None).is_err());
    clear_env();

    std::env::set_var("CAPTURE_FPS", "0");
    assert!(CaptureConfig::load(None).is_err());
    clear_env();

    std::env::set_var("CAPTURE_MAPS", "Town01,../escape");
    assert!(CaptureConfig::load(None).is_err());
    clear_env();
}

#[test]
fn malformed_file_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ \"fps\": \"fast\" }").expect("write config");
    assert!(CaptureConfig::load(Some(file.path())).is_err());

    clear_env();
}
