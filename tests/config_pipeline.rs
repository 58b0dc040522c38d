//! Config file and grid CSV through to tables, estimate and a simulated run.

use holo_daq::config::HoloConfig;
use holo_daq::control::control_channel;
use holo_daq::estimator::estimate_runtime;
use holo_daq::hardware::mock::{MockConnector, MOCK_LASER_PORT, MOCK_SHUTTER_PORT, MOCK_STAGE_PORT};
use holo_daq::raster::PixelGrid;
use holo_daq::session::Session;
use holo_daq::HoloError;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::broadcast;

fn config_file(scan_rules: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[application]
log_level = "debug"

[devices.stage]
port = "{MOCK_STAGE_PORT}"

[devices.shutter]
port = "{MOCK_SHUTTER_PORT}"

[devices.laser]
port = "{MOCK_LASER_PORT}"

[laser]
max_power_mw = 6.0

[scan]
film_width_m = 0.004
film_height_m = 0.003
{scan_rules}
"#
    )
    .unwrap();
    file
}

fn grid_file(csv: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(csv.as_bytes()).unwrap();
    file
}

#[test]
fn test_estimate_from_files() {
    let config = HoloConfig::load_from(
        config_file(r#"exposure_rules = ["[255,256):1.0", "[100,101):0.5"]"#).path(),
    )
    .unwrap();
    let grid = PixelGrid::from_csv_path(grid_file("0,255,0,100\n0,0,0,0\n255,0,0,0\n").path()).unwrap();
    let map = config.exposure_map().unwrap();

    let estimate = estimate_runtime(&grid, &map.exposure, config.geometry().unwrap(), config.scan.unit_rate);

    assert!((estimate.seconds - 8.5).abs() < 1e-9, "{}", estimate.seconds);
    assert_eq!(estimate.exposed_pixels, 3);
}

#[test]
fn test_power_rules_are_clamped_to_the_laser_ceiling() {
    let config = HoloConfig::load_from(
        config_file(
            r#"exposure_rules = ["[0,256):1.0"]
power_rules = ["[0,128):4.0", "[128,256):9.0"]"#,
        )
        .path(),
    )
    .unwrap();
    let map = config.exposure_map().unwrap();
    assert_eq!(map.power_for(10), 4.0);
    assert_eq!(map.power_for(200), 6.0);
}

#[test]
fn test_malformed_rule_fails_before_any_session() {
    let config =
        HoloConfig::load_from(config_file(r#"exposure_rules = ["[0,300):1.0"]"#).path()).unwrap();
    let err = config.exposure_map().unwrap_err();
    assert!(matches!(err, HoloError::MalformedRange { ref line, .. } if line == "[0,300):1.0"));
}

#[test]
fn test_ragged_csv_is_rejected() {
    let err = PixelGrid::from_csv_path(grid_file("1,2,3\n4,5\n").path()).unwrap_err();
    assert!(matches!(err, HoloError::InvalidGrid(_)));
}

#[tokio::test(start_paused = true)]
async fn test_configured_session_runs_on_the_mock_rig() {
    let config = HoloConfig::load_from(
        config_file(
            r#"exposure_rules = ["[128,256):0.5"]
power_rules = ["[0,256):3.0"]"#,
        )
        .path(),
    )
    .unwrap();
    let grid = PixelGrid::from_csv_path(grid_file("0,200\n200,0\n").path()).unwrap();
    let connector = MockConnector::rig();

    let session = Session::new(
        config.session_config().unwrap(),
        Arc::new(connector.clone()),
        Arc::new(grid),
        Arc::new(config.exposure_map().unwrap()),
    );
    let (events, _rx) = broadcast::channel(64);
    let (_handle, mut control) = control_channel();
    let outcome = session.run(&mut control, events).await;

    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(outcome.report().exposures, 2);
    let laser = connector.commands(MOCK_LASER_PORT);
    let primed = laser.iter().position(|c| c.starts_with("P=")).unwrap();
    assert_eq!(laser[primed..primed + 2], ["P=3.00", "L=1"]);
}
