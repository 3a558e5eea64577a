//! S5/S6: the file-based weight control plane (slider override + oracle
//! mode handoff), exercised against a real temp directory rather than the
//! network.

use dualstratum::weight::{WeightArbiter, WeightSource};
use std::io::Write;
use std::path::PathBuf;

struct TempDir(PathBuf);

impl TempDir {
    fn new(tag: &str) -> Self {
        let mut p = std::env::temp_dir();
        p.push(format!("dualstratum-it-{tag}-{}-{}", std::process::id(), nanos()));
        std::fs::create_dir_all(&p).unwrap();
        Self(p)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn nanos() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
}

fn write_file(dir: &PathBuf, name: &str, contents: &str) {
    let mut f = std::fs::File::create(dir.join(name)).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
}

/// S5: `weights_override.json` written by the slider takes effect on the
/// next resolve, overriding the static config weights.
#[test]
fn slider_override_takes_priority_over_config() {
    let dir = TempDir::new("s5");
    let arbiter = WeightArbiter::new(&dir.0, 50, 50);

    let before = arbiter.resolve();
    assert_eq!((before.pool_a, before.pool_b), (50, 50));
    assert_eq!(before.source, WeightSource::Config);

    write_file(&dir.0, "weights_override.json", r#"{"poolA_weight":80,"poolB_weight":20,"source":"slider"}"#);

    let after = arbiter.resolve();
    assert_eq!((after.pool_a, after.pool_b), (80, 20));
    assert_eq!(after.source, WeightSource::Slider);
}

/// S6: with `oracle_mode.json` absent, the config's `auto_balance` decides
/// who owns the override file; flipping the mode file to `false` hands
/// ownership back to the slider even with `auto_balance=true` in config.
#[test]
fn oracle_mode_file_overrides_config_auto_balance() {
    let dir = TempDir::new("s6");
    let arbiter = WeightArbiter::new(&dir.0, 50, 50);

    // No mode file yet: config decides.
    assert!(arbiter.oracle_active(true));
    assert!(!arbiter.oracle_active(false));

    // Oracle writes a fresh weights file while active.
    write_file(&dir.0, "weights_override.json", r#"{"poolA_weight":62,"poolB_weight":38,"source":"oracle","ts":"2026-01-01 00:00:00"}"#);
    let resolved = arbiter.resolve();
    assert_eq!(resolved.source, WeightSource::Oracle);
    assert_eq!((resolved.pool_a, resolved.pool_b), (62, 38));

    // Flipping the mode file to false hands the file back to the slider,
    // even though config still says auto_balance=true.
    write_file(&dir.0, "oracle_mode.json", r#"{"oracle_active": false}"#);
    assert!(!arbiter.oracle_active(true));

    write_file(&dir.0, "weights_override.json", r#"{"poolA_weight":40,"poolB_weight":60,"source":"slider"}"#);
    let resolved = arbiter.resolve();
    assert_eq!(resolved.source, WeightSource::Slider);
}

/// `reset_oracle_mode_on_startup` clears any previous mode file so a
/// restarted proxy falls back to config `auto_balance` until the dashboard
/// reasserts a mode.
#[test]
fn startup_reset_clears_oracle_mode_file() {
    let dir = TempDir::new("startup-reset");
    write_file(&dir.0, "oracle_mode.json", r#"{"oracle_active": true}"#);
    dualstratum::weight::reset_oracle_mode_on_startup(&dir.0);
    assert!(!dir.0.join("oracle_mode.json").exists());
}
