//! Weight arbiter (C9): resolves effective pool weights each scheduler tick
//! from the file-based control plane, falling back to static config.
//!
//! Grounded on `dpmpv2.py::read_weight_override`/`read_oracle_mode`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightSource {
    Config,
    Slider,
    Oracle,
    OracleFallback,
}

#[derive(Debug, Clone, Copy)]
pub struct EffectiveWeights {
    pub pool_a: u32,
    pub pool_b: u32,
    pub source: WeightSource,
}

#[derive(Debug, Deserialize)]
struct WeightsOverrideFile {
    #[serde(rename = "poolA_weight")]
    pool_a_weight: i64,
    #[serde(rename = "poolB_weight")]
    pool_b_weight: i64,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OracleModeFile {
    #[serde(default)]
    oracle_active: bool,
}

pub struct WeightArbiter {
    control_plane_dir: PathBuf,
    config_pool_a_weight: u32,
    config_pool_b_weight: u32,
}

impl WeightArbiter {
    pub fn new(control_plane_dir: impl Into<PathBuf>, config_pool_a_weight: u32, config_pool_b_weight: u32) -> Self {
        Self {
            control_plane_dir: control_plane_dir.into(),
            config_pool_a_weight,
            config_pool_b_weight,
        }
    }

    fn weights_override_path(&self) -> PathBuf {
        self.control_plane_dir.join("weights_override.json")
    }

    fn oracle_mode_path(&self) -> PathBuf {
        self.control_plane_dir.join("oracle_mode.json")
    }

    /// Priority: `weights_override.json` (valid, non-negative, not both zero)
    /// wins; otherwise fall back to the static config weights.
    pub fn resolve(&self) -> EffectiveWeights {
        if let Some((wa, wb, source)) = read_weight_override(&self.weights_override_path()) {
            return EffectiveWeights { pool_a: wa, pool_b: wb, source };
        }
        EffectiveWeights {
            pool_a: self.config_pool_a_weight,
            pool_b: self.config_pool_b_weight,
            source: WeightSource::Config,
        }
    }

    /// Whether the oracle worker is currently allowed to own the override
    /// file. Priority: `oracle_mode.json` if present and parseable, else the
    /// config `auto_balance` default.
    pub fn oracle_active(&self, config_auto_balance: bool) -> bool {
        read_oracle_mode(&self.oracle_mode_path(), config_auto_balance)
    }
}

fn read_weight_override(path: &Path) -> Option<(u32, u32, WeightSource)> {
    let bytes = std::fs::read(path).ok()?;
    let parsed: WeightsOverrideFile = serde_json::from_slice(&bytes).ok()?;
    if parsed.pool_a_weight < 0
        || parsed.pool_b_weight < 0
        || (parsed.pool_a_weight == 0 && parsed.pool_b_weight == 0)
    {
        return None;
    }
    let source = match parsed.source.as_deref() {
        Some("oracle") => WeightSource::Oracle,
        Some("oracle_fallback") => WeightSource::OracleFallback,
        _ => WeightSource::Slider,
    };
    Some((parsed.pool_a_weight as u32, parsed.pool_b_weight as u32, source))
}

fn read_oracle_mode(path: &Path, config_auto_balance: bool) -> bool {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice::<OracleModeFile>(&bytes)
            .map(|f| f.oracle_active)
            .unwrap_or(config_auto_balance),
        Err(_) => config_auto_balance,
    }
}

/// Delete `oracle_mode.json` if present. Called once at process start
/// (SPEC_FULL.md §6: the file is "deleted on process start").
pub fn reset_oracle_mode_on_startup(control_plane_dir: &Path) {
    let path = control_plane_dir.join("oracle_mode.json");
    match std::fs::remove_file(&path) {
        Ok(()) => log::info!("event=oracle_mode_reset path={}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("event=oracle_mode_reset_failed path={} err={e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct TempDir(PathBuf);
    impl TempDir {
        fn new() -> Self {
            let mut p = std::env::temp_dir();
            p.push(format!("dualstratum-weight-test-{}-{}", std::process::id(), rand_suffix()));
            std::fs::create_dir_all(&p).unwrap();
            Self(p)
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64
    }

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn falls_back_to_config_when_override_absent() {
        let dir = TempDir::new();
        let arbiter = WeightArbiter::new(&dir.0, 30, 70);
        let w = arbiter.resolve();
        assert_eq!((w.pool_a, w.pool_b), (30, 70));
        assert_eq!(w.source, WeightSource::Config);
    }

    #[test]
    fn override_file_wins_with_slider_source() {
        let dir = TempDir::new();
        write_file(&dir.0, "weights_override.json", r#"{"poolA_weight":80,"poolB_weight":20,"source":"slider"}"#);
        let arbiter = WeightArbiter::new(&dir.0, 50, 50);
        let w = arbiter.resolve();
        assert_eq!((w.pool_a, w.pool_b), (80, 20));
        assert_eq!(w.source, WeightSource::Slider);
    }

    #[test]
    fn invalid_override_falls_back() {
        let dir = TempDir::new();
        write_file(&dir.0, "weights_override.json", r#"{"poolA_weight":0,"poolB_weight":0}"#);
        let arbiter = WeightArbiter::new(&dir.0, 50, 50);
        let w = arbiter.resolve();
        assert_eq!(w.source, WeightSource::Config);
    }

    #[test]
    fn oracle_mode_defaults_to_config_auto_balance() {
        let dir = TempDir::new();
        let arbiter = WeightArbiter::new(&dir.0, 50, 50);
        assert!(!arbiter.oracle_active(false));
        assert!(arbiter.oracle_active(true));
    }

    #[test]
    fn oracle_mode_file_overrides_config() {
        let dir = TempDir::new();
        write_file(&dir.0, "oracle_mode.json", r#"{"oracle_active": true}"#);
        let arbiter = WeightArbiter::new(&dir.0, 50, 50);
        assert!(arbiter.oracle_active(false));
    }
}
