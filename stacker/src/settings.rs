//! Run configuration.
//!
//! Settings are stored as a flat JSON object. Loading is deliberately
//! forgiving: each field is extracted independently and a missing or
//! unparsable field falls back to its default without failing the rest of
//! the file.

use log::debug;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::Path;

/// All tunables of a detection run.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// Slowest motion hypothesis, arcsec/min.
    pub motion_min: f64,
    /// Fastest motion hypothesis, arcsec/min.
    pub motion_max: f64,
    /// Position-angle sweep start, degrees.
    pub pa_min: f64,
    /// Position-angle sweep end, degrees.
    pub pa_max: f64,
    /// Tracking tolerance used to derive sweep step sizes, pixels.
    pub trk_err: f64,
    /// Positional tolerance for tracklet and mover matching, pixels.
    pub pos_err: f64,
    /// Aperture radius, pixels.
    pub aperture: f64,
    /// Base count of threshold-exceeding pixels a detection must reach;
    /// the track length in pixels is added on top.
    pub tcount_base: usize,
    /// Detection threshold above background, in stack sigmas.
    pub sigma1: f64,
    /// Star-mask threshold of the superstack, in stack sigmas.
    pub sigma2: f64,
    /// Lower stretch bound of raw frames, in frame sigmas below background.
    /// Also the lower-clip multiplier of the second histogram pass.
    pub black_fits: f64,
    /// Upper stretch bound of raw frames, in frame sigmas above background.
    pub white_fits: f64,
    /// Display black level of stacked images, in stack sigmas.
    pub black_hist: f64,
    /// Display white level of stacked images, in stack sigmas.
    pub white_hist: f64,
    /// Apply the 3x3 Gaussian blur during preparation.
    pub blur: bool,
    /// Apply per-column de-lining during preparation.
    pub deline: bool,
    /// Synthesize a flat field from the frames and divide it out.
    pub flatten: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            motion_min: 0.3,
            motion_max: 5.0,
            pa_min: 0.0,
            pa_max: 360.0,
            trk_err: 1.0,
            pos_err: 2.0,
            aperture: 3.0,
            tcount_base: 4,
            sigma1: 4.0,
            sigma2: 6.0,
            black_fits: 3.0,
            white_fits: 6.0,
            black_hist: 1.0,
            white_hist: 6.0,
            blur: false,
            deline: false,
            flatten: false,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, falling back to defaults per field.
    ///
    /// An unreadable or unparsable file yields the full defaults; within a
    /// parsed file every recognized field is applied independently.
    pub fn load(path: &Path) -> Self {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                debug!("settings file {}: {err}, using defaults", path.display());
                return Self::default();
            }
        };
        let root: Value = match serde_json::from_str(&text) {
            Ok(root) => root,
            Err(err) => {
                debug!("settings file {}: {err}, using defaults", path.display());
                return Self::default();
            }
        };
        Self::from_value(&root)
    }

    /// Apply recognized fields of a parsed JSON object over the defaults.
    pub fn from_value(root: &Value) -> Self {
        let defaults = Self::default();
        Self {
            motion_min: float_field(root, "motion_min", defaults.motion_min),
            motion_max: float_field(root, "motion_max", defaults.motion_max),
            pa_min: float_field(root, "pa_min", defaults.pa_min),
            pa_max: float_field(root, "pa_max", defaults.pa_max),
            trk_err: float_field(root, "trk_err", defaults.trk_err),
            pos_err: float_field(root, "pos_err", defaults.pos_err),
            aperture: float_field(root, "aperture", defaults.aperture),
            tcount_base: int_field(root, "tcount_base", defaults.tcount_base),
            sigma1: float_field(root, "sigma1", defaults.sigma1),
            sigma2: float_field(root, "sigma2", defaults.sigma2),
            black_fits: float_field(root, "black_fits", defaults.black_fits),
            white_fits: float_field(root, "white_fits", defaults.white_fits),
            black_hist: float_field(root, "black_hist", defaults.black_hist),
            white_hist: float_field(root, "white_hist", defaults.white_hist),
            blur: bool_field(root, "blur", defaults.blur),
            deline: bool_field(root, "deline", defaults.deline),
            flatten: bool_field(root, "flatten", defaults.flatten),
        }
    }

    /// Write the default settings as a JSON template.
    pub fn write_template(path: &Path) -> io::Result<()> {
        let text = serde_json::to_string_pretty(&Self::default())
            .expect("settings serialize to JSON");
        fs::write(path, text)
    }

    /// Position-angle sweep bounds in radians.
    pub fn pa_bounds_rad(&self) -> (f64, f64) {
        (self.pa_min.to_radians(), self.pa_max.to_radians())
    }
}

fn float_field(root: &Value, name: &str, default: f64) -> f64 {
    match root.get(name).and_then(Value::as_f64) {
        Some(value) => value,
        None => {
            debug!("settings field {name} missing or invalid, using {default}");
            default
        }
    }
}

fn int_field(root: &Value, name: &str, default: usize) -> usize {
    match root.get(name).and_then(Value::as_u64) {
        Some(value) => value as usize,
        None => {
            debug!("settings field {name} missing or invalid, using {default}");
            default
        }
    }
}

fn bool_field(root: &Value, name: &str, default: bool) -> bool {
    match root.get(name).and_then(Value::as_bool) {
        Some(value) => value,
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let root = json!({
            "motion_max": 2.5,
            "blur": true,
        });
        let settings = Settings::from_value(&root);
        assert_eq!(settings.motion_max, 2.5);
        assert!(settings.blur);
        assert_eq!(settings.motion_min, Settings::default().motion_min);
        assert_eq!(settings.sigma1, Settings::default().sigma1);
    }

    #[test]
    fn test_bad_field_type_falls_back() {
        let root = json!({
            "sigma1": "five",
            "tcount_base": -3,
        });
        let settings = Settings::from_value(&root);
        assert_eq!(settings.sigma1, Settings::default().sigma1);
        assert_eq!(settings.tcount_base, Settings::default().tcount_base);
    }

    #[test]
    fn test_template_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        Settings::write_template(&path).unwrap();
        let loaded = Settings::load(&path);
        assert_eq!(loaded.motion_min, Settings::default().motion_min);
        assert_eq!(loaded.tcount_base, Settings::default().tcount_base);
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/settings.json"));
        assert_eq!(settings.aperture, Settings::default().aperture);
    }

    #[test]
    fn test_pa_bounds_in_radians() {
        let settings = Settings::default();
        let (lo, hi) = settings.pa_bounds_rad();
        assert_eq!(lo, 0.0);
        assert!((hi - std::f64::consts::TAU).abs() < 1e-12);
    }
}
