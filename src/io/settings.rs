//! Settings file loader.
//!
//! The settings format is the classical SLAM YAML key/value file
//! (`Camera.fx: 517.3` etc.), including the OpenCV `%YAML:1.0` header that
//! standard YAML parsers reject; directive lines are stripped before
//! parsing. Missing or invalid required keys are construction-time errors:
//! nothing here can fail once streaming has started.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use yaml_rust::{Yaml, YamlLoader};

use crate::frame::CameraModel;
use crate::tracking::TrackerConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Distortion `[k1, k2, p1, p2, k3]`.
    pub dist: [f64; 5],
    /// `fx * baseline`.
    pub bf: f64,
    pub fps: f64,
    /// Color channel order of the incoming images: true = RGB, false = BGR.
    pub rgb: bool,
    /// Close/far threshold in baseline units (scaled to meters via `bf/fx`).
    pub th_depth: f64,
    /// Divisor turning raw depth values into meters.
    pub depth_map_factor: f64,

    pub orb_n_features: i32,
    pub orb_scale_factor: f64,
    pub orb_n_levels: usize,
    pub orb_ini_th_fast: i32,
    pub orb_min_th_fast: i32,

    /// Manhattan orthogonality tolerance (degrees) and plane association
    /// offset threshold (meters).
    pub manhattan_ver_th: f64,
    pub manhattan_dis_th: f64,
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading settings file {}", path.as_ref().display()))?;
        Self::from_yaml_str(&text)
            .with_context(|| format!("parsing settings file {}", path.as_ref().display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        // OpenCV FileStorage headers are not valid YAML directives.
        let cleaned: String = text
            .lines()
            .filter(|line| !line.trim_start().starts_with('%'))
            .collect::<Vec<_>>()
            .join("\n");
        let docs = YamlLoader::load_from_str(&cleaned).context("invalid YAML")?;
        let doc = docs.first().context("empty settings document")?;

        let settings = Self {
            fx: required_f64(doc, "Camera.fx")?,
            fy: required_f64(doc, "Camera.fy")?,
            cx: required_f64(doc, "Camera.cx")?,
            cy: required_f64(doc, "Camera.cy")?,
            dist: [
                required_f64(doc, "Camera.k1")?,
                required_f64(doc, "Camera.k2")?,
                required_f64(doc, "Camera.p1")?,
                required_f64(doc, "Camera.p2")?,
                required_f64(doc, "Camera.k3")?,
            ],
            bf: required_f64(doc, "Camera.bf")?,
            fps: required_f64(doc, "Camera.fps")?,
            rgb: required_i64(doc, "Camera.RGB")? != 0,
            th_depth: required_f64(doc, "ThDepth")?,
            depth_map_factor: required_f64(doc, "DepthMapFactor")?,
            orb_n_features: required_i64(doc, "ORBextractor.nFeatures")? as i32,
            orb_scale_factor: required_f64(doc, "ORBextractor.scaleFactor")?,
            orb_n_levels: required_i64(doc, "ORBextractor.nLevels")? as usize,
            orb_ini_th_fast: required_i64(doc, "ORBextractor.iniThFAST")? as i32,
            orb_min_th_fast: required_i64(doc, "ORBextractor.minThFAST")? as i32,
            manhattan_ver_th: required_f64(doc, "Manhattan.verTh")?,
            manhattan_dis_th: required_f64(doc, "Manhattan.disTh")?,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.fx <= 0.0 || self.fy <= 0.0 {
            bail!("invalid calibration: focal lengths must be positive");
        }
        if self.bf <= 0.0 {
            bail!("invalid calibration: Camera.bf must be positive");
        }
        if self.depth_map_factor.abs() < 1e-9 {
            bail!("DepthMapFactor must be non-zero");
        }
        if self.orb_n_levels == 0 || self.orb_scale_factor <= 1.0 {
            bail!("invalid ORB pyramid configuration");
        }
        Ok(())
    }

    /// Close/far depth threshold in meters.
    pub fn th_depth_meters(&self) -> f64 {
        self.bf / self.fx * self.th_depth
    }

    pub fn camera_model(&self, width: u32, height: u32) -> CameraModel {
        CameraModel::new(
            self.fx,
            self.fy,
            self.cx,
            self.cy,
            self.dist,
            self.bf,
            width,
            height,
        )
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            min_frames: 0,
            max_frames: self.fps.max(1.0) as u64,
            th_depth: self.th_depth_meters(),
            manhattan_ver_th_deg: self.manhattan_ver_th,
            manhattan_dis_th: self.manhattan_dis_th,
            ..TrackerConfig::default()
        }
    }
}

fn lookup<'a>(doc: &'a Yaml, key: &str) -> Result<&'a Yaml> {
    let value = &doc[key];
    if value.is_badvalue() {
        bail!("missing required settings key '{}'", key);
    }
    Ok(value)
}

fn required_f64(doc: &Yaml, key: &str) -> Result<f64> {
    let value = lookup(doc, key)?;
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|v| v as f64))
        .with_context(|| format!("settings key '{}' is not a number", key))
}

fn required_i64(doc: &Yaml, key: &str) -> Result<i64> {
    lookup(doc, key)?
        .as_i64()
        .with_context(|| format!("settings key '{}' is not an integer", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"%YAML:1.0

Camera.fx: 517.306408
Camera.fy: 516.469215
Camera.cx: 318.643040
Camera.cy: 255.313989

Camera.k1: 0.262383
Camera.k2: -0.953104
Camera.p1: -0.005358
Camera.p2: 0.002628
Camera.k3: 1.163314

Camera.bf: 40.0
Camera.fps: 30.0
Camera.RGB: 1

ThDepth: 40.0
DepthMapFactor: 5000.0

ORBextractor.nFeatures: 1000
ORBextractor.scaleFactor: 1.2
ORBextractor.nLevels: 8
ORBextractor.iniThFAST: 20
ORBextractor.minThFAST: 7

Manhattan.verTh: 5.0
Manhattan.disTh: 0.08
"#;

    #[test]
    fn test_loads_full_settings() {
        let s = Settings::from_yaml_str(FULL).unwrap();
        assert!((s.fx - 517.306408).abs() < 1e-9);
        assert!(s.rgb);
        assert_eq!(s.orb_n_levels, 8);
        assert!((s.manhattan_dis_th - 0.08).abs() < 1e-12);
        // ThDepth is given in baseline units.
        let th = s.th_depth_meters();
        assert!((th - 40.0 * 40.0 / 517.306408).abs() < 1e-9);
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let broken = FULL.replace("Camera.fps: 30.0\n", "");
        let err = Settings::from_yaml_str(&broken).unwrap_err();
        assert!(format!("{:#}", err).contains("Camera.fps"));
    }

    #[test]
    fn test_invalid_calibration_is_fatal() {
        let broken = FULL.replace("Camera.fx: 517.306408", "Camera.fx: -1.0");
        assert!(Settings::from_yaml_str(&broken).is_err());
    }

    #[test]
    fn test_integer_values_accepted_for_floats() {
        let tweaked = FULL.replace("Camera.bf: 40.0", "Camera.bf: 40");
        let s = Settings::from_yaml_str(&tweaked).unwrap();
        assert_eq!(s.bf, 40.0);
    }
}
