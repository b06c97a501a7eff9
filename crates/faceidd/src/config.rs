use faceid_core::{default_model_dir, MatchAlgorithm, ModelPaths, PipelineSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("can't read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration: defaults, then an optional TOML file named by
/// `FACEID_CONFIG`, then `FACEID_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen host (default: localhost).
    pub host: String,
    /// Listen port (default: 3003).
    pub port: u16,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Reference images, one identity per file stem.
    pub gallery_dir: PathBuf,
    /// Detect faces on reference images instead of using whole images.
    pub run_detector: bool,
    pub pipeline: PipelineSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3003,
            model_dir: default_model_dir(),
            gallery_dir: PathBuf::from("dict"),
            run_detector: false,
            pipeline: PipelineSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACEID_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Overlay `FACEID_*` values from `lookup`. Unparseable values are
    /// logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("FACEID_HOST") {
            self.host = host;
        }
        if let Some(dir) = lookup("FACEID_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("FACEID_GALLERY_DIR") {
            self.gallery_dir = PathBuf::from(dir);
        }
        override_parsed(&lookup, "FACEID_PORT", &mut self.port);
        override_parsed(&lookup, "FACEID_RUN_DETECTOR", &mut self.run_detector);

        let pipeline = &mut self.pipeline;
        override_parsed(&lookup, "FACEID_DETECTION_THRESHOLD", &mut pipeline.detection_threshold);
        override_parsed(&lookup, "FACEID_MATCH_THRESHOLD", &mut pipeline.match_threshold);
        override_parsed(&lookup, "FACEID_ROI_SCALE", &mut pipeline.roi_scale);
        override_parsed::<MatchAlgorithm>(&lookup, "FACEID_MATCH_ALGO", &mut pipeline.match_algo);
        override_parsed(&lookup, "FACEID_MAX_FACES", &mut pipeline.max_faces);
    }

    /// Address string for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }
}

fn override_parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(err) => tracing::warn!(key, value = %raw, error = %err, "ignoring invalid config value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr(), "localhost:3003");
        assert_eq!(config.gallery_dir, PathBuf::from("dict"));
        assert_eq!(config.pipeline.match_algo, MatchAlgorithm::Optimal);
        assert_eq!(config.pipeline.max_faces, 16);
        assert!(!config.pipeline.allow_grow);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[
            ("FACEID_PORT", "8080"),
            ("FACEID_HOST", "0.0.0.0"),
            ("FACEID_MATCH_ALGO", "MIN_DIST"),
            ("FACEID_MATCH_THRESHOLD", "0.45"),
            ("FACEID_RUN_DETECTOR", "true"),
            ("FACEID_MODEL_DIR", "/opt/models"),
        ]));
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.pipeline.match_algo, MatchAlgorithm::Greedy);
        assert_eq!(config.pipeline.match_threshold, 0.45);
        assert!(config.run_detector);
        assert_eq!(config.model_paths().detector, PathBuf::from("/opt/models/det_10g.onnx"));
    }

    #[test]
    fn test_invalid_env_value_keeps_previous() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[("FACEID_PORT", "eighty"), ("FACEID_MAX_FACES", "-1")]));
        assert_eq!(config.port, 3003);
        assert_eq!(config.pipeline.max_faces, 16);
    }

    #[test]
    fn test_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faceid.toml");
        std::fs::write(
            &path,
            r#"
port = 9000
gallery_dir = "/srv/faces"

[pipeline]
match_algo = "MIN_DIST"
roi_scale = 1.3
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.gallery_dir, PathBuf::from("/srv/faces"));
        assert_eq!(config.pipeline.match_algo, MatchAlgorithm::Greedy);
        assert_eq!(config.pipeline.roi_scale, 1.3);
        assert_eq!(config.pipeline.match_threshold, 0.6);
    }

    #[test]
    fn test_toml_algorithm_name_ignores_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faceid.toml");
        std::fs::write(&path, "[pipeline]\nmatch_algo = \"min_dist\"\n").unwrap();
        assert_eq!(Config::from_file(&path).unwrap().pipeline.match_algo, MatchAlgorithm::Greedy);

        std::fs::write(&path, "[pipeline]\nmatch_algo = \"fastest\"\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_bad_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
