use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config {} is missing required section `{section}`", path.display())]
    MissingSection { path: PathBuf, section: &'static str },

    #[error("invalid config value `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpeechConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Hop between frame starts, as a fraction of `window_size`.
    #[serde(default = "default_stride")]
    pub stride: f32,
    #[serde(default = "default_preemphasis")]
    pub preemphasis: f32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            window_size: default_window_size(),
            stride: default_stride(),
            preemphasis: default_preemphasis(),
        }
    }
}

/// Hyperparameters shared by the generator and the discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    #[serde(default = "default_kwidth")]
    pub kwidth: usize,
    #[serde(default = "default_ratio")]
    pub ratio: usize,
    #[serde(default = "default_l1_lambda")]
    pub l1_lambda: f64,
    #[serde(default = "default_leakiness")]
    pub leakiness: f64,
    #[serde(default)]
    pub noise_std: f64,
    #[serde(default = "default_noise_decay")]
    pub noise_decay: f64,
    #[serde(default)]
    pub noise_std_end: f64,
    #[serde(default = "default_denoise_every")]
    pub denoise_every: usize,
    pub g_enc_depths: Vec<usize>,
    pub d_num_fmaps: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataPaths {
    pub clean: PathBuf,
    pub noisy: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub train_paths: DataPaths,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_paths: Option<DataPaths>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdamConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_beta_1")]
    pub beta_1: f64,
    #[serde(default = "default_beta_2")]
    pub beta_2: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            beta_1: default_beta_1(),
            beta_2: default_beta_2(),
            epsilon: default_epsilon(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub generator: AdamConfig,
    #[serde(default)]
    pub discriminator: AdamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunningConfig {
    /// Per-replica batch size.
    pub batch_size: usize,
    pub num_epochs: usize,
    pub outdir: PathBuf,
    #[serde(default = "default_log_interval_steps")]
    pub log_interval_steps: usize,
    #[serde(default = "default_save_interval_steps")]
    pub save_interval_steps: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LearningConfig {
    pub dataset_config: DatasetConfig,
    #[serde(default)]
    pub optimizer_config: OptimizerConfig,
    pub running_config: RunningConfig,
}

/// The loaded YAML document. Immutable once [`Config::load`] returns.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub path: PathBuf,
    pub speech_config: SpeechConfig,
    pub model_config: ModelConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    learning_config: Option<LearningConfig>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    speech_config: Option<SpeechConfig>,
    #[serde(default)]
    model_config: Option<ModelConfig>,
    #[serde(default)]
    learning_config: Option<LearningConfig>,
}

impl Config {
    /// Loads and validates the document at `path`.
    ///
    /// With `learning` set, `learning_config` must be present; inference
    /// callers only need the speech and model sections.
    pub fn load(path: impl AsRef<Path>, learning: bool) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text, path, learning)
    }

    pub fn from_yaml_str(text: &str, path: &Path, learning: bool) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let model_config = raw.model_config.ok_or_else(|| ConfigError::MissingSection {
            path: path.to_path_buf(),
            section: "model_config",
        })?;
        if learning && raw.learning_config.is_none() {
            return Err(ConfigError::MissingSection {
                path: path.to_path_buf(),
                section: "learning_config",
            });
        }

        let mut learning_config = raw.learning_config;
        if let Some(learning_config) = learning_config.as_mut() {
            learning_config.expand_paths();
        }

        let config = Self {
            path: path.to_path_buf(),
            speech_config: raw.speech_config.unwrap_or_default(),
            model_config,
            learning_config,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn learning_config(&self) -> Result<&LearningConfig, ConfigError> {
        self.learning_config
            .as_ref()
            .ok_or_else(|| ConfigError::MissingSection {
                path: self.path.clone(),
                section: "learning_config",
            })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let speech = &self.speech_config;
        if speech.sample_rate == 0 {
            return Err(invalid("speech_config.sample_rate", "must be > 0"));
        }
        if speech.window_size == 0 {
            return Err(invalid("speech_config.window_size", "must be > 0"));
        }
        if !(speech.stride > 0.0 && speech.stride <= 1.0) {
            return Err(invalid(
                "speech_config.stride",
                format!("must be in (0, 1], got {}", speech.stride),
            ));
        }
        if !(0.0..1.0).contains(&speech.preemphasis) {
            return Err(invalid(
                "speech_config.preemphasis",
                format!("must be in [0, 1), got {}", speech.preemphasis),
            ));
        }

        let model = &self.model_config;
        if model.kwidth == 0 || model.kwidth % 2 == 0 {
            return Err(invalid(
                "model_config.kwidth",
                format!("must be odd, got {}", model.kwidth),
            ));
        }
        if model.ratio < 2 {
            return Err(invalid(
                "model_config.ratio",
                format!("must be >= 2, got {}", model.ratio),
            ));
        }
        for (key, depths) in [
            ("model_config.g_enc_depths", &model.g_enc_depths),
            ("model_config.d_num_fmaps", &model.d_num_fmaps),
        ] {
            if depths.is_empty() || depths.contains(&0) {
                return Err(invalid(key, "must be a non-empty list of positive depths"));
            }
        }
        for (key, depth) in [
            ("model_config.g_enc_depths", model.g_enc_depths.len()),
            ("model_config.d_num_fmaps", model.d_num_fmaps.len()),
        ] {
            let reduction = model.ratio.checked_pow(depth as u32).unwrap_or(usize::MAX);
            if speech.window_size % reduction != 0 {
                return Err(invalid(
                    key,
                    format!(
                        "window_size {} is not divisible by ratio^{depth} = {reduction}",
                        speech.window_size
                    ),
                ));
            }
        }
        if model.denoise_every == 0 {
            return Err(invalid("model_config.denoise_every", "must be > 0"));
        }

        if let Some(learning) = &self.learning_config {
            let running = &learning.running_config;
            if running.batch_size == 0 {
                return Err(invalid("running_config.batch_size", "must be > 0"));
            }
            if running.num_epochs == 0 {
                return Err(invalid("running_config.num_epochs", "must be > 0"));
            }
            if running.log_interval_steps == 0 || running.save_interval_steps == 0 {
                return Err(invalid(
                    "running_config.*_interval_steps",
                    "intervals must be > 0",
                ));
            }
            for (key, adam) in [
                ("optimizer_config.generator", &learning.optimizer_config.generator),
                (
                    "optimizer_config.discriminator",
                    &learning.optimizer_config.discriminator,
                ),
            ] {
                if adam.learning_rate <= 0.0 {
                    return Err(invalid(key, "learning_rate must be > 0"));
                }
            }
        }
        Ok(())
    }
}

impl LearningConfig {
    fn expand_paths(&mut self) {
        let dataset = &mut self.dataset_config;
        dataset.train_paths.expand_home();
        if let Some(test_paths) = dataset.test_paths.as_mut() {
            test_paths.expand_home();
        }
        dataset.cache_dir = dataset.cache_dir.as_deref().map(Path::expand_home);
        self.running_config.outdir = self.running_config.outdir.expand_home();
    }
}

impl DataPaths {
    fn expand_home(&mut self) {
        self.clean = self.clean.expand_home();
        self.noisy = self.noisy.expand_home();
    }
}

pub(crate) trait ExpandHome {
    fn expand_home(&self) -> PathBuf;
}

impl ExpandHome for Path {
    fn expand_home(&self) -> PathBuf {
        let path_str = self.to_string_lossy();
        if !path_str.starts_with('~') {
            return self.to_path_buf();
        }

        let home = std::env::var("HOME").unwrap_or_else(|_| String::from("/"));
        if path_str == "~" {
            return PathBuf::from(home);
        }

        if let Some(stripped) = path_str.strip_prefix("~/") {
            return PathBuf::from(home).join(stripped);
        }

        self.to_path_buf()
    }
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_window_size() -> usize {
    16384
}

fn default_stride() -> f32 {
    0.5
}

fn default_preemphasis() -> f32 {
    0.95
}

fn default_kwidth() -> usize {
    31
}

fn default_ratio() -> usize {
    2
}

fn default_l1_lambda() -> f64 {
    100.0
}

fn default_leakiness() -> f64 {
    0.3
}

fn default_noise_decay() -> f64 {
    0.7
}

fn default_denoise_every() -> usize {
    1
}

fn default_learning_rate() -> f64 {
    2e-4
}

fn default_beta_1() -> f64 {
    0.5
}

fn default_beta_2() -> f64 {
    0.999
}

fn default_epsilon() -> f64 {
    1e-8
}

fn default_log_interval_steps() -> usize {
    100
}

fn default_save_interval_steps() -> usize {
    500
}

fn default_seed() -> u64 {
    42
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
speech_config:
  window_size: 64
  stride: 0.5
model_config:
  kwidth: 5
  g_enc_depths: [4, 8]
  d_num_fmaps: [4, 8]
learning_config:
  dataset_config:
    train_paths:
      clean: data/clean
      noisy: data/noisy
  optimizer_config:
    generator:
      learning_rate: 0.001
  running_config:
    batch_size: 4
    num_epochs: 2
    outdir: out
"#;

    fn parse(text: &str, learning: bool) -> Result<Config, ConfigError> {
        Config::from_yaml_str(text, Path::new("test.yml"), learning)
    }

    #[test]
    fn parses_sections_and_applies_defaults() {
        let config = parse(VALID, true).unwrap();
        assert_eq!(config.speech_config.sample_rate, 16000);
        assert_eq!(config.speech_config.window_size, 64);
        assert_eq!(config.model_config.ratio, 2);
        assert_eq!(config.model_config.l1_lambda, 100.0);

        let learning = config.learning_config().unwrap();
        assert_eq!(learning.dataset_config.train_paths.clean, PathBuf::from("data/clean"));
        assert_eq!(learning.optimizer_config.generator.learning_rate, 0.001);
        assert_eq!(learning.optimizer_config.discriminator.beta_1, 0.5);
        assert_eq!(learning.running_config.log_interval_steps, 100);
        assert_eq!(learning.running_config.seed, 42);
    }

    #[test]
    fn learning_mode_requires_learning_section() {
        let inference_only = r#"
speech_config:
  window_size: 64
model_config:
  kwidth: 5
  g_enc_depths: [4, 8]
  d_num_fmaps: [4, 8]
"#;
        assert!(parse(inference_only, false).is_ok());
        let err = parse(inference_only, true).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingSection {
                section: "learning_config",
                ..
            }
        ));
    }

    #[test]
    fn missing_model_section_is_reported() {
        let err = parse("speech_config:\n  window_size: 64\n", false).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingSection {
                section: "model_config",
                ..
            }
        ));
    }

    #[test]
    fn unknown_model_key_is_rejected() {
        let text = VALID.replace("kwidth: 5", "kwidth: 5\n  bogus: 1");
        assert!(matches!(parse(&text, true), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn window_must_divide_by_encoder_reduction() {
        let text = VALID.replace("window_size: 64", "window_size: 66");
        let err = parse(&text, true).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "model_config.g_enc_depths",
                ..
            }
        ));
    }

    #[test]
    fn even_kernel_width_is_invalid() {
        let text = VALID.replace("kwidth: 5", "kwidth: 4");
        assert!(matches!(
            parse(&text, true),
            Err(ConfigError::Invalid {
                key: "model_config.kwidth",
                ..
            })
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Config::load("/nonexistent/segan/config.yml", true).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn home_is_expanded_in_paths() {
        let home = std::env::var("HOME").unwrap_or_else(|_| String::from("/"));
        let text = VALID.replace("outdir: out", "outdir: ~/runs");
        let config = parse(&text, true).unwrap();
        assert_eq!(
            config.learning_config().unwrap().running_config.outdir,
            PathBuf::from(home).join("runs")
        );
    }
}
