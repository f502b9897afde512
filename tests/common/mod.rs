#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use segan_trainer::cli::TrainArgs;
use tempfile::TempDir;

pub const NUM_PAIRS: usize = 2;
// 160 samples give 4 frames of 64 with a hop of 32.
pub const NUM_SAMPLES: usize = 160;
pub const FRAMES_PER_PAIR: usize = 4;

pub fn write_wav(path: &Path, phase: f32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for t in 0..NUM_SAMPLES {
        let value = ((t as f32 * 0.05 + phase).sin() * 8000.0) as i16;
        writer.write_sample(value).unwrap();
    }
    writer.finalize().unwrap();
}

/// A tiny clean/noisy corpus plus a config pointing at it.
pub struct Workspace {
    pub dir: TempDir,
    pub config_path: PathBuf,
}

impl Workspace {
    pub fn new(num_epochs: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for side in ["clean", "noisy"] {
            fs::create_dir_all(dir.path().join(side)).unwrap();
        }
        for i in 0..NUM_PAIRS {
            let name = format!("p{i}.wav");
            write_wav(&dir.path().join("clean").join(&name), i as f32);
            write_wav(&dir.path().join("noisy").join(&name), i as f32 + 0.3);
        }
        let config_path = dir.path().join("config.yml");
        let ws = Self { dir, config_path };
        ws.write_config(num_epochs, false);
        ws
    }

    /// Rewrites the config; `with_eval` reuses the training corpus as test set.
    pub fn write_config(&self, num_epochs: usize, with_eval: bool) {
        let clean = self.dir.path().join("clean");
        let noisy = self.dir.path().join("noisy");
        let test_paths = if with_eval {
            format!(
                "    test_paths:\n      clean: {}\n      noisy: {}\n",
                clean.display(),
                noisy.display()
            )
        } else {
            String::new()
        };
        let yaml = format!(
            r#"
speech_config:
  sample_rate: 16000
  window_size: 64
  stride: 0.5
model_config:
  kwidth: 5
  g_enc_depths: [4, 8]
  d_num_fmaps: [4, 8]
  noise_std: 0.1
  noise_std_end: 0.01
learning_config:
  dataset_config:
    train_paths:
      clean: {clean}
      noisy: {noisy}
{test_paths}  running_config:
    batch_size: 2
    num_epochs: {num_epochs}
    outdir: {outdir}
    log_interval_steps: 3
    save_interval_steps: 1
    seed: 7
"#,
            clean = clean.display(),
            noisy = noisy.display(),
            outdir = self.outdir().display(),
        );
        fs::write(&self.config_path, yaml).unwrap();
    }

    pub fn outdir(&self) -> PathBuf {
        self.dir.path().join("run")
    }

    pub fn args(&self, extra: &[&str]) -> TrainArgs {
        let config = self.config_path.to_str().unwrap();
        let argv = ["segan-trainer", "--config", config]
            .into_iter()
            .chain(extra.iter().copied());
        TrainArgs::try_parse_from(argv).unwrap()
    }
}

pub fn walk(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk(&path));
        } else {
            out.push(path);
        }
    }
    out
}
