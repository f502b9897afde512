use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_nn::VarMap;
use chrono::Utc;
use serde::{Deserialize, Serialize};

const INDEX_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub step: usize,
    pub epoch: usize,
    pub saved_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    checkpoints: Vec<CheckpointEntry>,
}

/// Keeps the newest `max_to_keep` generator/discriminator snapshots in `dir`.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
    index: CheckpointIndex,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> anyhow::Result<Self> {
        if max_to_keep == 0 {
            anyhow::bail!("max_to_keep must be > 0");
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed creating checkpoint directory: {}", dir.display()))?;

        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            let text = fs::read_to_string(&index_path)
                .with_context(|| format!("Failed reading {}", index_path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Corrupt checkpoint index: {}", index_path.display()))?
        } else {
            CheckpointIndex::default()
        };

        Ok(Self {
            dir,
            max_to_keep,
            index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_to_keep(&self) -> usize {
        self.max_to_keep
    }

    pub fn entries(&self) -> &[CheckpointEntry] {
        &self.index.checkpoints
    }

    pub fn latest(&self) -> Option<&CheckpointEntry> {
        self.index.checkpoints.last()
    }

    pub fn generator_path(&self, step: usize) -> PathBuf {
        self.dir.join(format!("ckpt-{step}.generator.safetensors"))
    }

    pub fn discriminator_path(&self, step: usize) -> PathBuf {
        self.dir.join(format!("ckpt-{step}.discriminator.safetensors"))
    }

    pub fn save(
        &mut self,
        step: usize,
        epoch: usize,
        generator: &VarMap,
        discriminator: &VarMap,
    ) -> anyhow::Result<()> {
        let generator_path = self.generator_path(step);
        generator
            .save(&generator_path)
            .with_context(|| format!("Failed writing checkpoint: {}", generator_path.display()))?;
        let discriminator_path = self.discriminator_path(step);
        discriminator.save(&discriminator_path).with_context(|| {
            format!(
                "Failed writing checkpoint: {}",
                discriminator_path.display()
            )
        })?;

        self.index.checkpoints.retain(|entry| entry.step != step);
        self.index.checkpoints.push(CheckpointEntry {
            step,
            epoch,
            saved_at: Utc::now().to_rfc3339(),
        });

        while self.index.checkpoints.len() > self.max_to_keep {
            let stale = self.index.checkpoints.remove(0);
            for path in [
                self.generator_path(stale.step),
                self.discriminator_path(stale.step),
            ] {
                if let Err(err) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), %err, "Failed removing old checkpoint");
                }
            }
        }

        self.write_index()?;
        tracing::debug!(step, epoch, "Checkpoint saved");
        Ok(())
    }

    /// Loads the newest snapshot into the given variable maps.
    pub fn restore_latest(
        &self,
        generator: &mut VarMap,
        discriminator: &mut VarMap,
    ) -> anyhow::Result<Option<CheckpointEntry>> {
        let Some(entry) = self.latest().cloned() else {
            return Ok(None);
        };
        let generator_path = self.generator_path(entry.step);
        generator
            .load(&generator_path)
            .with_context(|| format!("Failed restoring {}", generator_path.display()))?;
        let discriminator_path = self.discriminator_path(entry.step);
        discriminator
            .load(&discriminator_path)
            .with_context(|| format!("Failed restoring {}", discriminator_path.display()))?;
        Ok(Some(entry))
    }

    fn write_index(&self) -> anyhow::Result<()> {
        let index_path = self.dir.join(INDEX_FILE);
        let tmp_path = self.dir.join(format!("{INDEX_FILE}.tmp"));
        fs::write(&tmp_path, serde_json::to_string_pretty(&self.index)?)
            .with_context(|| format!("Failed writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &index_path)
            .with_context(|| format!("Failed writing {}", index_path.display()))?;
        Ok(())
    }
}
