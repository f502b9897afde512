use std::fmt;
use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use blake2::{Blake2s256, Digest};
use candle_core::{Device, Tensor};
use ndarray::{Array2, Ix2, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::audio::read_raw_audio;
use crate::featurizer::{FrameParams, SpeechFeaturizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Train,
    Eval,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => f.write_str("train"),
            Self::Eval => f.write_str("eval"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AudioPair {
    pub clean_path: PathBuf,
    pub noisy_path: PathBuf,
}

/// Every frame of the dataset, clean and noisy rows aligned: `[frames, window]`.
#[derive(Clone, Debug)]
pub struct FrameSet {
    pub clean: Tensor,
    pub noisy: Tensor,
}

impl FrameSet {
    pub fn len(&self) -> usize {
        self.clean.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct SeganTrainDataset {
    pub stage: Stage,
    featurizer: Arc<dyn SpeechFeaturizer>,
    pub clean_dir: PathBuf,
    pub noisy_dir: PathBuf,
    pairs: Vec<AudioPair>,
    cache: bool,
    cache_dir: Option<PathBuf>,
    shuffle: bool,
    cached_frames: OnceLock<FrameSet>,
}

impl SeganTrainDataset {
    pub fn new(
        stage: Stage,
        featurizer: Arc<dyn SpeechFeaturizer>,
        clean_dir: impl Into<PathBuf>,
        noisy_dir: impl Into<PathBuf>,
        cache: bool,
        shuffle: bool,
    ) -> anyhow::Result<Self> {
        let clean_dir = clean_dir.into();
        let noisy_dir = noisy_dir.into();
        let pairs = discover_pairs(&clean_dir, &noisy_dir)?;
        if pairs.is_empty() {
            anyhow::bail!(
                "No clean/noisy WAV pairs found under {} and {}",
                clean_dir.display(),
                noisy_dir.display()
            );
        }
        tracing::info!(
            stage = %stage,
            pairs = pairs.len(),
            featurizer = %featurizer.kind(),
            cache,
            shuffle,
            "Dataset ready"
        );

        Ok(Self {
            stage,
            featurizer,
            clean_dir,
            noisy_dir,
            pairs,
            cache,
            cache_dir: None,
            shuffle,
            cached_frames: OnceLock::new(),
        })
    }

    /// Persists featurized frames under `dir` in addition to the in-memory
    /// cache. Ignored unless caching is enabled.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn featurizer(&self) -> &Arc<dyn SpeechFeaturizer> {
        &self.featurizer
    }

    pub fn pairs(&self) -> &[AudioPair] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache
    }

    pub fn shuffle_enabled(&self) -> bool {
        self.shuffle
    }

    /// Featurizes every pair. With caching on, the first call is the only one
    /// that touches the audio files.
    pub fn frames(&self) -> anyhow::Result<FrameSet> {
        if let Some(frames) = self.cached_frames.get() {
            return Ok(frames.clone());
        }
        let frames = self.load_frames()?;
        if self.cache {
            let _ = self.cached_frames.set(frames.clone());
        }
        Ok(frames)
    }

    pub fn batches(&self, batch_size: usize, rng: &mut StdRng) -> anyhow::Result<Batches> {
        if batch_size == 0 {
            anyhow::bail!("Batch size must be > 0");
        }
        let frames = self.frames()?;
        let mut order: Vec<u32> = (0..frames.len() as u32).collect();
        if self.shuffle {
            order.shuffle(rng);
        }
        Ok(Batches {
            frames,
            order,
            batch_size,
            cursor: 0,
        })
    }

    fn load_frames(&self) -> anyhow::Result<FrameSet> {
        let params = self.featurizer.params();
        let disk_cache = if self.cache {
            self.cache_dir.as_deref()
        } else {
            None
        };

        let mut clean_parts = Vec::with_capacity(self.pairs.len());
        let mut noisy_parts = Vec::with_capacity(self.pairs.len());
        for pair in &self.pairs {
            let cache_file = disk_cache.map(|dir| dir.join(pair_cache_relpath(pair, params)));

            let cached = match &cache_file {
                Some(path) if path.exists() => load_cached_frames(path, params.window_size)?,
                _ => None,
            };
            let (clean, noisy) = match cached {
                Some(frames) => frames,
                None => {
                    let frames = self.featurize_pair(pair)?;
                    if let Some(path) = &cache_file {
                        save_cached_frames(path, &frames.0, &frames.1)?;
                    }
                    frames
                }
            };

            if clean.dims()[0] == 0 {
                tracing::warn!(
                    clean = %pair.clean_path.display(),
                    "Audio shorter than one window, skipping"
                );
                continue;
            }
            clean_parts.push(clean);
            noisy_parts.push(noisy);
        }

        if clean_parts.is_empty() {
            anyhow::bail!(
                "No frames of {} samples could be extracted from {}",
                params.window_size,
                self.clean_dir.display()
            );
        }

        // A single part comes back from `cat` as-is, possibly a strided view.
        Ok(FrameSet {
            clean: Tensor::cat(&clean_parts, 0)?.contiguous()?,
            noisy: Tensor::cat(&noisy_parts, 0)?.contiguous()?,
        })
    }

    fn featurize_pair(&self, pair: &AudioPair) -> anyhow::Result<(Tensor, Tensor)> {
        let sample_rate = self.featurizer.sample_rate();
        let clean = read_raw_audio(&pair.clean_path, sample_rate)?;
        let noisy = read_raw_audio(&pair.noisy_path, sample_rate)?;
        let clean = self
            .featurizer
            .extract(&clean)
            .with_context(|| format!("Failed to featurize {}", pair.clean_path.display()))?;
        let noisy = self
            .featurizer
            .extract(&noisy)
            .with_context(|| format!("Failed to featurize {}", pair.noisy_path.display()))?;

        let rows = clean.dims()[0].min(noisy.dims()[0]);
        Ok((clean.narrow(0, 0, rows)?, noisy.narrow(0, 0, rows)?))
    }
}

/// One epoch's worth of `(clean, noisy)` batches shaped `[B, 1, window]`.
pub struct Batches {
    frames: FrameSet,
    order: Vec<u32>,
    batch_size: usize,
    cursor: usize,
}

impl Batches {
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    pub fn num_frames(&self) -> usize {
        self.order.len()
    }
}

impl Iterator for Batches {
    type Item = anyhow::Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let chunk = &self.order[self.cursor..end];
        self.cursor = end;

        let select = || -> anyhow::Result<(Tensor, Tensor)> {
            let index = Tensor::from_slice(chunk, chunk.len(), &Device::Cpu)?;
            let clean = self.frames.clean.index_select(&index, 0)?.unsqueeze(1)?;
            let noisy = self.frames.noisy.index_select(&index, 0)?.unsqueeze(1)?;
            Ok((clean, noisy))
        };
        Some(select())
    }
}

/// Pairs every `.wav` under `clean_dir` with the file at the same relative
/// path under `noisy_dir`. Subdirectories are walked.
pub fn discover_pairs(clean_dir: &Path, noisy_dir: &Path) -> anyhow::Result<Vec<AudioPair>> {
    for dir in [clean_dir, noisy_dir] {
        if !dir.is_dir() {
            anyhow::bail!("Dataset directory does not exist: {}", dir.display());
        }
    }

    let mut relpaths = Vec::new();
    collect_wavs(clean_dir, Path::new(""), &mut relpaths)?;
    relpaths.sort();

    let mut pairs = Vec::with_capacity(relpaths.len());
    for relpath in relpaths {
        let clean_path = clean_dir.join(&relpath);
        let noisy_path = noisy_dir.join(&relpath);
        if !noisy_path.is_file() {
            tracing::warn!(
                clean = %clean_path.display(),
                "No noisy counterpart, skipping"
            );
            continue;
        }
        pairs.push(AudioPair {
            clean_path,
            noisy_path,
        });
    }
    Ok(pairs)
}

fn collect_wavs(root: &Path, relative: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let dir = root.join(relative);
    let entries = fs::read_dir(&dir)
        .with_context(|| format!("Failed to read dataset dir: {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
        let relpath = relative.join(entry.file_name());
        if entry.path().is_dir() {
            collect_wavs(root, &relpath, out)?;
        } else if relpath
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
        {
            out.push(relpath);
        }
    }
    Ok(())
}

pub fn pair_cache_relpath(pair: &AudioPair, params: &FrameParams) -> PathBuf {
    let source_key = format!(
        "{}|{}|{}",
        pair.clean_path.to_string_lossy(),
        pair.noisy_path.to_string_lossy(),
        params.cache_key()
    );
    let mut hasher = Blake2s256::new();
    hasher.update(source_key.as_bytes());
    let digest = hasher.finalize();
    let hash = hex::encode(&digest[..8]);
    let stem = pair
        .clean_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("pair");

    PathBuf::from(format!("{stem}_{hash}.npz"))
}

fn load_cached_frames(
    cache_file: &Path,
    window: usize,
) -> anyhow::Result<Option<(Tensor, Tensor)>> {
    let file = match File::open(cache_file) {
        Ok(file) => file,
        Err(_) => return Ok(None),
    };
    let mut npz = match NpzReader::new(file) {
        Ok(npz) => npz,
        Err(_) => return Ok(None),
    };

    let Some(clean) = read_frames(&mut npz, "clean") else {
        return Ok(None);
    };
    let Some(noisy) = read_frames(&mut npz, "noisy") else {
        return Ok(None);
    };
    if clean.ncols() != window || noisy.dim() != clean.dim() {
        tracing::debug!(path = %cache_file.display(), "Stale cache entry, rebuilding");
        return Ok(None);
    }

    let shape = clean.dim();
    let clean = Tensor::from_slice(
        clean.as_slice().context("Non-contiguous clean array")?,
        shape,
        &Device::Cpu,
    )?;
    let noisy = Tensor::from_slice(
        noisy.as_slice().context("Non-contiguous noisy array")?,
        shape,
        &Device::Cpu,
    )?;
    Ok(Some((clean, noisy)))
}

fn read_frames(npz: &mut NpzReader<File>, name: &str) -> Option<Array2<f32>> {
    npz.by_name::<OwnedRepr<f32>, Ix2>(&format!("{name}.npy"))
        .or_else(|_| npz.by_name::<OwnedRepr<f32>, Ix2>(name))
        .ok()
}

fn save_cached_frames(cache_file: &Path, clean: &Tensor, noisy: &Tensor) -> anyhow::Result<()> {
    if let Some(parent) = cache_file.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create cache directory: {}", parent.display()))?;
    }

    let (rows, cols) = clean.dims2()?;
    let clean_arr = Array2::from_shape_vec((rows, cols), clean.flatten_all()?.to_vec1::<f32>()?)
        .context("Failed to shape clean cache array")?;
    let noisy_arr = Array2::from_shape_vec((rows, cols), noisy.flatten_all()?.to_vec1::<f32>()?)
        .context("Failed to shape noisy cache array")?;

    let file = File::create(cache_file)
        .with_context(|| format!("Failed to create cache file: {}", cache_file.display()))?;
    let mut npz = NpzWriter::new(file);
    npz.add_array("clean", &clean_arr)
        .context("Failed writing 'clean' to cache")?;
    npz.add_array("noisy", &noisy_arr)
        .context("Failed writing 'noisy' to cache")?;
    npz.finish().context("Failed finalizing cache npz")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpeechConfig;
    use crate::featurizer::{build_featurizer, FeaturizerKind};
    use hound::{SampleFormat, WavSpec, WavWriter};
    use rand::SeedableRng;

    fn write_wav(path: &Path, len: usize, amplitude: f32) {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for i in 0..len {
            let value = amplitude * ((i as f32) * 0.1).sin();
            writer.write_sample((value * 32767.0) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn featurizer_of(kind: FeaturizerKind) -> Arc<dyn SpeechFeaturizer> {
        let cfg = SpeechConfig {
            sample_rate: 16000,
            window_size: 16,
            stride: 0.5,
            preemphasis: 0.95,
        };
        build_featurizer(kind, &cfg).unwrap()
    }

    fn featurizer() -> Arc<dyn SpeechFeaturizer> {
        featurizer_of(FeaturizerKind::Numpy)
    }

    fn corpus() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("clean")).unwrap();
        fs::create_dir_all(dir.path().join("noisy")).unwrap();
        write_wav(&dir.path().join("clean/a.wav"), 40, 0.5);
        write_wav(&dir.path().join("noisy/a.wav"), 40, 0.6);
        write_wav(&dir.path().join("clean/b.wav"), 24, 0.5);
        write_wav(&dir.path().join("noisy/b.wav"), 30, 0.6);
        write_wav(&dir.path().join("clean/orphan.wav"), 40, 0.5);
        dir
    }

    #[test]
    fn pairs_are_matched_by_file_name() {
        let dir = corpus();
        let pairs = discover_pairs(&dir.path().join("clean"), &dir.path().join("noisy")).unwrap();
        let names: Vec<_> = pairs
            .iter()
            .map(|pair| pair.clean_path.file_name().unwrap().to_owned())
            .collect();
        assert_eq!(names, vec!["a.wav", "b.wav"]);
    }

    #[test]
    fn pairs_are_matched_by_relative_path() {
        let dir = corpus();
        for side in ["clean", "noisy"] {
            fs::create_dir_all(dir.path().join(side).join("p232")).unwrap();
            write_wav(&dir.path().join(side).join("p232/a.wav"), 40, 0.5);
        }
        // Same file name, different speaker dir: must not pair with p232/a.wav.
        fs::create_dir_all(dir.path().join("clean/p257")).unwrap();
        write_wav(&dir.path().join("clean/p257/a.wav"), 40, 0.5);

        let clean_dir = dir.path().join("clean");
        let pairs = discover_pairs(&clean_dir, &dir.path().join("noisy")).unwrap();
        let relpaths: Vec<_> = pairs
            .iter()
            .map(|pair| pair.clean_path.strip_prefix(&clean_dir).unwrap().to_owned())
            .collect();
        assert_eq!(
            relpaths,
            vec![
                PathBuf::from("a.wav"),
                PathBuf::from("b.wav"),
                PathBuf::from("p232/a.wav"),
            ]
        );
        assert!(pairs[2].noisy_path.ends_with("noisy/p232/a.wav"));
    }

    #[test]
    fn single_pair_batches_with_tensor_featurizer() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("clean")).unwrap();
        fs::create_dir_all(dir.path().join("noisy")).unwrap();
        write_wav(&dir.path().join("clean/a.wav"), 40, 0.5);
        write_wav(&dir.path().join("noisy/a.wav"), 40, 0.6);

        let dataset = SeganTrainDataset::new(
            Stage::Train,
            featurizer_of(FeaturizerKind::Tensor),
            dir.path().join("clean"),
            dir.path().join("noisy"),
            false,
            true,
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let (clean, noisy) = dataset.batches(2, &mut rng).unwrap().next().unwrap().unwrap();
        assert_eq!(clean.dims(), &[2, 1, 16]);
        assert_eq!(noisy.dims(), &[2, 1, 16]);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = corpus();
        let result = SeganTrainDataset::new(
            Stage::Train,
            featurizer(),
            dir.path().join("clean"),
            dir.path().join("missing"),
            false,
            true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn frames_are_truncated_to_the_shorter_side() {
        let dir = corpus();
        let dataset = SeganTrainDataset::new(
            Stage::Train,
            featurizer(),
            dir.path().join("clean"),
            dir.path().join("noisy"),
            false,
            false,
        )
        .unwrap();
        // a.wav: 4 frames each side; b.wav: 2 clean vs 3 noisy.
        let frames = dataset.frames().unwrap();
        assert_eq!(frames.len(), 6);
        assert_eq!(frames.noisy.dims(), &[6, 16]);
    }

    #[test]
    fn batches_cover_every_frame_once() {
        let dir = corpus();
        let dataset = SeganTrainDataset::new(
            Stage::Train,
            featurizer(),
            dir.path().join("clean"),
            dir.path().join("noisy"),
            false,
            true,
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let batches = dataset.batches(4, &mut rng).unwrap();
        assert_eq!(batches.num_batches(), 2);

        let shapes: Vec<Vec<usize>> = batches
            .map(|batch| batch.unwrap().0.dims().to_vec())
            .collect();
        assert_eq!(shapes, vec![vec![4, 1, 16], vec![2, 1, 16]]);
    }

    #[test]
    fn disk_cache_round_trips_frames() {
        let dir = corpus();
        let cache_dir = dir.path().join("cache");
        let build = || {
            SeganTrainDataset::new(
                Stage::Train,
                featurizer(),
                dir.path().join("clean"),
                dir.path().join("noisy"),
                true,
                false,
            )
            .unwrap()
            .with_cache_dir(&cache_dir)
        };

        let first = build().frames().unwrap();
        assert_eq!(fs::read_dir(&cache_dir).unwrap().count(), 2);

        // Remove the audio so the second run can only succeed from cache.
        fs::remove_file(dir.path().join("clean/a.wav")).unwrap();
        fs::write(dir.path().join("clean/a.wav"), b"not a wav").unwrap();
        let second = build().frames().unwrap();

        let diff = (first.clean - second.clean)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }
}
