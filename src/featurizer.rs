//! Speech featurizers: raw audio in, pre-emphasised fixed-size frames out.
//!
//! Two interchangeable strategies produce the same frames. The ndarray one
//! slices on the host; the tensor one slices with candle ops.

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use ndarray::{s, Array2, ArrayView1};
use serde::Serialize;

use crate::config::SpeechConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FeaturizerKind {
    /// Host-side slicing with ndarray.
    Numpy,
    /// Slicing with candle tensor ops.
    Tensor,
}

impl fmt::Display for FeaturizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numpy => f.write_str("ndarray"),
            Self::Tensor => f.write_str("tensor"),
        }
    }
}

pub trait SpeechFeaturizer: fmt::Debug + Send + Sync {
    fn kind(&self) -> FeaturizerKind;

    fn params(&self) -> &FrameParams;

    fn window_size(&self) -> usize {
        self.params().window_size
    }

    fn sample_rate(&self) -> u32 {
        self.params().sample_rate
    }

    /// Returns a `[frames, window_size]` F32 tensor on the CPU.
    fn extract(&self, signal: &[f32]) -> anyhow::Result<Tensor>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameParams {
    pub sample_rate: u32,
    pub window_size: usize,
    pub hop_size: usize,
    pub preemphasis: f32,
}

impl FrameParams {
    pub fn from_config(cfg: &SpeechConfig) -> anyhow::Result<Self> {
        if cfg.window_size == 0 {
            anyhow::bail!("window_size must be > 0");
        }
        if !(cfg.stride > 0.0 && cfg.stride <= 1.0) {
            anyhow::bail!("stride must be in (0, 1], got {}", cfg.stride);
        }
        let hop_size = ((cfg.window_size as f32 * cfg.stride) as usize).max(1);
        Ok(Self {
            sample_rate: cfg.sample_rate,
            window_size: cfg.window_size,
            hop_size,
            preemphasis: cfg.preemphasis,
        })
    }

    /// Frames start every `hop_size` samples; a frame is kept while its end
    /// stays within one hop of the signal end, and is zero-padded to size.
    pub fn num_frames(&self, num_samples: usize) -> usize {
        let mut count = 0;
        let mut start = 0;
        while start < num_samples && start + self.window_size < num_samples + self.hop_size {
            count += 1;
            start += self.hop_size;
        }
        count
    }

    /// Identifies the frame layout for on-disk feature caches.
    pub fn cache_key(&self) -> String {
        format!(
            "sr={}|win={}|hop={}|pre={}",
            self.sample_rate, self.window_size, self.hop_size, self.preemphasis
        )
    }
}

#[derive(Debug, Clone)]
pub struct NumpySpeechFeaturizer {
    params: FrameParams,
}

impl NumpySpeechFeaturizer {
    pub fn new(cfg: &SpeechConfig) -> anyhow::Result<Self> {
        Ok(Self {
            params: FrameParams::from_config(cfg)?,
        })
    }
}

impl SpeechFeaturizer for NumpySpeechFeaturizer {
    fn kind(&self) -> FeaturizerKind {
        FeaturizerKind::Numpy
    }

    fn params(&self) -> &FrameParams {
        &self.params
    }

    fn extract(&self, signal: &[f32]) -> anyhow::Result<Tensor> {
        let window = self.params.window_size;
        let hop = self.params.hop_size;
        let num_frames = self.params.num_frames(signal.len());

        let mut frames = Array2::<f32>::zeros((num_frames, window));
        for (index, mut row) in frames.outer_iter_mut().enumerate() {
            let start = index * hop;
            let end = (start + window).min(signal.len());
            row.slice_mut(s![..end - start])
                .assign(&ArrayView1::from(&signal[start..end]));
        }

        let coeff = self.params.preemphasis;
        if coeff > 0.0 {
            for mut row in frames.rows_mut() {
                for t in (1..window).rev() {
                    row[t] -= coeff * row[t - 1];
                }
            }
        }

        let data = frames
            .as_slice()
            .context("Frame buffer is not contiguous")?;
        Ok(Tensor::from_slice(data, (num_frames, window), &Device::Cpu)?)
    }
}

#[derive(Debug, Clone)]
pub struct TensorSpeechFeaturizer {
    params: FrameParams,
}

impl TensorSpeechFeaturizer {
    pub fn new(cfg: &SpeechConfig) -> anyhow::Result<Self> {
        Ok(Self {
            params: FrameParams::from_config(cfg)?,
        })
    }
}

impl SpeechFeaturizer for TensorSpeechFeaturizer {
    fn kind(&self) -> FeaturizerKind {
        FeaturizerKind::Tensor
    }

    fn params(&self) -> &FrameParams {
        &self.params
    }

    fn extract(&self, signal: &[f32]) -> anyhow::Result<Tensor> {
        let window = self.params.window_size;
        let hop = self.params.hop_size;
        let num_frames = self.params.num_frames(signal.len());
        if num_frames == 0 {
            return Ok(Tensor::zeros((0, window), DType::F32, &Device::Cpu)?);
        }

        let span = (num_frames - 1) * hop + window;
        let signal = Tensor::from_slice(signal, signal.len(), &Device::Cpu)?;
        let signal = if span > signal.dim(0)? {
            let pad = span - signal.dim(0)?;
            signal.pad_with_zeros(0, 0, pad)?
        } else {
            signal.narrow(0, 0, span)?
        };

        let frames = (0..num_frames)
            .map(|index| signal.narrow(0, index * hop, window))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let frames = Tensor::stack(&frames, 0)?;

        let coeff = f64::from(self.params.preemphasis);
        if coeff <= 0.0 || window < 2 {
            return Ok(frames.contiguous()?);
        }
        let head = frames.narrow(1, 0, 1)?;
        let tail = (frames.narrow(1, 1, window - 1)?
            - frames.narrow(1, 0, window - 1)?.affine(coeff, 0.0)?)?;
        Ok(Tensor::cat(&[&head, &tail], 1)?.contiguous()?)
    }
}

pub fn build_featurizer(
    kind: FeaturizerKind,
    cfg: &SpeechConfig,
) -> anyhow::Result<Arc<dyn SpeechFeaturizer>> {
    Ok(match kind {
        FeaturizerKind::Numpy => Arc::new(NumpySpeechFeaturizer::new(cfg)?),
        FeaturizerKind::Tensor => Arc::new(TensorSpeechFeaturizer::new(cfg)?),
    })
}
