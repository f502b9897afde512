use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointManager;
use crate::config::{AdamConfig, ModelConfig, OptimizerConfig, RunningConfig};
use crate::dataset::SeganTrainDataset;
use crate::model::{Discriminator, Generator};
use crate::strategy::ExecutionStrategy;

const HISTORY_FILE: &str = "metrics_history.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepMetrics {
    pub d_loss: f64,
    pub g_adv_loss: f64,
    pub g_l1_loss: f64,
}

impl StepMetrics {
    fn accumulate(&mut self, other: &StepMetrics) {
        self.d_loss += other.d_loss;
        self.g_adv_loss += other.g_adv_loss;
        self.g_l1_loss += other.g_l1_loss;
    }

    fn mean(&self, count: usize) -> StepMetrics {
        let n = count.max(1) as f64;
        StepMetrics {
            d_loss: self.d_loss / n,
            g_adv_loss: self.g_adv_loss / n,
            g_l1_loss: self.g_l1_loss / n,
        }
    }
}

/// Running mean over the steps since the last log line.
#[derive(Debug, Default)]
struct MetricsWindow {
    totals: StepMetrics,
    steps: usize,
}

impl MetricsWindow {
    fn push(&mut self, metrics: &StepMetrics) {
        self.totals.accumulate(metrics);
        self.steps += 1;
    }

    fn take(&mut self) -> Option<StepMetrics> {
        if self.steps == 0 {
            return None;
        }
        let mean = self.totals.mean(self.steps);
        *self = Self::default();
        Some(mean)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub steps: usize,
    pub global_step: usize,
    pub disc_noise_std: f64,
    pub metrics: StepMetrics,
    pub epoch_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FitSummary {
    pub global_step: usize,
    pub global_batch_size: usize,
    /// Epochs trained by this call only; `metrics_history.json` keeps all.
    pub history: Vec<EpochSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalSummary {
    pub num_frames: usize,
    /// Mean absolute sample error of the enhanced windows against clean.
    pub mean_abs_error: f64,
}

struct Compiled {
    generator: Generator,
    discriminator: Discriminator,
    g_optimizer: AdamW,
    d_optimizer: AdamW,
    checkpoints: CheckpointManager,
    global_step: usize,
    /// Number of fully trained epochs, restored from the latest checkpoint.
    completed_epochs: usize,
}

/// Owns the execution strategy, checkpointing and the adversarial fit loop.
pub struct SeganTrainer {
    config: RunningConfig,
    strategy: ExecutionStrategy,
    compiled: Option<Compiled>,
}

impl SeganTrainer {
    pub fn new(config: RunningConfig, strategy: ExecutionStrategy) -> Self {
        tracing::info!(strategy = %strategy.describe(), "Trainer created");
        Self {
            config,
            strategy,
            compiled: None,
        }
    }

    pub fn strategy(&self) -> &ExecutionStrategy {
        &self.strategy
    }

    pub fn config(&self) -> &RunningConfig {
        &self.config
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.config.outdir.join("checkpoints")
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    pub fn global_step(&self) -> usize {
        self.compiled.as_ref().map_or(0, |c| c.global_step)
    }

    pub fn generator(&self) -> Option<&Generator> {
        self.compiled.as_ref().map(|c| &c.generator)
    }

    pub fn discriminator(&self) -> Option<&Discriminator> {
        self.compiled.as_ref().map(|c| &c.discriminator)
    }

    pub fn checkpoints(&self) -> Option<&CheckpointManager> {
        self.compiled.as_ref().map(|c| &c.checkpoints)
    }

    /// Attaches the model pair and optimizers, and resumes from the newest
    /// checkpoint under `<outdir>/checkpoints` when there is one.
    pub fn compile(
        &mut self,
        mut generator: Generator,
        mut discriminator: Discriminator,
        optimizer_config: &OptimizerConfig,
        max_to_keep: usize,
    ) -> anyhow::Result<()> {
        let device = self.strategy.primary_device();
        if !generator.device().same_device(device) || !discriminator.device().same_device(device) {
            anyhow::bail!(
                "Models must be built inside the trainer's strategy scope ({})",
                self.strategy.describe()
            );
        }
        if generator.window_size() != discriminator.window_size() {
            anyhow::bail!(
                "Generator window {} does not match discriminator window {}",
                generator.window_size(),
                discriminator.window_size()
            );
        }

        let checkpoints = CheckpointManager::new(self.checkpoint_dir(), max_to_keep)?;
        let restored =
            checkpoints.restore_latest(generator.varmap_mut(), discriminator.varmap_mut())?;
        let (global_step, completed_epochs) = match &restored {
            Some(entry) => {
                tracing::info!(
                    step = entry.step,
                    epoch = entry.epoch,
                    saved_at = %entry.saved_at,
                    "Restored checkpoint"
                );
                (entry.step, entry.epoch)
            }
            None => (0, 0),
        };

        let g_optimizer = AdamW::new(
            generator.varmap().all_vars(),
            adam_params(&optimizer_config.generator),
        )?;
        let d_optimizer = AdamW::new(
            discriminator.varmap().all_vars(),
            adam_params(&optimizer_config.discriminator),
        )?;

        self.compiled = Some(Compiled {
            generator,
            discriminator,
            g_optimizer,
            d_optimizer,
            checkpoints,
            global_step,
            completed_epochs,
        });
        Ok(())
    }

    /// Runs the remaining epochs. `train_bs` overrides the per-replica batch
    /// size from the running config.
    pub fn fit(
        &mut self,
        train_dataset: &SeganTrainDataset,
        train_bs: Option<usize>,
    ) -> anyhow::Result<FitSummary> {
        let Self {
            config,
            strategy,
            compiled,
        } = self;
        let state = compiled
            .as_mut()
            .context("SeganTrainer::compile must be called before fit")?;

        let batch_size = global_batch_size(config.batch_size, train_bs, strategy);
        let device = strategy.primary_device().clone();
        let model_cfg = state.generator.config().clone();

        fs::create_dir_all(&config.outdir)
            .with_context(|| format!("Failed creating output dir: {}", config.outdir.display()))?;

        let first_epoch = state.completed_epochs + 1;
        let mut history = Vec::new();
        if first_epoch > config.num_epochs {
            tracing::info!(
                completed = state.completed_epochs,
                num_epochs = config.num_epochs,
                "All epochs already trained"
            );
        } else {
            tracing::info!(
                batch_size,
                replicas = strategy.num_replicas_in_sync(),
                mirrored = strategy.is_mirrored(),
                first_epoch,
                num_epochs = config.num_epochs,
                "Starting training"
            );
        }

        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(first_epoch as u64));
        for epoch in first_epoch..=config.num_epochs {
            let epoch_started = Instant::now();
            let noise_std = discriminator_noise_std(&model_cfg, epoch - 1);

            let batches = train_dataset.batches(batch_size, &mut rng)?;
            let progress = ProgressBar::new(batches.num_batches() as u64);
            progress.set_style(progress_style());

            let mut epoch_totals = StepMetrics::default();
            let mut epoch_steps = 0usize;
            let mut window = MetricsWindow::default();

            for batch in batches {
                let (clean, noisy) = batch?;
                let clean = clean.to_device(&device)?;
                let noisy = noisy.to_device(&device)?;

                let metrics = train_step(state, &clean, &noisy, noise_std, model_cfg.l1_lambda)?;
                state.global_step += 1;
                epoch_steps += 1;
                epoch_totals.accumulate(&metrics);
                window.push(&metrics);

                progress.set_message(format!(
                    "d={:.4} g_adv={:.4} g_l1={:.4}",
                    metrics.d_loss, metrics.g_adv_loss, metrics.g_l1_loss
                ));
                progress.inc(1);

                if state.global_step % config.log_interval_steps == 0 {
                    if let Some(mean) = window.take() {
                        log_train_metrics(state.global_step, epoch, &mean);
                    }
                }

                if state.global_step % config.save_interval_steps == 0 {
                    state.checkpoints.save(
                        state.global_step,
                        epoch - 1,
                        state.generator.varmap(),
                        state.discriminator.varmap(),
                    )?;
                }
            }
            progress.finish_and_clear();
            if let Some(mean) = window.take() {
                log_train_metrics(state.global_step, epoch, &mean);
            }

            state.checkpoints.save(
                state.global_step,
                epoch,
                state.generator.varmap(),
                state.discriminator.varmap(),
            )?;
            state.completed_epochs = epoch;

            let summary = EpochSummary {
                epoch,
                steps: epoch_steps,
                global_step: state.global_step,
                disc_noise_std: noise_std,
                metrics: epoch_totals.mean(epoch_steps),
                epoch_seconds: epoch_started.elapsed().as_secs_f64(),
            };
            println!(
                "Epoch {epoch}/{}: d_loss={:.4}, g_adv_loss={:.4}, g_l1_loss={:.4} ({:.1}s)",
                config.num_epochs,
                summary.metrics.d_loss,
                summary.metrics.g_adv_loss,
                summary.metrics.g_l1_loss,
                summary.epoch_seconds
            );
            history.push(summary);
        }

        append_history(&config.outdir.join(HISTORY_FILE), first_epoch, &history)?;

        Ok(FitSummary {
            global_step: state.global_step,
            global_batch_size: batch_size,
            history,
        })
    }

    /// Enhances every window of `dataset` once and scores it against the
    /// clean side. Nothing is updated.
    pub fn evaluate(
        &self,
        dataset: &SeganTrainDataset,
        train_bs: Option<usize>,
    ) -> anyhow::Result<EvalSummary> {
        let state = self
            .compiled
            .as_ref()
            .context("SeganTrainer::compile must be called before evaluate")?;
        let batch_size = global_batch_size(self.config.batch_size, train_bs, &self.strategy);
        let device = self.strategy.primary_device();

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let batches = dataset.batches(batch_size, &mut rng)?;
        let num_frames = batches.num_frames();
        let mut abs_error = 0f64;
        for batch in batches {
            let (clean, noisy) = batch?;
            let clean = clean.to_device(device)?;
            let noisy = noisy.to_device(device)?;
            let enhanced = state.generator.forward(&noisy, None)?.to_dtype(DType::F32)?;
            abs_error += scalar(&(enhanced - clean)?.abs()?.sum_all()?)?;
        }

        let samples = (num_frames * state.generator.window_size()).max(1);
        let summary = EvalSummary {
            num_frames,
            mean_abs_error: abs_error / samples as f64,
        };
        tracing::info!(
            stage = %dataset.stage,
            frames = summary.num_frames,
            mean_abs_error = summary.mean_abs_error,
            "eval"
        );
        Ok(summary)
    }
}

fn log_train_metrics(step: usize, epoch: usize, mean: &StepMetrics) {
    tracing::info!(
        step,
        epoch,
        d_loss = mean.d_loss,
        g_adv_loss = mean.g_adv_loss,
        g_l1_loss = mean.g_l1_loss,
        "train"
    );
}

/// Replaces everything from `first_epoch` on with `epochs`, keeping the
/// entries of earlier runs.
fn append_history(
    path: &Path,
    first_epoch: usize,
    epochs: &[EpochSummary],
) -> anyhow::Result<()> {
    let mut history: Vec<EpochSummary> = match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text)
            .with_context(|| format!("Corrupt training history: {}", path.display()))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("Failed reading training history: {}", path.display()));
        }
    };
    history.retain(|entry| entry.epoch < first_epoch);
    history.extend_from_slice(epochs);

    fs::write(path, serde_json::to_string_pretty(&history)?)
        .with_context(|| format!("Failed writing training history: {}", path.display()))?;
    Ok(())
}

/// One discriminator update (real → 1, fake → 0) followed by one generator
/// update, both least-squares.
fn train_step(
    state: &mut Compiled,
    clean: &Tensor,
    noisy: &Tensor,
    noise_std: f64,
    l1_lambda: f64,
) -> anyhow::Result<StepMetrics> {
    let fake = state.generator.forward(noisy, None)?;
    let clean = clean.to_dtype(fake.dtype())?;

    let d_real = state
        .discriminator
        .forward_t(&add_noise(&clean, noise_std)?, noisy, true)?;
    let d_fake = state
        .discriminator
        .forward_t(&add_noise(&fake.detach(), noise_std)?, noisy, true)?;
    let d_loss = ((d_real - 1.0)?.sqr()?.mean_all()? + d_fake.sqr()?.mean_all()?)?
        .affine(0.5, 0.0)?;
    state.d_optimizer.backward_step(&d_loss)?;

    let d_fake = state
        .discriminator
        .forward_t(&add_noise(&fake, noise_std)?, noisy, true)?;
    let g_adv = (d_fake - 1.0)?.sqr()?.mean_all()?.affine(0.5, 0.0)?;
    let g_l1 = (&fake - &clean)?.abs()?.mean_all()?.affine(l1_lambda, 0.0)?;
    let g_loss = (&g_adv + &g_l1)?;
    state.g_optimizer.backward_step(&g_loss)?;

    Ok(StepMetrics {
        d_loss: scalar(&d_loss)?,
        g_adv_loss: scalar(&g_adv)?,
        g_l1_loss: scalar(&g_l1)?,
    })
}

fn add_noise(x: &Tensor, std: f64) -> candle_core::Result<Tensor> {
    if std <= 0.0 {
        return Ok(x.clone());
    }
    x.broadcast_add(&x.randn_like(0.0, std)?)
}

fn scalar(t: &Tensor) -> candle_core::Result<f64> {
    Ok(f64::from(t.to_dtype(DType::F32)?.to_scalar::<f32>()?))
}

fn adam_params(cfg: &AdamConfig) -> ParamsAdamW {
    ParamsAdamW {
        lr: cfg.learning_rate,
        beta1: cfg.beta_1,
        beta2: cfg.beta_2,
        eps: cfg.epsilon,
        weight_decay: 0.0,
    }
}

/// Per-replica batch (the override, else the configured one) times the
/// number of replicas.
pub fn global_batch_size(
    config_batch_size: usize,
    train_bs: Option<usize>,
    strategy: &ExecutionStrategy,
) -> usize {
    train_bs.unwrap_or(config_batch_size) * strategy.num_replicas_in_sync()
}

/// Input noise for the discriminator after `completed_epochs` epochs. The
/// noise decays every `denoise_every` epochs and switches off once it falls
/// below `noise_std_end`.
pub fn discriminator_noise_std(cfg: &ModelConfig, completed_epochs: usize) -> f64 {
    if cfg.noise_std <= 0.0 {
        return 0.0;
    }
    let decays = (completed_epochs / cfg.denoise_every.max(1)) as i32;
    let std = cfg.noise_std * cfg.noise_decay.powi(decays);
    if std < cfg.noise_std_end {
        0.0
    } else {
        std
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}
