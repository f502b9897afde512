//! Wires CLI args and the YAML config into a ready-to-fit training session.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;

use crate::cli::TrainArgs;
use crate::config::{Config, DataPaths};
use crate::dataset::{SeganTrainDataset, Stage};
use crate::featurizer::{build_featurizer, SpeechFeaturizer};
use crate::model::{Discriminator, Generator};
use crate::runtime;
use crate::strategy::ExecutionStrategy;
use crate::train::{EvalSummary, FitSummary, SeganTrainer};

const GENERATOR_SUMMARY_WIDTH: usize = 150;
const DISCRIMINATOR_SUMMARY_WIDTH: usize = 100;

pub struct Session {
    config: Config,
    featurizer: Arc<dyn SpeechFeaturizer>,
    dataset: SeganTrainDataset,
    eval_dataset: Option<SeganTrainDataset>,
    trainer: SeganTrainer,
    train_bs: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub fit: FitSummary,
    /// Present when the config lists `test_paths`.
    pub eval: Option<EvalSummary>,
}

#[derive(Serialize)]
struct RunSnapshot<'a> {
    started_at: String,
    args: &'a TrainArgs,
    config: &'a Config,
}

impl Session {
    /// Everything up to, but not including, the blocking fit.
    ///
    /// Call [`runtime::setup_environment`] first. The mixed-precision toggle
    /// and the strategy are settled before any model variable is created,
    /// since models can only be built from the trainer's strategy scope.
    pub fn bootstrap(args: &TrainArgs) -> anyhow::Result<Self> {
        args.validate()?;

        runtime::set_mixed_precision(args.mxp);
        let strategy = ExecutionStrategy::from_devices(&args.devices)?;

        let config = Config::load(&args.config, true)?;
        tracing::info!(path = %args.config.display(), "Config loaded");
        let learning = config.learning_config()?.clone();

        let featurizer = build_featurizer(args.featurizer_kind(), &config.speech_config)?;

        let cache_dir = learning
            .dataset_config
            .cache_dir
            .clone()
            .unwrap_or_else(|| learning.running_config.outdir.join("cache"));
        let open_dataset = |stage: Stage, paths: &DataPaths, shuffle: bool| {
            let dataset = SeganTrainDataset::new(
                stage,
                Arc::clone(&featurizer),
                &paths.clean,
                &paths.noisy,
                args.cache,
                shuffle,
            )?;
            anyhow::Ok(if args.cache {
                dataset.with_cache_dir(&cache_dir)
            } else {
                dataset
            })
        };
        let dataset = open_dataset(Stage::Train, &learning.dataset_config.train_paths, true)?;
        let eval_dataset = learning
            .dataset_config
            .test_paths
            .as_ref()
            .map(|paths| open_dataset(Stage::Eval, paths, false))
            .transpose()?;

        let mut trainer = SeganTrainer::new(learning.running_config.clone(), strategy);

        let (generator, discriminator) = {
            let scope = trainer.strategy().scope();
            let window_size = featurizer.window_size();

            let generator = Generator::new(window_size, &config.model_config, &scope)
                .context("Failed to construct generator")?;
            generator.build()?;
            generator.summary(GENERATOR_SUMMARY_WIDTH);

            let discriminator = Discriminator::new(window_size, &config.model_config, &scope)
                .context("Failed to construct discriminator")?;
            discriminator.build()?;
            discriminator.summary(DISCRIMINATOR_SUMMARY_WIDTH);

            (generator, discriminator)
        };

        trainer.compile(
            generator,
            discriminator,
            &learning.optimizer_config,
            args.max_ckpts,
        )?;
        write_snapshot(&learning.running_config.outdir, args, &config)?;

        Ok(Self {
            config,
            featurizer,
            dataset,
            eval_dataset,
            trainer,
            train_bs: args.tbs,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn featurizer(&self) -> &Arc<dyn SpeechFeaturizer> {
        &self.featurizer
    }

    pub fn dataset(&self) -> &SeganTrainDataset {
        &self.dataset
    }

    pub fn eval_dataset(&self) -> Option<&SeganTrainDataset> {
        self.eval_dataset.as_ref()
    }

    pub fn trainer(&self) -> &SeganTrainer {
        &self.trainer
    }

    /// Blocks until every configured epoch has run, then scores the
    /// evaluation set if there is one.
    pub fn run(mut self) -> anyhow::Result<RunSummary> {
        let fit = self.trainer.fit(&self.dataset, self.train_bs)?;
        let eval = self
            .eval_dataset
            .as_ref()
            .map(|dataset| self.trainer.evaluate(dataset, self.train_bs))
            .transpose()?;
        Ok(RunSummary { fit, eval })
    }
}

pub fn run(args: &TrainArgs) -> anyhow::Result<()> {
    let session = Session::bootstrap(args)?;
    let outdir = session.trainer().config().outdir.clone();
    let RunSummary { fit, eval } = session.run()?;

    println!("Global steps: {}", fit.global_step);
    println!("Global batch size: {}", fit.global_batch_size);
    if let Some(last) = fit.history.last() {
        println!(
            "Last epoch {}: d_loss={:.4}, g_l1_loss={:.4}",
            last.epoch, last.metrics.d_loss, last.metrics.g_l1_loss
        );
    }
    if let Some(eval) = eval {
        println!(
            "Eval: {} frames, mean abs error {:.5}",
            eval.num_frames, eval.mean_abs_error
        );
    }
    println!("Artifacts written to: {}", outdir.display());
    Ok(())
}

fn write_snapshot(outdir: &Path, args: &TrainArgs, config: &Config) -> anyhow::Result<()> {
    fs::create_dir_all(outdir)
        .with_context(|| format!("Failed creating output dir: {}", outdir.display()))?;
    let snapshot = RunSnapshot {
        started_at: Utc::now().to_rfc3339(),
        args,
        config,
    };
    let path = outdir.join("config.json");
    fs::write(&path, serde_json::to_string_pretty(&snapshot)?)
        .with_context(|| format!("Failed writing config: {}", path.display()))?;
    Ok(())
}
