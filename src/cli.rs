use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;

use crate::featurizer::FeaturizerKind;

/// `config.yml` shipped next to this crate's manifest.
pub const DEFAULT_CONFIG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config.yml");

#[derive(Debug, Clone, Serialize, Parser)]
#[command(
    name = "segan-trainer",
    about = "Train a SEGAN speech enhancement model using Candle"
)]
pub struct TrainArgs {
    #[arg(
        long,
        short = 'c',
        default_value = DEFAULT_CONFIG,
        help = "The file path of model configuration file"
    )]
    pub config: PathBuf,

    #[arg(
        long = "max_ckpts",
        default_value_t = 10,
        help = "Max number of checkpoints to keep"
    )]
    pub max_ckpts: usize,

    #[arg(long, help = "Train batch size per replica")]
    pub tbs: Option<usize>,

    #[arg(
        long,
        num_args = 0..,
        default_values_t = [0usize],
        help = "Device ids to apply distributed training"
    )]
    pub devices: Vec<usize>,

    #[arg(long, default_value_t = false, help = "Enable mixed precision")]
    pub mxp: bool,

    #[arg(long, default_value_t = false, help = "Choose ndarray features extractor")]
    pub nfx: bool,

    #[arg(long, default_value_t = false, help = "Enable caching for dataset")]
    pub cache: bool,
}

impl TrainArgs {
    pub fn featurizer_kind(&self) -> FeaturizerKind {
        if self.nfx {
            FeaturizerKind::Numpy
        } else {
            FeaturizerKind::Tensor
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_ckpts == 0 {
            anyhow::bail!("--max_ckpts must be > 0");
        }
        if self.tbs == Some(0) {
            anyhow::bail!("--tbs must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> TrainArgs {
        TrainArgs::try_parse_from(std::iter::once("segan-trainer").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let args = parse(&[]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG));
        assert_eq!(args.max_ckpts, 10);
        assert_eq!(args.tbs, None);
        assert_eq!(args.devices, vec![0]);
        assert!(!args.mxp && !args.nfx && !args.cache);
        assert_eq!(args.featurizer_kind(), FeaturizerKind::Tensor);
    }

    #[test]
    fn parses_all_flags() {
        let args = parse(&[
            "-c",
            "run.yml",
            "--max_ckpts",
            "3",
            "--tbs",
            "16",
            "--devices",
            "0",
            "1",
            "--mxp",
            "--nfx",
            "--cache",
        ]);
        assert_eq!(args.config, PathBuf::from("run.yml"));
        assert_eq!(args.max_ckpts, 3);
        assert_eq!(args.tbs, Some(16));
        assert_eq!(args.devices, vec![0, 1]);
        assert!(args.mxp && args.cache);
        assert_eq!(args.featurizer_kind(), FeaturizerKind::Numpy);
    }

    #[test]
    fn malformed_values_are_usage_errors() {
        assert!(TrainArgs::try_parse_from(["segan-trainer", "--max_ckpts", "many"]).is_err());
        assert!(TrainArgs::try_parse_from(["segan-trainer", "--devices", "gpu0"]).is_err());
    }

    #[test]
    fn zero_batch_override_is_rejected() {
        assert!(parse(&["--tbs", "0"]).validate().is_err());
        assert!(parse(&["--max_ckpts", "0"]).validate().is_err());
        assert!(parse(&["--tbs", "8"]).validate().is_ok());
    }
}
