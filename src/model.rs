use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{
    batch_norm, conv1d, linear, prelu, BatchNorm, BatchNormConfig, Conv1d, Conv1dConfig, Linear,
    Module, ModuleT, PReLU, VarMap,
};

use crate::config::ModelConfig;
use crate::strategy::StrategyScope;

#[derive(Debug)]
struct EncoderBlock {
    conv: Conv1d,
    act: PReLU,
}

/// Nearest-neighbour upsampling by `ratio` followed by a same-length conv.
#[derive(Debug)]
struct DecoderBlock {
    conv: Conv1d,
    /// Absent on the output layer, which goes straight to tanh.
    act: Option<PReLU>,
}

/// Encoder/decoder over raw waveform windows with skip connections and a
/// latent code concatenated at the bottleneck.
pub struct Generator {
    varmap: VarMap,
    window_size: usize,
    cfg: ModelConfig,
    device: Device,
    dtype: DType,
    encoder: Vec<EncoderBlock>,
    decoder: Vec<DecoderBlock>,
}

impl Generator {
    pub fn new(
        window_size: usize,
        cfg: &ModelConfig,
        scope: &StrategyScope,
    ) -> anyhow::Result<Self> {
        check_hparams(window_size, cfg.kwidth, cfg.ratio, &cfg.g_enc_depths)?;

        let varmap = VarMap::new();
        let vb = scope.var_builder(&varmap);
        let conv_cfg = Conv1dConfig {
            padding: cfg.kwidth / 2,
            stride: cfg.ratio,
            ..Default::default()
        };
        let upconv_cfg = Conv1dConfig {
            padding: cfg.kwidth / 2,
            ..Default::default()
        };

        let depths = &cfg.g_enc_depths;
        let mut encoder = Vec::with_capacity(depths.len());
        let mut in_channels = 1;
        for (index, &depth) in depths.iter().enumerate() {
            let vb = vb.pp(format!("enc{index}"));
            encoder.push(EncoderBlock {
                conv: conv1d(in_channels, depth, cfg.kwidth, conv_cfg, vb.pp("conv"))?,
                act: prelu(Some(depth), vb.pp("prelu"))?,
            });
            in_channels = depth;
        }

        // Every decoder input is a skip (or the latent) concatenated with the
        // previous output, hence twice the encoder depth.
        let mut decoder = Vec::with_capacity(depths.len());
        for index in (0..depths.len()).rev() {
            let vb = vb.pp(format!("dec{index}"));
            let out_channels = if index == 0 { 1 } else { depths[index - 1] };
            let conv = conv1d(
                2 * depths[index],
                out_channels,
                cfg.kwidth,
                upconv_cfg,
                vb.pp("conv"),
            )?;
            let act = if index == 0 {
                None
            } else {
                Some(prelu(Some(out_channels), vb.pp("prelu"))?)
            };
            decoder.push(DecoderBlock { conv, act });
        }

        Ok(Self {
            varmap,
            window_size,
            cfg: cfg.clone(),
            device: scope.device().clone(),
            dtype: scope.dtype(),
            encoder,
            decoder,
        })
    }

    /// Shape of the latent code for a batch of `batch_size` windows.
    pub fn latent_shape(&self, batch_size: usize) -> (usize, usize, usize) {
        let depth = self.cfg.g_enc_depths.len() as u32;
        let channels = *self.cfg.g_enc_depths.last().unwrap_or(&1);
        (batch_size, channels, self.window_size / self.cfg.ratio.pow(depth))
    }

    /// `noisy` is `[B, 1, window]`. A fresh standard normal latent is drawn
    /// when `z` is `None`.
    pub fn forward(&self, noisy: &Tensor, z: Option<&Tensor>) -> Result<Tensor> {
        let mut h = noisy.to_dtype(self.dtype)?;
        let mut skips = Vec::with_capacity(self.encoder.len());
        for block in &self.encoder {
            h = block.act.forward(&block.conv.forward(&h)?)?;
            skips.push(h.clone());
        }

        let z = match z {
            Some(z) => z.to_dtype(self.dtype)?,
            None => Tensor::randn(0f32, 1f32, h.shape(), h.device())?.to_dtype(self.dtype)?,
        };
        h = Tensor::cat(&[&h, &z], 1)?;

        let depth = skips.len();
        for (index, block) in self.decoder.iter().enumerate() {
            h = block.conv.forward(&upsample_nearest(&h, self.cfg.ratio)?)?;
            if let Some(act) = &block.act {
                h = act.forward(&h)?;
                h = Tensor::cat(&[&h, &skips[depth - 2 - index]], 1)?;
            }
        }
        h.tanh()
    }

    /// Runs a zero window through the network so every parameter is
    /// materialised and the output shape is checked before training.
    pub fn build(&self) -> anyhow::Result<()> {
        let x = Tensor::zeros((1, 1, self.window_size), self.dtype, &self.device)?;
        let z = Tensor::zeros(self.latent_shape(1), self.dtype, &self.device)?;
        let y = self.forward(&x, Some(&z))?;
        if y.dims3()? != (1, 1, self.window_size) {
            anyhow::bail!(
                "Generator output shape {:?} does not match window size {}",
                y.dims(),
                self.window_size
            );
        }
        Ok(())
    }

    pub fn summary(&self, line_length: usize) {
        print_summary("generator", &self.varmap, line_length);
    }

    pub fn num_parameters(&self) -> usize {
        parameter_table(&self.varmap).iter().map(|row| row.count).sum()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn varmap_mut(&mut self) -> &mut VarMap {
        &mut self.varmap
    }
}

#[derive(Debug)]
struct DiscriminatorBlock {
    conv: Conv1d,
    bn: BatchNorm,
}

/// Scores a (candidate, noisy) window pair; one logit per example.
pub struct Discriminator {
    varmap: VarMap,
    window_size: usize,
    leakiness: f64,
    device: Device,
    dtype: DType,
    blocks: Vec<DiscriminatorBlock>,
    reduce: Conv1d,
    head: Linear,
}

impl Discriminator {
    pub fn new(
        window_size: usize,
        cfg: &ModelConfig,
        scope: &StrategyScope,
    ) -> anyhow::Result<Self> {
        check_hparams(window_size, cfg.kwidth, cfg.ratio, &cfg.d_num_fmaps)?;

        let varmap = VarMap::new();
        let vb = scope.var_builder(&varmap);
        let conv_cfg = Conv1dConfig {
            padding: cfg.kwidth / 2,
            stride: cfg.ratio,
            ..Default::default()
        };

        let mut blocks = Vec::with_capacity(cfg.d_num_fmaps.len());
        let mut in_channels = 2;
        for (index, &fmaps) in cfg.d_num_fmaps.iter().enumerate() {
            let vb = vb.pp(format!("block{index}"));
            blocks.push(DiscriminatorBlock {
                conv: conv1d(in_channels, fmaps, cfg.kwidth, conv_cfg, vb.pp("conv"))?,
                bn: batch_norm(fmaps, BatchNormConfig::default(), vb.pp("bn"))?,
            });
            in_channels = fmaps;
        }

        let reduce = conv1d(in_channels, 1, 1, Conv1dConfig::default(), vb.pp("reduce"))?;
        let reduced_len = window_size / cfg.ratio.pow(cfg.d_num_fmaps.len() as u32);
        let head = linear(reduced_len, 1, vb.pp("head"))?;

        Ok(Self {
            varmap,
            window_size,
            leakiness: cfg.leakiness,
            device: scope.device().clone(),
            dtype: scope.dtype(),
            blocks,
            reduce,
            head,
        })
    }

    /// Both inputs are `[B, 1, window]`; returns `[B, 1]`.
    pub fn forward_t(&self, candidate: &Tensor, noisy: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = Tensor::cat(&[candidate, noisy], 1)?.to_dtype(self.dtype)?;
        for block in &self.blocks {
            let x = block.conv.forward(&h)?;
            let x = block.bn.forward_t(&x, train)?;
            h = candle_nn::ops::leaky_relu(&x, self.leakiness)?;
        }
        let h = self.reduce.forward(&h)?.flatten_from(1)?;
        self.head.forward(&h)
    }

    pub fn build(&self) -> anyhow::Result<()> {
        let x = Tensor::zeros((1, 1, self.window_size), self.dtype, &self.device)?;
        let y = self.forward_t(&x, &x, false)?;
        if y.dims2()? != (1, 1) {
            anyhow::bail!("Discriminator output shape {:?} is not [1, 1]", y.dims());
        }
        Ok(())
    }

    pub fn summary(&self, line_length: usize) {
        print_summary("discriminator", &self.varmap, line_length);
    }

    pub fn num_parameters(&self) -> usize {
        parameter_table(&self.varmap).iter().map(|row| row.count).sum()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn varmap_mut(&mut self) -> &mut VarMap {
        &mut self.varmap
    }
}

/// Repeats every step `factor` times: `[B, C, L]` to `[B, C, L * factor]`.
fn upsample_nearest(x: &Tensor, factor: usize) -> Result<Tensor> {
    let (batch, channels, len) = x.dims3()?;
    x.unsqueeze(3)?
        .broadcast_as((batch, channels, len, factor))?
        .reshape((batch, channels, len * factor))
}

fn check_hparams(
    window_size: usize,
    kwidth: usize,
    ratio: usize,
    depths: &[usize],
) -> anyhow::Result<()> {
    if kwidth == 0 || kwidth % 2 == 0 {
        anyhow::bail!("kwidth must be odd, got {kwidth}");
    }
    if ratio < 2 {
        anyhow::bail!("ratio must be >= 2, got {ratio}");
    }
    if depths.is_empty() || depths.contains(&0) {
        anyhow::bail!("Layer depths must be a non-empty list of positive values");
    }
    let reduction = ratio
        .checked_pow(depths.len() as u32)
        .filter(|reduction| *reduction <= window_size)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "window_size {window_size} is too small for {} layers with ratio {ratio}",
                depths.len()
            )
        })?;
    if window_size % reduction != 0 {
        anyhow::bail!("window_size {window_size} is not divisible by {reduction}");
    }
    Ok(())
}

struct ParameterRow {
    name: String,
    shape: Vec<usize>,
    count: usize,
}

fn parameter_table(varmap: &VarMap) -> Vec<ParameterRow> {
    let data = varmap
        .data()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut rows: Vec<ParameterRow> = data
        .iter()
        .map(|(name, var)| ParameterRow {
            name: name.clone(),
            shape: var.dims().to_vec(),
            count: var.elem_count(),
        })
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    rows
}

fn print_summary(model_name: &str, varmap: &VarMap, line_length: usize) {
    let rows = parameter_table(varmap);
    let line_length = line_length.max(40);
    let name_width = line_length * 55 / 100;
    let shape_width = line_length * 30 / 100;

    let total: usize = rows.iter().map(|row| row.count).sum();
    // Batch norm running statistics are updated in place, not by the optimizer.
    let non_trainable: usize = rows
        .iter()
        .filter(|row| row.name.contains("running_"))
        .map(|row| row.count)
        .sum();

    println!("Model: \"{model_name}\"");
    println!("{}", "_".repeat(line_length));
    println!(
        "{:<name_width$}{:<shape_width$}{}",
        "Parameter", "Shape", "Param #"
    );
    println!("{}", "=".repeat(line_length));
    for row in &rows {
        println!(
            "{:<name_width$}{:<shape_width$}{}",
            row.name,
            format!("{:?}", row.shape),
            row.count
        );
    }
    println!("{}", "=".repeat(line_length));
    println!("Total params: {total}");
    println!("Trainable params: {}", total - non_trainable);
    println!("Non-trainable params: {non_trainable}");
    println!("{}", "_".repeat(line_length));
}
