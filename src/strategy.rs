use std::collections::HashSet;

use anyhow::Context;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use crate::runtime;

/// How model variables are placed across the requested devices.
#[derive(Debug, Clone)]
pub enum ExecutionStrategy {
    OneDevice(Device),
    /// One replica per device. Master variables live on the first replica.
    Mirrored {
        device_ids: Vec<usize>,
        devices: Vec<Device>,
    },
}

impl ExecutionStrategy {
    pub fn from_devices(device_ids: &[usize]) -> anyhow::Result<Self> {
        if device_ids.is_empty() {
            return Ok(Self::OneDevice(Device::Cpu));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = device_ids.iter().find(|id| !seen.insert(**id)) {
            anyhow::bail!("Device id {dup} listed more than once in --devices");
        }

        let devices = device_ids
            .iter()
            .map(|&id| {
                Device::cuda_if_available(id)
                    .with_context(|| format!("Failed to open device {id}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        if devices.len() > 1 && devices.iter().all(Device::is_cpu) {
            tracing::warn!(
                replicas = devices.len(),
                "CUDA is not available, every replica runs on the CPU"
            );
        }

        if devices.len() == 1 {
            let device = devices.into_iter().next().unwrap_or(Device::Cpu);
            Ok(Self::OneDevice(device))
        } else {
            Ok(Self::Mirrored {
                device_ids: device_ids.to_vec(),
                devices,
            })
        }
    }

    pub fn num_replicas_in_sync(&self) -> usize {
        match self {
            Self::OneDevice(_) => 1,
            Self::Mirrored { devices, .. } => devices.len(),
        }
    }

    pub fn primary_device(&self) -> &Device {
        match self {
            Self::OneDevice(device) => device,
            Self::Mirrored { devices, .. } => &devices[0],
        }
    }

    pub fn is_mirrored(&self) -> bool {
        matches!(self, Self::Mirrored { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::OneDevice(device) => format!("OneDevice({device:?})"),
            Self::Mirrored { device_ids, .. } => format!("Mirrored(devices={device_ids:?})"),
        }
    }

    /// Opens a variable-creation scope. The compute dtype is fixed at this
    /// point, so toggle mixed precision before calling.
    pub fn scope(&self) -> StrategyScope<'_> {
        StrategyScope {
            strategy: self,
            dtype: runtime::compute_dtype(self.primary_device()),
        }
    }
}

/// Borrowed from a strategy while models are being constructed.
pub struct StrategyScope<'a> {
    strategy: &'a ExecutionStrategy,
    dtype: DType,
}

impl StrategyScope<'_> {
    pub fn strategy(&self) -> &ExecutionStrategy {
        self.strategy
    }

    pub fn device(&self) -> &Device {
        self.strategy.primary_device()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn var_builder(&self, varmap: &VarMap) -> VarBuilder<'static> {
        VarBuilder::from_varmap(varmap, self.dtype, self.device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_id_is_one_device() {
        let strategy = ExecutionStrategy::from_devices(&[0]).unwrap();
        assert!(matches!(strategy, ExecutionStrategy::OneDevice(_)));
        assert_eq!(strategy.num_replicas_in_sync(), 1);
    }

    #[test]
    fn several_ids_are_mirrored() {
        let strategy = ExecutionStrategy::from_devices(&[0, 1]).unwrap();
        assert!(strategy.is_mirrored());
        assert_eq!(strategy.num_replicas_in_sync(), 2);
        assert!(strategy.describe().contains("[0, 1]"));
    }

    #[test]
    fn empty_list_falls_back_to_cpu() {
        let strategy = ExecutionStrategy::from_devices(&[]).unwrap();
        assert!(strategy.primary_device().is_cpu());
        assert_eq!(strategy.num_replicas_in_sync(), 1);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        assert!(ExecutionStrategy::from_devices(&[0, 0]).is_err());
    }
}
