//! Process-wide setup that must happen before any candle usage.

use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{DType, Device};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "info,candle_core=error,candle_nn=error";

static AUTO_MIXED_PRECISION: AtomicBool = AtomicBool::new(false);

/// Installs the tracing subscriber and pins the numeric thread pool size.
///
/// Call this first in `main`. Candle reads `RAYON_NUM_THREADS` once, the
/// first time it sizes its worker pool, so the override has no effect after
/// any tensor work has run. Calling it again is a no-op for logging.
pub fn setup_environment() {
    if let Ok(threads) = std::env::var("SEGAN_NUM_THREADS") {
        if std::env::var_os("RAYON_NUM_THREADS").is_none() {
            std::env::set_var("RAYON_NUM_THREADS", threads);
        }
    }

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

pub fn set_mixed_precision(enabled: bool) {
    AUTO_MIXED_PRECISION.store(enabled, Ordering::SeqCst);
    tracing::debug!(enabled, "auto mixed precision");
}

pub fn mixed_precision_enabled() -> bool {
    AUTO_MIXED_PRECISION.load(Ordering::SeqCst)
}

/// Variable dtype for new models on `device`.
///
/// Reduced precision only pays off on accelerators; CPU stays in F32.
pub fn compute_dtype(device: &Device) -> DType {
    if mixed_precision_enabled() && !device.is_cpu() {
        DType::BF16
    } else {
        DType::F32
    }
}
