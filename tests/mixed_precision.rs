// Runs in its own test binary: the toggle is process-wide.

use candle_core::{DType, Device};
use segan_trainer::runtime;
use segan_trainer::strategy::ExecutionStrategy;

#[test]
fn toggle_is_observable_and_cpu_stays_f32() {
    runtime::set_mixed_precision(true);
    assert!(runtime::mixed_precision_enabled());
    assert_eq!(runtime::compute_dtype(&Device::Cpu), DType::F32);

    let strategy = ExecutionStrategy::from_devices(&[]).unwrap();
    assert_eq!(strategy.scope().dtype(), DType::F32);

    runtime::set_mixed_precision(false);
    assert!(!runtime::mixed_precision_enabled());
}
