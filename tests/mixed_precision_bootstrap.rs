// Own test binary: bootstrap flips the process-wide precision toggle.

mod common;

use common::Workspace;
use segan_trainer::runtime;
use segan_trainer::session::Session;

#[test]
fn mxp_is_set_before_models_are_built() {
    let ws = Workspace::new(1);
    assert!(!runtime::mixed_precision_enabled());

    let session = Session::bootstrap(&ws.args(&["--mxp"])).unwrap();
    assert!(runtime::mixed_precision_enabled());

    let trainer = session.trainer();
    let device = trainer.strategy().primary_device();
    let expected = runtime::compute_dtype(device);
    assert_eq!(trainer.strategy().scope().dtype(), expected);
    assert_eq!(trainer.generator().unwrap().dtype(), expected);
    assert_eq!(trainer.discriminator().unwrap().dtype(), expected);
}
