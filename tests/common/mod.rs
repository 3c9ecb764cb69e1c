use std::sync::Once;

static INIT: Once = Once::new();

/// Route engine logs through the test writer; `RUST_LOG=debug` to see them.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
