pub mod env;
pub mod tracing_init;

pub use env::SyncConfig;
pub use tracing_init::init_tracing;
