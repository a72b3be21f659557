pub mod init;
pub mod loader;

pub use init::init_tracing;
pub use loader::{ImageLoader, LoadPhase};
