pub mod sweep_worker;
pub use sweep_worker::{SweepHandle, SweepWorker};
