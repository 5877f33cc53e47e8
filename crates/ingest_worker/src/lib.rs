pub mod benchmark;
pub mod controller;

pub use benchmark::BenchmarkTracker;
pub use controller::{batch_handler, drop_hook, IotController};
