pub mod generate;
pub mod simulator;

pub use generate::generate_reading;
pub use simulator::{ReadingPublisher, Simulator, SimulatorConfig, SimulatorSummary};
