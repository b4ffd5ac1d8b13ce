pub mod interlock;
pub mod manager;
pub mod outcome;
pub mod scheduler;
pub mod settings;
pub mod types;


pub use interlock::PumpPlan;
pub use manager::*;
pub use outcome::*;
pub use scheduler::{AnchoredClock, Clock, SystemClock, Transition, time_until};
pub use settings::*;
pub use types::*;
