pub mod sweeper;

pub use sweeper::{DeadLetter, ExpirationSweeper, SweepReport, SweeperConfig};
