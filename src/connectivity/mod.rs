pub mod monitor;
pub mod probe;

pub use monitor::{ConnectivityMonitor, MonitorHandle, TickOutcome};
pub use probe::{Eligibility, EligibilityProbe, HttpEligibilityProbe};
