pub mod pool;
pub mod readiness;
pub mod scheduler;
pub mod signal;
pub mod stripe;
pub mod telemetry;
