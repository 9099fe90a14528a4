pub mod drain;
pub mod metrics;
pub mod prelude;
pub mod readiness;
pub mod signal;
pub mod strng;
pub mod version;
