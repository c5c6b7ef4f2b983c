pub mod consumers;
pub mod env;
pub mod mqs;
pub mod redis;
pub mod telemetry;
pub mod time;
