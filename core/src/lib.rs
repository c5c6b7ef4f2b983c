pub mod alert;
pub mod application;
pub mod config;
pub mod consts;
pub mod delivery;
pub mod errors;
pub mod health_api;
pub mod idempotency;
pub mod logbatch;
pub mod matcher;
pub mod migrations;
pub mod models;
pub mod publish;
pub mod retry;
pub mod stores;
pub mod supervisor;
