pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod organizations;
pub mod routes;
pub mod saga;
pub mod telemetry;
pub mod webhooks;
