pub mod config;
pub mod dispatch;
pub mod domain;
pub mod email_client;
pub mod ledger;
pub mod lock;
pub mod queue;
pub mod readiness;
pub mod routes;
pub mod startup;
pub mod store;
pub mod telemetry;
pub mod tokens;
pub mod utils;
