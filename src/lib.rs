pub mod config;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod network;
pub mod sandbox;
pub mod server;
pub mod store;
pub mod studio;
pub mod telemetry;
pub mod util;
pub mod workflow;
