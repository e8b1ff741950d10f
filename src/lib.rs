pub mod auth;
pub mod config;
pub mod consultations;
pub mod contacts;
pub mod delivery;
pub mod error;
pub mod message_store;
pub mod messages;
pub mod models;
pub mod registry;
pub mod routes;
pub mod server;
pub mod store;

pub use error::{CareError, CareResult};
