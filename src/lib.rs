pub mod app;
pub mod authz;
pub mod cache;
pub mod db;
pub mod docs;
pub mod errors;
pub mod events;
pub mod jwt;
pub mod models;
pub mod routes;
pub mod store;
pub mod tenant;
pub mod utils;

pub use app::{create_app, AppState};
