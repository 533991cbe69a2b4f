pub mod api;
pub mod auth;
pub mod bot;
pub mod challenge;
pub mod config;
pub mod db;
pub mod elo;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod tournament;
