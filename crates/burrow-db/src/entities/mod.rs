//! Database entities

pub mod auth_token;
pub mod domain;
pub mod user;
pub mod user_bandwidth;
