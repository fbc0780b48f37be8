pub mod auth;
pub mod compression;
