//! Git repositories as configuration sources.

pub mod auth;
pub mod parse;
pub mod repository;

pub use repository::GitSource;
