pub mod app;
pub mod cleanup;
pub mod collection;
pub mod config;
pub mod domain;
pub mod error;
pub mod nearest;
pub mod output;
pub mod pipeline;
pub mod probe;
pub mod sanitize;
pub mod selection;
pub mod store;
pub mod transfer;
pub mod version;
