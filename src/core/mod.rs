pub mod cache;
pub mod codec;
pub mod config;
pub mod connection;
pub mod meta;
pub mod range;
pub mod registry;
pub mod transfer;
