pub mod chat;
pub mod config;
pub mod gateway;
pub mod mcp;
pub mod mirror;
