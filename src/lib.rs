//! Dripline — outreach drip campaigns and inbox auto-replies for connected
//! messaging accounts.

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod secrets;
pub mod store;
