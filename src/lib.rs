//! M-Pesa STK push payments backend
//!
//! Prompts donors for payment through M-Pesa, receives the provider's result
//! callback, and reconciles unanswered payments by querying the provider.

pub mod api;
#[cfg(feature = "cache")]
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod payments;
