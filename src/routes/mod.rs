//! HTTP route handlers.
//!
//! A thin JSON façade over the supervisor's methods. All handlers except
//! [`health`] require authentication via the [`crate::auth::require_api_key`]
//! middleware.

pub mod health;
pub mod watchdog;
