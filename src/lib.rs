#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! modemwatch library — the building blocks of the modem health watchdog.
//!
//! - `watchdog` — per-modem health state machines and progressive recovery
//! - `volte` — VoLTE audio-path control and post-reset reinitialization
//! - `asterisk` — telephony engine adapter (the injectable external seam)
//! - `status` — device state parsing
//! - `actionlog` — bounded JSON-Lines audit log with rotation
//! - `shell` / `serial` — process execution and direct AT access
//! - `clock` — injectable time source
//! - `config` — configuration loading
//! - `auth` — API key authentication middleware
//! - `routes` — REST API route handlers

pub mod actionlog;
pub mod asterisk;
pub mod auth;
pub mod clock;
pub mod config;
pub mod routes;
pub mod serial;
pub mod shell;
pub mod state;
pub mod status;
pub mod volte;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use state::AppState;
pub use watchdog::{HealthSupervisor, Supervisor};
