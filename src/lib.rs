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
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! edgewire library: the manager/agent edge tunnel and its HTTP surfaces.
//!
//! - `tunnel`: wire protocol, correlation, registry, server, client, proxying
//! - `routes`: manager and agent route handlers
//! - `auth`: admin key middleware
//! - `config`: configuration loading
//! - `error`: error taxonomy

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod tunnel;

pub use auth::ApiKey;
pub use config::Config;
pub use error::{ConfigError, TunnelError};
pub use state::{AgentState, ManagerState};
