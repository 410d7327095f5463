//! # switchboard
//!
//! Core of a multi-provider LLM proxy: accepts requests in the public chat
//! dialects (OpenAI, Claude, Gemini, Ollama), dispatches them to
//! heterogeneous back-ends (official APIs, OAuth desktop identities, AWS
//! CodeWhisperer / Kiro), and owns the credential lifecycle, dialect
//! translation, streaming reassembly, refresh-with-retry, and usage
//! reporting. The HTTP server, console, and configuration loading live in
//! the host.
//!
//! ## Layout
//!
//! - [`auth`] — accounts, credential store, selection pool, refresh drivers
//! - [`dialect`] — canonical forms and per-dialect request/response/stream
//!   conversion
//! - [`providers`] — per-provider executors producing the canonical event
//!   sequence
//! - [`usage`] — per-request counters and quota snapshots
//!
//! ## Sketch
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use switchboard::auth::{default_drivers, AuthManager, FileCredentialStore, Provider};
//! use switchboard::dialect::Dialect;
//! use switchboard::providers::{CancelToken, ExecOpts, ExecRequest, Executor, KiroExecutor};
//!
//! # async fn run() -> switchboard::Result<()> {
//! let store = Arc::new(FileCredentialStore::new("~/.switchboard/auth"));
//! let auth = Arc::new(AuthManager::new(store, default_drivers()));
//! auth.load_all().await?;
//! let scheduler = Arc::clone(&auth).spawn_scheduler();
//!
//! let executor = KiroExecutor::new(Arc::clone(&auth));
//! let account = auth.select(Provider::Kiro).await?;
//! let request = ExecRequest::new(
//!     Dialect::OpenAiChat,
//!     "claude-sonnet-4-5",
//!     br#"{"model":"claude-sonnet-4-5","messages":[{"role":"user","content":"hi"}]}"#.to_vec(),
//! );
//! let response = executor
//!     .execute(&CancelToken::new(), &account, &request, &ExecOpts::default())
//!     .await?;
//! # drop((scheduler, response));
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod dialect;
pub mod error;
pub mod net;
pub mod providers;
pub mod usage;

pub use error::{Error, Result};
