//! Microsoft/Xbox Live authentication for bot-controlled accounts.
//!
//! This crate turns a configured email into a fully authenticated
//! [`Identity`]: an XUID, a user hash, and an XSTS token combined into the
//! `XBL3.0` authorization header consumed by every other Xbox Live call.
//!
//! # Authentication Flow
//!
//! 1. Silent reuse/refresh from the on-disk token cache
//! 2. Device-code OAuth (live or MSAL flavor) with a pluggable prompt sink
//! 3. XASU user token
//! 4. XASD device / XAST title tokens (manual recovery path)
//! 5. XSTS authorization with hardened response parsing
//!
//! Strategies are tried from a ladder of (flow, relying party, scope) rows;
//! the first to yield a length-validated token wins. See
//! [`pipeline::AuthPipeline`] for the entry point.
//!
//! # Token Storage
//!
//! Sessions persist through the [`TokenStore`] trait. [`FileTokenStore`]
//! writes plain JSON bundles with 0600 permissions under a 0700 directory,
//! atomically (write-temp-then-rename); [`MemoryTokenStore`] backs tests.

pub mod client;
pub mod config;
pub mod device_code;
pub mod errors;
pub mod file_store;
pub mod identity;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod store;

pub use client::XboxAuthClient;
pub use config::{default_strategies, AuthFlow, HttpTimeouts, RetryPolicy, Strategy};
pub use device_code::{DeviceCodePrompt, TracingPresenter, UserCodePresenter};
pub use errors::{AuthError, Result, XstsApiError};
pub use file_store::FileTokenStore;
pub use identity::{identity_key, AuthMethod, AuthTitle, Identity, TokenCacheEntry};
pub use parse::{parse_xsts_response, ParsedXsts};
pub use pipeline::{AuthPipeline, PipelineOptions};
pub use store::{MemoryTokenStore, TokenStore};
