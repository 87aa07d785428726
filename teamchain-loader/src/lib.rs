// SPDX-License-Identifier: MIT OR Apache-2.0

//! Loading of group sigchains.
//!
//! [`TeamLoader`] drives a [`ChainPlayer`](teamchain_auth::ChainPlayer) over links fetched
//! through a [`LinkFetcher`], verifies signer keys and ancestor admin rights, and only hands
//! out a [`LoadedGroup`] once every ordering obligation has been resolved against the
//! [`IdentityLogs`].
pub mod config;
mod errors;
mod loader;
#[cfg(feature = "memory")]
pub mod memory;
pub mod resolve;
pub mod traits;

pub use config::LoaderConfig;
pub use errors::LoaderError;
pub use loader::{LoadRequest, LoadResult, LoadedGroup, TeamLoader};
pub use resolve::{ResolveError, resolve_proofs};
pub use traits::{
    IdentityLogSnapshot, IdentityLogs, LinkFetcher, LinkQuery, LogEvent, LogEventKind,
    SignerVerifier, SnapshotStore,
};
