//! PushBuild - Build binaries and push them to remote hosts
//!
//! The build client compiles configured packages with a worker pool and
//! uploads each binary to a deploy server over mutual TLS. The server
//! replaces the matching executable on disk, running optional before/after
//! actions around the swap.
//!
//! Every connection carries exactly one request and one response:
//!
//! ```text
//!  client                                   server
//!  ──────                                   ──────
//!  build ─► hash ─► Replace{name,sha,bytes} ─► before action
//!                                              rewrite executable
//!  log ◄──────────── ReplaceResponse ◄─────── after action
//! ```

pub mod build;
pub mod config;
pub mod digest;
pub mod network;
pub mod pool;
pub mod protocol;

pub use build::{Orchestrator, Task, TaskReport};
pub use config::{BuildConfig, ServerConfig};
pub use network::{DeployClient, Dispatcher, Server};

/// Current version of PushBuild
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
