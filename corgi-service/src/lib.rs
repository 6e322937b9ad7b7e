//! # corgi-service
//!
//! Personalization middleware for federated microblog servers. Clients
//! speak the standard upstream HTTP API to this service; most traffic is
//! forwarded verbatim, while a small set of augmentation-eligible endpoints
//! (home timeline, the recommended timeline, interaction logging) is
//! enriched with personalized content from the built-in recommendation
//! engine.
//!
//! ## Architecture
//!
//! - **Proxy & augmentation router**: identity-routed forwarding with
//!   fingerprinted caching and metrics headers
//! - **Ranking engine**: candidate selection, batched pre-aggregation,
//!   weighted scoring with reason attribution, diversity injection
//! - **Timeline injector**: deterministic, order-preserving merges
//! - **Cold-start engine**: trending selection with a fallback ladder
//! - **Crawler**: polite multi-instance discovery honoring author opt-out
//! - **Background jobs**: ranking refresh, crawl cycles, lifecycle sweep
//!
//! ## Example
//!
//! ```rust,no_run
//! use corgi_service::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let shutdown = CancellationToken::new();
//!     let (state, runner) = AppState::build(config, shutdown.clone()).await?;
//!     let workers = runner.spawn_workers();
//!
//!     let app = corgi_service::server::router(state.clone());
//!     Server::new(state.config().clone())
//!         .serve(app, shutdown.clone())
//!         .await?;
//!
//!     shutdown.cancel();
//!     for worker in workers {
//!         let _ = worker.await;
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod crawler;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod injector;
pub mod interactions;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod pagination;
pub mod proxy;
pub mod ranking;
pub mod sanitize;
pub mod server;
pub mod state;
pub mod store;

/// Commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::identity::{ResolvedIdentity, UserAlias};
    pub use crate::models::{Interaction, InteractionAction, Post, PostKey, RankingRecord};
    pub use crate::observability::init_tracing;
    pub use crate::server::Server;
    pub use crate::state::AppState;
    pub use crate::store::Store;
}
