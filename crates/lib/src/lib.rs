//! kiln-lib: a content-addressed container build engine.
//!
//! Build steps are described as nodes of an [`graph::OperationGraph`].
//! Nothing runs while the graph is built; asking for a node's value through
//! the [`eval::Evaluator`] resolves its subgraph bottom-up, serving results
//! from the [`cache::CacheStore`] where possible and running the rest
//! through an [`execute::Executor`]. The [`session::Session`] ties the
//! pieces together behind the client command set.
//!
//! - `graph`: operations, fingerprints and the append-only node arena
//! - `eval`: resolution, cache keys, single-flight and cancellation
//! - `cache`: results by cache key, eviction, pinning, persistence
//! - `execute`: the executor interface and the local sandbox executor
//! - `snapshot`: immutable content-addressed filesystem trees
//! - `host`, `image`, `registry`: the engine's view of the outside world

pub mod cache;
pub mod config;
pub mod consts;
pub mod eval;
pub mod events;
pub mod execute;
pub mod filter;
pub mod gc;
pub mod graph;
pub mod host;
pub mod image;
pub mod platform;
pub mod registry;
pub mod session;
pub mod snapshot;
pub mod store_lock;
pub mod util;
