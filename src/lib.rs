//! nn-gateway: a multi-tenant inference gateway for a local LLM runtime.
//!
//! Wraps a single-threaded model engine in a fair, bounded-concurrency
//! service with a WASI-NN-shaped embedding API:
//!   init → load_model → open_session → set_input → compute → get_output
//!
//! The moving parts:
//! - a three-level priority queue with per-task deadlines and a single
//!   background worker that owns the decode path
//! - a session store with chat history, caps, idle-timeout and LRU eviction
//! - a memory manager driving context shifts and partial KV-cache eviction
//!   against the engine
//! - a safe model hot-swap protocol with rollback
//!
//! The inference engine itself is an external collaborator behind the
//! [`engine::Engine`] trait; [`engine::StubEngine`] simulates it for tests.

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod infer;
pub mod memory;
pub mod scheduler;
pub mod session;

pub use config::{Config, RuntimeParams};
pub use engine::{Engine, EngineError, StubEngine};
pub use error::{GatewayError, Result};
pub use gateway::{BackendCondition, ComputeStatus, Gateway, GatewayStats, Tensor, TensorType};
pub use infer::FinishReason;
pub use scheduler::Priority;
pub use session::ExecCtx;
