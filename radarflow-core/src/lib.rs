//! Core library for the Radarflow ingestion pipeline.
//!
//! Three long-running workers (fetcher, converter, renderer) cooperate
//! through a SQLite catalogue rather than in-memory queues, so the process
//! can be killed at any point and converge to the same terminal state on
//! restart.

pub mod assemble;
pub mod cfradial;
pub mod convert;
pub mod decode;
pub mod error;
pub mod fetch;
pub mod layout;
pub mod radar;
pub mod recovery;
pub mod remote;
pub mod render;
pub mod store;
pub mod supervisor;
pub mod walker;

pub use assemble::VolumeAssembler;
pub use convert::Converter;
pub use error::{CoreError, Result};
pub use fetch::Fetcher;
pub use recovery::StuckSweeper;
pub use render::Renderer;
pub use store::{Store, StoreCounts};
pub use supervisor::{PipelineWorker, Role, StageFlags, Supervisor, WorkerCtx};
