//! AcornDB core: the `Tree` engine, the `Trunk` storage contract, the
//! invertible per-record pipeline, cache strategies, and the record model.
//!
//! Storage backends live in the `acorn-trunk-*` crates, reference pipeline
//! roots in `acorn-roots`, and replication in `acorn-sync`.

pub mod cache;
pub mod codec;
pub mod error;
pub mod nut;
pub mod pipeline;
pub mod shell;
pub mod stats;
pub mod subscribe;
pub mod tree;
pub mod trunk;

pub use cache::{CachePolicy, CacheStrategy};
pub use codec::{JsonCodec, NutCodec};
pub use error::{AcornError, AcornResult, PipelineError};
pub use nut::{HasId, Nut};
pub use pipeline::{Pipeline, Root};
pub use shell::NutShell;
pub use stats::TreeStats;
pub use subscribe::{ChangeEvent, Subscription};
pub use tree::{ImportOutcome, Payload, SquabbleVerdict, Tree, TreeBuilder, TtlPolicy};
pub use trunk::{import_wins, Trunk, TrunkCaps};
