//! Replication for AcornDB: Tangles push a Tree's change feed to a sink
//! (another in-process Tree or an HTTP sync endpoint) and pull
//! delta-since-timestamp changes back through LWW import. The Grove registry
//! composes many Trees and their Tangles.

pub mod error;
pub mod grove;
pub mod sink;
pub mod tangle;

pub use error::{SyncError, SyncResult};
pub use grove::Grove;
#[cfg(feature = "http-client")]
pub use sink::HttpSink;
pub use sink::{TangleSink, TreeSink};
pub use tangle::{RetryPolicy, ShakeOutcome, Tangle, TangleConfig, TangleStats};
