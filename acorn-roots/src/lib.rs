//! Reference pipeline roots: compression (gzip, brotli) and authenticated
//! encryption (AES-256-GCM with PBKDF2 or raw keys).
//!
//! Roots are pure byte transforms identified by a stable sequence number;
//! see `acorn_core::pipeline` for ordering and header semantics.

pub mod compression;
pub mod encryption;

pub use compression::{BrotliProvider, CompressionProvider, CompressionRoot, GzipProvider};
pub use encryption::{derive_key, EncryptionRoot};
