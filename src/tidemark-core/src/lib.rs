//! Tidemark Core Library
//!
//! This crate provides the shared data model for the Tidemark client:
//! - Typed error taxonomy and response classification
//! - Payload model with resendable/single-use classification
//! - Content-handle contract for marshaling request and response bodies
//! - Document and temporal descriptors
//! - Client configuration

pub mod config;
pub mod document;
pub mod error;
pub mod handle;
pub mod payload;

// Re-export commonly used types
pub use config::ClientConfig;
pub use document::{
    Category, DocumentDescriptor, DocumentRecord, RecordPart, TemporalDescriptor, VersionToken,
};
pub use error::{classify, Error, ErrorDetail, Result};
pub use handle::{
    BytesHandle, ContentHandle, FileHandle, FromContent, JsonHandle, StreamHandle, StringHandle,
};
pub use payload::{ByteStream, Format, Payload};
