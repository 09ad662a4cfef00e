//! Tidemark Client Library
//!
//! HTTP client for Tidemark bitemporal document database servers: document
//! read/write with optimistic concurrency, server transactions with session
//! affinity, multipart bulk transfer, search/eval, and temporal watermark
//! control, all behind a retrying request pipeline.

mod auth;
mod client;
mod cookie;
mod documents;
mod eval;
mod multipart;
mod pipeline;
mod retry;
mod search;
mod temporal;
mod transaction;

pub use auth::Auth;
pub use client::DatabaseClient;
pub use documents::{BulkWrite, WriteOptions};
pub use multipart::{DocumentPage, MultipartReader, PageInfo, Part};
pub use retry::RetryPolicy;
pub use search::SearchResults;
pub use transaction::{Transaction, TxState};

pub use tidemark_core::{
    ByteStream, BytesHandle, Category, ClientConfig, ContentHandle, DocumentDescriptor,
    DocumentRecord, Error, ErrorDetail, FileHandle, Format, FromContent, JsonHandle, Payload,
    RecordPart, Result, StreamHandle, StringHandle, TemporalDescriptor, VersionToken,
};
