//! Tidepool Codec - turning stored bytes back into values
//!
//! Two collaborators of the read path live here:
//!
//! - [`compression`]: per-version compression strategies
//! - [`schema`], [`repository`] and [`deserializer`]: record schemas, their
//!   registry, and writer-to-reader resolution with cached deserializers

pub mod compression;
pub mod deserializer;
pub mod error;
pub mod repository;
pub mod schema;

// Re-exports
pub use compression::{Compressor, CompressorFactory, GzipCompressor, NoOpCompressor};
pub use deserializer::{DeserializerCache, RecordDeserializer, ValueDecoder, encode_value};
pub use error::CodecError;
pub use repository::{InMemorySchemaRepository, SchemaRepository};
pub use schema::{FieldSchema, FieldType, RecordSchema, SchemaEntry};
