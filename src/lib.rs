//! Runtime core for SKilL binary object-graph bindings.
//!
//! A SKilL file is a sequence of blocks, each carrying a string-pool
//! delta, a type section, a field section and the concatenated field
//! payloads. This crate parses such files into a live object graph,
//! supports appending and full rewrites, and exposes typed access to
//! pools of instances.

/// Domain errors
pub mod error;
/// Field declarations and chunks
pub mod fields;
/// The field-type catalogue
pub mod fieldtypes;
mod parse;
/// Storage pools and the type hierarchy
pub mod pools;
/// Field restriction hook point
pub mod restrictions;
/// The user-facing state
pub mod state;
/// Byte-level cursors and the v64 codec
pub mod streams;
/// The lazily materializing string pool
pub mod strings;
mod write;

pub use self::error::SkillError;
pub use self::fields::{Chunk, FieldDeclaration};
pub use self::fieldtypes::{FieldType, FieldValue, TypeTag};
pub use self::pools::{Block, Obj, SkillObject, StoragePool};
pub use self::restrictions::FieldRestriction;
pub use self::state::{ReadMode, SkillFile};
pub use self::strings::StringPool;
