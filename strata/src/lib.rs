//! Symmetric object-graph archiving.
//!
//! One [`Transfer`] walk drives both directions of a session: a writing
//! archive emits each value, a reading archive rebuilds it in place.
//! Identity bookkeeping keeps shared and aliased references pointing at
//! one reconstructed object (cycles included), and a process-wide type
//! registry rebuilds objects whose most-derived type is only known from
//! the stream. Two codecs speak the same token protocol: a buffered
//! little-endian binary form and a line-oriented text form.

pub mod archive;
pub mod binary;
pub mod errors;
pub mod pointers;
pub mod registry;
pub mod text;
pub mod version;

pub use self::archive::{Archive, AsAny, Direction, IdentityMap, Polymorphic, Transfer};
pub use self::binary::{BinaryReader, BinaryWriter};
pub use self::errors::{ArchiveError, Result};
pub use self::text::{TextReader, TextWriter};
pub use self::version::{library_versions, set_library_version, Version, VersionMap};

pub use strata_derive::Transfer;
