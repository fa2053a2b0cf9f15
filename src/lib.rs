//! Reader and rebuilder for version-6 `SerializedFile` asset containers.
//!
//! A container is a 20-byte big-endian header, a data region of object
//! payloads, and a metadata blob at the tail holding the type trees and an
//! object table whose position and record shape are not declared anywhere.
//! [`recovery`] finds that table; [`assets`] splits a container into editable
//! files and packs them back.

pub mod reader;
pub mod header;
pub mod typetree;
pub mod recovery;
pub mod manifest;
pub mod assets;

pub use header::{ContainerHeader, HeaderError, HEADER_SIZE};
pub use typetree::{extract_name, TypeTree, TypeTreeError};
pub use recovery::{recover, ObjectRecord, ObjectTable, RecordLayout, RecoveryError, ScanConfig};
pub use manifest::{Manifest, ManifestEntry, ManifestError};
pub use assets::{pack, unpack, AssetsError, Container, PackOptions, UnpackOptions};
