//! Data model shared by the extension bridge runtime and its consumers.
//!
//! Everything here is plain serde data: remote index descriptors, installed
//! repository entries and groups, plugin preferences, and the content types
//! exchanged with loaded sources.

pub mod content;
pub mod descriptor;
pub mod preference;
pub mod repository;

pub use content::{Chapter, ImageResponse, Manga, MangaList, MangaStatus, Page};
pub use descriptor::{ExtensionDescriptor, RemoteRepository, SourceDescriptor, SourceInfo};
pub use preference::{KeyLanguage, KeyPreference, Preference, UniquePreference};
pub use repository::{ArtifactHash, RepositoryEntry, RepositoryGroup};
