//! Content exchanged with sources: series, chapters, pages, images.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MangaStatus {
    #[default]
    Unknown,
    Ongoing,
    Completed,
    Licensed,
    PublishingFinished,
    Cancelled,
    OnHiatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manga {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub status: MangaStatus,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub initialized: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MangaList {
    pub mangas: Vec<Manga>,
    #[serde(default)]
    pub has_next_page: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub url: String,
    pub name: String,
    /// Upload time in milliseconds since the epoch, `0` when unknown.
    #[serde(default)]
    pub date_upload: i64,
    #[serde(default = "unknown_chapter_number")]
    pub chapter_number: f32,
    #[serde(default)]
    pub scanlator: Option<String>,
}

fn unknown_chapter_number() -> f32 {
    -1.0
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub index: i32,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Raw image bytes returned by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResponse {
    pub content_type: String,
    pub data: Vec<u8>,
}
