//! Plugin-declared configurable settings.

use serde::{Deserialize, Serialize};

/// A configurable setting as declared by a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preference {
    #[serde(default)]
    pub index: i32,
    /// Widget kind, e.g. `ListPreference`, `SwitchPreferenceCompat`, `EditTextPreference`.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub entries: Vec<String>,
    #[serde(default)]
    pub entry_values: Vec<String>,
    #[serde(default)]
    pub current_value: Option<String>,
    #[serde(default = "visible_by_default")]
    pub visible: bool,
}

fn visible_by_default() -> bool {
    true
}

impl Preference {
    /// Current value, falling back to the declared default.
    pub fn effective_value(&self) -> Option<&str> {
        self.current_value
            .as_deref()
            .or(self.default_value.as_deref())
    }
}

/// A preference together with the storage key it lives under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPreference {
    pub key: String,
    #[serde(flatten)]
    pub preference: Preference,
}

/// Where one logical preference is stored: a source, its language, and the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyLanguage {
    pub source_id: i64,
    pub key: String,
    pub language: String,
}

/// One logical preference shared by every localized variant of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniquePreference {
    pub languages: Vec<KeyLanguage>,
    pub preference: Preference,
}
