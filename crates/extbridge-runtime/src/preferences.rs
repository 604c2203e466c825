//! Preference aggregation across the localized variants of one extension.
//!
//! Multi-language extensions declare the same setting once per source,
//! usually suffixed with the source language (`quality_en`, `quality_fr`).
//! Those collapse into one [`UniquePreference`] carrying every
//! `(source, key, language)` location it is stored under.

use std::sync::Arc;

use extbridge_models::{KeyLanguage, KeyPreference, SourceInfo, UniquePreference};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::preference_store::PreferenceValue;
use crate::runtime::SourceInterop;

/// Key with a trailing `_<language>` removed.
pub fn base_key<'a>(key: &'a str, language: &str) -> &'a str {
    key.strip_suffix(language)
        .and_then(|k| k.strip_suffix('_'))
        .filter(|k| !k.is_empty())
        .unwrap_or(key)
}

/// Languages whose declaration wins when variants disagree, in order.
/// Anything else follows alphabetically.
const LANGUAGE_FALLBACK: &[&str] = &["en", "es", "fr", "de", "it", "pt", "ru", "ja", "zh"];

fn language_rank(language: &str) -> (usize, &str) {
    let index = LANGUAGE_FALLBACK
        .iter()
        .position(|l| *l == language)
        .unwrap_or(usize::MAX);
    (index, language)
}

/// Group declared preferences by base key.
///
/// Sources are visited in language fallback order, so each group carries
/// the declaration of its best-ranked language and groups come out in the
/// order that language declares them.
pub fn aggregate(mut declared: Vec<(SourceInfo, Vec<KeyPreference>)>) -> Vec<UniquePreference> {
    declared.sort_by(|(a, _), (b, _)| {
        language_rank(&a.language).cmp(&language_rank(&b.language))
    });
    let mut groups: Vec<(String, UniquePreference)> = Vec::new();

    for (source, prefs) in declared {
        for pref in prefs {
            let location = KeyLanguage {
                source_id: source.id,
                key: pref.key.clone(),
                language: source.language.clone(),
            };
            let base = base_key(&pref.key, &source.language).to_string();

            match groups.iter_mut().find(|(k, _)| *k == base) {
                Some((_, unique)) => unique.languages.push(location),
                None => groups.push((
                    base,
                    UniquePreference {
                        languages: vec![location],
                        preference: pref.preference,
                    },
                )),
            }
        }
    }

    groups.into_iter().map(|(_, unique)| unique).collect()
}

pub async fn load_unique(
    sources: &[Arc<dyn SourceInterop>],
    cancel: &CancellationToken,
) -> Result<Vec<UniquePreference>, BridgeError> {
    let mut declared = Vec::with_capacity(sources.len());
    for source in sources {
        let prefs = source.preferences(cancel).await?;
        declared.push((source.info().clone(), prefs));
    }
    Ok(aggregate(declared))
}

pub async fn save_unique(
    sources: &[Arc<dyn SourceInterop>],
    preference: &UniquePreference,
    cancel: &CancellationToken,
) -> Result<(), BridgeError> {
    let value = PreferenceValue::from_preference(&preference.preference);

    for location in &preference.languages {
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        let source = sources
            .iter()
            .find(|s| s.info().id == location.source_id)
            .ok_or_else(|| BridgeError::NotFound(format!("source {}", location.source_id)))?;
        source.set_preference(&location.key, value.clone()).await?;
    }

    tracing::debug!(
        locations = preference.languages.len(),
        "preference saved to every source variant"
    );
    Ok(())
}
