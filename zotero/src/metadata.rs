//! Metadata Resolver (C7): matches a locally-discovered PDF back to its
//! Zotero item and produces `citeloom_core::model::CitationMetadata`.
//! Matching order and similarity threshold ported in meaning from
//! `application/use_cases/resolve_metadata.py`-equivalent logic described in
//! the original adapters; never blocks ingestion on a miss (§4.7).

use crate::types::{ZoteroCreator, ZoteroItem, ZoteroItemMetadata};
use citeloom_core::model::CitationMetadata;
use std::collections::BTreeSet;

/// Minimum Jaccard token-set similarity for a title-only match (§4.7).
pub const TITLE_MATCH_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub enum MatchBasis {
    Doi,
    Title { similarity: f64 },
}

#[derive(Debug, Clone)]
pub struct ResolvedMetadata {
    pub metadata: CitationMetadata,
    pub basis: MatchBasis,
}

fn normalize_doi(doi: &str) -> String {
    doi.trim()
        .trim_start_matches("https://doi.org/")
        .trim_start_matches("http://doi.org/")
        .trim_start_matches("doi:")
        .to_ascii_lowercase()
}

fn normalize_title(title: &str) -> BTreeSet<String> {
    title
        .to_ascii_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|tok| !tok.is_empty())
        .map(|tok| tok.to_string())
        .collect()
}

fn jaccard_similarity(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Scans a Zotero item's `extra` field for a reference-manager citekey line
/// (`"Citation Key: foo2024bar"`), falling back to `None` when absent (§4.7).
pub fn extract_citekey_from_extra(extra: &str) -> Option<String> {
    extra.lines().find_map(|line| {
        let line = line.trim();
        line.strip_prefix("Citation Key:")
            .map(|rest| rest.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

/// Two-letter ISO language code from Zotero's often-freeform `language`
/// field; returns the input unchanged if it's already exactly 2 letters,
/// otherwise takes the leading 2-letter prefix (§4.7).
pub fn normalize_language_code(language: &str) -> Option<String> {
    let trimmed = language.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.len() == 2 && lower.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(lower);
    }
    lower
        .split(['-', '_'])
        .next()
        .filter(|prefix| prefix.len() == 2 && prefix.chars().all(|c| c.is_ascii_alphabetic()))
        .map(|prefix| prefix.to_string())
}

fn authors_from(creators: &[ZoteroCreator]) -> Vec<String> {
    creators.iter().map(|c| c.display_name()).filter(|n| !n.is_empty()).collect()
}

/// Builds `CitationMetadata` directly from an item's own metadata, for the
/// common case where the item is already known (e.g. the Zotero item an
/// attachment belongs to) rather than being matched by DOI/title (§4.7).
pub fn from_item_metadata(item: &ZoteroItemMetadata, citekey: Option<String>) -> CitationMetadata {
    CitationMetadata {
        citekey,
        title: item.title.clone(),
        authors: authors_from(&item.creators),
        year: item.year,
        doi: item.doi.clone(),
        url: item.url.clone(),
        tags: item.tags.iter().cloned().collect(),
        collections: item.collections.iter().cloned().collect(),
        language: item.language.as_deref().and_then(normalize_language_code),
    }
}

/// Resolves `candidate_doi`/`candidate_title` against a catalogue of Zotero
/// items: DOI match first, falling back to a Jaccard title match at or above
/// `TITLE_MATCH_THRESHOLD`. Returns `None` on a miss rather than erroring,
/// so an ingestion run proceeds with unresolved metadata rather than stalling
/// (§4.7).
pub fn resolve_metadata(
    candidate_doi: Option<&str>,
    candidate_title: Option<&str>,
    catalogue: &[ZoteroItem],
) -> Option<ResolvedMetadata> {
    if let Some(doi) = candidate_doi {
        let needle = normalize_doi(doi);
        if !needle.is_empty() {
            if let Some(item) = catalogue
                .iter()
                .find(|item| item.data.doi.as_deref().map(normalize_doi).as_deref() == Some(needle.as_str()))
            {
                let citekey = item.data.extra.as_deref().and_then(extract_citekey_from_extra);
                return Some(ResolvedMetadata {
                    metadata: from_item_metadata(&item.data, citekey),
                    basis: MatchBasis::Doi,
                });
            }
        }
    }

    let title = candidate_title?;
    let needle_tokens = normalize_title(title);
    if needle_tokens.is_empty() {
        return None;
    }

    catalogue
        .iter()
        .filter_map(|item| {
            let haystack_tokens = normalize_title(&item.data.title);
            let similarity = jaccard_similarity(&needle_tokens, &haystack_tokens);
            (similarity >= TITLE_MATCH_THRESHOLD).then_some((item, similarity))
        })
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(item, similarity)| {
            let citekey = item.data.extra.as_deref().and_then(extract_citekey_from_extra);
            ResolvedMetadata {
                metadata: from_item_metadata(&item.data, citekey),
                basis: MatchBasis::Title { similarity },
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(doi: Option<&str>, title: &str, extra: Option<&str>) -> ZoteroItem {
        ZoteroItem {
            key: "K1".into(),
            data: ZoteroItemMetadata {
                title: title.into(),
                doi: doi.map(String::from),
                extra: extra.map(String::from),
                ..Default::default()
            },
        }
    }

    #[test]
    fn doi_match_is_case_and_prefix_insensitive() {
        let catalogue = vec![item(Some("10.1000/Xyz123"), "Some Paper", None)];
        let resolved = resolve_metadata(Some("https://doi.org/10.1000/xyz123"), None, &catalogue).unwrap();
        assert_eq!(resolved.basis, MatchBasis::Doi);
    }

    #[test]
    fn title_match_requires_threshold_similarity() {
        let catalogue = vec![item(None, "Attention Is All You Need", None)];
        let close = resolve_metadata(None, Some("Attention is all you need"), &catalogue);
        assert!(close.is_some());

        let far = resolve_metadata(None, Some("A completely different paper about gardening"), &catalogue);
        assert!(far.is_none());
    }

    #[test]
    fn citekey_is_pulled_from_extra_field() {
        let catalogue = vec![item(Some("10.1/abc"), "X", Some("Some note\nCitation Key: smith2024x\nmore"))];
        let resolved = resolve_metadata(Some("10.1/abc"), None, &catalogue).unwrap();
        assert_eq!(resolved.metadata.citekey.as_deref(), Some("smith2024x"));
    }

    #[test]
    fn language_code_normalizes_locale_tags() {
        assert_eq!(normalize_language_code("en-US"), Some("en".to_string()));
        assert_eq!(normalize_language_code("DE"), Some("de".to_string()));
        assert_eq!(normalize_language_code(""), None);
    }

    #[test]
    fn resolve_returns_none_on_total_miss_instead_of_erroring() {
        let catalogue = vec![item(Some("10.1/abc"), "Unrelated", None)];
        assert!(resolve_metadata(Some("10.2/zzz"), Some("Nothing close"), &catalogue).is_none());
    }
}
