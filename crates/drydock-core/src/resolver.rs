//! Artifact version resolution against repository directory listings.
//!
//! The binary repository exposes plain HTML directory listings. The only
//! contract relied on is the anchor grammar: version directories appear as
//! `<a href="LABEL/">` and artifact files as `<a href="FILE.ear">`. The
//! label grammar is `{numero}` followed by an optional pre-release suffix
//! (`-a<digits>` alpha, `-rc<digits>` release candidate, none = final)
//! and, for snapshot families, a trailing `-SNAPSHOT` marker.

use std::sync::Arc;

use crate::error::{DeployError, Result};
use crate::fetch::HttpFetch;

const SNAPSHOT_MARKER: &str = "-SNAPSHOT";

/// Pre-release classification of a version label, ordered by priority:
/// final beats release candidate beats alpha; within one kind the numeric
/// suffix decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Suffix {
    Alpha(u64),
    ReleaseCandidate(u64),
    Final,
}

impl Suffix {
    fn rank(self) -> u8 {
        match self {
            Suffix::Alpha(_) => 0,
            Suffix::ReleaseCandidate(_) => 1,
            Suffix::Final => 2,
        }
    }
}

/// Iterate the href targets of every anchor in a listing document.
fn anchor_targets(listing: &str) -> impl Iterator<Item = &str> {
    listing.split("<a href=\"").skip(1).filter_map(|rest| {
        let end = rest.find('"')?;
        Some(&rest[..end])
    })
}

/// Parse one directory label into its suffix, or `None` when the label
/// does not belong to the requested family at all.
///
/// A label that starts with the family identifier but carries a suffix
/// outside the known grammar is an unrecoverable repository-format error:
/// it signals a naming convention the resolver does not understand.
fn parse_label(numero: &str, snapshot: bool, label: &str) -> Result<Option<Suffix>> {
    let Some(rest) = label.strip_prefix(numero) else {
        return Ok(None);
    };
    let rest = if snapshot {
        let Some(rest) = rest.strip_suffix(SNAPSHOT_MARKER) else {
            return Ok(None);
        };
        rest
    } else {
        if rest.ends_with(SNAPSHOT_MARKER) {
            return Ok(None);
        }
        rest
    };

    if rest.is_empty() {
        return Ok(Some(Suffix::Final));
    }
    let Some(suffix) = rest.strip_prefix('-') else {
        // Longer family identifier sharing this one as a prefix, e.g.
        // "1.2" against "1.22".
        return Ok(None);
    };
    let kind: String = suffix.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let digits = &suffix[kind.len()..];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Ok(None);
    }
    let number: u64 = digits
        .parse()
        .map_err(|_| DeployError::RepositoryFormat(format!("suffix overflow in '{label}'")))?;
    match kind.as_str() {
        "a" => Ok(Some(Suffix::Alpha(number))),
        "rc" => Ok(Some(Suffix::ReleaseCandidate(number))),
        other => Err(DeployError::RepositoryFormat(format!(
            "unknown version suffix type '{other}' in '{label}'"
        ))),
    }
}

/// True when the challenger beats the incumbent.
fn beats(challenger: Suffix, incumbent: Suffix) -> bool {
    match (challenger, incumbent) {
        (Suffix::Alpha(a), Suffix::Alpha(b)) => a > b,
        (Suffix::ReleaseCandidate(a), Suffix::ReleaseCandidate(b)) => a > b,
        (a, b) => a.rank() > b.rank(),
    }
}

/// Latest version label of one artifact family in a directory listing,
/// or `None` when the listing holds no matching entry.
pub fn latest_version(numero: &str, snapshot: bool, listing: &str) -> Result<Option<String>> {
    let mut best: Option<(String, Suffix)> = None;
    for target in anchor_targets(listing) {
        let Some(label) = target.strip_suffix('/') else {
            continue;
        };
        let Some(suffix) = parse_label(numero, snapshot, label)? else {
            continue;
        };
        // The first candidate always wins against no candidate yet.
        let replace = match &best {
            None => true,
            Some((_, incumbent)) => beats(suffix, *incumbent),
        };
        if replace {
            best = Some((label.to_string(), suffix));
        }
    }
    Ok(best.map(|(label, _)| label))
}

/// First artifact filename in a version directory listing that belongs to
/// the family and carries the artifact extension.
pub fn artifact_entry(numero: &str, listing: &str) -> Result<String> {
    anchor_targets(listing)
        .find(|target| target.ends_with(".ear") && target.contains(numero))
        .map(str::to_string)
        .ok_or_else(|| {
            DeployError::RepositoryFormat(format!(
                "no artifact entry for family '{numero}' in version listing"
            ))
        })
}

/// Resolves exact artifact URLs, fetching the version directory listing
/// only when snapshot filenames require it.
pub struct Resolver {
    fetch: Arc<dyn HttpFetch>,
}

impl Resolver {
    pub fn new(fetch: Arc<dyn HttpFetch>) -> Self {
        Self { fetch }
    }

    /// Exact download URL of one artifact at one resolved version.
    ///
    /// Release filenames are fully determined by the version label, so the
    /// non-snapshot path performs no network call. Snapshot filenames embed
    /// a build timestamp, so the version directory has to be listed.
    pub async fn resolve_artifact_url(
        &self,
        numero: &str,
        snapshot: bool,
        artifact: &str,
        family_url: &str,
        version: &str,
    ) -> Result<String> {
        if !snapshot {
            return Ok(format!("{family_url}/{version}/{artifact}-{version}.ear"));
        }
        let listing_url = format!("{family_url}/{version}");
        let response = self.fetch.fetch(&listing_url).await?;
        if response.status != 200 {
            return Err(DeployError::Http {
                url: listing_url,
                reason: format!("HTTP {}", response.status),
            });
        }
        let file = artifact_entry(numero, &response.body)?;
        Ok(format!("{family_url}/{version}/{file}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(labels: &[&str]) -> String {
        let mut html = String::from("<html><body><pre>\n");
        for label in labels {
            html.push_str(&format!("<a href=\"{label}/\">{label}/</a>\n"));
        }
        html.push_str("</pre></body></html>\n");
        html
    }

    #[test]
    fn final_release_beats_release_candidates() {
        let doc = listing(&["1.2-rc1", "1.2-rc2", "1.2"]);
        assert_eq!(
            latest_version("1.2", false, &doc).unwrap(),
            Some("1.2".to_string())
        );
    }

    #[test]
    fn release_candidate_beats_alpha() {
        let doc = listing(&["1.2-a1", "1.2-rc1"]);
        assert_eq!(
            latest_version("1.2", false, &doc).unwrap(),
            Some("1.2-rc1".to_string())
        );
    }

    #[test]
    fn numeric_suffix_comparison_is_numeric_not_lexical() {
        let doc = listing(&["1.2-rc2", "1.2-rc10"]);
        assert_eq!(
            latest_version("1.2", false, &doc).unwrap(),
            Some("1.2-rc10".to_string())
        );
    }

    #[test]
    fn no_match_resolves_to_none() {
        let doc = listing(&["2.0", "2.0-rc1"]);
        assert_eq!(latest_version("1.2", false, &doc).unwrap(), None);
    }

    #[test]
    fn unknown_suffix_type_is_a_repository_format_error() {
        let doc = listing(&["1.2-beta1"]);
        let err = latest_version("1.2", false, &doc).unwrap_err();
        assert!(matches!(err, DeployError::RepositoryFormat(_)));
    }

    #[test]
    fn snapshot_flag_filters_snapshot_labels() {
        let doc = listing(&["1.2", "1.2-SNAPSHOT", "1.2-rc1-SNAPSHOT"]);
        assert_eq!(
            latest_version("1.2", true, &doc).unwrap(),
            Some("1.2-SNAPSHOT".to_string())
        );
        assert_eq!(
            latest_version("1.2", false, &doc).unwrap(),
            Some("1.2".to_string())
        );
    }

    #[test]
    fn longer_family_labels_are_not_matched() {
        let doc = listing(&["1.22", "1.2"]);
        assert_eq!(
            latest_version("1.2", false, &doc).unwrap(),
            Some("1.2".to_string())
        );
    }

    #[test]
    fn artifact_entry_takes_first_matching_ear() {
        let html = "<a href=\"foo-1.2-20240101.120000-3.ear\">x</a>\
                    <a href=\"foo-1.2-20240101.120000-3.ear.md5\">x</a>";
        assert_eq!(
            artifact_entry("1.2", html).unwrap(),
            "foo-1.2-20240101.120000-3.ear"
        );
    }

    #[test]
    fn artifact_entry_missing_is_a_repository_format_error() {
        let err = artifact_entry("1.2", "<a href=\"other-2.0.ear\">x</a>").unwrap_err();
        assert!(matches!(err, DeployError::RepositoryFormat(_)));
    }
}
