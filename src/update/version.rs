//! Version identifiers for release and development builds.
//!
//! Accepted forms are `X.Y.Z`, `vX.Y.Z`, `X.Y.Z-<tag>` (a content-addressed
//! build tag of 4 to 40 characters from `[A-Za-z0-9_-]`) and the pre-release
//! markers `X.Y.Z-alpha`, `-beta`, `-rc` and `-dev`.
//!
//! Development builds sort between their base release and the next one:
//! `0.1.0-<tag>` is newer than `0.1.0`'s predecessors but older than the bare
//! `0.1.0` release itself and everything after it. Parsing never fails;
//! malformed fields fall back to `0`.

use std::cmp::Ordering;
use std::fmt;

/// Minimum length of a build tag suffix.
const MIN_TAG_LEN: usize = 4;

/// Maximum length of a build tag suffix.
const MAX_TAG_LEN: usize = 40;

/// Suffixes that mark a development build even when they are not build tags.
const PRERELEASE_MARKERS: [&str; 4] = ["alpha", "beta", "rc", "dev"];

/// A parsed application version.
///
/// Equality compares every field, including the suffix. Ordering is exposed
/// through [`VersionIdentifier::compare`] rather than [`Ord`] because two
/// different dev builds of one base compare as equal without being `==`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VersionIdentifier {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Build tag or pre-release marker of a development build.
    pub dev_suffix: Option<String>,
}

impl VersionIdentifier {
    /// Build a plain release version.
    #[must_use]
    pub fn release(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            dev_suffix: None,
        }
    }

    /// Parse a version string. See [`parse`].
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        parse(raw)
    }

    /// Returns `true` for development builds.
    #[must_use]
    pub fn is_development(&self) -> bool {
        self.dev_suffix.is_some()
    }

    /// The `(major, minor, patch)` triple.
    #[must_use]
    pub fn base(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }

    /// Order two versions. See [`compare`].
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        compare(self, other)
    }

    /// Returns `true` if `self` orders strictly after `other`.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Greater
    }
}

impl fmt::Display for VersionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(suffix) = &self.dev_suffix {
            write!(f, "-{suffix}")?;
        }
        Ok(())
    }
}

/// Strip surrounding whitespace and any leading `v`/`V`.
///
/// Idempotent: `normalize(normalize(s)) == normalize(s)`.
#[must_use]
pub fn normalize(raw: &str) -> String {
    raw.trim_start_matches(|c: char| c.is_whitespace() || c == 'v' || c == 'V')
        .trim_end()
        .to_owned()
}

/// Parse a version string into a [`VersionIdentifier`].
///
/// The string is split on its first `-`. The right-hand side becomes the dev
/// suffix when it looks like a build tag or starts with a pre-release marker.
/// Anything else is read as a plain release from the whole string.
#[must_use]
pub fn parse(raw: &str) -> VersionIdentifier {
    let normalized = normalize(raw);

    if let Some((base, suffix)) = normalized.split_once('-')
        && (is_build_tag(suffix) || is_prerelease_marker(suffix))
    {
        let (major, minor, patch) = parse_base(base);
        return VersionIdentifier {
            major,
            minor,
            patch,
            dev_suffix: Some(suffix.to_owned()),
        };
    }

    let (major, minor, patch) = parse_base(&normalized);
    VersionIdentifier::release(major, minor, patch)
}

/// Order two versions.
///
/// Base triples compare numerically. On an equal base, the bare release is
/// newer than any dev build of it, and two dev builds compare `Equal`
/// whether or not their suffixes match.
#[must_use]
pub fn compare(a: &VersionIdentifier, b: &VersionIdentifier) -> Ordering {
    match a.base().cmp(&b.base()) {
        Ordering::Equal => {}
        unequal => return unequal,
    }

    match (&a.dev_suffix, &b.dev_suffix) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(left), Some(right)) => {
            if left != right {
                tracing::debug!(
                    left = %left,
                    right = %right,
                    "dev builds of the same base are unordered; treating as equal"
                );
            }
            Ordering::Equal
        }
    }
}

fn is_build_tag(suffix: &str) -> bool {
    (MIN_TAG_LEN..=MAX_TAG_LEN).contains(&suffix.len())
        && suffix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_prerelease_marker(suffix: &str) -> bool {
    let lower = suffix.to_ascii_lowercase();
    PRERELEASE_MARKERS
        .iter()
        .any(|marker| lower.starts_with(marker))
}

fn parse_base(base: &str) -> (u64, u64, u64) {
    let mut fields = base.split('.').map(leading_number);
    let major = fields.next().unwrap_or(0);
    let minor = fields.next().unwrap_or(0);
    let patch = fields.next().unwrap_or(0);
    (major, minor, patch)
}

/// Read the leading decimal digits of a field, `0` if there are none.
fn leading_number(field: &str) -> u64 {
    let digits: String = field
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(0)
}
