use std::cmp::Ordering;

use semver::Prerelease;

/// A dotted-numeric version with an optional pre-release suffix.
///
/// Any number of numeric components is accepted; missing trailing
/// components compare as zero, so `1.2` and `1.2.0` are equal. Build
/// metadata after `+` is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedVersion {
    components: Vec<u64>,
    pre: Option<Prerelease>,
}

fn parse_version(version: &str) -> Option<ParsedVersion> {
    let version = version.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    let (core, suffix) = split_core_and_suffix(version);

    let components = core
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    if components.is_empty() {
        return None;
    }

    let pre = match suffix.strip_prefix('-') {
        Some(pre) => Some(Prerelease::new(pre).ok().filter(|pre| !pre.is_empty())?),
        None => None,
    };

    Some(ParsedVersion { components, pre })
}

fn split_core_and_suffix(version: &str) -> (&str, &str) {
    let without_build = version.split_once('+').map_or(version, |(head, _)| head);
    let suffix_idx = without_build.find('-').unwrap_or(without_build.len());
    (&without_build[..suffix_idx], &without_build[suffix_idx..])
}

impl Ord for ParsedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for idx in 0..len {
            let left = self.components.get(idx).copied().unwrap_or(0);
            let right = other.components.get(idx).copied().unwrap_or(0);
            match left.cmp(&right) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }

        match (&self.pre, &other.pre) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(left), Some(right)) => left.cmp(right),
        }
    }
}

impl PartialOrd for ParsedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[must_use]
pub fn is_valid_version(version: &str) -> bool {
    parse_version(version).is_some()
}

/// Order two version strings. Returns `None` when either side is not a
/// dotted-numeric version.
#[must_use]
pub fn compare_versions(left: &str, right: &str) -> Option<Ordering> {
    Some(parse_version(left)?.cmp(&parse_version(right)?))
}

/// Whether `remote` is strictly newer than `current`.
///
/// Unparseable versions never count as newer.
#[must_use]
pub fn is_newer_version(remote: &str, current: &str) -> bool {
    compare_versions(remote, current).is_some_and(Ordering::is_gt)
}

/// Whether `actual` meets the `minimum` requirement.
#[must_use]
pub fn meets_minimum(actual: &str, minimum: &str) -> bool {
    compare_versions(actual, minimum).is_some_and(Ordering::is_ge)
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::*;

    #[test]
    fn test_version_comparison() {
        assert!(is_newer_version("1.0.1", "1.0.0"));
        assert!(is_newer_version("1.1.0", "1.0.0"));
        assert!(is_newer_version("2.0.0", "1.9.9"));
        assert!(is_newer_version("1.2", "1.1.9"));
        assert!(is_newer_version("1", "0.99.0"));
        assert!(is_newer_version("1.0.0", "1.0.0-beta.2"));
        assert!(is_newer_version("1.0.0.1", "1.0.0"));
        assert!(is_newer_version("v1.10.0", "1.9.0"));
        assert!(!is_newer_version("1.0.0", "1.0.0"));
        assert!(!is_newer_version("1.2", "1.2.0"));
        assert!(!is_newer_version("1.2.0.0", "1.2"));
        assert!(!is_newer_version("1.0.0-beta.2", "1.0.0-beta.10"));
        assert!(!is_newer_version("1.0.0", "1.0.1"));
        assert!(!is_newer_version("0.9.0", "1.0.0"));
    }

    #[test]
    fn invalid_versions_are_never_newer() {
        assert!(!is_newer_version("latest", "1.0.0"));
        assert!(!is_newer_version("2.0.0", "not-a-version"));
        assert!(!is_newer_version("", "1.0.0"));
        assert!(!is_newer_version("1..0", "0.1"));
    }

    #[test]
    fn is_newer_matches_compare_and_is_antisymmetric() {
        let versions = ["0.9", "1.0.0", "1.0.0-rc.1", "1.2.0", "1.2.1", "1.10", "2"];
        for left in versions {
            for right in versions {
                let ordering = compare_versions(left, right).expect("versions should parse");
                assert_eq!(is_newer_version(left, right), ordering == Ordering::Greater);
                if is_newer_version(left, right) {
                    assert!(!is_newer_version(right, left), "{left} vs {right}");
                }
            }
        }
    }

    #[test]
    fn ordering_is_transitive_across_chain() {
        assert!(is_newer_version("1.2.0", "1.0.0"));
        assert!(is_newer_version("1.2.1", "1.2.0"));
        assert!(is_newer_version("1.2.1", "1.0.0"));
    }

    #[test]
    fn build_metadata_is_ignored() {
        assert_eq!(compare_versions("1.0.0+build.5", "1.0.0"), Some(Ordering::Equal));
    }

    #[test]
    fn validity_and_minimums() {
        assert!(is_valid_version("1.0.0"));
        assert!(is_valid_version("6.4"));
        assert!(is_valid_version("2.0.0-beta.1"));
        assert!(!is_valid_version("1.0.x"));
        assert!(!is_valid_version("1.0.0-"));
        assert!(!is_valid_version(" "));

        assert!(meets_minimum("8.1.2", "7.4"));
        assert!(meets_minimum("7.4", "7.4.0"));
        assert!(!meets_minimum("7.3.33", "7.4"));
        assert!(!meets_minimum("unknown", "7.4"));
    }
}
