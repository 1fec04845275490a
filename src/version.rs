//! Version parsing and precedence for NuGet package versions.
//!
//! NuGet versions are SemVer 2.0 with an optional fourth numeric
//! component (the "revision", a leftover from `System.Version`). Parsing
//! never fails: malformed components degrade to zero so that one odd
//! version string cannot break a whole package lookup.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A parsed package version.
#[derive(Debug, Clone, Default)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Fourth numeric component, `0` when absent.
    pub revision: u64,
    /// Dot-separated label after the first `-`, empty for stable releases.
    pub pre_release: String,
    /// Everything after `+`. Never participates in ordering or equality.
    pub build_metadata: String,
    /// The string this version was parsed from.
    pub raw: String,
}

impl Version {
    /// Parse a version string. Never fails.
    ///
    /// ```
    /// use feedscout::version::Version;
    ///
    /// let v = Version::parse("1.2.3.4-beta.2+sha.abc");
    /// assert_eq!((v.major, v.minor, v.patch, v.revision), (1, 2, 3, 4));
    /// assert_eq!(v.pre_release, "beta.2");
    /// assert_eq!(v.build_metadata, "sha.abc");
    /// ```
    pub fn parse(input: &str) -> Self {
        let raw = input.trim();

        let (rest, build_metadata) = match raw.split_once('+') {
            Some((rest, build)) => (rest, build),
            None => (raw, ""),
        };
        let (numbers, pre_release) = match rest.split_once('-') {
            Some((numbers, label)) => (numbers, label),
            None => (rest, ""),
        };

        let mut parts = numbers.split('.').map(parse_component);
        let major = parts.next().unwrap_or(0);
        let minor = parts.next().unwrap_or(0);
        let patch = parts.next().unwrap_or(0);
        let revision = parts.next().unwrap_or(0);

        Self {
            major,
            minor,
            patch,
            revision,
            pre_release: pre_release.to_string(),
            build_metadata: build_metadata.to_string(),
            raw: raw.to_string(),
        }
    }

    /// A version is a pre-release iff it carries a pre-release label.
    /// Build metadata alone does not count.
    pub fn is_prerelease(&self) -> bool {
        !self.pre_release.is_empty()
    }

    /// Canonical string used to detect duplicates (`1.0` and `1.0.0.0` are
    /// the same version). Pre-release labels are lowercased.
    pub fn normalized(&self) -> String {
        let mut out = format!("{}.{}.{}", self.major, self.minor, self.patch);
        if self.revision > 0 {
            out.push_str(&format!(".{}", self.revision));
        }
        if self.is_prerelease() {
            let label: Vec<String> = self
                .pre_release
                .split('.')
                .map(|id| {
                    if is_numeric(id) {
                        let trimmed = id.trim_start_matches('0');
                        if trimmed.is_empty() { "0" } else { trimmed }.to_string()
                    } else {
                        id.to_ascii_lowercase()
                    }
                })
                .collect();
            out.push('-');
            out.push_str(&label.join("."));
        }
        out
    }

    fn compare(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then(self.revision.cmp(&other.revision))
            .then_with(|| compare_labels(&self.pre_release, &other.pre_release))
    }
}

fn parse_component(part: &str) -> u64 {
    part.trim().parse().unwrap_or(0)
}

/// Compare two pre-release labels. An empty label (stable) ranks above any
/// non-empty one.
fn compare_labels(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }

    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = compare_identifiers(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

fn compare_identifiers(a: &str, b: &str) -> Ordering {
    let a_numeric = is_numeric(a);
    let b_numeric = is_numeric(b);
    match (a_numeric, b_numeric) {
        (true, true) => {
            // Leading zeros are insignificant; after stripping them the
            // longer digit run is the larger number, which avoids overflow.
            let a = a.trim_start_matches('0');
            let b = b.trim_start_matches('0');
            a.len().cmp(&b.len()).then_with(|| a.cmp(b))
        }
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => cmp_ignore_ascii_case(a, b),
    }
}

fn is_numeric(identifier: &str) -> bool {
    !identifier.is_empty() && identifier.bytes().all(|b| b.is_ascii_digit())
}

fn cmp_ignore_ascii_case(a: &str, b: &str) -> Ordering {
    a.bytes()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.revision > 0 {
            write!(f, ".{}", self.revision)?;
        }
        if self.is_prerelease() {
            write!(f, "-{}", self.pre_release)?;
        }
        Ok(())
    }
}

impl From<&str> for Version {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}
