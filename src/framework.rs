//! Target framework identifiers and one-way compatibility.
//!
//! Only the four families that matter for picking a package version are
//! modeled. Anything else (including `any` and the empty string) parses to
//! [`FrameworkFamily::Unknown`], which acts as a wildcard.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Serialize, Serializer};

static MODERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^net(\d+)\.(\d+)$").expect("valid regex"));
static LEGACY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^net(\d)(\d+)$").expect("valid regex"));
static STANDARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^netstandard(\d+)\.(\d+)$").expect("valid regex"));
static CORE_APP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^netcoreapp(\d+)\.(\d+)$").expect("valid regex"));

/// Framework family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameworkFamily {
    /// `net5.0` and later
    Modern,
    /// .NET Framework (`net472`, `net48`, ...)
    Legacy,
    /// `netstandardX.Y`
    Standard,
    /// `netcoreappX.Y`
    CoreApp,
    /// Wildcard
    Unknown,
}

/// A parsed target framework moniker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Framework {
    pub family: FrameworkFamily,
    pub major: u32,
    /// For [`FrameworkFamily::Legacy`] the minor digits are scaled to two
    /// places: `net48` has minor `80`, `net472` has minor `72`.
    pub minor: u32,
    pub raw: String,
}

impl Framework {
    /// Parse a short target framework moniker. Never fails.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let lowered = trimmed.to_ascii_lowercase();
        // net8.0-windows10.0.19041 -> net8.0
        let moniker = lowered.split('-').next().unwrap_or_default();

        let unknown = Self {
            family: FrameworkFamily::Unknown,
            major: 0,
            minor: 0,
            raw: trimmed.to_string(),
        };

        if moniker.is_empty() || moniker == "any" {
            return unknown;
        }

        let dotted = |re: &Regex, family| {
            re.captures(moniker).map(|caps| Self {
                family,
                major: caps[1].parse().unwrap_or(0),
                minor: caps[2].parse().unwrap_or(0),
                raw: trimmed.to_string(),
            })
        };

        dotted(&*STANDARD, FrameworkFamily::Standard)
            .or_else(|| dotted(&*CORE_APP, FrameworkFamily::CoreApp))
            .or_else(|| dotted(&*MODERN, FrameworkFamily::Modern))
            .or_else(|| {
                LEGACY.captures(moniker).map(|caps| Self {
                    family: FrameworkFamily::Legacy,
                    major: caps[1].parse().unwrap_or(0),
                    minor: scale_legacy_minor(&caps[2]),
                    raw: trimmed.to_string(),
                })
            })
            .unwrap_or(unknown)
    }

    pub fn is_wildcard(&self) -> bool {
        self.family == FrameworkFamily::Unknown
    }

    fn at_least(&self, required: &Self) -> bool {
        (self.major, self.minor) >= (required.major, required.minor)
    }

    /// Whether a project targeting `self` can consume an asset built for
    /// `required`. The relation is one-way: `net8.0` consumes
    /// `netstandard2.1`, never the reverse.
    ///
    /// ```
    /// use feedscout::framework::Framework;
    ///
    /// let project = Framework::parse("net8.0");
    /// assert!(project.is_compatible_with(&Framework::parse("netstandard2.1")));
    /// assert!(!Framework::parse("netstandard2.1").is_compatible_with(&project));
    /// ```
    pub fn is_compatible_with(&self, required: &Self) -> bool {
        use FrameworkFamily::*;

        if required.is_wildcard() || self.is_wildcard() {
            return true;
        }

        match (self.family, required.family) {
            (Modern, Standard) => self.major >= 5,
            (CoreApp, Standard) => true,
            (Standard, Standard) => self.at_least(required),
            (Legacy, Standard) => {
                required.major == 1
                    || (required.major == 2 && required.minor == 0 && self.minor >= 62)
            }
            (Modern, Modern) | (CoreApp, CoreApp) | (Legacy, Legacy) => self.at_least(required),
            _ => false,
        }
    }
}

fn scale_legacy_minor(digits: &str) -> u32 {
    let value: u32 = digits.parse().unwrap_or(0);
    if digits.len() == 1 { value * 10 } else { value }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for Framework {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

/// Whether every project framework can consume at least one of the
/// frameworks a package version ships for.
///
/// A version that declares no frameworks is treated as framework-agnostic.
pub fn satisfies_all(project: &[Framework], supported: &[Framework]) -> bool {
    if supported.is_empty() {
        return true;
    }
    project
        .iter()
        .all(|consumer| supported.iter().any(|asset| consumer.is_compatible_with(asset)))
}

/// Convert the framework names found in registry catalog entries to short
/// monikers.
///
/// Catalog dependency groups use the long spelling (`.NETStandard2.0`,
/// `.NETFramework4.7.2`) while projects use the short one (`netstandard2.0`,
/// `net472`).
pub fn normalize_target_framework(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return "any".to_string();
    }
    let lowered = trimmed.to_ascii_lowercase();

    if let Some(version) = lowered.strip_prefix(".netstandard") {
        return format!("netstandard{}", two_part(version));
    }
    if let Some(version) = lowered.strip_prefix(".netcoreapp") {
        let version = two_part(version);
        let major: u32 = version
            .split('.')
            .next()
            .and_then(|m| m.parse().ok())
            .unwrap_or(0);
        return if major >= 5 {
            format!("net{version}")
        } else {
            format!("netcoreapp{version}")
        };
    }
    if let Some(version) = lowered.strip_prefix(".netframework") {
        let digits: String = version.chars().filter(|c| c.is_ascii_digit()).collect();
        let digits = if digits.len() == 1 {
            format!("{digits}0")
        } else {
            digits
        };
        return format!("net{digits}");
    }

    lowered
}

/// `2` -> `2.0`, `3.1.0` -> `3.1`
fn two_part(version: &str) -> String {
    let mut parts = version.trim_start_matches('v').split('.');
    let major = parts.next().filter(|p| !p.is_empty()).unwrap_or("0");
    let minor = parts.next().unwrap_or("0");
    format!("{major}.{minor}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fw(s: &str) -> Framework {
        Framework::parse(s)
    }

    #[test]
    fn test_parse_families() {
        assert_eq!(fw("net8.0").family, FrameworkFamily::Modern);
        assert_eq!(fw("net472").family, FrameworkFamily::Legacy);
        assert_eq!(fw("netstandard2.1").family, FrameworkFamily::Standard);
        assert_eq!(fw("netcoreapp3.1").family, FrameworkFamily::CoreApp);
        assert_eq!(fw("NET8.0").family, FrameworkFamily::Modern);
    }

    #[test]
    fn test_parse_unknown() {
        assert!(fw("").is_wildcard());
        assert!(fw("any").is_wildcard());
        assert!(fw("uap10.0").is_wildcard());
        assert!(fw("netstandard").is_wildcard());
    }

    #[test]
    fn test_parse_strips_platform_suffix() {
        let parsed = fw("net8.0-windows10.0.19041");
        assert_eq!(parsed.family, FrameworkFamily::Modern);
        assert_eq!((parsed.major, parsed.minor), (8, 0));
        assert_eq!(parsed.raw, "net8.0-windows10.0.19041");
    }

    #[test]
    fn test_legacy_minor_scaling() {
        assert_eq!((fw("net472").major, fw("net472").minor), (4, 72));
        assert_eq!(fw("net48").minor, 80);
        assert_eq!(fw("net462").minor, 62);
        assert_eq!(fw("net403").minor, 3);
        assert!(fw("net48").is_compatible_with(&fw("net472")));
        assert!(!fw("net461").is_compatible_with(&fw("net472")));
    }

    #[test]
    fn test_modern_consumes_standard() {
        assert!(fw("net8.0").is_compatible_with(&fw("netstandard2.1")));
        assert!(fw("net5.0").is_compatible_with(&fw("netstandard2.0")));
    }

    #[test]
    fn test_legacy_consumes_standard() {
        assert!(!fw("net472").is_compatible_with(&fw("netstandard2.1")));
        assert!(fw("net472").is_compatible_with(&fw("netstandard2.0")));
        assert!(fw("net462").is_compatible_with(&fw("netstandard2.0")));
        assert!(!fw("net461").is_compatible_with(&fw("netstandard2.0")));
        assert!(fw("net45").is_compatible_with(&fw("netstandard1.1")));
    }

    #[test]
    fn test_core_app_consumes_any_standard() {
        assert!(fw("netcoreapp2.0").is_compatible_with(&fw("netstandard2.1")));
    }

    #[test]
    fn test_standard_consumes_lower_standard() {
        assert!(fw("netstandard2.1").is_compatible_with(&fw("netstandard2.0")));
        assert!(!fw("netstandard2.0").is_compatible_with(&fw("netstandard2.1")));
    }

    #[test]
    fn test_same_family_requires_newer_or_equal() {
        assert!(fw("net8.0").is_compatible_with(&fw("net6.0")));
        assert!(!fw("net6.0").is_compatible_with(&fw("net8.0")));
        assert!(fw("netcoreapp3.1").is_compatible_with(&fw("netcoreapp3.1")));
    }

    #[test]
    fn test_cross_family_is_incompatible() {
        assert!(!fw("netstandard2.0").is_compatible_with(&fw("net8.0")));
        assert!(!fw("net472").is_compatible_with(&fw("net6.0")));
        assert!(!fw("net8.0").is_compatible_with(&fw("net472")));
    }

    #[test]
    fn test_wildcard_compatible_with_everything() {
        assert!(fw("net472").is_compatible_with(&fw("any")));
        assert!(fw("net472").is_compatible_with(&fw("")));
        assert!(fw("").is_compatible_with(&fw("net8.0")));
    }

    #[test]
    fn test_satisfies_all() {
        let supported = vec![fw("netstandard2.0"), fw("net6.0")];
        assert!(satisfies_all(&[fw("net8.0"), fw("net472")], &supported));
        assert!(!satisfies_all(&[fw("net461")], &supported));
        assert!(satisfies_all(&[fw("net461")], &[]));
        assert!(satisfies_all(&[], &supported));
    }

    #[test]
    fn test_normalize_target_framework() {
        assert_eq!(normalize_target_framework(".NETStandard2.0"), "netstandard2.0");
        assert_eq!(normalize_target_framework(".NETCoreApp3.1"), "netcoreapp3.1");
        assert_eq!(normalize_target_framework(".NETCoreApp5.0"), "net5.0");
        assert_eq!(normalize_target_framework(".NETFramework4.7.2"), "net472");
        assert_eq!(normalize_target_framework(".NETFramework4.5"), "net45");
        assert_eq!(normalize_target_framework(".NETFramework4"), "net40");
        assert_eq!(normalize_target_framework("net8.0"), "net8.0");
        assert_eq!(normalize_target_framework(""), "any");
        assert_eq!(fw(&normalize_target_framework(".NETFramework4.8")).minor, 80);
    }
}
