#![no_main]

use feedscout::version::Version;
use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;

fuzz_target!(|data: &[u8]| {
    if let Ok(content) = std::str::from_utf8(data) {
        let (left, right) = content.split_once('|').unwrap_or((content, "1.0.0"));
        let a = Version::parse(left);
        let b = Version::parse(right);

        assert_eq!(a.cmp(&a), Ordering::Equal, "ordering must be reflexive");
        assert_eq!(a.cmp(&b), b.cmp(&a).reverse(), "ordering must be antisymmetric");
        if a == b {
            assert_eq!(a.normalized(), b.normalized(), "equal versions must normalize alike");
        }
        assert_eq!(a.is_prerelease(), !a.pre_release.is_empty());
    }
});
