#![no_main]

use feedscout::framework::{Framework, normalize_target_framework};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(content) = std::str::from_utf8(data) {
        let framework = Framework::parse(content);
        let normalized = Framework::parse(&normalize_target_framework(content));

        assert!(
            framework.is_compatible_with(&framework),
            "a framework must consume its own assets"
        );
        let _ = framework.is_compatible_with(&normalized);
        let _ = normalized.is_compatible_with(&framework);
    }
});
