#![no_main]

use feedscout::sources::nuget_config::parse_config;
use feedscout::sources::props::parse_restore_sources;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(content) = std::str::from_utf8(data) {
        if let Ok(config) = parse_config(content) {
            for mapping in &config.mapping {
                assert!(
                    mapping.patterns.iter().all(|p| !p.trim().is_empty()),
                    "empty mapping patterns must be dropped"
                );
            }
        }

        if let Ok(sources) = parse_restore_sources(content) {
            assert!(
                sources.iter().all(|s| !s.contains("$(")),
                "property references must be dropped"
            );
        }
    }
});
