//! `RestoreSources` from `Directory.Build.props`

use quick_xml::Reader;
use quick_xml::events::Event;

use super::nuget_config::{element_name, unescape};

/// Extract the `<RestoreSources>` entries declared in a props file.
///
/// Entries are split on `;`. MSBuild property references such as
/// `$(RestoreSources)` are dropped since they cannot be evaluated here.
/// Every `<RestoreSources>` element contributes, in document order.
pub fn parse_restore_sources(content: &str) -> Result<Vec<String>, quick_xml::Error> {
    let mut reader = Reader::from_str(content);
    let mut depth_in_element = 0usize;
    let mut text = String::new();
    let mut sources = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if depth_in_element > 0 {
                    depth_in_element += 1;
                } else if element_name(&e).eq_ignore_ascii_case("RestoreSources") {
                    depth_in_element = 1;
                    text.clear();
                }
            }
            Event::Text(e) if depth_in_element == 1 => {
                text.push_str(&String::from_utf8_lossy(&e));
            }
            Event::CData(e) if depth_in_element == 1 => {
                text.push_str(&String::from_utf8_lossy(&e));
            }
            // Entity references arrive on their own; rebuild them for `unescape`
            Event::GeneralRef(e) if depth_in_element == 1 => {
                text.push('&');
                text.push_str(&String::from_utf8_lossy(&e));
                text.push(';');
            }
            Event::End(_) if depth_in_element > 0 => {
                depth_in_element -= 1;
                if depth_in_element == 0 {
                    sources.extend(split_sources(&unescape(&text)));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(sources)
}

fn split_sources(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.contains("$("))
        .map(str::to_string)
}
