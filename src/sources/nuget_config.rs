//! Streaming reader for `NuGet.Config` files.
//!
//! `<packageSourceCredentials>` uses element names as data (each child is
//! named after a source), so the file cannot be described by a static
//! schema. Instead a token walker tracks which section it is in and
//! accumulates the fields of the element currently open.

use std::borrow::Cow;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::auth::credential_store::{RawCredential, decode_element_name};

/// A `<packageSources><add key=".." value=".."/>` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub key: String,
    pub value: String,
}

/// A `<packageSourceMapping><packageSource key="..">` block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingEntry {
    pub source: String,
    /// Lowercased `<package pattern="..">` values in file order
    pub patterns: Vec<String>,
}

/// Everything the resolver needs from one config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    /// Sources declared after the last `<clear/>` (or all of them)
    pub sources: Vec<SourceEntry>,
    /// `<clear/>` appeared inside `<packageSources>`
    pub sources_cleared: bool,
    /// Names disabled through `<disabledPackageSources>`
    pub disabled: Vec<String>,
    pub credentials: Vec<RawCredential>,
    pub mapping: Vec<MappingEntry>,
    /// `<clear/>` appeared inside `<packageSourceMapping>`
    pub mapping_cleared: bool,
    /// The file has a `<packageSourceMapping>` section at all
    pub has_mapping: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Outside,
    Configuration,
    Sources,
    Disabled,
    Credentials,
    Mapping,
    Other,
}

struct Walker {
    /// Open element names, outermost first
    stack: Vec<String>,
    section: Section,
    credential: Option<RawCredential>,
    mapping: Option<MappingEntry>,
    file: ConfigFile,
}

impl Walker {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            section: Section::Outside,
            credential: None,
            mapping: None,
            file: ConfigFile::default(),
        }
    }

    fn open(&mut self, name: &str, attrs: &[(String, String)]) {
        match (self.stack.len(), self.section) {
            (0, _) => {
                if name.eq_ignore_ascii_case("configuration") {
                    self.section = Section::Configuration;
                }
            }
            (1, Section::Configuration) => {
                self.section = section_for(name);
                if self.section == Section::Mapping {
                    self.file.has_mapping = true;
                }
            }
            (2, Section::Sources) => self.on_source_child(name, attrs),
            (2, Section::Disabled) => {
                if name.eq_ignore_ascii_case("add")
                    && let (Some(key), Some(value)) = (attr(attrs, "key"), attr(attrs, "value"))
                    && value.trim().eq_ignore_ascii_case("true")
                {
                    self.file.disabled.push(key.trim().to_string());
                }
            }
            (2, Section::Credentials) => {
                self.credential = Some(RawCredential {
                    source_name: decode_element_name(name),
                    ..Default::default()
                });
            }
            (3, Section::Credentials) => {
                if name.eq_ignore_ascii_case("add")
                    && let (Some(credential), Some(key), Some(value)) = (
                        self.credential.as_mut(),
                        attr(attrs, "key"),
                        attr(attrs, "value"),
                    )
                {
                    credential.set(key, value);
                }
            }
            (2, Section::Mapping) => {
                if name.eq_ignore_ascii_case("clear") {
                    self.file.mapping.clear();
                    self.file.mapping_cleared = true;
                } else if name.eq_ignore_ascii_case("packageSource") {
                    self.mapping = attr(attrs, "key").map(|key| MappingEntry {
                        source: key.trim().to_string(),
                        patterns: Vec::new(),
                    });
                }
            }
            (3, Section::Mapping) => {
                if name.eq_ignore_ascii_case("package")
                    && let (Some(entry), Some(pattern)) = (self.mapping.as_mut(), attr(attrs, "pattern"))
                {
                    let pattern = pattern.trim().to_lowercase();
                    if !pattern.is_empty() {
                        entry.patterns.push(pattern);
                    }
                }
            }
            _ => {}
        }
        self.stack.push(name.to_string());
    }

    fn on_source_child(&mut self, name: &str, attrs: &[(String, String)]) {
        if name.eq_ignore_ascii_case("clear") {
            self.file.sources.clear();
            self.file.sources_cleared = true;
        } else if name.eq_ignore_ascii_case("add")
            && let (Some(key), Some(value)) = (attr(attrs, "key"), attr(attrs, "value"))
        {
            self.file.sources.push(SourceEntry {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
            });
        }
    }

    fn close(&mut self) {
        match (self.stack.len(), self.section) {
            (3, Section::Credentials) => {
                if let Some(credential) = self.credential.take() {
                    self.file.credentials.push(credential);
                }
            }
            (3, Section::Mapping) => {
                if let Some(entry) = self.mapping.take() {
                    self.file.mapping.push(entry);
                }
            }
            (2, _) => self.section = Section::Configuration,
            (1, _) => self.section = Section::Outside,
            _ => {}
        }
        self.stack.pop();
    }
}

fn section_for(name: &str) -> Section {
    const SECTIONS: [(&str, Section); 4] = [
        ("packageSources", Section::Sources),
        ("disabledPackageSources", Section::Disabled),
        ("packageSourceCredentials", Section::Credentials),
        ("packageSourceMapping", Section::Mapping),
    ];
    SECTIONS
        .iter()
        .find(|(tag, _)| name.eq_ignore_ascii_case(tag))
        .map(|(_, section)| *section)
        .unwrap_or(Section::Other)
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

pub(crate) fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_string()
}

pub(crate) fn attributes(e: &BytesStart<'_>) -> Vec<(String, String)> {
    e.attributes()
        .filter_map(|a| {
            a.ok().map(|attr| {
                let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                let raw = String::from_utf8_lossy(&attr.value);
                (key, unescape(&raw).into_owned())
            })
        })
        .collect()
}

pub(crate) fn unescape(raw: &str) -> Cow<'_, str> {
    quick_xml::escape::unescape(raw).unwrap_or(Cow::Borrowed(raw))
}

/// Parse the contents of a `NuGet.Config` file.
///
/// ```
/// use feedscout::sources::nuget_config::parse_config;
///
/// let file = parse_config(r#"
/// <configuration>
///   <packageSources>
///     <clear />
///     <add key="internal" value="https://pkgs.example.com/v3/index.json" />
///   </packageSources>
/// </configuration>"#).unwrap();
/// assert!(file.sources_cleared);
/// assert_eq!(file.sources[0].key, "internal");
/// ```
pub fn parse_config(content: &str) -> Result<ConfigFile, quick_xml::Error> {
    let mut reader = Reader::from_str(content);
    let mut walker = Walker::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => walker.open(&element_name(&e), &attributes(&e)),
            Event::Empty(e) => {
                walker.open(&element_name(&e), &attributes(&e));
                walker.close();
            }
            Event::End(_) => walker.close(),
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(walker.file)
}
