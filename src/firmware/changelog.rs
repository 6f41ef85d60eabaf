// Changelog grammar.
//
// The upstream changelog is a hand-maintained text file; the patterns here
// encode its (undocumented) formatting conventions. Blocks start at a
// date-prefixed "Version" header; inside a block, unbulleted lines open a
// titled section, "- " lines open an entry and "-   " lines nest details
// under the entry in progress.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::models::{ChangelogEntry, ChangelogSection, EntryKind, Firmware};

static VERSION_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2} - Version").unwrap());

static ENTRY_KEYWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(fix|improved|new)[:;]\s+(.*)$").unwrap());

#[derive(Debug, Error)]
pub enum ChangelogParseError {
    #[error("changelog block is missing its version header")]
    MissingHeader,
    #[error("malformed version header: {0:?}")]
    MalformedHeader(String),
}

/// Splits raw changelog text into version blocks and parses each one.
/// A malformed block aborts the whole parse; silently dropping a version
/// would corrupt the catalog.
pub fn parse_changelog(text: &str) -> Result<Vec<Firmware>, ChangelogParseError> {
    let mut blocks: Vec<Vec<&str>> = Vec::new();

    for line in text.lines() {
        if VERSION_HEADER.is_match(line) {
            blocks.push(Vec::new());
        }

        // Preamble lines before the first header have no block to live in.
        if let Some(block) = blocks.last_mut() {
            block.push(line);
        }
    }

    blocks.iter().map(|block| parse_version_block(block)).collect()
}

/// Parses one version block: a header line followed by section/entry lines.
pub fn parse_version_block(block: &[&str]) -> Result<Firmware, ChangelogParseError> {
    let Some((header, lines)) = block.split_first() else {
        return Err(ChangelogParseError::MissingHeader);
    };

    let Some((date, version)) = header.split_once(" - ") else {
        return Err(ChangelogParseError::MalformedHeader(header.to_string()));
    };

    if date.is_empty() || version.is_empty() {
        return Err(ChangelogParseError::MalformedHeader(header.to_string()));
    }

    let version = version.strip_prefix("Version ").unwrap_or(version);

    let mut section_id = 0;
    let mut changelog: Vec<ChangelogSection> = Vec::new();
    let mut current_entry: Option<ChangelogEntry> = None;
    let mut current_section = ChangelogSection {
        entries: Vec::new(),
        id: section_id,
        title: None,
    };

    for line in lines {
        if let Some(detail) = line.strip_prefix("-   ") {
            // Nested detail; attaches to the entry in progress, if any.
            if let Some(entry) = current_entry.as_mut() {
                entry.details.push(detail.to_string());
            }
        } else if line.starts_with("- ") || ENTRY_KEYWORD.is_match(line) {
            if let Some(entry) = current_entry.take() {
                current_section.entries.push(entry);
            }

            current_entry = Some(parse_entry_line(line));
        } else {
            // Unrecognized prefix: this line titles a new section.
            if let Some(entry) = current_entry.take() {
                current_section.entries.push(entry);
            }

            section_id += 1;
            changelog.push(std::mem::replace(
                &mut current_section,
                ChangelogSection {
                    entries: Vec::new(),
                    id: section_id,
                    title: Some(line.to_string()),
                },
            ));
        }
    }

    if let Some(entry) = current_entry.take() {
        current_section.entries.push(entry);
    }
    changelog.push(current_section);

    Ok(Firmware {
        version: version.to_string(),
        date: Some(date.to_string()),
        changelog: Some(changelog),
        path: String::new(),
        size: None,
    })
}

fn parse_entry_line(line: &str) -> ChangelogEntry {
    // "- Fix from <version> ..." entries keep their cross-reference text;
    // only the "- Fix " lead-in goes.
    if let Some(rest) = line.strip_prefix("- Fix from ") {
        return ChangelogEntry {
            description: format!("from {rest}"),
            kind: EntryKind::Fix,
            details: Vec::new(),
        };
    }

    let body = line.strip_prefix("- ").unwrap_or(line);

    match ENTRY_KEYWORD.captures(body) {
        Some(captures) => {
            let kind = match captures[1].to_lowercase().as_str() {
                "fix" => EntryKind::Fix,
                "improved" => EntryKind::Improved,
                "new" => EntryKind::New,
                _ => EntryKind::Change,
            };

            ChangelogEntry {
                description: captures[2].to_string(),
                kind,
                details: Vec::new(),
            }
        }
        None => ChangelogEntry {
            description: body.to_string(),
            kind: EntryKind::Change,
            details: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_and_keyword_entries() {
        let block = [
            "2024-01-01 - Version 1.2.3",
            "Improvements:",
            "- New: Shiny feature",
            "- Fix: Something fixed",
        ];

        let firmware = parse_version_block(&block).unwrap();
        assert_eq!(firmware.version, "1.2.3");
        assert_eq!(firmware.date.as_deref(), Some("2024-01-01"));

        let changelog = firmware.changelog.unwrap();
        // Untitled first section (empty here), then the titled one.
        assert_eq!(changelog.len(), 2);
        assert_eq!(changelog[0].id, 0);
        assert!(changelog[0].title.is_none());

        let section = &changelog[1];
        assert_eq!(section.title.as_deref(), Some("Improvements:"));
        assert_eq!(section.entries.len(), 2);
        assert_eq!(section.entries[0].kind, EntryKind::New);
        assert_eq!(section.entries[0].description, "Shiny feature");
        assert_eq!(section.entries[1].kind, EntryKind::Fix);
        assert_eq!(section.entries[1].description, "Something fixed");
    }

    #[test]
    fn entries_before_any_title_land_in_the_untitled_section() {
        let block = ["2024-01-01 - Version 1.0.0", "- Improved: Startup time"];

        let firmware = parse_version_block(&block).unwrap();
        let changelog = firmware.changelog.unwrap();

        assert_eq!(changelog.len(), 1);
        assert!(changelog[0].title.is_none());
        assert_eq!(changelog[0].entries.len(), 1);
        assert_eq!(changelog[0].entries[0].kind, EntryKind::Improved);
    }

    #[test]
    fn keyword_matches_case_insensitively_and_with_semicolon() {
        let block = [
            "2024-01-01 - Version 1.0.0",
            "- fix: lowercase keyword",
            "- New; semicolon separator",
        ];

        let firmware = parse_version_block(&block).unwrap();
        let section = &firmware.changelog.unwrap()[0];

        assert_eq!(section.entries[0].kind, EntryKind::Fix);
        assert_eq!(section.entries[0].description, "lowercase keyword");
        assert_eq!(section.entries[1].kind, EntryKind::New);
        assert_eq!(section.entries[1].description, "semicolon separator");
    }

    #[test]
    fn unrecognized_bullet_defaults_to_change() {
        let block = ["2024-01-01 - Version 1.0.0", "- Reworked the sampler"];

        let firmware = parse_version_block(&block).unwrap();
        let section = &firmware.changelog.unwrap()[0];

        assert_eq!(section.entries[0].kind, EntryKind::Change);
        assert_eq!(section.entries[0].description, "Reworked the sampler");
    }

    #[test]
    fn fix_from_lines_keep_their_cross_reference() {
        let block = ["2024-01-01 - Version 1.0.0", "- Fix from 0.9.2 regression"];

        let firmware = parse_version_block(&block).unwrap();
        let section = &firmware.changelog.unwrap()[0];

        assert_eq!(section.entries[0].kind, EntryKind::Fix);
        assert_eq!(section.entries[0].description, "from 0.9.2 regression");
    }

    #[test]
    fn nested_details_attach_to_the_entry_in_progress() {
        let block = [
            "2024-01-01 - Version 1.0.0",
            "- New: MIDI mappings",
            "-   CC 20 now scrubs",
            "-   CC 21 now mutes",
            "- Fix: Crash on load",
        ];

        let firmware = parse_version_block(&block).unwrap();
        let section = &firmware.changelog.unwrap()[0];

        assert_eq!(section.entries.len(), 2);
        assert_eq!(
            section.entries[0].details,
            vec!["CC 20 now scrubs", "CC 21 now mutes"]
        );
        assert!(section.entries[1].details.is_empty());
    }

    #[test]
    fn bare_keyword_line_opens_an_entry() {
        // "word: text" lines count as entries even without the bullet.
        let block = ["2024-01-01 - Version 1.0.0", "Fix: unbulleted entry"];

        let firmware = parse_version_block(&block).unwrap();
        let section = &firmware.changelog.unwrap()[0];

        assert_eq!(section.entries.len(), 1);
        assert_eq!(section.entries[0].kind, EntryKind::Fix);
        assert_eq!(section.entries[0].description, "unbulleted entry");
    }

    #[test]
    fn malformed_headers_are_fatal() {
        assert!(matches!(
            parse_version_block(&[]),
            Err(ChangelogParseError::MissingHeader)
        ));
        assert!(matches!(
            parse_version_block(&["no separator here"]),
            Err(ChangelogParseError::MalformedHeader(_))
        ));
    }

    #[test]
    fn splits_text_into_version_blocks() {
        let text = [
            "2025-01-01 - Version 2.0.0",
            "Changes:",
            "- New: Feature X",
            "2024-06-01 - Version 1.2.3",
            "Other:",
            "- Fix: Bug Y",
        ]
        .join("\n");

        let versions = parse_changelog(&text).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, "2.0.0");
        assert_eq!(versions[1].version, "1.2.3");
    }

    #[test]
    fn preamble_before_the_first_header_is_ignored() {
        let text = "M8 firmware changelog\n\n2024-01-01 - Version 1.0.0\n- Fix: One thing";

        let versions = parse_changelog(text).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, "1.0.0");
    }

    #[test]
    fn malformed_block_aborts_the_whole_parse() {
        // A header line that matches the split pattern but cannot be split
        // into date and version is not silently dropped.
        let text = "2024-01-01 - Version 1.0.0\n- Fix: ok";
        assert!(parse_changelog(text).is_ok());

        let empty = parse_changelog("");
        assert_eq!(empty.unwrap().len(), 0);
    }
}
