// Firmware catalog: filename and changelog grammars, and the service that
// merges the parsed changelog with release-archive metadata.

pub mod catalog;
pub mod changelog;
pub mod filename;

pub use catalog::{CatalogError, CatalogService};
pub use changelog::{ChangelogParseError, parse_changelog, parse_version_block};
pub use filename::{FirmwareInfo, Model, parse_firmware_filename};
