// Firmware catalog service.
//
// Two independent remote fetches (changelog text, release-archive listing)
// join into a merge step that assigns each downloadable archive to exactly
// one changelog version. Point releases share a base version and one zip:
// "1.2.3", "1.2.3A" and "1.2.3B" all group under "1.2.3", and the archive
// belongs to the lexicographically greatest member.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::events::{EventHub, Notice};
use crate::firmware::changelog::{ChangelogParseError, parse_changelog};
use crate::models::Firmware;

const API_BASE: &str = "https://api.github.com/repos/Dirtywave/M8Firmware/contents";
const CHANGELOG_PATH: &str = "changelog.txt";
const RELEASES_PATH: &str = "Releases";
const LATEST_ARCHIVE_PATH: &str = "M8Firmware.zip";

const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";
const ACCEPT_RAW: &str = "application/vnd.github.raw+json";
const ACCEPT_JSON: &str = "application/vnd.github+json";
const USER_AGENT_VALUE: &str = "com.dirtywave.updater";
const TOKEN_ENV_VAR: &str = "GITHUB_API_TOKEN";

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

// Archive names carry their version after a literal V, underscores standing
// in for periods: "M8Firmware_V1_2_3B.zip" -> "1.2.3B".
static ARCHIVE_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"V([0-9A-Za-z_]+)\.zip$").unwrap());

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Parse(#[from] ChangelogParseError),
    #[error("firmware api request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("firmware api returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("firmware api request timed out after {0:?}")]
    Timeout(Duration),
}

// Directory entry shape of the contents API. Listings return an array of
// these, the single-file endpoint returns one.
#[derive(Clone, Debug, Deserialize)]
pub struct ContentsEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReleaseDescriptor {
    pub path: String,
    pub size: u64,
    pub version: String,
}

/// Contents-API link for a repository-relative archive path.
pub fn remote_download_link(path: &str) -> String {
    format!("{API_BASE}/{path}")
}

fn extract_archive_version(name: &str) -> String {
    ARCHIVE_VERSION
        .captures(name)
        .map(|captures| captures[1].replace('_', "."))
        .unwrap_or_default()
}

/// Version string with a single trailing patch letter stripped. Assumes
/// patch letters sort in release order; see DESIGN.md for the fidelity
/// caveat around multi-digit or non-alphabetic suffixes.
pub fn base_version(version: &str) -> &str {
    match version.as_bytes().last() {
        Some(last) if last.is_ascii_uppercase() => &version[..version.len() - 1],
        _ => version,
    }
}

/// Merges parsed changelog versions (newest-first) with archive metadata.
/// Every changelog version becomes a catalog entry; within each base-version
/// group only the designated owner carries the archive path, and metadata
/// for versions the changelog never mentioned is discarded.
pub fn merge_catalog(changelog: Vec<Firmware>, metadata: Vec<ReleaseDescriptor>) -> Vec<Firmware> {
    let newest_version = changelog.first().map(|firmware| firmware.version.clone());

    let mut by_version: HashMap<String, Firmware> = changelog
        .into_iter()
        .map(|firmware| (firmware.version.clone(), firmware))
        .collect();

    let mut groups: HashMap<&str, Vec<&str>> = HashMap::new();
    for version in by_version.keys() {
        groups
            .entry(base_version(version))
            .or_default()
            .push(version);
    }

    let owners: HashMap<String, String> = groups
        .into_iter()
        .map(|(base, mut members)| {
            members.sort_unstable();
            // Sole member, or the latest patch letter.
            (base.to_string(), members.pop().unwrap_or(base).to_string())
        })
        .collect();

    for mut descriptor in metadata {
        if descriptor.version.is_empty() {
            // The top-level "latest" archive lives outside the release
            // naming scheme; it belongs to the newest changelog entry.
            match &newest_version {
                Some(newest) => descriptor.version = newest.clone(),
                None => continue,
            }
        }

        let Some(owner) = owners.get(base_version(&descriptor.version)) else {
            debug!(
                version = %descriptor.version,
                "discarding archive metadata for version absent from changelog"
            );
            continue;
        };

        if let Some(entry) = by_version.get_mut(owner) {
            entry.path = descriptor.path;
            entry.size = Some(descriptor.size);
        }
    }

    let mut catalog: Vec<Firmware> = by_version.into_values().collect();
    catalog.sort_unstable_by(|a, b| b.version.cmp(&a.version));
    catalog
}

#[derive(Clone)]
pub struct CatalogService {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    hub: EventHub,
    cache: Arc<Mutex<Option<Arc<Vec<Firmware>>>>>,
}

impl CatalogService {
    pub fn new(hub: EventHub) -> Self {
        Self::with_base_url(hub, API_BASE.to_string())
    }

    /// The bearer token, when configured, comes from the environment; the
    /// core has no other configuration surface.
    pub fn with_base_url(hub: EventHub, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            token: env::var(TOKEN_ENV_VAR).ok(),
            hub,
            cache: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cached(&self) -> Option<Arc<Vec<Firmware>>> {
        self.cache.lock().unwrap().clone()
    }

    /// Stale-while-revalidate: a cached catalog is returned immediately and
    /// refreshed in the background. Callers needing freshness await
    /// [`CatalogService::refresh`] directly.
    pub async fn fetch_catalog(&self) -> Result<Vec<Firmware>, CatalogError> {
        if let Some(cached) = self.cached() {
            debug!("serving cached firmware catalog, refreshing in background");

            let service = self.clone();
            tokio::spawn(async move {
                if let Err(err) = service.refresh().await {
                    error!("background catalog refresh failed: {err}");
                }
            });

            return Ok(cached.as_ref().clone());
        }

        self.refresh().await
    }

    /// Fetches, parses and merges a fresh catalog. Network failures degrade
    /// to an empty result plus a user-visible notice; parse failures
    /// propagate. Neither touches the cached catalog.
    pub async fn refresh(&self) -> Result<Vec<Firmware>, CatalogError> {
        let fetched = futures_util::future::try_join(
            self.fetch_changelog_text(),
            self.fetch_release_metadata(),
        )
        .await;

        let (changelog_text, metadata) = match fetched {
            Ok(pair) => pair,
            Err(err) => {
                error!("firmware catalog fetch failed: {err}");
                self.hub
                    .emit_notice(Notice::error("Failed to fetch and parse firmware data"));
                return Ok(Vec::new());
            }
        };

        let changelog = match parse_changelog(&changelog_text) {
            Ok(changelog) => changelog,
            Err(err) => {
                error!("firmware changelog parse failed: {err}");
                self.hub
                    .emit_notice(Notice::error("Failed to fetch and parse firmware data"));
                return Err(err.into());
            }
        };

        let catalog = merge_catalog(changelog, metadata);
        info!(entries = catalog.len(), "firmware catalog refreshed");

        *self.cache.lock().unwrap() = Some(Arc::new(catalog.clone()));

        Ok(catalog)
    }

    fn request(&self, path: &str, accept: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .get(format!("{}/{}", self.base_url, path))
            .header(reqwest::header::ACCEPT, accept)
            .header(reqwest::header::USER_AGENT, USER_AGENT_VALUE)
            .header(API_VERSION_HEADER, API_VERSION);

        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        request
    }

    fn check(response: reqwest::Response) -> Result<reqwest::Response, CatalogError> {
        if !response.status().is_success() {
            return Err(CatalogError::Status(response.status()));
        }

        Ok(response)
    }

    // One timeout bounds request and body together; dropping the future on
    // expiry aborts the in-flight transfer.
    async fn get_text(&self, path: &str, accept: &str) -> Result<String, CatalogError> {
        timeout(FETCH_TIMEOUT, async {
            let response = Self::check(self.request(path, accept).send().await?)?;
            Ok(response.text().await?)
        })
        .await
        .map_err(|_| CatalogError::Timeout(FETCH_TIMEOUT))?
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, CatalogError> {
        timeout(FETCH_TIMEOUT, async {
            let response = Self::check(self.request(path, ACCEPT_JSON).send().await?)?;
            Ok(response.json().await?)
        })
        .await
        .map_err(|_| CatalogError::Timeout(FETCH_TIMEOUT))?
    }

    async fn fetch_changelog_text(&self) -> Result<String, CatalogError> {
        self.get_text(CHANGELOG_PATH, ACCEPT_RAW).await
    }

    /// Release listing plus the well-known top-level "latest" archive,
    /// reversed so the newest descriptors come first.
    async fn fetch_release_metadata(&self) -> Result<Vec<ReleaseDescriptor>, CatalogError> {
        let listing: Vec<ContentsEntry> = self.get_json(RELEASES_PATH).await?;

        let mut descriptors: Vec<ReleaseDescriptor> = listing
            .into_iter()
            .map(|entry| ReleaseDescriptor {
                version: extract_archive_version(&entry.name),
                path: entry.path,
                size: entry.size,
            })
            .collect();

        let latest: ContentsEntry = self.get_json(LATEST_ARCHIVE_PATH).await?;

        descriptors.push(ReleaseDescriptor {
            version: extract_archive_version(&latest.name),
            path: latest.path,
            size: latest.size,
        });

        descriptors.reverse();

        Ok(descriptors)
    }
}
