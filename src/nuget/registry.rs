use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, FixedOffset};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;

use super::{
    BEPINEX_FEED, LocalPackage, NUGET_ORG, PackagePublisher, PackageRegistry, PublishedVersion,
    extract_package, is_unlisted,
};
use crate::error::ConfigError;
use crate::ledger::WorkLedger;
use crate::metadata::Dependency;
use crate::process::Tool;

const REGISTRATIONS: &str = "RegistrationsBaseUrl/3.6.0";
const PACKAGE_CONTENT: &str = "PackageBaseAddress/3.0.0";

#[derive(Debug, Deserialize)]
struct ServiceIndex {
    resources: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct RegistrationIndex {
    #[serde(default)]
    items: Vec<RegistrationPage>,
}

#[derive(Debug, Deserialize)]
struct RegistrationPage {
    #[serde(rename = "@id")]
    id: String,
    /// Absent when the page has to be fetched on its own.
    items: Option<Vec<RegistrationLeaf>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationLeaf {
    catalog_entry: CatalogEntry,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: String,
    version: String,
    #[serde(default)]
    listed: Option<bool>,
    #[serde(default)]
    published: Option<String>,
}

impl CatalogEntry {
    fn into_published(self) -> Option<PublishedVersion> {
        let published = self
            .published
            .as_deref()
            .and_then(|p| DateTime::<FixedOffset>::parse_from_rfc3339(p).ok());
        if self.listed == Some(false) || is_unlisted(published.as_ref()) {
            return None;
        }
        Some(PublishedVersion {
            id: self.id,
            version: self.version,
            published,
        })
    }
}

/// Client for NuGet v3 feeds, backed by a local package cache.
///
/// Reads go to the primary feed, dependency downloads fall back to the
/// remaining feeds in order. Concurrent requests for the same dependency
/// share one download.
pub struct NuGet {
    client: Client,
    sources: Vec<String>,
    cache_dir: Utf8PathBuf,
    api_key: Option<String>,
    services: Mutex<HashMap<String, Arc<ServiceIndex>>>,
    downloads: WorkLedger<(String, String)>,
}

impl NuGet {
    /// Feeds nuget.org then the BepInEx feed, caching under `cache_dir`.
    pub fn new(cache_dir: impl Into<Utf8PathBuf>, api_key: Option<String>) -> anyhow::Result<Self> {
        Self::with_sources(
            vec![NUGET_ORG.to_string(), BEPINEX_FEED.to_string()],
            cache_dir,
            api_key,
        )
    }

    pub fn with_sources(
        sources: Vec<String>,
        cache_dir: impl Into<Utf8PathBuf>,
        api_key: Option<String>,
    ) -> anyhow::Result<Self> {
        if sources.is_empty() {
            return Err(anyhow!("At least one package source is required"));
        }
        let client = Client::builder()
            .user_agent(concat!("dehumidifier/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Couldn't create HTTP client")?;

        Ok(Self {
            client,
            sources,
            cache_dir: cache_dir.into(),
            api_key: api_key.filter(|key| !key.is_empty()),
            services: Mutex::new(HashMap::new()),
            downloads: WorkLedger::new(),
        })
    }

    pub fn cache_dir(&self) -> &Utf8Path {
        &self.cache_dir
    }

    fn service_index(&self, source: &str) -> anyhow::Result<Arc<ServiceIndex>> {
        if let Some(index) = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source)
        {
            return Ok(index.clone());
        }

        let index: ServiceIndex = self
            .client
            .get(source)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .with_context(|| format!("Couldn't read service index '{source}'"))?;
        let index = Arc::new(index);

        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source.to_string(), index.clone());
        Ok(index)
    }

    fn resource(&self, source: &str, kind: &str) -> anyhow::Result<String> {
        let index = self.service_index(source)?;
        let base = index
            .resources
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| r.id.clone())
            .ok_or_else(|| anyhow!("'{source}' provides no {kind} resource"))?;
        Ok(with_trailing_slash(base))
    }

    /// Directory a dependency is unpacked into.
    pub fn package_dir(&self, dependency: &Dependency) -> Utf8PathBuf {
        self.cache_dir
            .join(dependency.name.to_lowercase())
            .join(dependency.version.to_lowercase())
    }

    fn fetch(&self, dependency: &Dependency, dest: &Utf8Path) -> anyhow::Result<()> {
        let mut last_error = None;

        for source in &self.sources {
            let base = match self.resource(source, PACKAGE_CONTENT) {
                Ok(base) => base,
                Err(e) => {
                    tracing::warn!("{e:#}");
                    last_error = Some(e);
                    continue;
                }
            };
            let url = package_url(&base, &dependency.name, &dependency.version);

            let response = self
                .client
                .get(&url)
                .send()
                .with_context(|| format!("Couldn't request '{url}'"))?;
            if response.status() == StatusCode::NOT_FOUND {
                tracing::debug!("{} {} not found on {source}", dependency.name, dependency.version);
                last_error = Some(anyhow!("{} {} not found on {source}", dependency.name, dependency.version));
                continue;
            }

            let bytes = response
                .error_for_status()
                .and_then(|r| r.bytes())
                .with_context(|| format!("Couldn't download '{url}'"))?;
            extract_package(&bytes, dest)
                .with_context(|| format!("Couldn't unpack {} {}", dependency.name, dependency.version))?;
            tracing::info!("Downloaded {} {} from {source}", dependency.name, dependency.version);
            return Ok(());
        }

        Err(last_error.unwrap_or_else(|| anyhow!("No package sources configured")))
            .with_context(|| format!("Couldn't obtain {} {}", dependency.name, dependency.version))
    }
}

fn with_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}

/// Flat container address of a package archive.
pub(crate) fn package_url(base: &str, id: &str, version: &str) -> String {
    let id = id.to_lowercase();
    let version = version.to_lowercase();
    format!("{base}{id}/{version}/{id}.{version}.nupkg")
}

fn parse_registration(body: &str) -> anyhow::Result<RegistrationIndex> {
    serde_json::from_str(body).context("Couldn't decode registration index")
}

impl PackageRegistry for NuGet {
    fn published_versions(&self, package_id: &str) -> anyhow::Result<Vec<PublishedVersion>> {
        let Some(source) = self.sources.first() else {
            return Ok(Vec::new());
        };
        let base = self.resource(source, REGISTRATIONS)?;
        let url = format!("{base}{}/index.json", package_id.to_lowercase());

        let response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("Couldn't request '{url}'"))?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::info!("{package_id} has never been published");
            return Ok(Vec::new());
        }
        let body = response
            .error_for_status()
            .and_then(|r| r.text())
            .with_context(|| format!("Couldn't read '{url}'"))?;

        let mut versions = Vec::new();
        for page in parse_registration(&body)?.items {
            let leaves = match page.items {
                Some(leaves) => leaves,
                None => {
                    let page: RegistrationPage = self
                        .client
                        .get(&page.id)
                        .send()
                        .and_then(|r| r.error_for_status())
                        .and_then(|r| r.json())
                        .with_context(|| format!("Couldn't read registration page '{}'", page.id))?;
                    page.items.unwrap_or_default()
                }
            };
            versions.extend(leaves.into_iter().filter_map(|l| l.catalog_entry.into_published()));
        }

        tracing::debug!("{package_id}: {} listed versions", versions.len());
        Ok(versions)
    }

    fn download(&self, dependency: &Dependency) -> anyhow::Result<LocalPackage> {
        let dest = self.package_dir(dependency);
        let key = (dependency.name.to_lowercase(), dependency.version.to_lowercase());

        let (_, outcome) = self
            .downloads
            .run_once(&key, || dest.is_dir(), || self.fetch(dependency, &dest));
        outcome?;

        Ok(LocalPackage {
            id: dependency.name.clone(),
            version: dependency.version.clone(),
            root: dest,
        })
    }
}

impl PackagePublisher for NuGet {
    fn push(&self, package: &Utf8Path) -> anyhow::Result<()> {
        let key = self
            .api_key
            .as_deref()
            .ok_or(ConfigError::MissingCredential("NuGet API key"))?;

        tracing::info!("Pushing {package}...");
        Tool::new("dotnet nuget push", "dotnet")
            .args(["nuget", "push", package.as_str(), "--source", NUGET_ORG])
            .arg("--api-key")
            .secret_arg(key)
            .arg("--skip-duplicate")
            .run()?;
        Ok(())
    }
}
