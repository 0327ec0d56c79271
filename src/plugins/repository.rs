//! Remote plugin repository client.
//!
//! The client keeps a cached copy of the remote catalog, resolves plugin
//! manifests (local folder first, remote repository second) and installs plugin
//! folders from repository archives. All network access goes through the
//! [`Transport`] trait so callers can substitute their own HTTP stack.

use crate::core::config::Config;
use crate::core::error::PluginctlError;
use crate::core::store::Store;
use crate::plugins::manifest::{PluginManifest, manifest_path};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

static GITHUB_REPO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(?:www\.)?github\.com/([^/]+)/([^/]+?)(?:\.git)?/?$")
        .expect("static regex")
});

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Value of the `Content-Length` header, when the server sent one.
    pub content_length: Option<u64>,
    pub body: Vec<u8>,
}

pub trait Transport {
    fn get(&self, url: &str) -> Result<HttpResponse, PluginctlError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn get(&self, url: &str) -> Result<HttpResponse, PluginctlError> {
        (**self).get(url)
    }
}

/// Blocking HTTP transport backed by reqwest.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, PluginctlError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pluginctl/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<HttpResponse, PluginctlError> {
        tracing::debug!(url, "http get");
        let response = self.client.get(url).send()?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let body = response.bytes()?.to_vec();
        Ok(HttpResponse {
            status,
            content_length,
            body,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(default)]
    pub desc: String,
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub plugins: BTreeMap<String, CatalogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Updated { new_plugins: Vec<String>, total: usize },
    /// The download failed; the previous cache is untouched.
    NotUpdated { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingSource {
    Catalog,
    LocalOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogListing {
    pub name: String,
    pub description: String,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub source: ListingSource,
    /// A plugin folder with a manifest exists locally.
    pub local: bool,
}

/// Locations and defaults the client works with.
#[derive(Debug, Clone)]
pub struct RepositorySettings {
    pub catalog_url: Option<String>,
    pub cache_path: PathBuf,
    pub plugins_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub default_branch: String,
}

impl RepositorySettings {
    pub fn from_config(store: &Store, config: &Config) -> Self {
        Self {
            catalog_url: config.catalog_url.clone(),
            cache_path: store.catalog_cache_path(),
            plugins_dir: config.plugins_path(store),
            tmp_dir: store.tmp_dir(),
            default_branch: config.default_branch.clone(),
        }
    }
}

pub struct RepositoryClient<T: Transport> {
    transport: T,
    settings: RepositorySettings,
}

impl<T: Transport> RepositoryClient<T> {
    pub fn new(transport: T, settings: RepositorySettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.settings.plugins_dir
    }

    pub fn plugin_dir(&self, name: &str) -> PathBuf {
        self.settings.plugins_dir.join(name)
    }

    pub fn has_local_manifest(&self, name: &str) -> bool {
        manifest_path(&self.plugin_dir(name)).is_file()
    }

    /// GET a URL and insist on a complete 200 response. With `require_length`
    /// a response that declares no `Content-Length` is refused too.
    fn fetch_checked(&self, url: &str, require_length: bool) -> Result<Vec<u8>, String> {
        let response = self
            .transport
            .get(url)
            .map_err(|e| format!("GET {url} failed: {e}"))?;
        if response.status != 200 {
            return Err(format!("GET {url} returned HTTP {}", response.status));
        }
        match response.content_length {
            Some(expected) => {
                let received = response.body.len() as u64;
                if expected != received {
                    return Err(format!(
                        "GET {url} transferred {received} of {expected} bytes"
                    ));
                }
            }
            None if require_length => {
                return Err(format!("GET {url} did not declare a Content-Length"));
            }
            None => {}
        }
        Ok(response.body)
    }

    /// The cached catalog, if one has been downloaded.
    pub fn read_catalog(&self) -> Result<Option<Catalog>, PluginctlError> {
        let path = &self.settings.cache_path;
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read(path)?;
        let catalog = serde_json::from_slice(&content).map_err(|e| {
            PluginctlError::RepositoryError(format!("cached catalog {} is unreadable: {e}", path.display()))
        })?;
        Ok(Some(catalog))
    }

    /// Download the remote catalog and replace the cache only if the transfer
    /// was complete and the body parses.
    pub fn refresh_catalog(&self) -> Result<RefreshOutcome, PluginctlError> {
        let url = self
            .settings
            .catalog_url
            .as_deref()
            .ok_or_else(|| PluginctlError::ConfigError("catalog_url is not configured".into()))?;
        let cache_path = &self.settings.cache_path;
        let cache_dir = cache_path
            .parent()
            .ok_or_else(|| PluginctlError::PathError(format!("{} has no parent", cache_path.display())))?;
        ensure_writable_dir(cache_dir)?;

        let previous = self
            .read_catalog()
            .inspect_err(|err| tracing::warn!(error = %err, "ignoring unreadable catalog cache"));

        let body = match self.fetch_checked(url, true) {
            Ok(body) => body,
            Err(reason) => {
                tracing::warn!(%reason, "catalog refresh failed; keeping cached copy");
                return Ok(RefreshOutcome::NotUpdated { reason });
            }
        };
        let catalog: Catalog = match serde_json::from_slice(&body) {
            Ok(catalog) => catalog,
            Err(e) => {
                let reason = format!("catalog from {url} is not valid: {e}");
                tracing::warn!(%reason, "catalog refresh failed; keeping cached copy");
                return Ok(RefreshOutcome::NotUpdated { reason });
            }
        };

        let mut tmp = tempfile::NamedTempFile::new_in(cache_dir)
            .map_err(|e| PluginctlError::filesystem(cache_dir, e))?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(cache_path)
            .map_err(|e| PluginctlError::filesystem(cache_path, e.error))?;

        // Without a readable previous cache there is nothing to diff against.
        let new_plugins: Vec<String> = match &previous {
            Ok(previous) => catalog
                .plugins
                .keys()
                .filter(|name| previous.as_ref().is_none_or(|p| !p.plugins.contains_key(*name)))
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        };
        tracing::info!(total = catalog.plugins.len(), new = new_plugins.len(), "catalog refreshed");
        Ok(RefreshOutcome::Updated {
            new_plugins,
            total: catalog.plugins.len(),
        })
    }

    /// Plugin folders under the plugins directory that carry a manifest.
    pub fn local_plugins(&self) -> Result<Vec<String>, PluginctlError> {
        let dir = &self.settings.plugins_dir;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            if manifest_path(&entry.path()).is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Catalog entries merged with local plugins the catalog does not list.
    pub fn listings(&self) -> Result<Vec<CatalogListing>, PluginctlError> {
        let catalog = self.read_catalog()?.unwrap_or_default();
        let local = self.local_plugins()?;
        let mut listings: Vec<CatalogListing> = catalog
            .plugins
            .iter()
            .map(|(name, entry)| CatalogListing {
                name: name.clone(),
                description: entry.desc.clone(),
                repo: Some(entry.repo.clone()),
                branch: entry.branch.clone(),
                source: ListingSource::Catalog,
                local: local.contains(name),
            })
            .collect();
        for name in local {
            if catalog.plugins.contains_key(&name) {
                continue;
            }
            let description = PluginManifest::from_file(&manifest_path(&self.plugin_dir(&name)), &name)
                .ok()
                .and_then(|m| m.description)
                .unwrap_or_default();
            listings.push(CatalogListing {
                name,
                description,
                repo: None,
                branch: None,
                source: ListingSource::LocalOnly,
                local: true,
            });
        }
        listings.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listings)
    }

    pub fn catalog_entry(&self, name: &str) -> Result<CatalogEntry, PluginctlError> {
        self.read_catalog()?
            .and_then(|c| c.plugins.get(name).cloned())
            .ok_or_else(|| PluginctlError::NotFound(format!("plugin {name} in the repository catalog")))
    }

    fn branch_of<'e>(&'e self, entry: &'e CatalogEntry) -> &'e str {
        entry
            .branch
            .as_deref()
            .filter(|b| !b.is_empty())
            .unwrap_or(&self.settings.default_branch)
    }

    /// Raw-content URL of the manifest inside a repository.
    pub fn raw_manifest_url(&self, entry: &CatalogEntry) -> String {
        let branch = self.branch_of(entry);
        match GITHUB_REPO.captures(entry.repo.trim()) {
            Some(caps) => format!(
                "https://raw.githubusercontent.com/{}/{}/{}/config/plugin.config.xml",
                &caps[1], &caps[2], branch
            ),
            None => format!(
                "{}/raw/{}/config/plugin.config.xml",
                trim_repo_url(&entry.repo),
                branch
            ),
        }
    }

    pub fn archive_url(&self, entry: &CatalogEntry) -> String {
        format!(
            "{}/archive/{}.zip",
            trim_repo_url(&entry.repo),
            self.branch_of(entry)
        )
    }

    /// Load a plugin's manifest: the local folder wins, otherwise it is
    /// downloaded from the plugin's repository.
    pub fn resolve_manifest(&self, name: &str) -> Result<PluginManifest, PluginctlError> {
        let local = manifest_path(&self.plugin_dir(name));
        if local.is_file() {
            return PluginManifest::from_file(&local, name);
        }
        let entry = self.catalog_entry(name).map_err(|_| {
            PluginctlError::ManifestError(format!(
                "{name}: no local manifest and no catalog entry"
            ))
        })?;
        let url = self.raw_manifest_url(&entry);
        let body = self.fetch_checked(&url, false).map_err(PluginctlError::RepositoryError)?;
        let xml = String::from_utf8(body)
            .map_err(|e| PluginctlError::ManifestError(format!("{name}: manifest is not UTF-8: {e}")))?;
        PluginManifest::parse(&xml, name)
    }

    /// Fetch `<repo>/archive/<branch>.zip` into the scratch directory.
    pub fn download_archive(&self, name: &str) -> Result<DownloadedArchive, PluginctlError> {
        let entry = self.catalog_entry(name)?;
        let tmp_dir = &self.settings.tmp_dir;
        ensure_writable_dir(tmp_dir)?;

        let url = self.archive_url(&entry);
        let body = self.fetch_checked(&url, false).map_err(PluginctlError::RepositoryError)?;

        let dir = tempfile::Builder::new()
            .prefix("download-")
            .tempdir_in(tmp_dir)
            .map_err(|e| PluginctlError::filesystem(tmp_dir, e))?;
        let path = dir.path().join(format!("{name}.zip"));
        fs::write(&path, &body).map_err(|e| PluginctlError::filesystem(&path, e))?;
        tracing::debug!(plugin = name, bytes = body.len(), "archive downloaded");
        Ok(DownloadedArchive { _dir: dir, path })
    }

    /// Extract a downloaded archive and install its top-level folder as
    /// `<plugins_dir>/<name>`.
    pub fn extract_archive(&self, name: &str, archive: &DownloadedArchive) -> Result<PathBuf, PluginctlError> {
        let plugins_dir = &self.settings.plugins_dir;
        ensure_writable_dir(plugins_dir)?;

        // Staging lives inside the plugins directory so the final rename stays
        // on one filesystem.
        let staging = tempfile::Builder::new()
            .prefix(".extract-")
            .tempdir_in(plugins_dir)
            .map_err(|e| PluginctlError::filesystem(plugins_dir, e))?;
        let files = extract_zip(&archive.path, staging.path())?;
        let root = archive_root(staging.path())?;

        let target = self.plugin_dir(name);
        replace_dir(&root, &target)?;
        tracing::info!(plugin = name, files, target = %target.display(), "plugin archive extracted");
        Ok(target)
    }

    pub fn download_and_extract(&self, name: &str) -> Result<PathBuf, PluginctlError> {
        let archive = self.download_archive(name)?;
        self.extract_archive(name, &archive)
    }
}

/// A repository archive on disk. The file is removed on drop.
#[derive(Debug)]
pub struct DownloadedArchive {
    _dir: tempfile::TempDir,
    pub path: PathBuf,
}

fn trim_repo_url(repo: &str) -> &str {
    let trimmed = repo.trim().trim_end_matches('/');
    trimmed.strip_suffix(".git").unwrap_or(trimmed)
}

/// Create `dir` if needed and prove it is writable.
pub fn ensure_writable_dir(dir: &Path) -> Result<(), PluginctlError> {
    fs::create_dir_all(dir).map_err(|e| PluginctlError::filesystem(dir, e))?;
    tempfile::NamedTempFile::new_in(dir)
        .map(drop)
        .map_err(|e| PluginctlError::filesystem(dir, format!("not writable: {e}")))
}

/// Extract every entry of a zip archive under `dest`. Returns the number of
/// files written. Entries whose path would leave `dest` are rejected.
pub fn extract_zip(archive_path: &Path, dest: &Path) -> Result<usize, PluginctlError> {
    let file = File::open(archive_path).map_err(|e| PluginctlError::filesystem(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut written = 0;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(out_path) = entry.enclosed_name().map(|p| dest.join(p)) else {
            return Err(PluginctlError::filesystem(
                dest,
                format!("archive entry escapes the extraction root: {}", entry.name()),
            ));
        };
        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| PluginctlError::filesystem(&out_path, e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| PluginctlError::filesystem(parent, e))?;
        }
        let mut out = File::create(&out_path).map_err(|e| PluginctlError::filesystem(&out_path, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| PluginctlError::filesystem(&out_path, e))?;
        written += 1;
    }
    Ok(written)
}

/// The folder that holds the plugin after extraction: the archive's single
/// top-level directory, or a fresh directory gathering a flat archive.
pub fn archive_root(staging: &Path) -> Result<PathBuf, PluginctlError> {
    let entries: Vec<fs::DirEntry> = fs::read_dir(staging)?.collect::<Result<_, _>>()?;
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        return Ok(entries[0].path());
    }
    if entries.is_empty() {
        return Err(PluginctlError::filesystem(staging, "archive is empty"));
    }
    let gathered = staging.join(".root");
    fs::create_dir(&gathered).map_err(|e| PluginctlError::filesystem(&gathered, e))?;
    for entry in entries {
        let dest = gathered.join(entry.file_name());
        fs::rename(entry.path(), &dest).map_err(|e| PluginctlError::filesystem(&dest, e))?;
    }
    Ok(gathered)
}

/// Move `source` to `target`. An existing target is set aside first and put
/// back if the move fails.
fn replace_dir(source: &Path, target: &Path) -> Result<(), PluginctlError> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| PluginctlError::PathError(format!("{} has no file name", target.display())))?;
    let backup = target.with_file_name(format!(".{file_name}.previous"));
    let had_previous = target.exists();
    if had_previous {
        if backup.exists() {
            fs::remove_dir_all(&backup).map_err(|e| PluginctlError::filesystem(&backup, e))?;
        }
        fs::rename(target, &backup).map_err(|e| PluginctlError::filesystem(target, e))?;
    }
    match fs::rename(source, target) {
        Ok(()) => {
            if had_previous {
                if let Err(e) = fs::remove_dir_all(&backup) {
                    tracing::warn!(path = %backup.display(), error = %e, "could not remove previous plugin folder");
                }
            }
            Ok(())
        }
        Err(e) => {
            if had_previous {
                if let Err(restore) = fs::rename(&backup, target) {
                    tracing::error!(path = %target.display(), error = %restore, "could not restore previous plugin folder");
                }
            }
            Err(PluginctlError::filesystem(target, e))
        }
    }
}
