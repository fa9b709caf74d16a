//! Configuration types: the CLI-level run configuration and the per-site
//! configuration loaded from a YAML site list.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Runner-level configuration, built from CLI flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub(crate) sites_path: PathBuf,
    pub(crate) out_dir: PathBuf,
    pub(crate) since_secs: Option<u64>,
    pub(crate) concurrency: usize,
}

impl RunConfig {
    pub fn new(sites_path: PathBuf, out_dir: PathBuf, since_secs: Option<u64>, concurrency: usize) -> Self {
        Self {
            sites_path,
            out_dir,
            since_secs,
            concurrency: concurrency.max(1),
        }
    }

    pub fn sites_path(&self) -> &PathBuf {
        &self.sites_path
    }

    pub fn out_dir(&self) -> &PathBuf {
        &self.out_dir
    }

    pub fn since_secs(&self) -> Option<u64> {
        self.since_secs
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Wordpress,
    Rss,
    Sitemap,
    Crawl,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wordpress => "wordpress",
            Self::Rss => "rss",
            Self::Sitemap => "sitemap",
            Self::Crawl => "crawl",
        }
    }
}

/// One configured site, as read from the `sites:` list of the YAML document.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub(crate) id: String,
    pub(crate) kind: SourceKind,
    #[serde(default)]
    pub(crate) base: Option<String>,
    #[serde(default)]
    pub(crate) feed: Option<String>,
    #[serde(default)]
    pub(crate) sitemap: Option<String>,
    #[serde(default = "default_rps")]
    pub(crate) rate_limit_rps: f64,
    #[serde(default = "default_max_depth")]
    pub(crate) max_depth: u8,
    #[serde(default)]
    pub(crate) scope_host: Option<String>,
    #[serde(default)]
    pub(crate) include_paths: Vec<String>,
    #[serde(default)]
    pub(crate) exclude_patterns: Vec<String>,
    #[serde(default = "default_user_agent")]
    pub(crate) user_agent: String,
    #[serde(default)]
    pub(crate) headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub(crate) recrawl_ttl_seconds: u64,
    #[serde(default)]
    pub(crate) js_render: bool,
    #[serde(default)]
    pub(crate) wait_selector: Option<String>,
    #[serde(default = "default_max_rendered_pages")]
    pub(crate) max_rendered_pages: usize,
    #[serde(default = "default_max_pages")]
    pub(crate) max_pages: usize,
}

fn default_rps() -> f64 {
    1.0
}
fn default_max_depth() -> u8 {
    3
}
fn default_user_agent() -> String {
    "LinkHarvest/1.0".to_string()
}
fn default_max_rendered_pages() -> usize {
    50
}
fn default_max_pages() -> usize {
    100
}

impl SiteConfig {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn base(&self) -> Option<&str> {
        self.base.as_deref()
    }

    pub fn feed(&self) -> Option<&str> {
        self.feed.as_deref()
    }

    pub fn sitemap(&self) -> Option<&str> {
        self.sitemap.as_deref()
    }

    pub fn rate_limit_rps(&self) -> f64 {
        self.rate_limit_rps
    }

    pub fn max_depth(&self) -> u8 {
        self.max_depth
    }

    pub fn scope_host(&self) -> Option<&str> {
        self.scope_host.as_deref()
    }

    pub fn include_paths(&self) -> &[String] {
        &self.include_paths
    }

    pub fn exclude_patterns(&self) -> &[String] {
        &self.exclude_patterns
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn headers(&self) -> &std::collections::HashMap<String, String> {
        &self.headers
    }

    pub fn recrawl_ttl_seconds(&self) -> u64 {
        self.recrawl_ttl_seconds
    }

    pub fn js_render(&self) -> bool {
        self.js_render
    }

    pub fn wait_selector(&self) -> Option<&str> {
        self.wait_selector.as_deref()
    }

    pub fn max_rendered_pages(&self) -> usize {
        self.max_rendered_pages
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    pub fn cfg_json(&self) -> String {
        serde_json::json!({
            "base": self.base,
            "feed": self.feed,
            "sitemap": self.sitemap,
            "rate_limit_rps": self.rate_limit_rps,
            "max_depth": self.max_depth,
            "scope_host": self.scope_host,
            "include_paths": self.include_paths,
            "exclude_patterns": self.exclude_patterns,
            "js_render": self.js_render,
        })
        .to_string()
    }
}

#[derive(Debug, Deserialize)]
struct SitesDocument {
    sites: Vec<SiteConfig>,
}

/// Checks that a site carries the fields its `kind` requires.
///
/// Serde only enforces shape, not these cross-field requirements, so this
/// runs as a second pass after deserialization and reports a typed
/// `HarvestError::Config` naming the missing field.
fn validate_site(site: &SiteConfig) -> std::result::Result<(), HarvestError> {
    let missing = match site.kind {
        SourceKind::Wordpress | SourceKind::Crawl => site.base.is_none(),
        SourceKind::Rss => site.feed.is_none(),
        SourceKind::Sitemap => site.sitemap.is_none() && site.base.is_none(),
    };
    if missing {
        return Err(HarvestError::Config(format!(
            "site '{}' ({:?}) is missing a required field for its kind",
            site.id, site.kind
        )));
    }
    Ok(())
}

/// Load the `sites:` list from a YAML file.
pub fn load_sites(path: &std::path::Path) -> Result<Vec<SiteConfig>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read sites file {}", path.display()))?;
    let doc: SitesDocument =
        serde_yaml::from_str(&text).context("failed to parse sites YAML")?;
    for site in &doc.sites {
        validate_site(site)?;
    }
    Ok(doc.sites)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_site_list() {
        let yaml = r#"
sites:
  - id: blog
    kind: rss
    feed: "https://example.com/feed.xml"
  - id: docs
    kind: crawl
    base: "https://example.com"
    max_depth: 2
"#;
        let doc: SitesDocument = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.sites.len(), 2);
        assert_eq!(doc.sites[0].id(), "blog");
        assert_eq!(doc.sites[0].kind(), SourceKind::Rss);
        assert_eq!(doc.sites[1].max_depth(), 2);
        assert_eq!(doc.sites[1].rate_limit_rps(), 1.0);
        for site in &doc.sites {
            validate_site(site).unwrap();
        }
    }

    #[test]
    fn rejects_rss_site_without_feed() {
        let yaml = r#"
sites:
  - id: blog
    kind: rss
"#;
        let doc: SitesDocument = serde_yaml::from_str(yaml).unwrap();
        let err = validate_site(&doc.sites[0]).unwrap_err();
        assert!(matches!(err, HarvestError::Config(_)));
    }
}
