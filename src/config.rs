//! Configuration loader and validator for the auto-tagging service.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::{ScheduleConfig, Stage};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub services: Services,
    pub publications: Vec<Publication>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub journal_dir: Option<String>,
    pub monthly_cap: i64,
    #[serde(default = "default_overseer_interval")]
    pub overseer_interval_seconds: u64,
    #[serde(default = "default_discovery_backoff")]
    pub discovery_backoff_seconds: u64,
    #[serde(default = "default_content_url_pattern")]
    pub content_url_pattern: String,
    #[serde(default = "default_excluded_segment_marker")]
    pub excluded_segment_marker: String,
}

fn default_overseer_interval() -> u64 {
    24 * 60 * 60
}

fn default_discovery_backoff() -> u64 {
    300
}

fn default_content_url_pattern() -> String {
    "article".to_string()
}

fn default_excluded_segment_marker() -> String {
    "sitemap-section".to_string()
}

/// External collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Services {
    pub analyzer: AnalyzerService,
    pub tagger: Credentials,
    pub publisher: Credentials,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalyzerService {
    pub url: String,
    pub user: String,
    pub home: String,
    #[serde(default)]
    pub host_rewrite: Option<HostRewrite>,
}

/// Substring replacement applied to article URLs before analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostRewrite {
    pub from: String,
    pub to: String,
}

/// Base URL plus basic-auth credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub url: String,
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Publication {
    pub name: String,
    pub sitemap_index: String,
    pub schedules: Schedules,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedules {
    pub discovery: StageSchedule,
    pub processing: StageSchedule,
    pub retry: StageSchedule,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageSchedule {
    pub interval_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Schedules {
    pub fn get(&self, stage: Stage) -> StageSchedule {
        match stage {
            Stage::Discovery => self.discovery,
            Stage::Processing => self.processing,
            Stage::Retry => self.retry,
        }
    }
}

impl Publication {
    /// Seed rows for the schedule table, one per stage.
    pub fn seed_schedules(&self) -> Vec<ScheduleConfig> {
        Stage::ALL
            .iter()
            .map(|&stage| {
                let s = self.schedules.get(stage);
                ScheduleConfig {
                    publication: self.name.clone(),
                    stage,
                    interval_seconds: s.interval_seconds,
                    enabled: s.enabled,
                }
            })
            .collect()
    }
}

impl App {
    pub fn resolved_database_url(&self) -> String {
        std::env::var("DATABASE_URL").ok().or_else(|| self.database_url.clone()).unwrap_or_else(|| {
            format!("sqlite://{}/autotagger.db", self.data_dir)
        })
    }

    pub fn resolved_journal_dir(&self) -> PathBuf {
        match &self.journal_dir {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => Path::new(&self.data_dir).join("fail-safe"),
        }
    }
}

impl Config {
    /// Ensure required directories exist (data dir and journal root).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)?;
        fs::create_dir_all(self.app.resolved_journal_dir())
    }

    pub fn publication(&self, name: &str) -> Option<&Publication> {
        self.publications.iter().find(|p| p.name == name)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    parse(&content)
}

/// Parse and validate YAML content.
pub fn parse(content: &str) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn non_empty(s: &str) -> bool {
    !s.trim().is_empty()
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if !non_empty(&cfg.app.data_dir) {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.monthly_cap <= 0 {
        return Err(ConfigError::Invalid("app.monthly_cap must be > 0"));
    }
    if cfg.app.overseer_interval_seconds == 0 {
        return Err(ConfigError::Invalid("app.overseer_interval_seconds must be > 0"));
    }
    if cfg.app.discovery_backoff_seconds == 0 {
        return Err(ConfigError::Invalid("app.discovery_backoff_seconds must be > 0"));
    }
    if regex::Regex::new(&cfg.app.content_url_pattern).is_err() {
        return Err(ConfigError::Invalid("app.content_url_pattern must be a valid regex"));
    }
    if !non_empty(&cfg.app.excluded_segment_marker) {
        return Err(ConfigError::Invalid("app.excluded_segment_marker must be non-empty"));
    }

    let analyzer = &cfg.services.analyzer;
    if !non_empty(&analyzer.url) {
        return Err(ConfigError::Invalid("services.analyzer.url must be non-empty"));
    }
    if !non_empty(&analyzer.user) || !non_empty(&analyzer.home) {
        return Err(ConfigError::Invalid("services.analyzer.user and home must be non-empty"));
    }
    if let Some(rw) = &analyzer.host_rewrite {
        if rw.from.is_empty() {
            return Err(ConfigError::Invalid("services.analyzer.host_rewrite.from must be non-empty"));
        }
    }
    for (creds, what) in [
        (&cfg.services.tagger, "services.tagger url/login/password must be non-empty"),
        (&cfg.services.publisher, "services.publisher url/login/password must be non-empty"),
    ] {
        if !non_empty(&creds.url) || !non_empty(&creds.login) || !non_empty(&creds.password) {
            return Err(ConfigError::Invalid(what));
        }
    }

    if cfg.publications.is_empty() {
        return Err(ConfigError::Invalid("publications must not be empty"));
    }
    let mut names = HashSet::new();
    for publication in &cfg.publications {
        if !non_empty(&publication.name) {
            return Err(ConfigError::Invalid("publications[].name must be non-empty"));
        }
        if publication.name.contains(['/', '\\', ',']) || publication.name.starts_with('.') {
            return Err(ConfigError::Invalid(
                "publications[].name must not contain '/', '\\' or ',' nor start with '.'",
            ));
        }
        if !names.insert(publication.name.as_str()) {
            return Err(ConfigError::Invalid("publications[].name must be unique"));
        }
        if !non_empty(&publication.sitemap_index) {
            return Err(ConfigError::Invalid("publications[].sitemap_index must be non-empty"));
        }
        if Stage::ALL
            .iter()
            .any(|&stage| publication.schedules.get(stage).interval_seconds == 0)
        {
            return Err(ConfigError::Invalid("publications[].schedules.*.interval_seconds must be > 0"));
        }
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  # database_url: "sqlite://./data/autotagger.db"
  # journal_dir: "./data/fail-safe"
  monthly_cap: 50000
  overseer_interval_seconds: 86400
  discovery_backoff_seconds: 300
  content_url_pattern: "article"
  excluded_segment_marker: "sitemap-section"

services:
  analyzer:
    url: "https://analyzer.example.com/analyze"
    user: "ANALYZER_USER"
    home: "ANALYZER_HOME"
    host_rewrite:
      from: "uat"
      to: "www"
  tagger:
    url: "https://tagger.example.com/asset?id="
    login: "TAGGER_LOGIN"
    password: "TAGGER_PASSWORD"
  publisher:
    url: "https://cms.example.com/webservice/escenic/content/"
    login: "PUBLISHER_LOGIN"
    password: "PUBLISHER_PASSWORD"

publications:
  - name: "bmo"
    sitemap_index: "https://www.bmo.de/sitemaps/sitemap-index.xml"
    schedules:
      discovery:
        interval_seconds: 3600
        enabled: true
      processing:
        interval_seconds: 5
        enabled: true
      retry:
        interval_seconds: 600
        enabled: true
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.publications[0].name, "bmo");
        assert_eq!(cfg.app.overseer_interval_seconds, 86400);
    }

    #[test]
    fn defaults_fill_optional_app_fields() {
        let yaml = example()
            .replace("  overseer_interval_seconds: 86400\n", "")
            .replace("  content_url_pattern: \"article\"\n", "");
        let cfg = parse(&yaml).unwrap();
        assert_eq!(cfg.app.overseer_interval_seconds, 86400);
        assert_eq!(cfg.app.content_url_pattern, "article");
        assert_eq!(
            cfg.app.resolved_journal_dir(),
            Path::new("./data").join("fail-safe")
        );
    }

    #[test]
    fn invalid_monthly_cap() {
        let mut cfg = example_cfg();
        cfg.app.monthly_cap = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("monthly_cap")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_service_credentials() {
        let mut cfg = example_cfg();
        cfg.services.tagger.password = "".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("services.tagger")), _ => panic!("wrong error") }

        let mut cfg = example_cfg();
        cfg.services.analyzer.home = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_publications() {
        let mut cfg = example_cfg();
        cfg.publications[0].name = "a/b".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        let dup = cfg.publications[0].clone();
        cfg.publications.push(dup);
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("unique")), _ => panic!("wrong error") }

        let mut cfg = example_cfg();
        cfg.publications[0].schedules.retry.interval_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.app.content_url_pattern = "(".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn seed_schedules_cover_every_stage() {
        let cfg = example_cfg();
        let seeds = cfg.publications[0].seed_schedules();
        assert_eq!(seeds.len(), 3);
        assert_eq!(seeds[1].stage, Stage::Processing);
        assert_eq!(seeds[1].interval_seconds, 5);
    }

    #[test]
    fn ensure_dirs_creates_data_and_journal_dirs() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
        assert!(data_path.join("fail-safe").exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.publication("bmo").unwrap().schedules.processing.interval_seconds, 5);
    }
}
