use std::{cmp::Ordering, fmt, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::{
    error::{ProvisionError, Result},
    prompt::Prompter,
    utils,
};

static NGINX_RELEASE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"nginx-(\d+\.\d+\.\d+)\.tar\.gz").expect("valid nginx regex"));

static APT_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:\d+:)?(\d+(?:\.\d+)*)").expect("valid apt version regex"));

/// ПО, для которого подбирается версия
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Software {
    Java,
    Node,
    PostgreSql,
    Redis,
    RabbitMq,
    Nginx,
    Docker,
}

impl Software {
    pub const ALL: [Software; 7] = [
        Software::Java,
        Software::Node,
        Software::PostgreSql,
        Software::Redis,
        Software::RabbitMq,
        Software::Nginx,
        Software::Docker,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Software::Java => "java",
            Software::Node => "node",
            Software::PostgreSql => "postgresql",
            Software::Redis => "redis",
            Software::RabbitMq => "rabbitmq",
            Software::Nginx => "nginx",
            Software::Docker => "docker",
        }
    }

    /// Встроенный список на случай недоступности остальных источников
    pub fn fallback_versions(self) -> &'static [&'static str] {
        match self {
            Software::Java => &["21", "17", "11"],
            Software::Node => &["22", "20", "18"],
            Software::PostgreSql => &["17", "16", "15", "14"],
            Software::Redis => &["7.4", "7.2", "6.2"],
            Software::RabbitMq => &["4.0", "3.13", "3.12"],
            Software::Nginx => &["1.27", "1.26"],
            Software::Docker => &["27.3", "26.1"],
        }
    }
}

impl fmt::Display for Software {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Software {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "java" | "jdk" | "openjdk" => Ok(Software::Java),
            "node" | "nodejs" => Ok(Software::Node),
            "postgresql" | "postgres" | "pg" => Ok(Software::PostgreSql),
            "redis" => Ok(Software::Redis),
            "rabbitmq" => Ok(Software::RabbitMq),
            "nginx" => Ok(Software::Nginx),
            "docker" => Ok(Software::Docker),
            _ => Err(ProvisionError::UnknownSoftware(s.to_string())),
        }
    }
}

/// Какой уровень источников дал результат
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTier {
    Upstream,
    PackageIndex,
    Builtin,
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceTier::Upstream => f.write_str("upstream"),
            SourceTier::PackageIndex => f.write_str("package-index"),
            SourceTier::Builtin => f.write_str("builtin"),
        }
    }
}

/// Список доступных версий; всегда непустой, отсортирован по убыванию
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCatalog {
    pub software: Software,
    pub versions: Vec<String>,
    pub source: SourceTier,
}

impl VersionCatalog {
    pub fn is_stale(&self) -> bool {
        self.source == SourceTier::Builtin
    }

    pub fn latest(&self) -> &str {
        &self.versions[0]
    }
}

/// Точное совпадение с одним из вариантов каталога
pub fn validate(version: &str, catalog: &VersionCatalog) -> bool {
    catalog.versions.iter().any(|v| v == version)
}

/// Сравнение версий с учетом чисел: "10" > "9", "1.10" > "1.9"
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |s: &str| -> Vec<String> {
        s.split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    };
    let (pa, pb) = (split(a), split(b));

    for (x, y) in pa.iter().zip(pb.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    pa.len().cmp(&pb.len()).then_with(|| a.cmp(b))
}

/// Удаляет дубликаты и сортирует по убыванию версии
pub fn normalize(versions: Vec<String>) -> Vec<String> {
    let mut versions: Vec<String> = versions
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    versions.sort_by(|a, b| compare_versions(b, a));
    versions.dedup();
    versions
}

/// Источник списка версий
#[async_trait]
pub trait VersionSource: Send + Sync {
    fn tier(&self) -> SourceTier;
    async fn fetch(&self, software: Software) -> anyhow::Result<Vec<String>>;
}

/// Официальные HTTP источники
pub struct UpstreamSource {
    client: reqwest::Client,
}

impl UpstreamSource {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vps_provision/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Не удалось создать HTTP клиент")?;
        Ok(Self { client })
    }

    async fn get_json(&self, url: &str) -> anyhow::Result<Value> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Запрос {} не выполнен", url))?
            .error_for_status()?;
        Ok(response.json::<Value>().await?)
    }

    async fn get_text(&self, url: &str) -> anyhow::Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Запрос {} не выполнен", url))?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl VersionSource for UpstreamSource {
    fn tier(&self) -> SourceTier {
        SourceTier::Upstream
    }

    async fn fetch(&self, software: Software) -> anyhow::Result<Vec<String>> {
        match software {
            Software::Java => Ok(parse_adoptium(
                &self
                    .get_json("https://api.adoptium.net/v3/info/available_releases")
                    .await?,
            )),
            Software::Node => Ok(parse_node_index(
                &self.get_json("https://nodejs.org/dist/index.json").await?,
            )),
            Software::PostgreSql => Ok(parse_postgres_versions(
                &self
                    .get_json("https://www.postgresql.org/versions.json")
                    .await?,
            )),
            Software::Redis => Ok(parse_github_releases(
                &self
                    .get_json("https://api.github.com/repos/redis/redis/releases?per_page=30")
                    .await?,
                2,
            )),
            Software::RabbitMq => Ok(parse_github_releases(
                &self
                    .get_json(
                        "https://api.github.com/repos/rabbitmq/rabbitmq-server/releases?per_page=30",
                    )
                    .await?,
                2,
            )),
            Software::Docker => Ok(parse_github_releases(
                &self
                    .get_json("https://api.github.com/repos/moby/moby/releases?per_page=30")
                    .await?,
                2,
            )),
            Software::Nginx => Ok(parse_nginx_download_page(
                &self.get_text("https://nginx.org/en/download.html").await?,
            )),
        }
    }
}

/// Локальный индекс пакетов apt
pub struct AptIndexSource {
    apt_cache: PathBuf,
}

impl AptIndexSource {
    pub fn new(apt_cache: impl Into<PathBuf>) -> Self {
        Self {
            apt_cache: apt_cache.into(),
        }
    }
}

impl Default for AptIndexSource {
    fn default() -> Self {
        Self::new("/usr/bin/apt-cache")
    }
}

#[async_trait]
impl VersionSource for AptIndexSource {
    fn tier(&self) -> SourceTier {
        SourceTier::PackageIndex
    }

    async fn fetch(&self, software: Software) -> anyhow::Result<Vec<String>> {
        let (args, major_only): (Vec<&str>, Option<&str>) = match software {
            Software::Java => (
                vec!["search", "--names-only", "^openjdk-[0-9]+-jdk$"],
                Some("openjdk-"),
            ),
            Software::PostgreSql => (
                vec!["search", "--names-only", "^postgresql-[0-9]+$"],
                Some("postgresql-"),
            ),
            Software::Node => (vec!["madison", "nodejs"], None),
            Software::Redis => (vec!["madison", "redis-server"], None),
            Software::RabbitMq => (vec!["madison", "rabbitmq-server"], None),
            Software::Nginx => (vec!["madison", "nginx"], None),
            Software::Docker => (vec!["madison", "docker-ce", "docker.io"], None),
        };

        let output = utils::run_command(&self.apt_cache, &args)
            .await
            .map_err(|e| anyhow!(e))?;
        if !output.success {
            return Err(anyhow!("apt-cache: {}", output.stderr.trim()));
        }

        Ok(match major_only {
            Some(prefix) => parse_apt_search(&output.stdout, prefix),
            None => parse_apt_madison(&output.stdout, software),
        })
    }
}

/// Разрешение версий по уровням источников с запасным встроенным списком
pub struct VersionResolver {
    sources: Vec<Box<dyn VersionSource>>,
    timeout: Duration,
}

impl VersionResolver {
    pub fn new(sources: Vec<Box<dyn VersionSource>>, timeout: Duration) -> Self {
        Self { sources, timeout }
    }

    /// Стандартная цепочка: upstream -> apt -> встроенный список
    pub fn standard(timeout: Duration) -> Self {
        let mut sources: Vec<Box<dyn VersionSource>> = Vec::new();
        match UpstreamSource::new(timeout) {
            Ok(upstream) => sources.push(Box::new(upstream)),
            Err(e) => warn!("HTTP источник версий недоступен: {:#}", e),
        }
        sources.push(Box::new(AptIndexSource::default()));
        Self::new(sources, timeout)
    }

    /// Никогда не завершается ошибкой: последний уровень всегда непустой
    pub async fn resolve(&self, software: Software) -> VersionCatalog {
        for source in &self.sources {
            let tier = source.tier();
            let fetched = match tokio::time::timeout(self.timeout, source.fetch(software)).await {
                Ok(Ok(versions)) => versions,
                Ok(Err(e)) => {
                    debug!("Источник {} для {} недоступен: {:#}", tier, software, e);
                    Vec::new()
                }
                Err(_) => {
                    debug!("Источник {} для {}: превышено время ожидания", tier, software);
                    Vec::new()
                }
            };

            let versions = normalize(fetched);
            if !versions.is_empty() {
                info!(
                    "Версии {} получены из источника {}: {}",
                    software,
                    tier,
                    versions.join(", ")
                );
                return VersionCatalog {
                    software,
                    versions,
                    source: tier,
                };
            }
        }

        warn!(
            "Не удалось получить актуальные версии {}, используется встроенный список",
            software
        );
        VersionCatalog {
            software,
            versions: normalize(
                software
                    .fallback_versions()
                    .iter()
                    .map(|v| v.to_string())
                    .collect(),
            ),
            source: SourceTier::Builtin,
        }
    }
}

/// Запрашивает версию, пока не будет выбрана допустимая; пустой ввод - отмена
pub fn choose_version(catalog: &VersionCatalog, prompter: &dyn Prompter) -> Result<String> {
    loop {
        let answer = prompter.input(&format!(
            "Версия {} [{}] (пусто - отмена)",
            catalog.software,
            catalog.versions.join(", ")
        ))?;
        let answer = answer.trim();

        if answer.is_empty() {
            return Err(ProvisionError::Cancelled);
        }
        if validate(answer, catalog) {
            return Ok(answer.to_string());
        }

        warn!(
            "{}",
            ProvisionError::InvalidVersion {
                software: catalog.software.to_string(),
                version: answer.to_string(),
            }
        );
    }
}

fn parse_adoptium(payload: &Value) -> Vec<String> {
    payload["available_lts_releases"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_u64())
        .map(|v| v.to_string())
        .collect()
}

/// Мажорные версии LTS веток Node.js
fn parse_node_index(payload: &Value) -> Vec<String> {
    payload
        .as_array()
        .into_iter()
        .flatten()
        .filter(|release| release["lts"].is_string())
        .filter_map(|release| release["version"].as_str())
        .filter_map(|v| v.trim_start_matches('v').split('.').next())
        .map(str::to_string)
        .collect()
}

fn parse_postgres_versions(payload: &Value) -> Vec<String> {
    payload
        .as_array()
        .into_iter()
        .flatten()
        .filter(|v| v["supported"].as_bool().unwrap_or(false))
        .filter_map(|v| match &v["major"] {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect()
}

/// Теги стабильных релизов GitHub, усеченные до `components` частей
fn parse_github_releases(payload: &Value, components: usize) -> Vec<String> {
    payload
        .as_array()
        .into_iter()
        .flatten()
        .filter(|r| !r["prerelease"].as_bool().unwrap_or(false))
        .filter(|r| !r["draft"].as_bool().unwrap_or(false))
        .filter_map(|r| r["tag_name"].as_str())
        .map(|tag| tag.trim_start_matches('v'))
        .filter(|tag| tag.split('.').all(|p| p.parse::<u64>().is_ok()))
        .map(|tag| truncate_version(tag, components))
        .collect()
}

fn parse_nginx_download_page(html: &str) -> Vec<String> {
    NGINX_RELEASE_RE
        .captures_iter(html)
        .map(|c| truncate_version(&c[1], 2))
        .collect()
}

/// Вывод `apt-cache search`: "openjdk-17-jdk - OpenJDK ..." -> "17"
fn parse_apt_search(stdout: &str, prefix: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|pkg| pkg.strip_prefix(prefix))
        .filter_map(|rest| rest.split('-').next())
        .filter(|major| !major.is_empty() && major.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

/// Вывод `apt-cache madison`: "nginx | 1.24.0-2ubuntu7 | http://... Packages"
fn parse_apt_madison(stdout: &str, software: Software) -> Vec<String> {
    let components = match software {
        Software::Node => 1,
        _ => 2,
    };
    stdout
        .lines()
        .filter_map(|line| line.split('|').nth(1))
        .filter_map(|raw| APT_VERSION_RE.captures(raw.trim()))
        .map(|c| truncate_version(&c[1], components))
        .collect()
}

fn truncate_version(version: &str, components: usize) -> String {
    version
        .split('.')
        .take(components)
        .collect::<Vec<_>>()
        .join(".")
}
