use super::{JsonLinesSource, LifecycleEventSource, RedisListSource};
use crate::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Declarative description of one event source, as it appears in config files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub list_key: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceBuilder {
    kind: Option<String>,
    name: Option<String>,
    redis_url: Option<String>,
    list_key: Option<String>,
    path: Option<PathBuf>,
}

impl SourceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        let mut builder = Self::new().kind(config.kind.clone());
        if let Some(name) = &config.name {
            builder = builder.name(name.clone());
        }
        if let Some(url) = &config.url {
            builder = builder.redis_url(url.clone());
        }
        if let Some(list_key) = &config.list_key {
            builder = builder.list_key(list_key.clone());
        }
        if let Some(path) = &config.path {
            builder = builder.path(path.clone());
        }
        builder
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn list_key(mut self, list_key: impl Into<String>) -> Self {
        self.list_key = Some(list_key.into());
        self
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    fn resolve_kind(&self) -> Result<String> {
        let kind = self
            .kind
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if kind.is_empty() {
            return Err(WardenError::Config(
                "event source kind cannot be empty".to_string(),
            ));
        }

        Ok(kind)
    }

    fn resolve_name(&self, kind: &str) -> String {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| kind.to_string())
    }

    pub fn build(&self) -> Result<Box<dyn LifecycleEventSource>> {
        let kind = self.resolve_kind()?;
        let name = self.resolve_name(&kind);

        match kind.as_str() {
            "redis_list" => {
                let url = self.redis_url.as_deref().unwrap_or_default().trim();
                if url.is_empty() {
                    return Err(WardenError::Config(format!(
                        "source {}: redis url is required for redis_list sources",
                        name
                    )));
                }

                let list_key = self.list_key.as_deref().unwrap_or_default().trim();
                if list_key.is_empty() {
                    return Err(WardenError::Config(format!(
                        "source {}: list_key is required for redis_list sources",
                        name
                    )));
                }

                Ok(Box::new(RedisListSource::new(name, url, list_key)))
            }
            "json_lines" => {
                let path = self.path.clone().ok_or_else(|| {
                    WardenError::Config(format!(
                        "source {}: path is required for json_lines sources",
                        name
                    ))
                })?;

                Ok(Box::new(JsonLinesSource::new(name, path)))
            }
            other => Err(WardenError::Config(format!(
                "unsupported event source kind: {}",
                other
            ))),
        }
    }
}
