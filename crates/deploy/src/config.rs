//! Deployment manifest (`Stackdrop.toml`).
//!
//! Loaded with figment so any key can be overridden from the environment,
//! e.g. `STACKDROP_GATEWAY_URL` or `STACKDROP_TIMING__STACK_MAX_ATTEMPTS`.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    AssetTarget, DeployTarget, OutputsStore, PipelineSettings, Poller,
    credentials::DEFAULT_CREDENTIAL_DURATION_SECS,
    types::{StackDescriptor, TemplateSource},
};

/// The default name of the deployment manifest.
pub const CONFIG_FILENAME: &str = "Stackdrop.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "STACKDROP_";

/// Selector matching every unit of the manifest.
pub const ALL_UNITS: &str = "all";

/// Template parameter carrying the stage, added unless a unit sets it.
pub const STAGE_PARAMETER: &str = "Stage";

/// Timing of every wait loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub stack_poll_interval_secs: u64,
    pub stack_max_attempts: u32,
    pub invalidation_poll_interval_secs: u64,
    pub invalidation_max_attempts: u32,
    pub credential_duration_secs: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            stack_poll_interval_secs: 10,
            stack_max_attempts: 120,
            invalidation_poll_interval_secs: 5,
            invalidation_max_attempts: 60,
            credential_duration_secs: DEFAULT_CREDENTIAL_DURATION_SECS,
        }
    }
}

/// A deployable unit, independent of stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitConfig {
    pub name: String,
    pub template: TemplateSource,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<AssetTarget>,
}

/// Root of the deployment manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Base URL of the control-plane gateway.
    pub gateway_url: Url,
    /// Directory holding one outputs file per unit.
    #[serde(default = "default_outputs_dir")]
    pub outputs_dir: PathBuf,
    /// Targets deployed at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub units: Vec<UnitConfig>,

    /// Directory relative paths are resolved against. Set on load.
    #[serde(skip)]
    pub root: PathBuf,
}

fn default_outputs_dir() -> PathBuf {
    PathBuf::from(".stackdrop")
}

fn default_concurrency() -> usize {
    1
}

impl DeployConfig {
    /// Load the manifest at `path` (or `path/Stackdrop.toml` for a
    /// directory) and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Configuration file or directory not found: {}", path.display());
        }

        let config_path = if path.is_dir() {
            path.join(CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        let figment = Figment::new()
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        let mut config = Self::from_figment(figment)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

        config.root = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        tracing::info!(
            path = %config_path.display(),
            units = config.units.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Extract and validate a manifest from any figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Save the manifest to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// A manifest with one static site and one backend-only unit.
    pub fn starter() -> Result<Self> {
        let mut site_parameters = BTreeMap::new();
        site_parameters.insert("DomainName".to_string(), "example.com".to_string());

        Ok(Self {
            gateway_url: Url::parse("http://localhost:8080/rpc")?,
            outputs_dir: default_outputs_dir(),
            concurrency: default_concurrency(),
            timing: TimingConfig::default(),
            units: vec![
                UnitConfig {
                    name: "site".to_string(),
                    template: TemplateSource::File("infra/site.yaml".into()),
                    parameters: site_parameters,
                    capabilities: BTreeSet::from(["CAPABILITY_NAMED_IAM".to_string()]),
                    execution_role: None,
                    assets: Some(AssetTarget::new("dist")),
                },
                UnitConfig {
                    name: "api".to_string(),
                    template: TemplateSource::File("infra/api.yaml".into()),
                    parameters: BTreeMap::new(),
                    capabilities: BTreeSet::from(["CAPABILITY_IAM".to_string()]),
                    execution_role: None,
                    assets: None,
                },
            ],
            root: PathBuf::new(),
        })
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for unit in &self.units {
            if !is_valid_name(&unit.name) {
                anyhow::bail!(
                    "Invalid unit name `{}`: use letters, digits and dashes",
                    unit.name
                );
            }
            if unit.name == ALL_UNITS {
                anyhow::bail!("`{ALL_UNITS}` is reserved and can not name a unit");
            }
            if !seen.insert(unit.name.as_str()) {
                anyhow::bail!("Unit `{}` is declared twice", unit.name);
            }
        }
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        if self.timing.stack_max_attempts == 0 {
            anyhow::bail!("timing.stack_max_attempts must be at least 1");
        }
        if self.timing.invalidation_max_attempts == 0 {
            anyhow::bail!("timing.invalidation_max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Pipeline knobs for a run against `stage`.
    pub fn settings(&self, stage: &str) -> PipelineSettings {
        PipelineSettings {
            stage: stage.to_string(),
            concurrency: self.concurrency,
            stack_poller: Poller::new(
                Duration::from_secs(self.timing.stack_poll_interval_secs),
                self.timing.stack_max_attempts,
            ),
            invalidation_poller: Poller::new(
                Duration::from_secs(self.timing.invalidation_poll_interval_secs),
                self.timing.invalidation_max_attempts,
            ),
            credential_duration_secs: self.timing.credential_duration_secs,
        }
    }

    pub fn unit(&self, name: &str) -> Option<&UnitConfig> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Units matching `selector`: one unit name, or `all` in manifest order.
    pub fn select(&self, selector: &str) -> Result<Vec<&UnitConfig>> {
        if selector == ALL_UNITS {
            return Ok(self.units.iter().collect());
        }

        match self.unit(selector) {
            Some(unit) => Ok(vec![unit]),
            None => {
                let known: Vec<&str> = self.units.iter().map(|u| u.name.as_str()).collect();
                anyhow::bail!(
                    "Unknown target `{selector}`, expected one of: {}, {ALL_UNITS}",
                    known.join(", ")
                )
            }
        }
    }

    /// Resolve the units matching `selector` into targets for `stage`.
    pub fn targets(&self, selector: &str, stage: &str) -> Result<Vec<DeployTarget>> {
        if !is_valid_name(stage) {
            anyhow::bail!("Invalid stage `{stage}`: use letters, digits and dashes");
        }
        Ok(self
            .select(selector)?
            .into_iter()
            .map(|unit| self.target(unit, stage))
            .collect())
    }

    /// Persisted outputs of `unit`.
    pub fn outputs_store(&self, unit: &str) -> OutputsStore {
        OutputsStore::new(
            self.resolve(&self.outputs_dir)
                .join(format!("{unit}.outputs.json")),
        )
    }

    /// Stack name of `unit` in `stage`.
    pub fn stack_name(unit: &str, stage: &str) -> String {
        format!("{unit}-{stage}")
    }

    fn target(&self, unit: &UnitConfig, stage: &str) -> DeployTarget {
        let template = match &unit.template {
            TemplateSource::File(path) => TemplateSource::File(self.resolve(path)),
            url @ TemplateSource::Url(_) => url.clone(),
        };

        let mut stack = StackDescriptor::new(Self::stack_name(&unit.name, stage), template);
        stack.parameters = unit.parameters.clone();
        stack
            .parameters
            .entry(STAGE_PARAMETER.to_string())
            .or_insert_with(|| stage.to_string());
        stack.capabilities = unit.capabilities.clone();
        stack.execution_role = unit.execution_role.clone();

        let assets = unit.assets.clone().map(|mut assets| {
            assets.build_dir = self.resolve(&assets.build_dir);
            assets
        });

        DeployTarget {
            name: unit.name.clone(),
            stack,
            outputs: self.outputs_store(&unit.name),
            assets,
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
