//! Engine configuration
//!
//! Settings come from an optional file (format chosen by extension) with
//! environment variables prefixed `MLMAINT_` layered on top. Nested keys use
//! `__`, e.g. `MLMAINT_DATABASE__URL`.

use crate::coordinator::CoordinatorConfig;
use crate::error::{MaintenanceError, MaintenanceResult};
use crate::job::{CollectorConfig, TrainerConfig};
use crate::retry::DEFAULT_BACKOFF_DIVISOR;
use crate::runner::CommandTemplate;
use crate::store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub const ENV_PREFIX: &str = "MLMAINT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub command_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite://maintenance.db".to_string(),
            max_connections: 4,
            command_timeout_secs: 30,
        }
    }
}

impl DatabaseSettings {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            database_url: self.url.clone(),
            max_connections: self.max_connections,
            command_timeout: Duration::from_secs(self.command_timeout_secs),
        }
    }
}

/// Where failure reports go
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Tags: `<Recipients>`, `<Subject>`, `<BodyFile>`, `<Attachment>`
    pub mail_command: Option<CommandTemplate>,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Keys the persisted coordinator status
    pub coordinator_id: Uuid,
    pub instance_name: String,
    pub database: DatabaseSettings,
    /// Scratch space for batch files and working artifacts
    pub work_dir: PathBuf,
    pub minimum_new_records_for_training: u64,
    pub cleanup_enabled: bool,
    pub backoff_significance_divisor: i64,
    pub run_interval_secs: u64,
    pub api_port: u16,
    pub notification: NotificationSettings,
    pub collectors: Vec<CollectorConfig>,
    pub trainers: Vec<TrainerConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            coordinator_id: Uuid::nil(),
            instance_name: "mlmaint".to_string(),
            database: DatabaseSettings::default(),
            work_dir: std::env::temp_dir().join("mlmaint"),
            minimum_new_records_for_training: 100,
            cleanup_enabled: true,
            backoff_significance_divisor: DEFAULT_BACKOFF_DIVISOR,
            run_interval_secs: 3600,
            api_port: 8080,
            notification: NotificationSettings::default(),
            collectors: Vec::new(),
            trainers: Vec::new(),
        }
    }
}

impl Settings {
    /// Load from an optional file plus the environment, then validate
    pub fn load(path: Option<&Path>) -> MaintenanceResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        let settings = settings.normalized();
        settings.validate()?;
        Ok(settings)
    }

    /// Fill descriptions left blank with the model name
    pub fn normalized(mut self) -> Self {
        for c in &mut self.collectors {
            if c.description.trim().is_empty() {
                c.description = format!("{} collector", c.model_name);
            }
        }
        for t in &mut self.trainers {
            if t.description.trim().is_empty() {
                t.description = t.model_name.clone();
            }
        }
        self
    }

    pub fn validate(&self) -> MaintenanceResult<()> {
        if self.coordinator_id.is_nil() {
            return Err(invalid("coordinator_id must be set"));
        }
        if self.backoff_significance_divisor < 1 {
            return Err(invalid("backoff_significance_divisor must be at least 1"));
        }
        if self.run_interval_secs == 0 {
            return Err(invalid("run_interval_secs must be positive"));
        }

        let mut ids = HashSet::new();
        ids.insert(self.coordinator_id);

        for c in &self.collectors {
            if c.id.is_nil() || !ids.insert(c.id) {
                return Err(invalid(format!(
                    "collector '{}' needs a unique, non-nil id",
                    c.description
                )));
            }
            if c.model_name.trim().is_empty() {
                return Err(invalid(format!("collector {} has no model_name", c.id)));
            }
            if c.batch_limit < 1 {
                return Err(invalid(format!("collector {} batch_limit must be positive", c.id)));
            }
            if c.testing_every < 0 {
                return Err(invalid(format!("collector {} testing_every must not be negative", c.id)));
            }
        }

        for t in &self.trainers {
            if t.id.is_nil() || !ids.insert(t.id) {
                return Err(invalid(format!(
                    "trainer '{}' needs a unique, non-nil id",
                    t.description
                )));
            }
            if t.model_name.trim().is_empty() {
                return Err(invalid(format!("trainer {} has no model_name", t.id)));
            }
            if t.max_training_batch < 1 || t.max_testing_batch < 1 {
                return Err(invalid(format!("trainer {} batch caps must be positive", t.id)));
            }
            if !(0.0..=1.0).contains(&t.minimum_score) {
                return Err(invalid(format!("trainer {} minimum_score must be within [0, 1]", t.id)));
            }
            if t.allowable_drop < 0.0 {
                return Err(invalid(format!("trainer {} allowable_drop must not be negative", t.id)));
            }
        }

        Ok(())
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            minimum_new_records_for_training: self.minimum_new_records_for_training,
            cleanup_enabled: self.cleanup_enabled,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        self.database.store_config()
    }
}

fn invalid(message: impl Into<String>) -> MaintenanceError {
    MaintenanceError::Configuration(message.into())
}
