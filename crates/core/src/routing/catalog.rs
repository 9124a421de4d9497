use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::tier::{ConfigurationId, TierConfiguration, WorkflowCategory};
use crate::errors::ApprovalError;

/// On-disk shape of a tier configuration file (`.toml` or `.json`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigurationFile {
    #[serde(default)]
    pub configurations: Vec<TierConfiguration>,
}

#[derive(Debug, Error)]
pub enum CatalogFileError {
    #[error("could not read tier configuration file `{path}`: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("could not parse tier configuration file `{path}`: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("unsupported tier configuration file extension for `{0}` (expected .toml or .json)")]
    UnsupportedFormat(PathBuf),
    #[error("{path}: {source}")]
    Invalid { path: PathBuf, source: ApprovalError },
}

impl ConfigurationFile {
    /// Parses and validates every configuration in the file. Unknown trigger types fail at
    /// parse time; operator/value shape mismatches fail validation.
    pub fn load(path: &Path) -> Result<Self, CatalogFileError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| CatalogFileError::Read { path: path.to_path_buf(), source })?;
        let parse_error =
            |message: String| CatalogFileError::Parse { path: path.to_path_buf(), message };

        let file = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => {
                toml::from_str::<Self>(&raw).map_err(|err| parse_error(err.to_string()))?
            }
            Some("json") => {
                serde_json::from_str::<Self>(&raw).map_err(|err| parse_error(err.to_string()))?
            }
            _ => return Err(CatalogFileError::UnsupportedFormat(path.to_path_buf())),
        };

        for config in &file.configurations {
            config
                .validate()
                .map_err(|source| CatalogFileError::Invalid { path: path.to_path_buf(), source })?;
        }
        Ok(file)
    }

    /// Loads every `.toml`/`.json` file in `dir`, in file-name order.
    pub fn load_dir(dir: &Path) -> Result<Vec<TierConfiguration>, CatalogFileError> {
        let entries = fs::read_dir(dir)
            .map_err(|source| CatalogFileError::Read { path: dir.to_path_buf(), source })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|source| CatalogFileError::Read { path: dir.to_path_buf(), source })?;
            let path = entry.path();
            let supported = matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("toml") | Some("json")
            );
            if path.is_file() && supported {
                paths.push(path);
            }
        }
        paths.sort();

        let mut configurations = Vec::new();
        for path in paths {
            configurations.extend(Self::load(&path)?.configurations);
        }
        Ok(configurations)
    }
}

/// Result of [`ConfigurationCatalog::revise`]: the superseded version (now inactive) and
/// the new one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Revision {
    pub previous: TierConfiguration,
    pub current: TierConfiguration,
}

/// Versioned tier configurations. A version referenced by any workflow instance is frozen.
#[derive(Clone, Debug, Default)]
pub struct ConfigurationCatalog {
    versions: BTreeMap<ConfigurationId, BTreeMap<u32, TierConfiguration>>,
    referenced: HashSet<(ConfigurationId, u32)>,
}

impl ConfigurationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, config: TierConfiguration) -> Result<(), ApprovalError> {
        config.validate()?;
        if self.get(&config.id, config.version).is_some() {
            return Err(ApprovalError::InvalidConfiguration {
                configuration_id: config.id.clone(),
                reason: format!("version {} is already registered", config.version),
            });
        }
        self.ensure_single_default(&config)?;

        tracing::debug!(
            event_name = "catalog.configuration_registered",
            configuration_id = %config.id,
            version = config.version,
            category = %config.category,
            "tier configuration registered"
        );
        self.versions.entry(config.id.clone()).or_default().insert(config.version, config);
        Ok(())
    }

    /// Edits a version in place. Only allowed while no instance references it.
    pub fn amend(&mut self, config: TierConfiguration) -> Result<(), ApprovalError> {
        if self.get(&config.id, config.version).is_none() {
            return Err(ApprovalError::ConfigurationNotFound(format!(
                "{}@{}",
                config.id, config.version
            )));
        }
        if self.is_referenced(&config.id, config.version) {
            return Err(ApprovalError::ConfigurationVersionMismatch {
                configuration_id: config.id.clone(),
                version: config.version,
            });
        }
        config.validate()?;
        self.ensure_single_default(&config)?;

        self.versions.entry(config.id.clone()).or_default().insert(config.version, config);
        Ok(())
    }

    /// Publishes `draft` as the next version of its configuration. The previous latest
    /// version is deactivated and hands its default flag to the new one.
    pub fn revise(&mut self, mut draft: TierConfiguration) -> Result<Revision, ApprovalError> {
        let mut previous = self
            .latest(&draft.id)
            .cloned()
            .ok_or_else(|| ApprovalError::ConfigurationNotFound(draft.id.to_string()))?;
        if previous.category != draft.category {
            return Err(ApprovalError::InvalidConfiguration {
                configuration_id: draft.id.clone(),
                reason: format!(
                    "a revision cannot move the configuration from `{}` to `{}`",
                    previous.category, draft.category
                ),
            });
        }

        draft.version = previous.version + 1;
        draft.is_default = previous.is_default;
        draft.is_active = true;
        draft.validate()?;

        previous.is_active = false;
        let versions = self.versions.entry(draft.id.clone()).or_default();
        versions.insert(previous.version, previous.clone());
        versions.insert(draft.version, draft.clone());

        tracing::info!(
            event_name = "catalog.configuration_revised",
            configuration_id = %draft.id,
            from_version = previous.version,
            to_version = draft.version,
            "tier configuration revised"
        );
        Ok(Revision { previous, current: draft })
    }

    pub fn mark_referenced(&mut self, id: &ConfigurationId, version: u32) {
        self.referenced.insert((id.clone(), version));
    }

    pub fn is_referenced(&self, id: &ConfigurationId, version: u32) -> bool {
        self.referenced.contains(&(id.clone(), version))
    }

    pub fn get(&self, id: &ConfigurationId, version: u32) -> Option<&TierConfiguration> {
        self.versions.get(id).and_then(|versions| versions.get(&version))
    }

    pub fn latest(&self, id: &ConfigurationId) -> Option<&TierConfiguration> {
        self.versions.get(id).and_then(|versions| versions.values().next_back())
    }

    pub fn default_for(&self, category: WorkflowCategory) -> Option<&TierConfiguration> {
        self.iter().find(|config| {
            config.category == category && config.is_default && config.is_active
        })
    }

    /// Configuration a new request is routed with: the named one if given (its latest active
    /// version), otherwise the category default.
    pub fn select(
        &self,
        category: WorkflowCategory,
        explicit: Option<&ConfigurationId>,
    ) -> Result<&TierConfiguration, ApprovalError> {
        match explicit {
            Some(id) => {
                let config = self
                    .versions
                    .get(id)
                    .and_then(|versions| versions.values().rev().find(|config| config.is_active))
                    .ok_or_else(|| ApprovalError::ConfigurationNotFound(id.to_string()))?;
                if config.category != category {
                    return Err(ApprovalError::InvalidConfiguration {
                        configuration_id: id.clone(),
                        reason: format!(
                            "configuration covers `{}` requests, not `{category}`",
                            config.category
                        ),
                    });
                }
                Ok(config)
            }
            None => self.default_for(category).ok_or_else(|| {
                ApprovalError::ConfigurationNotFound(format!("default for `{category}`"))
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TierConfiguration> {
        self.versions.values().flat_map(|versions| versions.values())
    }

    pub fn len(&self) -> usize {
        self.versions.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_single_default(&self, candidate: &TierConfiguration) -> Result<(), ApprovalError> {
        if !(candidate.is_default && candidate.is_active) {
            return Ok(());
        }
        let clash = self.iter().find(|existing| {
            existing.category == candidate.category
                && existing.is_default
                && existing.is_active
                && !(existing.id == candidate.id && existing.version == candidate.version)
        });
        match clash {
            Some(existing) => Err(ApprovalError::InvalidConfiguration {
                configuration_id: candidate.id.clone(),
                reason: format!(
                    "`{}` version {} is already the active default for `{}`",
                    existing.id, existing.version, candidate.category
                ),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::Utc;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    use super::{CatalogFileError, ConfigurationCatalog, ConfigurationFile};
    use crate::domain::tier::{
        ApprovalTier, ApproverLimit, ApproverType, ConfigurationId, ThresholdLogic,
        ThresholdOperator, ThresholdValue, TierApprover, TierConfiguration, TierInclusion,
        TierThreshold, TriggerType, WorkflowCategory,
    };
    use crate::errors::ApprovalError;

    fn config(id: &str, category: WorkflowCategory, is_default: bool) -> TierConfiguration {
        TierConfiguration {
            id: ConfigurationId(id.to_string()),
            name: id.to_string(),
            category,
            version: 1,
            tiers: vec![ApprovalTier {
                level: 1,
                name: "Manager".to_string(),
                category: None,
                thresholds: vec![TierThreshold {
                    trigger_type: TriggerType::Amount,
                    operator: ThresholdOperator::GreaterThan,
                    value: ThresholdValue::Number(Decimal::ZERO),
                }],
                approvers: vec![TierApprover {
                    approver_type: ApproverType::Manager,
                    approver_id: None,
                    order: 0,
                    is_required: true,
                }],
                require_all_approvers: false,
                sequential: false,
                auto_escalate_hours: None,
                auto_approve_on_timeout: false,
                escalation: None,
                reminder_interval_hours: None,
                approver_limits: ApproverLimit::default(),
                is_active: true,
            }],
            is_default,
            is_active: true,
            threshold_logic: ThresholdLogic::Any,
            tier_inclusion: TierInclusion::Cumulative,
            created_by: Some("admin".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn only_one_active_default_per_category() {
        let mut catalog = ConfigurationCatalog::new();
        catalog.register(config("purchase-a", WorkflowCategory::Purchase, true)).expect("first");
        catalog.register(config("permit-a", WorkflowCategory::Permit, true)).expect("other");

        let error = catalog
            .register(config("purchase-b", WorkflowCategory::Purchase, true))
            .expect_err("second default rejected");

        assert!(matches!(error, ApprovalError::InvalidConfiguration { .. }));
        assert!(catalog.register(config("purchase-b", WorkflowCategory::Purchase, false)).is_ok());
    }

    #[test]
    fn referenced_version_cannot_be_amended() {
        let mut catalog = ConfigurationCatalog::new();
        let original = config("purchase-a", WorkflowCategory::Purchase, true);
        catalog.register(original.clone()).expect("register");

        let mut edited = original.clone();
        edited.name = "edited before use".to_string();
        catalog.amend(edited).expect("unreferenced edit is allowed");

        catalog.mark_referenced(&original.id, 1);
        let mut late_edit = original.clone();
        late_edit.name = "edited after use".to_string();
        let error = catalog.amend(late_edit).expect_err("referenced version is frozen");

        assert_eq!(
            error,
            ApprovalError::ConfigurationVersionMismatch {
                configuration_id: original.id.clone(),
                version: 1,
            }
        );
        assert_eq!(
            catalog.get(&original.id, 1).map(|config| config.name.as_str()),
            Some("edited before use")
        );
    }

    #[test]
    fn revise_creates_next_version_and_moves_default() {
        let mut catalog = ConfigurationCatalog::new();
        let original = config("purchase-a", WorkflowCategory::Purchase, true);
        catalog.register(original.clone()).expect("register");
        catalog.mark_referenced(&original.id, 1);

        let mut draft = original.clone();
        draft.is_default = false;
        draft.name = "raised limits".to_string();
        let revision = catalog.revise(draft).expect("revise");

        assert_eq!(revision.current.version, 2);
        assert!(revision.current.is_default);
        assert!(!revision.previous.is_active);
        assert_eq!(
            catalog.default_for(WorkflowCategory::Purchase).map(|config| config.version),
            Some(2)
        );
        assert_eq!(
            catalog.get(&original.id, 1).map(|config| config.name.as_str()),
            Some("purchase-a")
        );
    }

    #[test]
    fn select_prefers_explicit_configuration_and_checks_category() {
        let mut catalog = ConfigurationCatalog::new();
        catalog.register(config("purchase-a", WorkflowCategory::Purchase, true)).expect("a");
        catalog.register(config("purchase-b", WorkflowCategory::Purchase, false)).expect("b");

        let explicit = ConfigurationId("purchase-b".to_string());
        let chosen = catalog.select(WorkflowCategory::Purchase, Some(&explicit)).expect("b");
        assert_eq!(chosen.id, explicit);

        let fallback = catalog.select(WorkflowCategory::Purchase, None).expect("default");
        assert_eq!(fallback.id.0, "purchase-a");

        assert!(matches!(
            catalog.select(WorkflowCategory::TimeOff, None),
            Err(ApprovalError::ConfigurationNotFound(_))
        ));
        assert!(matches!(
            catalog.select(WorkflowCategory::Permit, Some(&explicit)),
            Err(ApprovalError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn toml_file_with_unknown_trigger_type_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("purchase.toml");
        fs::write(
            &path,
            r#"
[[configurations]]
id = "purchase-default"
name = "Purchase"
category = "purchase"

[[configurations.tiers]]
level = 1
name = "Manager"
approvers = [{ approver_type = "manager" }]
thresholds = [{ trigger_type = "colour", operator = "equals", value = { kind = "text", value = "red" } }]
"#,
        )
        .expect("write file");

        let error = ConfigurationFile::load(&path).expect_err("unknown trigger");
        assert!(matches!(error, CatalogFileError::Parse { .. }));
    }

    #[test]
    fn json_file_with_shape_mismatch_fails_validation() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("purchase.json");
        fs::write(
            &path,
            r#"{"configurations": [{
                "id": "purchase-default",
                "name": "Purchase",
                "category": "purchase",
                "tiers": [{
                    "level": 1,
                    "name": "Manager",
                    "approvers": [{"approver_type": "manager"}],
                    "thresholds": [{
                        "trigger_type": "amount",
                        "operator": "between",
                        "value": {"kind": "text", "value": "lots"}
                    }]
                }]
            }]}"#,
        )
        .expect("write file");

        let error = ConfigurationFile::load(&path).expect_err("shape mismatch");
        assert!(matches!(
            error,
            CatalogFileError::Invalid { source: ApprovalError::InvalidConfiguration { .. }, .. }
        ));
    }

    #[test]
    fn directory_load_reads_toml_files() {
        let dir = TempDir::new().expect("tempdir");
        fs::write(
            dir.path().join("time_off.toml"),
            r#"
[[configurations]]
id = "time-off-default"
name = "Time off"
category = "time_off"
is_default = true

[[configurations.tiers]]
level = 1
name = "Manager"
approvers = [{ approver_type = "manager" }]
thresholds = [{ trigger_type = "duration_days", operator = "greater_than", value = { kind = "number", value = 2 } }]
"#,
        )
        .expect("write file");
        fs::write(dir.path().join("notes.txt"), "ignored").expect("write notes");

        let configurations = ConfigurationFile::load_dir(dir.path()).expect("load dir");

        assert_eq!(configurations.len(), 1);
        assert_eq!(configurations[0].category, WorkflowCategory::TimeOff);
        assert_eq!(configurations[0].version, 1);
    }
}
