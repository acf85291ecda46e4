//! Typed configuration (§A.4): the JSON config of §6 expressed as nested
//! structs with serde defaults, following the reference stack's
//! `config.rs` pattern of per-field `#[serde(default = "fn")]` plus a
//! `toml`-based loader. Built-in rule presets and [`RuntimeOptions`]
//! (§S.3) live here too.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::envfilter::{ContainerEnvRule, EnvFilterConfig};
use crate::error::CaptnError;
use crate::executor::{PostHookPolicy, PreHookPolicy};
use crate::registry::{RegistryClientConfig, RegistryCredentials};
use crate::types::{Condition, DiffKind, LagAxis, Rule};
use crate::verify::VerifyPolicy;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default)]
    pub cron_schedule: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            dry_run: true,
            cron_schedule: None,
        }
    }
}

fn default_delay_between_updates() -> Duration {
    Duration::ZERO
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_delay_between_updates", with = "humantime_serde")]
    pub delay_between_updates: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            delay_between_updates: default_delay_between_updates(),
        }
    }
}

fn default_max_wait() -> Duration {
    Duration::from_secs(60)
}
fn default_stable_time() -> Duration {
    Duration::from_secs(10)
}
fn default_check_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_grace_period() -> Duration {
    Duration::ZERO
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateVerificationConfig {
    #[serde(default = "default_max_wait", with = "humantime_serde")]
    pub max_wait: Duration,
    #[serde(default = "default_stable_time", with = "humantime_serde")]
    pub stable_time: Duration,
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for UpdateVerificationConfig {
    fn default() -> Self {
        UpdateVerificationConfig {
            max_wait: default_max_wait(),
            stable_time: default_stable_time(),
            check_interval: default_check_interval(),
            grace_period: default_grace_period(),
        }
    }
}

impl From<&UpdateVerificationConfig> for VerifyPolicy {
    fn from(c: &UpdateVerificationConfig) -> Self {
        VerifyPolicy {
            stable_time: c.stable_time,
            check_interval: c.check_interval,
            grace_period: c.grace_period,
            max_wait: c.max_wait,
        }
    }
}

fn default_prune_min_backup_age() -> Duration {
    Duration::from_secs(3600)
}
fn default_min_backups_to_keep() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    #[serde(default = "default_true")]
    pub remove_unused_images: bool,
    #[serde(default = "default_true")]
    pub remove_old_containers: bool,
    #[serde(default = "default_prune_min_backup_age", with = "humantime_serde")]
    pub min_backup_age: Duration,
    #[serde(default = "default_min_backups_to_keep")]
    pub min_backups_to_keep: usize,
}

impl Default for PruneConfig {
    fn default() -> Self {
        PruneConfig {
            remove_unused_images: true,
            remove_old_containers: true,
            min_backup_age: default_prune_min_backup_age(),
            min_backups_to_keep: default_min_backups_to_keep(),
        }
    }
}

impl From<&PruneConfig> for crate::prune::PrunePolicy {
    fn from(c: &PruneConfig) -> Self {
        crate::prune::PrunePolicy {
            remove_old_containers: c.remove_old_containers,
            remove_unused_images: c.remove_unused_images,
            min_backup_age: c.min_backup_age,
            min_backups_to_keep: c.min_backups_to_keep,
        }
    }
}

fn default_scripts_directory() -> PathBuf {
    PathBuf::from("/etc/captn/scripts")
}
fn default_hook_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreScriptsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_scripts_directory")]
    pub scripts_directory: PathBuf,
    #[serde(default = "default_hook_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl Default for PreScriptsConfig {
    fn default() -> Self {
        PreScriptsConfig {
            enabled: true,
            scripts_directory: default_scripts_directory(),
            timeout: default_hook_timeout(),
            continue_on_failure: false,
        }
    }
}

impl From<&PreScriptsConfig> for PreHookPolicy {
    fn from(c: &PreScriptsConfig) -> Self {
        PreHookPolicy {
            enabled: c.enabled,
            timeout: c.timeout,
            continue_on_failure: c.continue_on_failure,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostScriptsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_scripts_directory")]
    pub scripts_directory: PathBuf,
    #[serde(default = "default_hook_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
}

impl Default for PostScriptsConfig {
    fn default() -> Self {
        PostScriptsConfig {
            enabled: true,
            scripts_directory: default_scripts_directory(),
            timeout: default_hook_timeout(),
            rollback_on_failure: true,
        }
    }
}

impl From<&PostScriptsConfig> for PostHookPolicy {
    fn from(c: &PostScriptsConfig) -> Self {
        PostHookPolicy {
            enabled: c.enabled,
            timeout: c.timeout,
            rollback_on_failure: c.rollback_on_failure,
        }
    }
}

fn default_helper_image() -> String {
    "docker:cli".to_string()
}

/// Self-update behavior (§4.10): when the Updater's own container is among
/// the ones it manages, the stop/start swap is delegated to a disposable
/// helper container built from `helper_image`, rather than the Updater
/// stopping the container its own process is running in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfUpdateConfig {
    #[serde(default = "default_helper_image")]
    pub helper_image: String,
    #[serde(default = "default_true")]
    pub remove_helper_container: bool,
    /// Explicit override for which running container is the Updater
    /// itself, when `/proc/self/cgroup`-based auto-detection isn't
    /// applicable (e.g. not running containerized, or a cgroup layout the
    /// detector doesn't recognize).
    #[serde(default)]
    pub self_container_name: Option<String>,
}

impl Default for SelfUpdateConfig {
    fn default() -> Self {
        SelfUpdateConfig {
            helper_image: default_helper_image(),
            remove_helper_container: true,
            self_container_name: None,
        }
    }
}

impl From<&SelfUpdateConfig> for crate::executor::SelfUpdateOptions {
    fn from(c: &SelfUpdateConfig) -> Self {
        crate::executor::SelfUpdateOptions {
            helper_image: c.helper_image.clone(),
            remove_helper_container: c.remove_helper_container,
        }
    }
}

fn default_page_crawl_limit() -> u32 {
    10
}
fn default_page_size() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEndpointConfig {
    pub api_url: Option<String>,
    #[serde(default = "default_page_crawl_limit")]
    pub page_crawl_limit: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for RegistryEndpointConfig {
    fn default() -> Self {
        RegistryEndpointConfig {
            api_url: None,
            page_crawl_limit: default_page_crawl_limit(),
            page_size: default_page_size(),
        }
    }
}

impl RegistryEndpointConfig {
    pub fn validate(&self) -> Result<(), CaptnError> {
        if !(1..=1000).contains(&self.page_crawl_limit) {
            return Err(CaptnError::ConfigInvalid(format!(
                "pageCrawlLimit must be in [1, 1000], got {}",
                self.page_crawl_limit
            )));
        }
        if !(1..=100).contains(&self.page_size) {
            return Err(CaptnError::ConfigInvalid(format!(
                "pageSize must be in [1, 100], got {}",
                self.page_size
            )));
        }
        Ok(())
    }
}

impl From<&RegistryEndpointConfig> for RegistryClientConfig {
    fn from(c: &RegistryEndpointConfig) -> Self {
        RegistryClientConfig {
            page_size: c.page_size,
            page_crawl_limit: c.page_crawl_limit,
            retry: Default::default(),
        }
    }
}

/// Credentials file schema (§4.3): per-repository entries take priority
/// over the registry-wide default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsFile {
    #[serde(default)]
    pub default: Option<RegistryCredentials>,
    #[serde(default)]
    pub repositories: BTreeMap<String, RegistryCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    pub credentials_file: Option<PathBuf>,
}

impl Default for RegistryAuthConfig {
    fn default() -> Self {
        RegistryAuthConfig {
            enabled: false,
            credentials_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvFilteringConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub preserve_patterns: Vec<String>,
    #[serde(default)]
    pub container_specific_rules: BTreeMap<String, ContainerEnvRule>,
}

impl From<&EnvFilteringConfig> for EnvFilterConfig {
    fn from(c: &EnvFilteringConfig) -> Self {
        EnvFilterConfig {
            enabled: c.enabled,
            exclude_patterns: c.exclude_patterns.clone(),
            preserve_patterns: c.preserve_patterns.clone(),
            container_specific_rules: c.container_specific_rules.clone(),
        }
    }
}

/// The top-level configuration, covering every section in §6.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptnConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub update_verification: UpdateVerificationConfig,
    #[serde(default)]
    pub prune: PruneConfig,
    #[serde(default)]
    pub pre_scripts: PreScriptsConfig,
    #[serde(default)]
    pub post_scripts: PostScriptsConfig,
    #[serde(default)]
    pub docker: RegistryEndpointConfig,
    #[serde(default)]
    pub ghcr: RegistryEndpointConfig,
    #[serde(default)]
    pub registry_auth: RegistryAuthConfig,
    #[serde(default)]
    pub env_filtering: EnvFilteringConfig,
    #[serde(default)]
    pub self_update: SelfUpdateConfig,
    /// Exact, case-sensitive container name -> rule name.
    #[serde(default)]
    pub assignments_by_name: BTreeMap<String, String>,
    #[serde(default)]
    pub rules: BTreeMap<String, Rule>,
}

impl CaptnConfig {
    pub fn from_str(s: &str) -> Result<Self, CaptnError> {
        toml::from_str(s).map_err(|e| CaptnError::ConfigInvalid(e.to_string()))
    }

    pub fn from_path(path: &Path) -> Result<Self, CaptnError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CaptnError::ConfigInvalid(format!("{}: {e}", path.display())))?;
        Self::from_str(&content)
    }

    pub fn validate(&self) -> Result<(), CaptnError> {
        self.docker.validate()?;
        self.ghcr.validate()?;

        for name in self.assignments_by_name.values() {
            if name != "default" && !self.rules.contains_key(name) && built_in_rules().get(name.as_str()).is_none() {
                return Err(CaptnError::RuleInvalid {
                    name: name.clone(),
                    reason: "no such rule defined".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Resolve the effective rule for `container_name`, given an optional
    /// per-container label override (§4.4 "label override > name-to-rule
    /// assignment > default").
    pub fn resolve_rule(&self, container_name: &str, label_rule: Option<&str>) -> Rule {
        let rule_name = label_rule
            .map(str::to_string)
            .or_else(|| self.assignments_by_name.get(container_name).cloned())
            .unwrap_or_else(|| "default".to_string());

        self.rules
            .get(&rule_name)
            .cloned()
            .or_else(|| built_in_rules().get(rule_name.as_str()).cloned())
            .unwrap_or_default()
    }
}

/// Runtime overrides layered on top of [`CaptnConfig`] (§S.3): CLI flags
/// and an escape hatch for pinning a container to an exact version,
/// bypassing rule evaluation entirely.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    pub dry_run: Option<bool>,
    pub force_run: bool,
    pub name_filters: Vec<String>,
    pub log_level: Option<String>,
    pub clear_logs: bool,
    pub daemon: bool,
    /// Maps a container name to a tag it must be forced onto, skipping
    /// rule evaluation for that one container (§S.3).
    pub force_version: BTreeMap<String, String>,
}

impl RuntimeOptions {
    pub fn effective_dry_run(&self, config: &GeneralConfig) -> bool {
        if self.force_run {
            return false;
        }
        self.dry_run.unwrap_or(config.dry_run)
    }
}

fn rule_with_allow(kinds: &[DiffKind]) -> Rule {
    let mut rule = Rule::default();
    rule.allow = kinds.iter().copied().collect();
    rule
}

/// The built-in presets named in §6: a baseline vocabulary every
/// deployment starts from, independent of any config file.
pub fn built_in_rules() -> BTreeMap<&'static str, Rule> {
    let mut rules = BTreeMap::new();

    rules.insert("default", rule_with_allow(&[DiffKind::Digest, DiffKind::Patch]));

    rules.insert("strict", rule_with_allow(&[DiffKind::Digest]));

    rules.insert("patch_only", rule_with_allow(&[DiffKind::Digest, DiffKind::Patch]));

    rules.insert("digest_only", rule_with_allow(&[DiffKind::Digest]));

    let mut security_only = rule_with_allow(&[DiffKind::Digest, DiffKind::Patch]);
    security_only.conditions.insert(
        DiffKind::Patch,
        Condition {
            require: [DiffKind::Digest].into_iter().collect(),
        },
    );
    rules.insert("security_only", security_only);

    let mut ci_cd = rule_with_allow(&[
        DiffKind::Digest,
        DiffKind::Build,
        DiffKind::Patch,
        DiffKind::Minor,
    ]);
    ci_cd.min_image_age = Duration::ZERO;
    rules.insert("ci_cd", ci_cd);

    let mut conservative = rule_with_allow(&[DiffKind::Digest, DiffKind::Patch]);
    conservative.min_image_age = Duration::from_secs(7 * 24 * 3600);
    rules.insert("conservative", conservative);

    let mut relaxed = rule_with_allow(&[
        DiffKind::Digest,
        DiffKind::Patch,
        DiffKind::Minor,
    ]);
    relaxed.min_image_age = Duration::from_secs(24 * 3600);
    rules.insert("relaxed", relaxed);

    let mut permissive = rule_with_allow(&[
        DiffKind::Digest,
        DiffKind::Build,
        DiffKind::Patch,
        DiffKind::Minor,
        DiffKind::Major,
    ]);
    permissive.progressive_upgrade = true;
    rules.insert("permissive", permissive);

    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_rules_cover_the_named_presets() {
        let rules = built_in_rules();
        for name in [
            "default",
            "strict",
            "patch_only",
            "digest_only",
            "security_only",
            "ci_cd",
            "conservative",
            "relaxed",
            "permissive",
        ] {
            assert!(rules.contains_key(name), "missing preset {name}");
        }
    }

    #[test]
    fn strict_only_allows_digest() {
        let rules = built_in_rules();
        let strict = &rules["strict"];
        assert_eq!(strict.allow.len(), 1);
        assert!(strict.allow.contains(&DiffKind::Digest));
    }

    #[test]
    fn permissive_enables_progressive_upgrade() {
        let rules = built_in_rules();
        assert!(rules["permissive"].progressive_upgrade);
    }

    #[test]
    fn parses_minimal_toml_with_defaults() {
        let config = CaptnConfig::from_str("").unwrap();
        assert!(config.general.dry_run);
        assert_eq!(config.docker.page_size, 100);
        assert_eq!(config.prune.min_backups_to_keep, 1);
    }

    #[test]
    fn validate_rejects_out_of_range_page_size() {
        let mut config = CaptnConfig::default();
        config.docker.page_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolve_rule_prefers_label_over_assignment_over_default() {
        let mut config = CaptnConfig::default();
        config.assignments_by_name.insert("web".to_string(), "strict".to_string());

        let via_assignment = config.resolve_rule("web", None);
        assert_eq!(via_assignment.allow.len(), 1);

        let via_label = config.resolve_rule("web", Some("permissive"));
        assert!(via_label.progressive_upgrade);

        let via_default = config.resolve_rule("other", None);
        assert_eq!(via_default.allow.len(), 2);
    }

    #[test]
    fn runtime_force_run_overrides_config_dry_run() {
        let config = GeneralConfig::default();
        let mut opts = RuntimeOptions::default();
        opts.force_run = true;
        assert!(!opts.effective_dry_run(&config));
    }
}
