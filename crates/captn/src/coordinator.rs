//! Run Coordinator (C11): discover targets, dispatch executors, aggregate
//! results. See SPEC_FULL.md §4.11.
//!
//! Single-threaded with respect to container mutations — only one
//! [`crate::executor::execute_plan`] call is in flight at a time. Registry
//! discovery for distinct image references is fanned out over a bounded
//! pool of plain OS threads (the reference stack never reaches for a
//! thread-pool crate; `webhook.rs`'s fire-and-forget `std::thread::spawn`
//! is the closest precedent, though here the threads are joined rather
//! than detached).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::config::{CaptnConfig, CredentialsFile, RuntimeOptions};
use crate::container::ContainerDriver;
use crate::envfilter::glob_to_regex;
use crate::error::CaptnError;
use crate::executor::{execute_plan, execute_self_update, ExecutorOptions, SelfUpdateOptions};
use crate::lock::LockFile;
use crate::planner;
use crate::prune::{prune_backups, prune_images, PrunePolicy};
use crate::registry::{profile_for_host, resolve_credentials, RegistryClient, RegistryClientConfig, RegistryProfile};
use crate::report::{Report, ReportBuilder, RegistryStats};
use crate::types::{Candidate, Container, Durations, FinalState, SkipReason, UpdateOutcome};
use crate::version::parse;
use crate::Reporter;

/// The label key whose value, when present, names the Rule overriding
/// whatever `assignmentsByName`/default would otherwise select (§3
/// "Container", §4.4 "label override").
pub const RULE_LABEL: &str = "captn.rule";

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub state_dir: PathBuf,
    pub lock_timeout: Duration,
    pub max_registry_concurrency: usize,
    pub global_timeout: Duration,
    /// Name of the container running the updater itself, if known. Its
    /// update (if planned) is deferred to the end of the run (§4.10
    /// "self-update handling").
    pub self_container_name: Option<String>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        CoordinatorOptions {
            state_dir: PathBuf::from("/var/lib/captn"),
            lock_timeout: Duration::from_secs(3600),
            max_registry_concurrency: 6,
            global_timeout: Duration::from_secs(10 * 3600),
            self_container_name: None,
        }
    }
}

/// One distinct (image, tag, digest) triple shared by one or more
/// containers, deduplicating registry fetches across replicas (§4.11).
struct ImageGroup {
    image: String,
    tag: String,
    digest: String,
    members: Vec<usize>,
}

fn group_key(image: &str, tag: &str, digest: &str) -> String {
    format!("{image}:{tag}@{digest}")
}

/// Split `image` into an optional explicit registry host and the
/// repository path, the way a fully-qualified reference like
/// `ghcr.io/org/app` or a bare `nginx` is conventionally read (§S.2).
fn split_host(image: &str) -> (Option<&str>, &str) {
    match image.split_once('/') {
        Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            (Some(first), rest)
        }
        _ => (None, image),
    }
}

struct RegistryTarget {
    profile: RegistryProfile,
    api_base_override: Option<String>,
    repo: String,
}

fn resolve_registry_target(image: &str, config: &CaptnConfig) -> RegistryTarget {
    let (host, repo_path) = split_host(image);
    match host {
        Some(h) => {
            let profile = profile_for_host(h);
            let api_base_override = match profile {
                RegistryProfile::Hub => config.docker.api_url.clone(),
                RegistryProfile::Ghcr => config.ghcr.api_url.clone(),
                RegistryProfile::GenericV2 => Some(format!("https://{h}")),
            };
            RegistryTarget {
                profile,
                api_base_override,
                repo: repo_path.to_string(),
            }
        }
        None => {
            let repo = if repo_path.contains('/') {
                repo_path.to_string()
            } else {
                format!("library/{repo_path}")
            };
            RegistryTarget {
                profile: RegistryProfile::Hub,
                api_base_override: config.docker.api_url.clone(),
                repo,
            }
        }
    }
}

enum FetchOutcome {
    Candidates(Vec<Candidate>, RegistryStats),
    Err(CaptnError),
}

fn fetch_one(image: &str, tag: &str, digest: &str, config: &CaptnConfig, credentials: &CredentialsFile) -> FetchOutcome {
    let Some(current) = parse(tag) else {
        // Should not happen: callers only build a group once the tag has
        // already parsed. Treated as an empty candidate list rather than
        // panicking.
        return FetchOutcome::Candidates(Vec::new(), RegistryStats::default());
    };
    let Some(pattern) = crate::pattern::TagPattern::induce(tag) else {
        return FetchOutcome::Candidates(Vec::new(), RegistryStats::default());
    };

    let target = resolve_registry_target(image, config);
    let client = match RegistryClient::new(target.profile, target.api_base_override) {
        Ok(c) => c,
        Err(e) => return FetchOutcome::Err(e),
    };

    let registry_wide = if config.registry_auth.enabled {
        credentials.default.as_ref()
    } else {
        None
    };
    let creds = if config.registry_auth.enabled {
        resolve_credentials(&target.repo, &credentials.repositories, registry_wide)
    } else {
        None
    };

    let cfg: RegistryClientConfig = match target.profile {
        RegistryProfile::Hub => (&config.docker).into(),
        _ => (&config.ghcr).into(),
    };

    match client.fetch_candidates(&target.repo, &pattern, &current, digest, creds, &cfg) {
        Ok(candidates) => {
            let stats = RegistryStats {
                image: image.to_string(),
                candidates_listed: candidates.len(),
                pages_crawled: 0,
                retries: 0,
            };
            FetchOutcome::Candidates(candidates, stats)
        }
        Err(e) => FetchOutcome::Err(e),
    }
}

/// Fetch candidates for every group, bounded to `max_concurrency` threads
/// in flight at once.
fn fetch_grouped(
    groups: &[ImageGroup],
    config: &CaptnConfig,
    credentials: &CredentialsFile,
    max_concurrency: usize,
) -> BTreeMap<String, FetchOutcome> {
    let mut results = BTreeMap::new();
    let chunk_size = max_concurrency.max(1);

    for chunk in groups.chunks(chunk_size) {
        let chunk_results: Vec<(String, FetchOutcome)> = std::thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|g| {
                    let key = group_key(&g.image, &g.tag, &g.digest);
                    scope.spawn(move || (key, fetch_one(&g.image, &g.tag, &g.digest, config, credentials)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("fetch thread panicked")).collect()
        });
        results.extend(chunk_results);
    }

    results
}

fn skip_outcome(container: &Container, reason_text: String) -> UpdateOutcome {
    UpdateOutcome {
        container: container.name.clone(),
        plan: None,
        steps_applied: 0,
        final_state: FinalState::Skipped,
        reason: Some(reason_text),
        durations: Durations::default(),
        script_results: Vec::new(),
    }
}

fn aborted_outcome(container: &Container, reason_text: String) -> UpdateOutcome {
    UpdateOutcome {
        container: container.name.clone(),
        plan: None,
        steps_applied: 0,
        final_state: FinalState::Aborted,
        reason: Some(reason_text),
        durations: Durations::default(),
        script_results: Vec::new(),
    }
}

fn name_matches_any(name: &str, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters
        .iter()
        .filter_map(|f| glob_to_regex(f))
        .any(|re| re.is_match(name))
}

/// Executor options derived once per run from the static config; only the
/// per-container rule's `minImageAge` (re-checked at pull time) and
/// `dryRun` vary per container.
fn executor_options(config: &CaptnConfig, runtime: &RuntimeOptions, min_image_age: Duration) -> ExecutorOptions {
    ExecutorOptions {
        dry_run: runtime.effective_dry_run(&config.general),
        log_level: runtime.log_level.clone().unwrap_or_else(|| "info".to_string()),
        scripts_dir: config.pre_scripts.scripts_directory.clone(),
        config_dir: config
            .pre_scripts
            .scripts_directory
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc/captn")),
        pre_hook: (&config.pre_scripts).into(),
        post_hook: (&config.post_scripts).into(),
        verify_policy: (&config.update_verification).into(),
        stop_timeout: Duration::from_secs(10),
        delay_between_updates: config.update.delay_between_updates,
        env_filter: (&config.env_filtering).into(),
        min_image_age,
    }
}

/// Run one coordinator pass: lock, discover, plan, execute, prune, report.
pub fn run(
    driver: &dyn ContainerDriver,
    config: &CaptnConfig,
    runtime: &RuntimeOptions,
    credentials: &CredentialsFile,
    options: &CoordinatorOptions,
    reporter: &mut dyn Reporter,
) -> Result<Report, CaptnError> {
    let _lock = LockFile::acquire_with_timeout(&options.state_dir, options.lock_timeout, runtime.force_run)?;

    let run_start = Instant::now();
    let started_at = Utc::now();
    let dry_run = runtime.effective_dry_run(&config.general);
    let mut builder = ReportBuilder::new(started_at, dry_run);

    let all_containers = driver.list()?;
    let mut containers: Vec<Container> = all_containers
        .into_iter()
        .filter(|c| name_matches_any(&c.name, &runtime.name_filters))
        .filter(|c| !c.image.is_empty() && !c.tag.is_empty())
        .collect();
    containers.sort_by(|a, b| a.name.cmp(&b.name));

    reporter.info(&format!("discovered {} container(s) after filtering", containers.len()));

    // Group by (image, tag, digest) to dedupe registry work across
    // replicas running the identical reference.
    let mut groups: BTreeMap<String, ImageGroup> = BTreeMap::new();
    let mut skip_early: Vec<UpdateOutcome> = Vec::new();

    for (idx, container) in containers.iter().enumerate() {
        if parse(&container.tag).is_none() {
            skip_early.push(skip_outcome(container, SkipReason::TagNotParseable.to_string()));
            continue;
        }
        let digest = container.digest.clone().unwrap_or_default();
        let key = group_key(&container.image, &container.tag, &digest);
        groups
            .entry(key)
            .or_insert_with(|| ImageGroup {
                image: container.image.clone(),
                tag: container.tag.clone(),
                digest,
                members: Vec::new(),
            })
            .members
            .push(idx);
    }

    for outcome in skip_early {
        builder.record_outcome(outcome);
    }

    let group_list: Vec<ImageGroup> = groups.into_values().collect();
    let fetch_results = fetch_grouped(&group_list, config, credentials, options.max_registry_concurrency);

    for stats in fetch_results.values().filter_map(|o| match o {
        FetchOutcome::Candidates(_, s) => Some(s.clone()),
        FetchOutcome::Err(_) => None,
    }) {
        builder.record_registry_stats(stats);
    }

    // Plan every container, splitting off the self-update (if any) to run
    // last.
    let mut ready: Vec<(Container, crate::types::UpdatePlan)> = Vec::new();
    let mut self_update: Option<(Container, crate::types::UpdatePlan)> = None;

    for group in &group_list {
        let key = group_key(&group.image, &group.tag, &group.digest);
        let outcome = fetch_results.get(&key);

        for &idx in &group.members {
            let container = &containers[idx];
            let label_rule = container.labels.get(RULE_LABEL).map(String::as_str);
            let rule = config.resolve_rule(&container.name, label_rule);

            let candidates = match outcome {
                Some(FetchOutcome::Candidates(c, _)) => c,
                Some(FetchOutcome::Err(e)) => {
                    builder.record_outcome(skip_outcome(container, format!("registry error: {e}")));
                    continue;
                }
                None => {
                    builder.record_outcome(skip_outcome(container, "no registry result for group".to_string()));
                    continue;
                }
            };

            // A forced version (§S.3) skips rule evaluation entirely: the
            // container goes to that exact tag if it's among the
            // discovered candidates, or is skipped outright.
            let planned = if let Some(forced_tag) = runtime.force_version.get(&container.name) {
                match candidates.iter().find(|c| &c.version.raw == forced_tag) {
                    Some(candidate) => Ok(crate::types::UpdatePlan {
                        steps: vec![crate::types::Step {
                            target: candidate.clone(),
                            diff_kind: candidate.diff_kind_vs_current,
                        }],
                    }),
                    None => Err(format!("forced version {forced_tag} not found among discovered candidates")),
                }
            } else {
                let current = parse(&container.tag).expect("already validated parseable above");
                planner::plan(&current, candidates, &rule, Utc::now()).map_err(|r| r.to_string())
            };

            match planned {
                Ok(plan) => {
                    if options.self_container_name.as_deref() == Some(container.name.as_str()) {
                        self_update = Some((container.clone(), plan));
                    } else {
                        ready.push((container.clone(), plan));
                    }
                }
                Err(reason) => {
                    builder.record_outcome(skip_outcome(container, reason.to_string()));
                }
            }
        }
    }

    if let Some(pair) = self_update {
        ready.push(pair);
    }

    for (container, plan) in ready {
        if run_start.elapsed() > options.global_timeout {
            builder.record_outcome(aborted_outcome(&container, "global run timeout exceeded".to_string()));
            continue;
        }

        // Candidates were selected against the rule's minImageAge at plan
        // time; the executor re-checks it at pull time against the same
        // threshold to catch drift on long-running passes.
        let rule_min_age = config
            .resolve_rule(&container.name, container.labels.get(RULE_LABEL).map(String::as_str))
            .min_image_age;
        let exec_options = executor_options(config, runtime, rule_min_age);

        let outcome = if options.self_container_name.as_deref() == Some(container.name.as_str()) {
            let self_update_options: SelfUpdateOptions = (&config.self_update).into();
            reporter.info(&format!(
                "executing self-update for {} via helper container",
                container.name
            ));
            execute_self_update(driver, &container, &plan, &exec_options, &self_update_options, reporter)
        } else {
            reporter.info(&format!("executing plan for {}", container.name));
            execute_plan(driver, &container, &plan, &exec_options, reporter)
        };
        builder.record_outcome(outcome);
    }

    let prune_policy: PrunePolicy = (&config.prune).into();
    if !dry_run {
        match prune_backups(driver, &prune_policy, Utc::now(), reporter) {
            Ok(n) => reporter.info(&format!("pruned {n} backup container(s)")),
            Err(e) => reporter.warn(&format!("backup prune failed: {e}")),
        }

        let candidate_image_refs: Vec<String> = group_list
            .iter()
            .map(|g| format!("{}:{}", g.image, g.tag))
            .collect();
        match prune_images(driver, &prune_policy, &candidate_image_refs, reporter) {
            Ok(n) => reporter.info(&format!("pruned {n} unused image(s)")),
            Err(e) => reporter.warn(&format!("image prune failed: {e}")),
        }
    }

    Ok(builder.build(Utc::now()))
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            SkipReason::TagNotParseable => "reference tag is not parseable",
            SkipReason::NoCandidates => "no update candidates available",
            SkipReason::RuleForbidsAll => "rule forbids every available candidate",
            SkipReason::ImageTooYoung => "candidate image is younger than minImageAge",
        };
        write!(f, "{msg}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::FakeDriver;
    use crate::container::ContainerDriver as _;
    use crate::report::NullReporter;
    use crate::types::{Container, ContainerState, HealthState, ResourceLimits, RestartPolicy};
    use std::collections::BTreeMap;

    fn container(name: &str, image: &str, tag: &str) -> Container {
        Container {
            id: format!("id-{name}"),
            name: name.to_string(),
            image: image.to_string(),
            tag: tag.to_string(),
            digest: Some("sha256:old".to_string()),
            labels: BTreeMap::new(),
            env: BTreeMap::new(),
            mounts: Vec::new(),
            networks: Vec::new(),
            ports: Vec::new(),
            restart_policy: RestartPolicy::Always,
            resource_limits: ResourceLimits::default(),
            created_at: Utc::now(),
            state: ContainerState::Running,
            health_state: HealthState::None,
        }
    }

    #[test]
    fn split_host_recognizes_fully_qualified_refs() {
        assert_eq!(split_host("ghcr.io/org/app"), (Some("ghcr.io"), "org/app"));
        assert_eq!(split_host("nginx"), (None, "nginx"));
        assert_eq!(split_host("library/nginx"), (None, "library/nginx"));
        assert_eq!(split_host("localhost:5000/app"), (Some("localhost:5000"), "app"));
    }

    #[test]
    fn name_filter_empty_matches_everything() {
        assert!(name_matches_any("web-1", &[]));
    }

    #[test]
    fn name_filter_matches_one_of_the_or_set() {
        let filters = vec!["web-*".to_string(), "db".to_string()];
        assert!(name_matches_any("web-1", &filters));
        assert!(name_matches_any("db", &filters));
        assert!(!name_matches_any("cache", &filters));
    }

    #[test]
    fn lock_is_released_even_when_run_errors_out_early() {
        let td = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new();
        let config = CaptnConfig::default();
        let runtime = RuntimeOptions::default();
        let credentials = CredentialsFile::default();
        let options = CoordinatorOptions {
            state_dir: td.path().to_path_buf(),
            ..Default::default()
        };
        let mut reporter = NullReporter;

        let report = run(&driver, &config, &runtime, &credentials, &options, &mut reporter).unwrap();
        assert!(report.outcomes.is_empty());
        assert!(!LockFile::is_locked(td.path()));
    }

    #[test]
    fn unparseable_tag_is_skipped_without_touching_the_driver() {
        let td = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new();
        driver.insert(container("web", "myapp", "latest"));

        let config = CaptnConfig::default();
        let runtime = RuntimeOptions::default();
        let credentials = CredentialsFile::default();
        let options = CoordinatorOptions {
            state_dir: td.path().to_path_buf(),
            ..Default::default()
        };
        let mut reporter = NullReporter;

        let report = run(&driver, &config, &runtime, &credentials, &options, &mut reporter).unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].final_state, FinalState::Skipped);
        assert_eq!(driver.list().unwrap().len(), 1);
    }

    #[test]
    fn name_filter_excludes_non_matching_containers_from_the_report() {
        let td = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new();
        driver.insert(container("web-1", "myapp", "latest"));
        driver.insert(container("db", "postgres", "latest"));

        let config = CaptnConfig::default();
        let mut runtime = RuntimeOptions::default();
        runtime.name_filters.push("web-*".to_string());
        let credentials = CredentialsFile::default();
        let options = CoordinatorOptions {
            state_dir: td.path().to_path_buf(),
            ..Default::default()
        };
        let mut reporter = NullReporter;

        let report = run(&driver, &config, &runtime, &credentials, &options, &mut reporter).unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].container, "web-1");
    }
}
