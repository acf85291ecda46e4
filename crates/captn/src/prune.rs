//! Post-run backup/image pruning, per §4.10's backup lifecycle and
//! SPEC_FULL.md §S.4's eligibility-counting algorithm.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::container::ContainerDriver;
use crate::types::{Container, ContainerState};
use crate::Reporter;

#[derive(Debug, Clone, Copy)]
pub struct PrunePolicy {
    pub remove_old_containers: bool,
    pub remove_unused_images: bool,
    pub min_backup_age: Duration,
    pub min_backups_to_keep: usize,
}

impl Default for PrunePolicy {
    fn default() -> Self {
        PrunePolicy {
            remove_old_containers: true,
            remove_unused_images: true,
            min_backup_age: Duration::from_secs(3600),
            min_backups_to_keep: 1,
        }
    }
}

fn backup_pattern() -> Regex {
    Regex::new(r"^(?P<base>.+)_bak_cu_(?P<ts>\d{8}_\d{6})$").unwrap()
}

struct Backup {
    container: Container,
    base_name: String,
    created: DateTime<Utc>,
}

fn parse_backup(re: &Regex, container: &Container) -> Option<Backup> {
    let caps = re.captures(&container.name)?;
    let base_name = caps.name("base")?.as_str().to_string();
    let ts = caps.name("ts")?.as_str();
    let created = chrono::NaiveDateTime::parse_from_str(ts, "%Y%m%d_%H%M%S")
        .ok()?
        .and_utc();
    Some(Backup {
        container: container.clone(),
        base_name,
        created,
    })
}

/// Delete exited backup containers older than `minBackupAge`, keeping at
/// least `minBackupsToKeep` per base name regardless of age (§S.4):
/// sort each base-name group oldest-first, delete from the front only
/// while the remaining count after deletion would still exceed the floor.
pub fn prune_backups(
    driver: &dyn ContainerDriver,
    policy: &PrunePolicy,
    now: DateTime<Utc>,
    reporter: &mut dyn Reporter,
) -> Result<usize, crate::error::CaptnError> {
    if !policy.remove_old_containers {
        return Ok(0);
    }

    let re = backup_pattern();
    let all = driver.list()?;

    let mut groups: BTreeMap<String, Vec<Backup>> = BTreeMap::new();
    for container in &all {
        if container.state != ContainerState::Exited {
            continue;
        }
        if let Some(backup) = parse_backup(&re, container) {
            groups.entry(backup.base_name.clone()).or_default().push(backup);
        }
    }

    let mut removed = 0usize;
    for (base, mut backups) in groups {
        backups.sort_by_key(|b| b.created);

        let total = backups.len();
        let mut kept = total;
        for (i, backup) in backups.iter().enumerate() {
            if kept <= policy.min_backups_to_keep {
                break;
            }
            let age = now.signed_duration_since(backup.created);
            let Ok(age_std) = age.to_std() else { continue };
            if age_std < policy.min_backup_age {
                continue;
            }

            // Deleting this one must still leave at least the floor among
            // the remaining (not-yet-considered) backups in this group.
            let remaining_after = total - (i + 1);
            if remaining_after + 1 <= policy.min_backups_to_keep {
                continue;
            }

            match driver.remove(&backup.container.id) {
                Ok(()) => {
                    removed += 1;
                    kept -= 1;
                    reporter.info(&format!("pruned backup {} (base {base})", backup.container.name));
                }
                Err(e) => reporter.warn(&format!("failed to prune backup {}: {e}", backup.container.name)),
            }
        }
    }

    Ok(removed)
}

/// Remove images no longer referenced by any known container (§4.10's
/// `removeUnusedImages`). `candidate_image_refs` are the exact refs this
/// run pulled and may have superseded.
pub fn prune_images(
    driver: &dyn ContainerDriver,
    policy: &PrunePolicy,
    candidate_image_refs: &[String],
    reporter: &mut dyn Reporter,
) -> Result<usize, crate::error::CaptnError> {
    if !policy.remove_unused_images {
        return Ok(0);
    }

    let all = driver.list()?;
    let in_use: std::collections::BTreeSet<String> = all
        .iter()
        .map(|c| match &c.digest {
            Some(d) => format!("{}@{}", c.image, d),
            None => format!("{}:{}", c.image, c.tag),
        })
        .collect();

    let mut removed = 0usize;
    for image_ref in candidate_image_refs {
        if in_use.contains(image_ref) {
            continue;
        }
        match driver.remove_image(image_ref) {
            Ok(()) => {
                removed += 1;
                reporter.info(&format!("pruned unused image {image_ref}"));
            }
            Err(e) => reporter.warn(&format!("failed to prune image {image_ref}: {e}")),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::FakeDriver;
    use crate::report::NullReporter;
    use crate::types::{HealthState, ResourceLimits, RestartPolicy};
    use std::collections::BTreeMap;

    fn backup_container(name: &str, state: ContainerState) -> Container {
        Container {
            id: name.to_string(),
            name: name.to_string(),
            image: "example/app".to_string(),
            tag: "1.0.0".to_string(),
            digest: None,
            labels: BTreeMap::new(),
            env: BTreeMap::new(),
            mounts: vec![],
            networks: vec![],
            ports: vec![],
            restart_policy: RestartPolicy::No,
            resource_limits: ResourceLimits::default(),
            created_at: Utc::now(),
            state,
            health_state: HealthState::None,
        }
    }

    #[test]
    fn prunes_old_backups_down_to_the_floor() {
        let driver = FakeDriver::new();
        driver.insert(backup_container("web_bak_cu_20200101_000000", ContainerState::Exited));
        driver.insert(backup_container("web_bak_cu_20200102_000000", ContainerState::Exited));
        driver.insert(backup_container("web_bak_cu_20200103_000000", ContainerState::Exited));

        let policy = PrunePolicy {
            remove_old_containers: true,
            remove_unused_images: false,
            min_backup_age: Duration::from_secs(1),
            min_backups_to_keep: 1,
        };

        let mut reporter = NullReporter;
        let now = Utc::now();
        let removed = prune_backups(&driver, &policy, now, &mut reporter).unwrap();

        assert_eq!(removed, 2);
        assert_eq!(driver.list().unwrap().len(), 1);
        assert_eq!(driver.list().unwrap()[0].name, "web_bak_cu_20200103_000000");
    }

    #[test]
    fn respects_min_backup_age() {
        let driver = FakeDriver::new();
        driver.insert(backup_container("web_bak_cu_20200101_000000", ContainerState::Exited));

        let policy = PrunePolicy {
            remove_old_containers: true,
            remove_unused_images: false,
            min_backup_age: Duration::from_secs(86400 * 365 * 50),
            min_backups_to_keep: 0,
        };

        let mut reporter = NullReporter;
        let removed = prune_backups(&driver, &policy, Utc::now(), &mut reporter).unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn ignores_running_containers_matching_backup_name_shape() {
        let driver = FakeDriver::new();
        driver.insert(backup_container("web_bak_cu_20200101_000000", ContainerState::Running));

        let policy = PrunePolicy {
            remove_old_containers: true,
            remove_unused_images: false,
            min_backup_age: Duration::from_secs(1),
            min_backups_to_keep: 0,
        };

        let mut reporter = NullReporter;
        let removed = prune_backups(&driver, &policy, Utc::now(), &mut reporter).unwrap();
        assert_eq!(removed, 0);
    }
}
