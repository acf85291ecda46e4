//! Rule Engine (C4): admissibility filter, plan selection, tie-breaks.
//! See SPEC_FULL.md §4.4.

use chrono::{DateTime, Utc};

use crate::types::{Candidate, DiffKind, Rule, Version};
use crate::version::compare;

/// The admissible subset of `candidates` under `rule`, given `current` and
/// `now`. Implements algorithm steps 1-5 of §4.4.
pub fn admissible_set<'a>(
    current: &Version,
    candidates: &'a [Candidate],
    rule: &Rule,
    now: DateTime<Utc>,
) -> Vec<&'a Candidate> {
    candidates
        .iter()
        .filter(|c| is_admissible(current, c, candidates, rule, now))
        .collect()
}

fn is_admissible(
    current: &Version,
    candidate: &Candidate,
    all_candidates: &[Candidate],
    rule: &Rule,
    now: DateTime<Utc>,
) -> bool {
    // Step 1: c > current in the shared scheme, or c == current with a
    // differing digest (the `digest` kind).
    match compare(current, &candidate.version) {
        Some(std::cmp::Ordering::Less) => {}
        Some(std::cmp::Ordering::Equal) if candidate.diff_kind_vs_current == DiffKind::Digest => {}
        _ => return false,
    }

    // Step 2: minImageAge.
    let age = now.signed_duration_since(candidate.pushed_at);
    let Ok(age_std) = age.to_std() else {
        return false;
    };
    if age_std < rule.min_image_age {
        return false;
    }

    // Step 3: diff kind must be in the allow-set.
    let kind = candidate.diff_kind_vs_current;
    if !rule.allow.contains(&kind) {
        return false;
    }

    // Step 4: conditions — at least one required kind present among *all*
    // available candidates for this container, not just earlier-allowed ones.
    if let Some(condition) = rule.conditions.get(&kind) {
        let satisfied = all_candidates
            .iter()
            .any(|other| condition.require.contains(&other.diff_kind_vs_current));
        if !satisfied {
            return false;
        }
    }

    // Step 5: lag policy, major then minor within fixed major.
    if let Some(&max_lag_major) = rule.lag_policy.get(&crate::types::LagAxis::Major) {
        if let Some(&max_major) = all_candidates
            .iter()
            .filter_map(|c| c.version.components.first())
            .max()
        {
            let candidate_major = candidate.version.components.first().copied().unwrap_or(0);
            if max_major.saturating_sub(max_lag_major as u64) > candidate_major {
                return false;
            }
        }
    }

    if let Some(&max_lag_minor) = rule.lag_policy.get(&crate::types::LagAxis::Minor) {
        let candidate_major = candidate.version.components.first().copied().unwrap_or(0);
        let candidate_minor = candidate.version.components.get(1).copied().unwrap_or(0);
        if let Some(&max_minor_same_major) = all_candidates
            .iter()
            .filter(|c| c.version.components.first().copied().unwrap_or(0) == candidate_major)
            .filter_map(|c| c.version.components.get(1))
            .max()
        {
            if max_minor_same_major.saturating_sub(max_lag_minor as u64) > candidate_minor {
                return false;
            }
        }
    }

    true
}

/// Highest-Version candidate in a slice, breaking ties by the newer
/// `pushedAt` (§4.4 "tie-breaks").
fn highest<'a>(candidates: &[&'a Candidate]) -> Option<&'a Candidate> {
    candidates
        .iter()
        .copied()
        .max_by(|a, b| {
            compare(&a.version, &b.version)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.pushed_at.cmp(&b.pushed_at))
        })
}

/// Build the ordered chain for a progressive-upgrade plan: every admissible
/// candidate strictly between the lowest and the highest with no admissible
/// candidate skipped (§4.4/§8.4).
fn progressive_chain<'a>(candidates: &[&'a Candidate]) -> Vec<&'a Candidate> {
    let mut sorted: Vec<&Candidate> = candidates.to_vec();
    sorted.sort_by(|a, b| compare(&a.version, &b.version).unwrap_or(std::cmp::Ordering::Equal));

    let mut chain: Vec<&Candidate> = Vec::new();
    for c in sorted {
        match chain.last() {
            Some(prev) if compare(&prev.version, &c.version) == Some(std::cmp::Ordering::Equal) => {
                // Same version, newer pushedAt wins the slot.
                if c.pushed_at > prev.pushed_at {
                    chain.pop();
                    chain.push(c);
                }
            }
            _ => chain.push(c),
        }
    }
    chain
}

/// `selectPlan(candidates, rule) -> UpdatePlan` from §4.4, expressed as the
/// ordered `Vec<Candidate>` the planner turns into `Step`s. Empty when the
/// admissible set is empty.
pub fn select_plan<'a>(
    current: &Version,
    candidates: &'a [Candidate],
    rule: &Rule,
    now: DateTime<Utc>,
) -> Vec<&'a Candidate> {
    let admissible = admissible_set(current, candidates, rule, now);
    if admissible.is_empty() {
        return Vec::new();
    }

    if !rule.progressive_upgrade {
        return highest(&admissible).into_iter().collect();
    }

    progressive_chain(&admissible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::parse;
    use std::time::Duration;

    fn candidate(tag: &str, digest: &str, diff: DiffKind, pushed_at: DateTime<Utc>) -> Candidate {
        Candidate {
            version: parse(tag).unwrap(),
            digest: digest.to_string(),
            pushed_at,
            diff_kind_vs_current: diff,
        }
    }

    #[test]
    fn filters_out_below_allow_set() {
        let current = parse("1.2.3").unwrap();
        let now = Utc::now();
        let candidates = vec![candidate("1.3.0", "d2", DiffKind::Minor, now)];
        let mut rule = Rule::default();
        rule.allow.insert(DiffKind::Patch);

        let admissible = admissible_set(&current, &candidates, &rule, now);
        assert!(admissible.is_empty());
    }

    #[test]
    fn min_image_age_defers_young_candidates() {
        let current = parse("1.2.3").unwrap();
        let now = Utc::now();
        let candidates = vec![candidate("1.2.4", "d2", DiffKind::Patch, now)];
        let mut rule = Rule::default();
        rule.allow.insert(DiffKind::Patch);
        rule.min_image_age = Duration::from_secs(86400);

        let admissible = admissible_set(&current, &candidates, &rule, now);
        assert!(admissible.is_empty());
    }

    #[test]
    fn non_progressive_picks_highest_admissible() {
        let current = parse("1.2.3").unwrap();
        let now = Utc::now();
        let candidates = vec![
            candidate("1.2.4", "d2", DiffKind::Patch, now),
            candidate("1.3.0", "d3", DiffKind::Minor, now),
        ];
        let mut rule = Rule::default();
        rule.allow.insert(DiffKind::Patch);
        rule.allow.insert(DiffKind::Minor);

        let plan = select_plan(&current, &candidates, &rule, now);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].version.raw, "1.3.0");
    }

    #[test]
    fn progressive_chain_includes_every_admissible_step() {
        let current = parse("1.2.3").unwrap();
        let now = Utc::now();
        let candidates = vec![
            candidate("1.2.4", "d2", DiffKind::Patch, now),
            candidate("1.3.0", "d3", DiffKind::Minor, now),
        ];
        let mut rule = Rule::default();
        rule.progressive_upgrade = true;
        rule.allow.insert(DiffKind::Patch);
        rule.allow.insert(DiffKind::Minor);

        let plan = select_plan(&current, &candidates, &rule, now);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].version.raw, "1.2.4");
        assert_eq!(plan[1].version.raw, "1.3.0");
    }

    #[test]
    fn condition_requires_concurrently_available_kind() {
        let current = parse("1.2.3").unwrap();
        let now = Utc::now();
        let candidates = vec![candidate("2.0.0", "d2", DiffKind::Major, now)];
        let mut rule = Rule::default();
        rule.allow.insert(DiffKind::Major);
        rule.conditions.insert(
            DiffKind::Major,
            crate::types::Condition {
                require: [DiffKind::Digest].into_iter().collect(),
            },
        );

        // No digest-kind candidate present -> condition unmet.
        assert!(admissible_set(&current, &candidates, &rule, now).is_empty());
    }

    #[test]
    fn lag_policy_forbids_candidates_too_far_behind_latest_major() {
        let current = parse("1.0.0").unwrap();
        let now = Utc::now();
        let candidates = vec![
            candidate("2.0.0", "d2", DiffKind::Major, now),
            candidate("3.0.0", "d3", DiffKind::Major, now),
        ];
        let mut rule = Rule::default();
        rule.allow.insert(DiffKind::Major);
        rule.lag_policy.insert(crate::types::LagAxis::Major, 0);

        let admissible = admissible_set(&current, &candidates, &rule, now);
        assert_eq!(admissible.len(), 1);
        assert_eq!(admissible[0].version.raw, "3.0.0");
    }

    #[test]
    fn tie_break_prefers_newer_pushed_at() {
        let current = parse("1.2.3").unwrap();
        let earlier = Utc::now() - chrono::Duration::hours(2);
        let later = Utc::now();
        let candidates = vec![
            candidate("1.3.0", "dA", DiffKind::Minor, earlier),
            candidate("1.3.0", "dB", DiffKind::Minor, later),
        ];
        let mut rule = Rule::default();
        rule.allow.insert(DiffKind::Minor);

        let plan = select_plan(&current, &candidates, &rule, later);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].digest, "dB");
    }

    #[test]
    fn digest_only_candidate_requires_equal_version() {
        let current = parse("1.2.3").unwrap();
        let now = Utc::now();
        let candidates = vec![candidate("1.2.3", "dNEW", DiffKind::Digest, now)];
        let mut rule = Rule::default();
        rule.allow.insert(DiffKind::Digest);

        let admissible = admissible_set(&current, &candidates, &rule, now);
        assert_eq!(admissible.len(), 1);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// §8.3: making a Rule strictly more permissive never shrinks the
            /// admissible set.
            #[test]
            fn more_permissive_allow_set_never_shrinks_admissible(minor_allowed in any::<bool>()) {
                let current = parse("1.0.0").unwrap();
                let now = Utc::now();
                let candidates = vec![
                    candidate("1.0.1", "dp", DiffKind::Patch, now),
                    candidate("1.1.0", "dm", DiffKind::Minor, now),
                ];

                let mut narrow = Rule::default();
                narrow.allow.insert(DiffKind::Patch);

                let mut wide = Rule::default();
                wide.allow.insert(DiffKind::Patch);
                if minor_allowed {
                    wide.allow.insert(DiffKind::Minor);
                }

                let narrow_admissible = admissible_set(&current, &candidates, &narrow, now).len();
                let wide_admissible = admissible_set(&current, &candidates, &wide, now).len();
                prop_assert!(wide_admissible >= narrow_admissible);
            }
        }
    }
}
