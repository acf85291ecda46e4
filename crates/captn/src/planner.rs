//! Update Planner (C9): turn a container's rule and its already-fetched,
//! already-classified candidates into a plan, or a reason to skip. See
//! SPEC_FULL.md §4.9.
//!
//! Tag parsing and pattern induction happen earlier, in the coordinator,
//! since a non-parseable reference tag means the registry is never even
//! queried (§4.2). This module only owns the rule-selection step and the
//! bookkeeping needed to tell `RuleForbidsAll` apart from `ImageTooYoung`.

use chrono::{DateTime, Utc};

use crate::error::CaptnError;
use crate::rule::select_plan;
use crate::types::{Candidate, Rule, SkipReason, Step, UpdatePlan, Version};

/// Build a plan from `candidates` (already pattern-filtered and classified
/// against `current` by the registry client) under `rule`.
pub fn plan(
    current: &Version,
    candidates: &[Candidate],
    rule: &Rule,
    now: DateTime<Utc>,
) -> Result<UpdatePlan, SkipReason> {
    if candidates.is_empty() {
        return Err(SkipReason::NoCandidates);
    }

    let selected = select_plan(current, candidates, rule, now);
    if selected.is_empty() {
        // Distinguish "forbidden outright" from "admissible but still
        // below minImageAge" by re-running selection with the age gate
        // waived (§4.9).
        let mut age_waived = rule.clone();
        age_waived.min_image_age = std::time::Duration::ZERO;
        let waived = select_plan(current, candidates, &age_waived, now);
        if !waived.is_empty() {
            return Err(SkipReason::ImageTooYoung);
        }
        return Err(SkipReason::RuleForbidsAll);
    }

    let steps = selected
        .into_iter()
        .map(|c| Step {
            target: c.clone(),
            diff_kind: c.diff_kind_vs_current,
        })
        .collect();

    Ok(UpdatePlan { steps })
}

impl From<SkipReason> for CaptnError {
    fn from(reason: SkipReason) -> Self {
        match reason {
            SkipReason::TagNotParseable => CaptnError::TagNotParseable,
            SkipReason::NoCandidates => CaptnError::NoCandidates,
            SkipReason::RuleForbidsAll => CaptnError::RuleForbidsAll,
            SkipReason::ImageTooYoung => CaptnError::ImageTooYoung,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::parse;
    use std::time::Duration;

    fn candidate(tag: &str, digest: &str, diff: crate::types::DiffKind, pushed_at: DateTime<Utc>) -> Candidate {
        Candidate {
            version: parse(tag).unwrap(),
            digest: digest.to_string(),
            pushed_at,
            diff_kind_vs_current: diff,
        }
    }

    #[test]
    fn no_candidates_skips() {
        let current = parse("1.2.3").unwrap();
        let mut rule = Rule::default();
        rule.allow.insert(crate::types::DiffKind::Patch);

        let result = plan(&current, &[], &rule, Utc::now());
        assert_eq!(result.unwrap_err(), SkipReason::NoCandidates);
    }

    #[test]
    fn rule_forbids_all_when_allow_set_empty() {
        let current = parse("1.2.3").unwrap();
        let rule = Rule::default();

        let candidates = vec![candidate("1.2.4", "sha256:b", crate::types::DiffKind::Patch, Utc::now())];
        let result = plan(&current, &candidates, &rule, Utc::now());
        assert_eq!(result.unwrap_err(), SkipReason::RuleForbidsAll);
    }

    #[test]
    fn image_too_young_distinguished_from_rule_forbids_all() {
        let current = parse("1.2.3").unwrap();
        let mut rule = Rule::default();
        rule.allow.insert(crate::types::DiffKind::Patch);
        rule.min_image_age = Duration::from_secs(86400);

        let candidates = vec![candidate("1.2.4", "sha256:b", crate::types::DiffKind::Patch, Utc::now())];
        let result = plan(&current, &candidates, &rule, Utc::now());
        assert_eq!(result.unwrap_err(), SkipReason::ImageTooYoung);
    }

    #[test]
    fn builds_single_step_plan_for_admissible_patch() {
        let current = parse("1.2.3").unwrap();
        let mut rule = Rule::default();
        rule.allow.insert(crate::types::DiffKind::Patch);

        let candidates = vec![candidate(
            "1.2.4",
            "sha256:b",
            crate::types::DiffKind::Patch,
            Utc::now() - chrono::Duration::hours(1),
        )];
        let result = plan(&current, &candidates, &rule, Utc::now()).unwrap();
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].target.version.raw, "1.2.4");
    }
}
