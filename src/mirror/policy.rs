//! Mirror policy evaluation.
//!
//! Policies are allow/deny rules with glob patterns over namespace and
//! provider type, optionally pinned to one upstream. Evaluation is
//! deterministic in (policies, upstream, namespace, provider): the lowest
//! priority band with at least one match decides; within that band an
//! explicit deny wins, then approval-requiring allows, then plain allows.
//! No match at all defaults to allow.

use crate::db::mirrors::MirrorPolicy;

/// Outcome of evaluating one candidate against an organization's policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny,
    /// Allowed only once an approved approval request exists.
    RequiresApproval,
}

/// Minimal glob: `*` matches any run of characters, everything else is
/// literal. Matching is case-sensitive, like the registry addresses it
/// guards.
#[must_use]
pub fn glob_matches(pattern: &str, value: &str) -> bool {
    fn inner(pattern: &[u8], value: &[u8]) -> bool {
        match (pattern.first(), value.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                // Greedy or empty match for the star.
                inner(&pattern[1..], value)
                    || (!value.is_empty() && inner(pattern, &value[1..]))
            }
            (Some(p), Some(v)) if p == v => inner(&pattern[1..], &value[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

fn policy_matches(
    policy: &MirrorPolicy,
    upstream_url: &str,
    namespace: &str,
    provider_type: &str,
) -> bool {
    if let Some(pinned) = &policy.upstream_url {
        if pinned.trim_end_matches('/') != upstream_url.trim_end_matches('/') {
            return false;
        }
    }
    glob_matches(&policy.namespace_pattern, namespace)
        && glob_matches(&policy.provider_pattern, provider_type)
}

/// Evaluate `policies` (already sorted by priority) for one candidate.
#[must_use]
pub fn evaluate(
    policies: &[MirrorPolicy],
    upstream_url: &str,
    namespace: &str,
    provider_type: &str,
) -> PolicyDecision {
    let mut deciding_priority: Option<i64> = None;
    let mut decision = PolicyDecision::Allow;

    for policy in policies {
        if let Some(priority) = deciding_priority {
            if policy.priority != priority {
                break;
            }
        }
        if !policy_matches(policy, upstream_url, namespace, provider_type) {
            continue;
        }

        if policy.action == "deny" {
            // Deny wins the band outright.
            return PolicyDecision::Deny;
        }
        if deciding_priority.is_none() {
            deciding_priority = Some(policy.priority);
            decision = if policy.requires_approval {
                PolicyDecision::RequiresApproval
            } else {
                PolicyDecision::Allow
            };
        } else if policy.requires_approval && decision == PolicyDecision::Allow {
            decision = PolicyDecision::RequiresApproval;
        }
    }

    decision
}
