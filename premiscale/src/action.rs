//! The unit of work the [`crate::reconciler`] emits and the
//! [`crate::dispatcher`] executes. See spec.md §3, §9.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One lifecycle operation against a single VM, or no-op.
///
/// `Action` forms an associative, `Null`-identity monoid under [`Action::combine`]:
/// folding a cycle's candidate actions for one ASG collapses duplicate or
/// superseded work into the minimal sequence the dispatcher actually runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// No work to do this cycle.
    Null,
    /// Spawn `modifier` new VMs named from the ASG's domain-name template.
    Create { asg: String, host: String, modifier: u32 },
    /// Clone an existing VM onto a (possibly different) host.
    Clone { asg: String, vm: String, source_host: String, dest_host: String },
    /// Live-migrate a running VM to another host.
    Migrate { asg: String, vm: String, source_host: String, dest_host: String },
    /// Delete-then-create, bounded by the ASG's maxUnavailable/maxSurge.
    Replace { asg: String, vm: String, host: String },
    /// Remove a VM. `reclaim_storage` additionally deletes its backing
    /// block devices (see `Verb.DELETE_STORAGE` in the original source).
    Delete { asg: String, vm: String, host: String, reclaim_storage: bool },
}

impl Action {
    pub fn asg(&self) -> Option<&str> {
        match self {
            Action::Null => None,
            Action::Create { asg, .. }
            | Action::Clone { asg, .. }
            | Action::Migrate { asg, .. }
            | Action::Replace { asg, .. }
            | Action::Delete { asg, .. } => Some(asg),
        }
    }

    /// Combine two actions produced for the same ASG within one
    /// reconciliation cycle. `Null` is the identity; two `Create`s for the
    /// same ASG sum their modifiers; any other pairing reduces to whichever
    /// operand is more specific (i.e. the right-hand side, since the
    /// Reconciler folds left-to-right in emission order and a more specific
    /// action always supersedes an earlier, less specific one).
    ///
    /// This must stay associative: `(a.combine(b)).combine(c) ==
    /// a.combine(b.combine(c))`. See the `action` proptests for the
    /// invariant this enables in the Reconciler's fold.
    pub fn combine(self, other: Action) -> Action {
        match (self, other) {
            (Action::Null, x) => x,
            (x, Action::Null) => x,
            (
                Action::Create { asg, host, modifier: m1 },
                Action::Create { modifier: m2, .. },
            ) => Action::Create { asg, host, modifier: m1 + m2 },
            (_, other) => other,
        }
    }
}

impl Default for Action {
    fn default() -> Self {
        Action::Null
    }
}

/// Fold a candidate list into the minimal sequence of actions, in the order
/// the Reconciler generated them (spec.md §4.3 "Action reduction").
pub fn reduce(actions: impl IntoIterator<Item = Action>) -> Action {
    actions
        .into_iter()
        .fold(Action::Null, |acc, next| acc.combine(next))
}

/// Outcome of executing one Action, placed on the platform queue as an
/// audit record (spec.md §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub action: Action,
    pub asg: String,
    pub host: String,
    pub vm: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub outcome: ActionOutcome,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionOutcome {
    Succeeded,
    Failed,
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(n: u32) -> Action {
        Action::Create { asg: "g1".into(), host: "h1".into(), modifier: n }
    }

    fn delete() -> Action {
        Action::Delete { asg: "g1".into(), vm: "v1".into(), host: "h1".into(), reclaim_storage: false }
    }

    #[test]
    fn null_is_identity() {
        let a = create(2);
        assert_eq!(Action::Null.combine(a.clone()), a.clone());
        assert_eq!(a.clone().combine(Action::Null), a);
    }

    #[test]
    fn creates_sum_modifiers() {
        let combined = create(1).combine(create(2));
        assert_eq!(combined, create(3));
    }

    #[test]
    fn combine_is_associative() {
        let variants = [Action::Null, create(1), create(2), delete()];
        for a in &variants {
            for b in &variants {
                for c in &variants {
                    let left = a.clone().combine(b.clone()).combine(c.clone());
                    let right = a.clone().combine(b.clone().combine(c.clone()));
                    assert_eq!(left, right, "associativity failed for {a:?} {b:?} {c:?}");
                }
            }
        }
    }

    #[test]
    fn reduce_folds_a_candidate_list() {
        let candidates = vec![create(1), create(1), create(1)];
        assert_eq!(reduce(candidates), create(3));
    }

    #[test]
    fn more_specific_action_wins() {
        assert_eq!(create(1).combine(delete()), delete());
    }
}
