//! Cross-tick comparability of vCPU tables.

use std::collections::BTreeSet;

use virtbal_core::telemetry::{record, Severity};

use crate::snapshot::VcpuTable;

/// Verdict on whether two consecutive vCPU tables can be diffed.
///
/// Three shapes occur:
/// - `comparable: false, skip` empty — skip the whole tick.
/// - `comparable: false, skip` non-empty — process everything except the
///   listed domains.
/// - `comparable: true` — process everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub comparable: bool,
    pub skip: BTreeSet<String>,
}

impl Comparison {
    fn whole_tick_skip() -> Self {
        Self {
            comparable: false,
            skip: BTreeSet::new(),
        }
    }
}

/// Decide comparability of the current table against the previous one.
///
/// A domain new to the current tick forces a whole-tick skip: it needs one
/// full interval of usage history before its deltas mean anything. A domain
/// whose vCPU count changed is only skipped itself; shrinking or growing a
/// domain does not invalidate the rest of the host.
pub fn compare(current: &VcpuTable, previous: &VcpuTable) -> Comparison {
    if current.is_empty() {
        record(Severity::Flag, "current vCPU table is empty");
        return Comparison::whole_tick_skip();
    }
    if previous.is_empty() {
        record(Severity::Flag, "previous vCPU table is empty");
        return Comparison::whole_tick_skip();
    }

    if current.len() != previous.len() {
        record(
            Severity::Flag,
            format!(
                "domain count changed between intervals ({} -> {})",
                previous.len(),
                current.len()
            ),
        );
        return Comparison::whole_tick_skip();
    }

    let mut skip = BTreeSet::new();
    for (uuid, vcpus) in current {
        let Some(previous_vcpus) = previous.get(uuid) else {
            record(
                Severity::Flag,
                format!("domain {uuid} appeared since the previous interval"),
            );
            return Comparison::whole_tick_skip();
        };

        if vcpus.len() != previous_vcpus.len() {
            skip.insert(uuid.clone());
        }
    }

    if !skip.is_empty() {
        let listed: Vec<&str> = skip.iter().map(String::as_str).collect();
        record(
            Severity::Flag,
            format!(
                "vCPU count changed for {} domains: {}",
                skip.len(),
                listed.join(", ")
            ),
        );
        return Comparison {
            comparable: false,
            skip,
        };
    }

    Comparison {
        comparable: true,
        skip,
    }
}
