//! Counter rules for projects and groups.
//!
//! Every group starts with `required_count = verification_number` and
//! `finished_count = 0`. Each new mapping session for the group moves one
//! unit from required to finished. Progress is derived, never stored
//! independently of the counters.

use serde::Serialize;

use super::types::{Group, Project, ProjectStatus};

/// The counter columns of a group row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupCounters {
    pub number_of_tasks: u32,
    pub finished_count: u32,
    pub required_count: u32,
    pub progress: u8,
}

impl GroupCounters {
    pub fn initial(number_of_tasks: u32, verification_number: u32) -> Self {
        GroupCounters {
            number_of_tasks,
            finished_count: 0,
            required_count: verification_number,
            progress: 0,
        }
    }
}

impl Group {
    pub fn counters(&self) -> GroupCounters {
        GroupCounters {
            number_of_tasks: self.number_of_tasks,
            finished_count: self.finished_count,
            required_count: self.required_count,
            progress: self.progress,
        }
    }

    pub fn set_counters(&mut self, c: GroupCounters) {
        self.finished_count = c.finished_count;
        self.required_count = c.required_count;
        self.progress = c.progress;
    }
}

/// `floor(finished / (finished + required) * 100)`, exactly 100 once nothing
/// is required.
pub fn group_progress(finished: u32, required: u32) -> u8 {
    if required == 0 {
        return 100;
    }
    let total = finished as u64 + required as u64;
    (finished as u64 * 100 / total) as u8
}

/// Apply `n` new sessions to a group's counters.
pub fn apply_submissions(c: GroupCounters, n: u32) -> GroupCounters {
    let finished_count = c.finished_count.saturating_add(n);
    let required_count = c.required_count.saturating_sub(n);
    GroupCounters {
        finished_count,
        required_count,
        progress: group_progress(finished_count, required_count).max(c.progress),
        ..c
    }
}

/// One new session for this group.
pub fn on_submission(group: &Group) -> Group {
    let mut next = group.clone();
    next.set_counters(apply_submissions(group.counters(), 1));
    next
}

pub fn required_results(groups: &[Group]) -> u64 {
    groups
        .iter()
        .map(|g| g.required_count as u64 * g.number_of_tasks as u64)
        .sum()
}

/// Share of required results delivered, counting at most
/// `verification_number` sessions per group.
pub fn project_progress(verification_number: u32, required_results: u64, groups: &[GroupCounters]) -> u8 {
    if required_results == 0 {
        return 0;
    }
    let delivered: u64 = groups
        .iter()
        .map(|g| g.finished_count.min(verification_number) as u64 * g.number_of_tasks as u64)
        .sum();
    (delivered * 100 / required_results).min(100) as u8
}

/// Initialise counters for a freshly partitioned project.
pub fn on_project_created(project: &mut Project, groups: &mut [Group]) {
    for g in groups.iter_mut() {
        g.set_counters(GroupCounters::initial(g.number_of_tasks, project.verification_number));
    }
    project.required_results = required_results(groups);
    project.result_count = 0;
    project.contributor_count = 0;
    project.progress = 0;
}

/// Live-store subtrees emptied when a project is archived, in order.
pub fn archived_subtrees(project_id: &str) -> Vec<String> {
    vec![
        format!("results/{}", project_id),
        format!("tasks/{}", project_id),
        format!("groupsUsers/{}", project_id),
        format!("groups/{}", project_id),
    ]
}

/// Live-store subtrees removed when a project is deleted, in order. Task
/// references go first and the project document last.
pub fn on_project_deleted(project_id: &str) -> Vec<String> {
    let mut paths = archived_subtrees(project_id);
    paths.push(format!("projects/{}", project_id));
    paths
}

/// Mark a project archived; returns the status it had before.
pub fn on_project_archived(project: &mut Project) -> ProjectStatus {
    std::mem::replace(&mut project.status, ProjectStatus::Archived)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    RequiredResultsMismatch { stored: u64, computed: u64 },
    EmptyGroup { group_id: String },
    DuplicateGroup { group_id: String },
    CountersBelowVerification { group_id: String, finished: u32, required: u32 },
    RequiredAboveVerification { group_id: String, required: u32 },
    ProgressMismatch { group_id: String, stored: u8, expected: u8 },
}

/// Check the counter invariants of a project and its groups. An empty list
/// means the pair is consistent.
pub fn validate_invariants(project: &Project, groups: &[Group]) -> Vec<InvariantViolation> {
    let v = project.verification_number;
    let mut violations = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for g in groups {
        if !seen.insert(g.group_id.as_str()) {
            violations.push(InvariantViolation::DuplicateGroup {
                group_id: g.group_id.clone(),
            });
        }
        if g.number_of_tasks == 0 {
            violations.push(InvariantViolation::EmptyGroup {
                group_id: g.group_id.clone(),
            });
        }
        if (g.finished_count as u64 + g.required_count as u64) < v as u64 {
            violations.push(InvariantViolation::CountersBelowVerification {
                group_id: g.group_id.clone(),
                finished: g.finished_count,
                required: g.required_count,
            });
        }
        if g.required_count > v {
            violations.push(InvariantViolation::RequiredAboveVerification {
                group_id: g.group_id.clone(),
                required: g.required_count,
            });
        }
        let expected = group_progress(g.finished_count, g.required_count);
        if g.progress != expected {
            violations.push(InvariantViolation::ProgressMismatch {
                group_id: g.group_id.clone(),
                stored: g.progress,
                expected,
            });
        }
    }

    let computed: u64 = groups.iter().map(|g| v as u64 * g.number_of_tasks as u64).sum();
    if project.required_results != computed {
        violations.push(InvariantViolation::RequiredResultsMismatch {
            stored: project.required_results,
            computed,
        });
    }
    violations
}
