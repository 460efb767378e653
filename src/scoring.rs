//! Scoring engine: fitness of a worker for a task.
//!
//! The coordinator only depends on the [`ScoringEngine`] trait; the bundled
//! [`SkillMatchScorer`] implements the skill-overlap formula:
//!
//! ```text
//! expertise = |required ∩ skills| / max(|skills|, 1)
//! penalty   = current_load * penalty_weight
//! bonus     = priority_weights[priority]
//! score     = expertise - penalty + bonus
//! ```
//!
//! Scoring reads worker snapshots only and needs no synchronization.

use std::cmp::Ordering;

use crate::config::{OrchestratorConfig, PriorityWeights};
use crate::tasks::model::Task;
use crate::workers::model::Worker;

/// Pluggable fitness function.
pub trait ScoringEngine: Send + Sync {
    fn score(&self, worker: &Worker, task: &Task) -> f64;
}

/// Skill-overlap scorer with a load penalty and a priority bonus.
#[derive(Debug, Clone)]
pub struct SkillMatchScorer {
    pub penalty_weight: f64,
    pub priority_weights: PriorityWeights,
}

impl SkillMatchScorer {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            penalty_weight: config.penalty_weight,
            priority_weights: config.priority_weights,
        }
    }

    pub fn expertise(worker: &Worker, task: &Task) -> f64 {
        let matched = worker.matched_skills(&task.required_skills).len();
        matched as f64 / worker.skill_set.len().max(1) as f64
    }
}

impl Default for SkillMatchScorer {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl ScoringEngine for SkillMatchScorer {
    fn score(&self, worker: &Worker, task: &Task) -> f64 {
        let expertise = Self::expertise(worker, task);
        let penalty = f64::from(worker.current_load) * self.penalty_weight;
        let bonus = self.priority_weights.for_priority(task.priority);
        expertise - penalty + bonus
    }
}

/// A scored worker.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub worker: Worker,
    pub score: f64,
}

impl Candidate {
    /// Human-readable reason recorded on the assignment.
    pub fn rationale(&self, task: &Task) -> String {
        let matched = self.worker.matched_skills(&task.required_skills);
        if matched.is_empty() {
            format!(
                "score {:.3}; no required skills matched; load {}",
                self.score, self.worker.current_load
            )
        } else {
            format!(
                "score {:.3}; matched {}; load {}",
                self.score,
                matched.join(", "),
                self.worker.current_load
            )
        }
    }
}

/// Whether `worker` may take `task` at all.
pub fn is_eligible(worker: &Worker, task: &Task, require_skill_match: bool) -> bool {
    if !worker.active || !worker.has_room_for(task.estimated_effort) {
        return false;
    }
    if require_skill_match && !task.required_skills.is_empty() {
        return !worker.matched_skills(&task.required_skills).is_empty();
    }
    true
}

/// Best-first ordering: higher score, then lower load, then lower id.
pub fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.worker.current_load.cmp(&b.worker.current_load))
        .then_with(|| a.worker.id.cmp(&b.worker.id))
}

/// Score every eligible worker and sort best-first. Deterministic for a
/// given snapshot.
pub fn rank(
    engine: &dyn ScoringEngine,
    workers: &[Worker],
    task: &Task,
    require_skill_match: bool,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = workers
        .iter()
        .filter(|w| is_eligible(w, task, require_skill_match))
        .map(|w| Candidate {
            score: engine.score(w, task),
            worker: w.clone(),
        })
        .collect();
    candidates.sort_by(compare_candidates);
    candidates
}
