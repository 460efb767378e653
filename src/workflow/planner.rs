//! Workflow planner: splits a task across workers when no single worker
//! fits it well.
//!
//! Required skills are grouped into phases (design → implement → verify).
//! A phase becomes one step when some worker covers all of its skills and
//! one parallel step per skill otherwise. Verification skills become a
//! review step, preferably staffed by someone who authored no earlier step.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::assignment::AssignmentCoordinator;
use crate::error::Result;
use crate::tasks::model::{Assignment, Task};
use crate::workflow::model::{StepMode, WorkflowPlan, WorkflowStep};

/// Ordered phase a skill belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Design,
    Implement,
    Verify,
}

const DESIGN_KEYWORDS: &[&str] = &[
    "design", "ux", "architecture", "research", "planning", "spec", "product",
];
const VERIFY_KEYWORDS: &[&str] = &[
    "test", "qa", "review", "verify", "verification", "security", "audit",
];

impl Phase {
    /// Classify a skill tag by keyword.
    pub fn of(skill: &str) -> Self {
        let skill = skill.to_ascii_lowercase();
        if VERIFY_KEYWORDS.iter().any(|k| skill.contains(k)) {
            Phase::Verify
        } else if DESIGN_KEYWORDS.iter().any(|k| skill.contains(k)) {
            Phase::Design
        } else {
            Phase::Implement
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Phase::Design => "Design",
            Phase::Implement => "Implement",
            Phase::Verify => "Review",
        }
    }
}

pub struct WorkflowPlanner {
    coordinator: Arc<AssignmentCoordinator>,
    collaboration_threshold: f64,
}

impl WorkflowPlanner {
    pub fn new(coordinator: Arc<AssignmentCoordinator>, collaboration_threshold: f64) -> Self {
        Self {
            coordinator,
            collaboration_threshold,
        }
    }

    /// Whether a task with this best single-worker score should be split.
    pub fn needs_collaboration(&self, task: &Task, best_score: Option<f64>) -> bool {
        task.complex || best_score.is_some_and(|s| s < self.collaboration_threshold)
    }

    /// Build a multi-worker plan, or `None` if the task does not decompose
    /// into at least two staffed steps.
    pub async fn plan_collaboration(&self, task: &Task) -> Result<Option<WorkflowPlan>> {
        let mut phases: BTreeMap<Phase, BTreeSet<String>> = BTreeMap::new();
        for skill in &task.required_skills {
            phases.entry(Phase::of(skill)).or_default().insert(skill.clone());
        }
        if phases.is_empty() {
            phases.insert(Phase::Implement, BTreeSet::new());
        }

        let mut steps: Vec<WorkflowStep> = Vec::new();
        let mut previous: Vec<usize> = Vec::new();
        let mut authors: Vec<String> = Vec::new();

        for (phase, skills) in &phases {
            let groups = if *phase == Phase::Verify {
                vec![skills.clone()]
            } else {
                self.split_phase(task, skills).await?
            };
            let parallel = groups.len() > 1;
            let avoid = if *phase == Phase::Verify { authors.clone() } else { Vec::new() };

            let mut current = Vec::new();
            for group in groups {
                let Some(step) = self
                    .staff(task, *phase, group, &previous, &avoid, steps.len(), parallel)
                    .await?
                else {
                    return Ok(None);
                };
                if *phase != Phase::Verify {
                    authors.push(step.worker_id.clone());
                }
                current.push(step.index);
                steps.push(step);
            }
            previous = current;
        }

        // A complex task nobody needs to split still gets a second pair of
        // eyes.
        if steps.len() == 1 && task.complex && !phases.contains_key(&Phase::Verify) {
            let skills = steps[0].skills.clone();
            if let Some(review) = self
                .staff(task, Phase::Verify, skills, &previous, &authors, 1, false)
                .await?
                .filter(|r| !authors.contains(&r.worker_id))
            {
                steps.push(review);
            }
        }

        if steps.len() < 2 {
            debug!(task_id = %task.id, "Task does not decompose into a collaboration");
            return Ok(None);
        }

        let share = task.estimated_effort.div_ceil(steps.len() as u32).max(1);
        for step in &mut steps {
            step.estimated_duration = share;
        }

        let plan = WorkflowPlan {
            task_id: task.id,
            steps,
        };
        info!(
            task_id = %task.id,
            steps = plan.steps.len(),
            workers = ?plan.workers(),
            "Collaboration planned"
        );
        Ok(Some(plan))
    }

    /// One group if a single worker covers every skill, else one per skill.
    async fn split_phase(&self, task: &Task, skills: &BTreeSet<String>) -> Result<Vec<BTreeSet<String>>> {
        if skills.len() <= 1 {
            return Ok(vec![skills.clone()]);
        }
        let candidates = self.coordinator.rank_scoped(task, skills, 0).await?;
        let covered = candidates
            .iter()
            .any(|c| skills.iter().all(|s| c.worker.skill_set.contains(s)));
        if covered {
            Ok(vec![skills.clone()])
        } else {
            Ok(skills.iter().map(|s| BTreeSet::from([s.clone()])).collect())
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn staff(
        &self,
        task: &Task,
        phase: Phase,
        skills: BTreeSet<String>,
        dependencies: &[usize],
        avoid: &[String],
        index: usize,
        parallel: bool,
    ) -> Result<Option<WorkflowStep>> {
        let covering = if skills.len() > 1 {
            self.coordinator
                .rank_scoped(task, &skills, 0)
                .await?
                .into_iter()
                .find(|c| skills.iter().all(|s| c.worker.skill_set.contains(s)) && !avoid.contains(&c.worker.id))
        } else {
            None
        };
        let selected = match covering {
            Some(candidate) => Ok(Assignment {
                task_id: task.id,
                worker_id: candidate.worker.id.clone(),
                score: candidate.score,
                timestamp: Utc::now(),
                rationale: candidate.rationale(task),
            }),
            None => self.coordinator.select_for_step(task, &skills, 0, avoid).await,
        };
        let assignment = match selected {
            Ok(a) => a,
            Err(e) if e.is_unassignable() => {
                debug!(task_id = %task.id, ?skills, "No worker for step");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mode = match (phase, parallel, dependencies.is_empty()) {
            (Phase::Verify, _, _) => StepMode::Review,
            (_, true, _) => StepMode::Parallel,
            _ => StepMode::Sequential,
        };
        let objective = if skills.is_empty() {
            format!("{} {}", phase.verb(), task.title)
        } else {
            format!(
                "{} {} ({})",
                phase.verb(),
                task.title,
                skills.iter().cloned().collect::<Vec<_>>().join(", ")
            )
        };

        Ok(Some(WorkflowStep {
            index,
            worker_id: assignment.worker_id.clone(),
            objective,
            skills,
            dependencies: dependencies.to_vec(),
            estimated_duration: 0,
            mode,
            retryable: phase != Phase::Verify,
            assignment,
        }))
    }
}
