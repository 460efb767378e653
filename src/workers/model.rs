//! Worker capability profiles.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

fn default_active() -> bool {
    true
}

/// A capability-bearing executor that tasks are assigned to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub role: String,
    #[serde(default)]
    pub skill_set: BTreeSet<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Sum of estimated effort of the worker's non-terminal assigned tasks.
    #[serde(default)]
    pub current_load: u32,
    /// Largest load the worker accepts. Unset means the directory's default,
    /// or no bound when it has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
}

impl Worker {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            role: role.into(),
            skill_set: BTreeSet::new(),
            active: true,
            current_load: 0,
            capacity: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skill_set = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_load(mut self, load: u32) -> Self {
        self.current_load = load;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Whether `effort` more units fit under capacity.
    pub fn has_room_for(&self, effort: u32) -> bool {
        self.current_load
            .checked_add(effort)
            .is_some_and(|load| self.capacity.is_none_or(|capacity| load <= capacity))
    }

    /// Skills from `required` this worker has.
    pub fn matched_skills<'a>(&self, required: &'a BTreeSet<String>) -> Vec<&'a str> {
        required
            .iter()
            .filter(|s| self.skill_set.contains(*s))
            .map(String::as_str)
            .collect()
    }
}

/// Per-worker task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerWorkload {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}
