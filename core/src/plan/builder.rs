//! Execution plans: which run goes to which slot.
//!
//! Run IDs `0..repeats` are dealt round-robin over `parallelism` slots, so
//! slot `i` gets `i, i + P, i + 2P, ...`. Operators read monitor output by
//! this correspondence, so the order is fixed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::control::tags;
use crate::error::PlanError;
use crate::logsync::StreamKind;

/// Installs the project's Python requirements when there are any.
pub const DEFAULT_SETUP_COMMAND: &str =
    "if [ -f requirements.txt ]; then pip install -r requirements.txt; fi";

/// Instance tag values are capped by the provider.
const TAG_VALUE_MAX: usize = 255;


// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Runs once, before any slot starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupStep {
    pub command: String,
}

impl Default for SetupStep {
    fn default() -> Self {
        SetupStep {
            command: DEFAULT_SETUP_COMMAND.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPlan {
    pub slot: u32,
    /// Run IDs in execution order.
    pub run_ids: Vec<u32>,
}

/// The blueprint for one machine. Pure data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub command: String,
    pub repeats: u32,
    pub parallelism: u32,
    pub setup: SetupStep,
    pub slots: Vec<SlotPlan>,
}


// ---------------------------------------------------------------------------
// build
// ---------------------------------------------------------------------------

/// Build a plan for `repeats` runs of `command` over `parallelism` slots.
pub fn build(command: &str, repeats: u32, parallelism: u32) -> Result<ExecutionPlan, PlanError> {
    if command.trim().is_empty() {
        return Err(invalid("command is empty"));
    }
    if repeats == 0 {
        return Err(invalid("repeats must be at least 1"));
    }
    if parallelism == 0 {
        return Err(invalid("parallelism must be at least 1"));
    }
    if parallelism > repeats {
        return Err(invalid(&format!(
            "parallelism {} exceeds repeats {}: more slots than runs",
            parallelism, repeats
        )));
    }

    let slots = (0..parallelism)
        .map(|slot| SlotPlan {
            slot,
            run_ids: (slot..repeats).step_by(parallelism as usize).collect(),
        })
        .collect();

    Ok(ExecutionPlan {
        command: command.to_string(),
        repeats,
        parallelism,
        setup: SetupStep::default(),
        slots,
    })
}

fn invalid(reason: &str) -> PlanError {
    PlanError::InvalidPlan {
        reason: reason.to_string(),
    }
}

impl ExecutionPlan {
    /// Replace the setup step's command.
    pub fn with_setup(mut self, command: &str) -> Self {
        self.setup = SetupStep {
            command: command.to_string(),
        };
        self
    }

    /// Slot that executes `run`, if the run is part of the plan.
    pub fn slot_of(&self, run: u32) -> Option<u32> {
        if run >= self.repeats {
            return None;
        }
        Some(run % self.parallelism)
    }

    /// Every log stream a machine running this plan will produce.
    pub fn expected_streams(&self) -> Vec<StreamKind> {
        let mut streams = vec![StreamKind::Setup];
        for slot in &self.slots {
            for &run in &slot.run_ids {
                streams.push(StreamKind::Run {
                    slot: slot.slot,
                    run,
                });
            }
        }
        streams
    }

    /// Instance tags that let a restarted monitor rebuild this plan.
    pub fn to_tags(&self) -> Vec<(String, String)> {
        vec![
            (tags::REPEATS.to_string(), self.repeats.to_string()),
            (tags::PARALLELISM.to_string(), self.parallelism.to_string()),
            (tags::COMMAND.to_string(), truncate(&self.command, TAG_VALUE_MAX)),
        ]
    }

    /// Rebuild a plan from instance tags. `None` if the tags are missing or
    /// do not describe a valid plan. The command may come back truncated.
    pub fn from_tags(tag_map: &BTreeMap<String, String>) -> Option<ExecutionPlan> {
        let repeats = tag_map.get(tags::REPEATS)?.parse().ok()?;
        let parallelism = tag_map.get(tags::PARALLELISM)?.parse().ok()?;
        let command = tag_map
            .get(tags::COMMAND)
            .map(String::as_str)
            .unwrap_or("?");
        build(command, repeats, parallelism).ok()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_runs_two_slots() {
        let plan = build("echo hi", 3, 2).unwrap();
        assert_eq!(plan.slots.len(), 2);
        assert_eq!(plan.slots[0].run_ids, vec![0, 2]);
        assert_eq!(plan.slots[1].run_ids, vec![1]);
    }

    #[test]
    fn round_robin_assignment_is_exact() {
        for repeats in 1..=12u32 {
            for parallelism in 1..=repeats {
                let plan = build("x", repeats, parallelism).unwrap();
                let mut seen = vec![0u32; repeats as usize];
                for slot in &plan.slots {
                    let expected: Vec<u32> = (0..)
                        .map(|k| slot.slot + k * parallelism)
                        .take_while(|&id| id < repeats)
                        .collect();
                    assert_eq!(slot.run_ids, expected, "r={repeats} p={parallelism}");
                    for &id in &slot.run_ids {
                        seen[id as usize] += 1;
                        assert_eq!(plan.slot_of(id), Some(slot.slot));
                    }
                }
                assert!(seen.iter().all(|&n| n == 1));
            }
        }
    }

    #[test]
    fn zero_repeats_is_invalid() {
        assert!(matches!(
            build("echo", 0, 1),
            Err(PlanError::InvalidPlan { .. })
        ));
    }

    #[test]
    fn more_slots_than_runs_is_invalid() {
        assert!(matches!(
            build("echo", 3, 5),
            Err(PlanError::InvalidPlan { .. })
        ));
    }

    #[test]
    fn zero_parallelism_and_empty_command_are_invalid() {
        assert!(build("echo", 3, 0).is_err());
        assert!(build("   ", 1, 1).is_err());
    }

    #[test]
    fn setup_step_is_embedded_once() {
        let plan = build("python run.py", 4, 2).unwrap().with_setup("make deps");
        assert_eq!(plan.setup.command, "make deps");
        let streams = plan.expected_streams();
        assert_eq!(streams.len(), 5);
        assert_eq!(streams[0], StreamKind::Setup);
        assert_eq!(
            streams.iter().filter(|s| **s == StreamKind::Setup).count(),
            1
        );
        assert!(streams.contains(&StreamKind::Run { slot: 1, run: 3 }));
    }

    #[test]
    fn tags_round_trip_to_the_same_assignment() {
        let plan = build("python run.py --lr 0.1", 5, 2).unwrap();
        let tag_map: BTreeMap<String, String> = plan.to_tags().into_iter().collect();
        let rebuilt = ExecutionPlan::from_tags(&tag_map).unwrap();
        assert_eq!(rebuilt.slots, plan.slots);
        assert_eq!(rebuilt.command, plan.command);
    }

    #[test]
    fn missing_tags_give_no_plan() {
        let mut tag_map = BTreeMap::new();
        tag_map.insert(tags::REPEATS.to_string(), "3".to_string());
        assert!(ExecutionPlan::from_tags(&tag_map).is_none());
        tag_map.insert(tags::PARALLELISM.to_string(), "9".to_string());
        assert!(ExecutionPlan::from_tags(&tag_map).is_none());
    }

    #[test]
    fn long_commands_are_truncated_in_tags() {
        let command = "é".repeat(200);
        let plan = build(&command, 1, 1).unwrap();
        let tag_map: BTreeMap<String, String> = plan.to_tags().into_iter().collect();
        assert!(tag_map[tags::COMMAND].len() <= TAG_VALUE_MAX);
    }
}
