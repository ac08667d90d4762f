//! Render-queue ordering.
//!
//! The queue is a flat list of `(shot, workflow)` pairs consumed strictly in
//! order by the render engine; only one task is in flight at a time.

use serde::{Deserialize, Serialize};

use crate::shot::Shot;
use crate::types::{ShotIndex, WorkflowIndex};

/// Traversal order of the selected shots and their workflows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Every workflow of a shot before moving to the next shot.
    PerShot,
    /// Workflow N of every shot before workflow N+1 of any shot.
    #[default]
    PerWorkflow,
}

/// One unit of dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderTask {
    pub shot_index: ShotIndex,
    pub workflow_index: WorkflowIndex,
}

impl RenderTask {
    pub fn new(shot_index: ShotIndex, workflow_index: WorkflowIndex) -> Self {
        Self {
            shot_index,
            workflow_index,
        }
    }
}

/// Expand a shot selection into the ordered list of enabled workflow runs.
///
/// Selection indices past the end of `shots` are skipped.
pub fn build_queue(shots: &[Shot], selection: &[ShotIndex], mode: RenderMode) -> Vec<RenderTask> {
    let selected: Vec<(ShotIndex, &Shot)> = selection
        .iter()
        .filter_map(|&i| shots.get(i).map(|s| (i, s)))
        .collect();

    match mode {
        RenderMode::PerShot => selected
            .iter()
            .flat_map(|(si, shot)| {
                shot.workflows
                    .iter()
                    .enumerate()
                    .filter(|(_, wf)| wf.enabled)
                    .map(move |(wi, _)| RenderTask::new(*si, wi))
            })
            .collect(),
        RenderMode::PerWorkflow => {
            let max = selected
                .iter()
                .map(|(_, s)| s.workflows.len())
                .max()
                .unwrap_or(0);
            let mut tasks = Vec::new();
            for wi in 0..max {
                for (si, shot) in &selected {
                    if shot.workflows.get(wi).is_some_and(|wf| wf.enabled) {
                        tasks.push(RenderTask::new(*si, wi));
                    }
                }
            }
            tasks
        }
    }
}

/// Queue for "render all": every shot, ordered per workflow.
pub fn render_all_queue(shots: &[Shot]) -> Vec<RenderTask> {
    let all: Vec<ShotIndex> = (0..shots.len()).collect();
    build_queue(shots, &all, RenderMode::PerWorkflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shot::WorkflowAssignment;

    fn shot(enabled: &[bool]) -> Shot {
        let mut s = Shot::new("s");
        for (i, &on) in enabled.iter().enumerate() {
            let mut wf = WorkflowAssignment::new(format!("wf{i}.json"), false);
            wf.enabled = on;
            s.workflows.push(wf);
        }
        s
    }

    fn pairs(tasks: &[RenderTask]) -> Vec<(usize, usize)> {
        tasks.iter().map(|t| (t.shot_index, t.workflow_index)).collect()
    }

    #[test]
    fn per_shot_order() {
        let shots = vec![shot(&[true, true]), shot(&[true, false, true])];
        let q = build_queue(&shots, &[0, 1], RenderMode::PerShot);
        assert_eq!(pairs(&q), vec![(0, 0), (0, 1), (1, 0), (1, 2)]);
    }

    #[test]
    fn per_workflow_order() {
        let shots = vec![shot(&[true, true]), shot(&[true, false, true])];
        let q = build_queue(&shots, &[0, 1], RenderMode::PerWorkflow);
        assert_eq!(pairs(&q), vec![(0, 0), (1, 0), (0, 1), (1, 2)]);
    }

    #[test]
    fn selection_order_and_bounds() {
        let shots = vec![shot(&[true]), shot(&[true])];
        let q = build_queue(&shots, &[1, 7, 0], RenderMode::PerShot);
        assert_eq!(pairs(&q), vec![(1, 0), (0, 0)]);
    }

    #[test]
    fn render_all_uses_per_workflow() {
        let shots = vec![shot(&[true, true]), shot(&[true])];
        assert_eq!(pairs(&render_all_queue(&shots)), vec![(0, 0), (1, 0), (0, 1)]);
        assert!(render_all_queue(&[]).is_empty());
    }
}
