/// ComfyUI node identifiers are the string keys of the workflow object.
pub type NodeId = String;

/// Index of a shot within a project's shot list.
pub type ShotIndex = usize;

/// Index of a workflow within a shot's workflow list.
pub type WorkflowIndex = usize;
