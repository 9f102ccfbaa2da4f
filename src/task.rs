// src/task.rs — task and sub-task model

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Free-form key/value metadata carried by tasks and sub-tasks. Submission and
/// execution responses accumulate here for observability.
pub type Metadata = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    None,
    Init,
    Prepare,
    Transfer,
    Measure,
    Nochannel,
    Shutdown,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::None => "none",
            TaskType::Init => "init",
            TaskType::Prepare => "prepare",
            TaskType::Transfer => "transfer",
            TaskType::Measure => "measure",
            TaskType::Nochannel => "nochannel",
            TaskType::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel-selection discipline a device was initialized with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    Reuse,
    New,
}

fn new_id() -> Uuid {
    Uuid::new_v4()
}

fn one_channel() -> usize {
    1
}

fn mixing_allowed() -> bool {
    true
}

/// One instrument-facing step of a task. All task types carry exactly one
/// sub-task except transfers, which carry one per device on the route.
/// `method_data` is routed to the instrument without interpretation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    #[serde(default = "new_id")]
    pub id: Uuid,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub channel: Option<usize>,
    #[serde(default)]
    pub method_data: Value,
    #[serde(default)]
    pub md: Metadata,

    // init tasks
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub device_address: Option<String>,
    #[serde(default)]
    pub channel_mode: Option<ChannelMode>,
    #[serde(default = "one_channel")]
    pub number_of_channels: usize,
    #[serde(default)]
    pub simulated: bool,
    #[serde(default = "mixing_allowed")]
    pub sample_mixing: bool,

    // measurement tasks
    #[serde(default)]
    pub acquisition_time: Option<f64>,

    // transfer tasks
    #[serde(default)]
    pub non_channel_storage: Option<String>,
}

impl Default for SubTask {
    fn default() -> Self {
        SubTask {
            id: Uuid::new_v4(),
            device: String::new(),
            channel: None,
            method_data: Value::Null,
            md: Metadata::new(),
            device_type: None,
            device_address: None,
            channel_mode: None,
            number_of_channels: 1,
            simulated: false,
            sample_mixing: true,
            acquisition_time: None,
            non_channel_storage: None,
        }
    }
}

impl SubTask {
    pub fn set_md(&mut self, key: &str, value: impl Into<Value>) {
        self.md.insert(key.to_string(), value.into());
    }
}

/// The unit of work submitted by a producer. Priority and the sample identity
/// fields may be left unset at submission time; admission resolves them. The
/// task history holds the ids of prior tasks that acted on the same material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default = "new_id")]
    pub id: Uuid,
    #[serde(default)]
    pub md: Metadata,
    #[serde(default)]
    pub priority: Option<f64>,
    #[serde(default)]
    pub sample_id: Option<Uuid>,
    #[serde(default)]
    pub sample_number: Option<u64>,
    #[serde(default)]
    pub dependency_id: Option<Uuid>,
    #[serde(default)]
    pub dependency_sample_number: Option<u64>,
    pub task_type: TaskType,
    #[serde(default)]
    pub tasks: Vec<SubTask>,
    #[serde(default)]
    pub task_history: Vec<Uuid>,
}

impl Task {
    pub fn new(task_type: TaskType, tasks: Vec<SubTask>) -> Self {
        Task {
            id: Uuid::new_v4(),
            md: Metadata::new(),
            priority: None,
            sample_id: None,
            sample_number: None,
            dependency_id: None,
            dependency_sample_number: None,
            task_type,
            tasks,
            task_history: Vec::new(),
        }
    }

    pub fn first(&self) -> Option<&SubTask> {
        self.tasks.first()
    }

    pub fn last(&self) -> Option<&SubTask> {
        self.tasks.last()
    }

    pub fn set_md(&mut self, key: &str, value: impl Into<Value>) {
        self.md.insert(key.to_string(), value.into());
    }

    pub fn md_str(&self, key: &str) -> Option<&str> {
        self.md.get(key).and_then(Value::as_str)
    }
}

/// Sub-second fraction of the submission instant, scaled below 1 so the
/// sample number always dominates the combined priority value.
fn submission_fraction() -> f64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    if now <= 0.0 {
        return 0.0;
    }
    now / 10f64.powf(now.log10().ceil())
}

/// Canonical priority encoding: lower sample numbers dominate, ties are
/// broken by earlier submission. Higher value wins.
pub fn compute_priority(sample_number: u64) -> f64 {
    -(sample_number as f64) - submission_fraction()
}
