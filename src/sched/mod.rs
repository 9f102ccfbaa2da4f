// src/sched/mod.rs — scheduler core
//
// The scheduler owns the three task queues (scheduled, active, history), the
// device registry, the per-device channel-occupancy table, and the
// sample-id↔number bijection. Producers talk to it from caller threads; the
// background driver is the only caller of execute_one/update_active. Every
// queue carries its own lock, everything else lives behind the scheduler
// lock, and device I/O never happens under that lock.

mod channels;
mod collect;
mod dispatch;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::device::{create_device, known_device_type, Device};
use crate::error::{Error, Result};
use crate::status::Status;
use crate::store::TaskStore;
use crate::task::{compute_priority, Task, TaskType};

const SCHEDULED_DB: &str = "priority_queue.sqlite3";
const ACTIVE_DB: &str = "active_queue.sqlite3";
const HISTORY_DB: &str = "history_queue.sqlite3";
const CHANNEL_PO_FILE: &str = "channel_po.json";

/// A channel-occupancy slot: which task's sample physically sits in the
/// channel, independent of whether the device is currently executing.
/// Occupants reference tasks by id (the tasks themselves live in the active
/// or history queue); sample number and priority ride along because every
/// occupancy decision needs them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occupant {
    pub task_id: Uuid,
    pub sample_number: u64,
    pub priority: f64,
}

/// Registry entry produced by a collected `init` task.
pub struct DeviceEntry {
    pub device: Arc<Mutex<Box<dyn Device>>>,
    pub device_type: String,
    pub device_address: Option<String>,
    pub sample_mixing: bool,
}

pub(crate) struct SchedState {
    pub devices: HashMap<String, DeviceEntry>,
    pub channel_po: HashMap<String, Vec<Option<Occupant>>>,
    pub sample_id_to_number: HashMap<Uuid, u64>,
    /// Recently cancelled tasks; resubmission recovers the original priority
    /// from here once a task left the queues.
    pub cancelled: HashMap<Uuid, Task>,
    pub paused: bool,
    pub dependency_stalls: u64,
}

/// Which queue a task currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Scheduled,
    Active,
    History,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusReport {
    pub queue: QueueName,
    pub submission_response: Option<String>,
    pub subtasks_submission_response: Vec<Option<String>>,
}

pub struct Scheduler {
    storage_path: PathBuf,
    pub(crate) queue: TaskStore,
    pub(crate) active: TaskStore,
    pub(crate) history: TaskStore,
    pub(crate) state: Mutex<SchedState>,
    pub(crate) device_timeout: Duration,
}

impl Scheduler {
    /// Opens the three queues under `storage_path`, rebuilds the
    /// sample-id↔number map from their union, and reloads the persisted
    /// channel-occupancy table. Tasks found in the active queue are treated
    /// as still active and picked up by the next polling pass.
    pub fn new(storage_path: impl Into<PathBuf>, device_timeout: Duration) -> Result<Scheduler> {
        let storage_path = storage_path.into();
        fs::create_dir_all(&storage_path)?;

        let queue = TaskStore::open(&storage_path.join(SCHEDULED_DB))?;
        let active = TaskStore::open(&storage_path.join(ACTIVE_DB))?;
        let history = TaskStore::open(&storage_path.join(HISTORY_DB))?;

        let mut sample_id_to_number = HashMap::new();
        for task in queue
            .get_all()?
            .into_iter()
            .chain(active.get_all()?)
            .chain(history.get_all()?)
        {
            if let (Some(id), Some(n)) = (task.sample_id, task.sample_number) {
                sample_id_to_number.insert(id, n);
            }
        }

        let channel_po = load_channel_po(&storage_path.join(CHANNEL_PO_FILE));

        let scheduler = Scheduler {
            storage_path,
            queue,
            active,
            history,
            state: Mutex::new(SchedState {
                devices: HashMap::new(),
                channel_po,
                sample_id_to_number,
                cancelled: HashMap::new(),
                paused: false,
                dependency_stalls: 0,
            }),
            device_timeout,
        };
        scheduler.store_channel_po(&scheduler.state_lock())?;
        Ok(scheduler)
    }

    pub(crate) fn state_lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().expect("scheduler lock poisoned")
    }

    /// Puts a task into the scheduled queue. Resolves the sample identity
    /// against the bijection, computes the priority if unset, and rejects
    /// submissions that contradict earlier ones.
    pub fn queue_put(&self, mut task: Task) -> Result<(Uuid, u64, String)> {
        if task.tasks.is_empty() {
            return Err(Error::Rejected(
                "Task not submitted. Task carries no sub-tasks.".into(),
            ));
        }
        if task.task_type == TaskType::None {
            return Err(Error::Rejected("Task not submitted. Unknown task type.".into()));
        }
        if task.task_type == TaskType::Init {
            let known = task.tasks[0]
                .device_type
                .as_deref()
                .map_or(false, known_device_type);
            if !known {
                return Err(Error::Rejected("Task not submitted. Unknown device type.".into()));
            }
        }

        {
            let mut state = self.state_lock();
            let (sample_id, sample_number) =
                resolve_sample_identity(&state, &task).map_err(Error::Rejected)?;
            state.sample_id_to_number.insert(sample_id, sample_number);
            task.sample_id = Some(sample_id);
            task.sample_number = Some(sample_number);
            if task.priority.is_none() {
                task.priority = Some(compute_priority(sample_number));
            }
        }

        self.queue.put(&task)?;
        let sample_number = task.sample_number.unwrap_or_default();
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            sample_number,
            "task enqueued"
        );
        Ok((task.id, sample_number, "Task successfully enqueued.".into()))
    }

    /// Removes a task from the scheduled queue; with `include_active` also
    /// from the active queue. A dispatched command is never rescinded at the
    /// instrument. `drop_material` additionally clears any occupancy slot
    /// referencing the task.
    pub fn queue_cancel(
        &self,
        task_id: Uuid,
        include_active: bool,
        drop_material: bool,
    ) -> Result<Option<Task>> {
        let mut found = self.queue.get_task_by_id(task_id)?;
        if found.is_some() {
            self.queue.remove(task_id)?;
        } else if include_active {
            found = self.active.get_task_by_id(task_id)?;
            if found.is_some() {
                self.active.remove(task_id)?;
            }
        }

        if let Some(task) = &found {
            let mut state = self.state_lock();
            if drop_material {
                for slots in state.channel_po.values_mut() {
                    for slot in slots.iter_mut() {
                        if slot.as_ref().map(|o| o.task_id) == Some(task_id) {
                            *slot = None;
                        }
                    }
                }
                self.store_channel_po(&state)?;
            }
            state.cancelled.insert(task_id, task.clone());
            info!(task_id = %task_id, include_active, drop_material, "task cancelled");
        }
        Ok(found)
    }

    /// Re-enqueues a replacement under an existing task id. The replacement
    /// keeps the original's priority and sample binding, so it slots back
    /// into the exact queue position the original held.
    pub fn resubmit(&self, task_id: Uuid, replacement: Option<Task>) -> Result<(Uuid, u64, String)> {
        if let Some(original) = self.queue.get_task_by_id(task_id)? {
            let task = merge_replacement(&original, replacement, task_id);
            self.queue.replace(&task)?;
            return Ok((
                task_id,
                task.sample_number.unwrap_or_default(),
                "Task successfully resubmitted.".into(),
            ));
        }

        let stashed = self.state_lock().cancelled.get(&task_id).cloned();
        match stashed {
            Some(original) => {
                let task = merge_replacement(&original, replacement, task_id);
                self.queue.put(&task)?;
                Ok((
                    task_id,
                    task.sample_number.unwrap_or_default(),
                    "Task successfully resubmitted.".into(),
                ))
            }
            None => Err(Error::Rejected(
                "Task not resubmitted. Unknown task id.".into(),
            )),
        }
    }

    /// Snapshot of the scheduled queue, highest priority first.
    pub fn queue_inspect(&self) -> Result<Vec<Task>> {
        self.queue.get_all()
    }

    /// Snapshot of the active queue.
    pub fn active_inspect(&self) -> Result<Vec<Task>> {
        self.active.get_all()
    }

    /// Snapshot of the history queue.
    pub fn history_inspect(&self) -> Result<Vec<Task>> {
        self.history.get_all()
    }

    /// Reports which queue holds the task and its accumulated responses.
    pub fn task_status(&self, task_id: Uuid) -> Result<Option<TaskStatusReport>> {
        let stores = [
            (&self.queue, QueueName::Scheduled),
            (&self.active, QueueName::Active),
            (&self.history, QueueName::History),
        ];
        for (store, queue) in stores {
            if let Some(task) = store.get_task_by_id(task_id)? {
                return Ok(Some(TaskStatusReport {
                    queue,
                    submission_response: task.md_str("submission_response").map(str::to_string),
                    subtasks_submission_response: task
                        .tasks
                        .iter()
                        .map(|sub| {
                            sub.md
                                .get("submission_response")
                                .and_then(Value::as_str)
                                .map(str::to_string)
                        })
                        .collect(),
                }));
            }
        }
        Ok(None)
    }

    /// Clears the scheduled and active queues, zeroes the occupancy table,
    /// and forgets the sample bindings. History is never deleted.
    pub fn reset(&self) -> Result<()> {
        self.queue.clear()?;
        self.active.clear()?;
        let mut state = self.state_lock();
        for slots in state.channel_po.values_mut() {
            for slot in slots.iter_mut() {
                *slot = None;
            }
        }
        state.sample_id_to_number.clear();
        state.cancelled.clear();
        self.store_channel_po(&state)?;
        info!("scheduler reset");
        Ok(())
    }

    /// `reset` plus clearing the device registry; the next run starts from
    /// fresh inits.
    pub fn restart(&self) -> Result<()> {
        self.reset()?;
        let mut state = self.state_lock();
        state.devices.clear();
        state.channel_po.clear();
        self.store_channel_po(&state)?;
        info!("scheduler restart");
        Ok(())
    }

    /// Gates dispatch only; completion polling continues while paused.
    pub fn pause(&self) {
        self.state_lock().paused = true;
        info!("dispatch paused");
    }

    pub fn resume(&self) {
        self.state_lock().paused = false;
        info!("dispatch resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.state_lock().paused
    }

    /// Times the dispatch cycle was abandoned on an unresolved dependency.
    pub fn dependency_stalls(&self) -> u64 {
        self.state_lock().dependency_stalls
    }

    /// True once both the scheduled and active queues have drained.
    pub fn drained(&self) -> Result<bool> {
        Ok(self.queue.empty()? && self.active.empty()?)
    }

    /// Copy of a device's occupancy slots, for operators and tests.
    pub fn channel_occupancy(&self, device_name: &str) -> Option<Vec<Option<Occupant>>> {
        self.state_lock().channel_po.get(device_name).cloned()
    }

    pub fn sample_number_for(&self, sample_id: Uuid) -> Option<u64> {
        self.state_lock().sample_id_to_number.get(&sample_id).copied()
    }

    /// Registers the device described by an init sub-task. Called from init
    /// pre-processing; rejects unknown device types.
    pub(crate) fn register_device(&self, task: &Task) -> std::result::Result<String, String> {
        if task.tasks.len() != 1 {
            return Err("Init tasks carry exactly one sub-task.".into());
        }
        let sub = &task.tasks[0];
        let Some(device_type) = sub.device_type.as_deref() else {
            return Err("Unknown device type.".into());
        };
        let Some(device) = create_device(
            device_type,
            &sub.device,
            sub.device_address.as_deref(),
            sub.simulated,
            self.device_timeout,
        ) else {
            return Err("Unknown device type.".into());
        };

        let mut state = self.state_lock();
        state.devices.insert(
            sub.device.clone(),
            DeviceEntry {
                device: Arc::new(Mutex::new(device)),
                device_type: device_type.to_string(),
                device_address: sub.device_address.clone(),
                sample_mixing: sub.sample_mixing,
            },
        );
        debug!(device = %sub.device, device_type, "device registered");
        Ok("Success.".into())
    }

    pub(crate) fn device_handle(&self, name: &str) -> Option<Arc<Mutex<Box<dyn Device>>>> {
        self.state_lock().devices.get(name).map(|e| e.device.clone())
    }

    /// One atomic status snapshot from a device, taken outside the
    /// scheduler lock.
    pub(crate) fn device_snapshot(&self, name: &str) -> Option<(Status, Status, Vec<Status>)> {
        let handle = self.device_handle(name)?;
        let device = handle.lock().expect("device lock poisoned");
        Some(device.get_device_and_channel_status())
    }

    /// Serializes the occupancy table; called after every mutation.
    pub(crate) fn store_channel_po(&self, state: &SchedState) -> Result<()> {
        let serialized = serde_json::to_string_pretty(&state.channel_po)?;
        fs::write(self.storage_path.join(CHANNEL_PO_FILE), serialized)?;
        Ok(())
    }
}

fn load_channel_po(path: &Path) -> HashMap<String, Vec<Option<Occupant>>> {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

/// Admission-time resolution of (sample_id, sample_number) against the
/// bijection. Any contradiction with an earlier submission rejects the task.
fn resolve_sample_identity(
    state: &SchedState,
    task: &Task,
) -> std::result::Result<(Uuid, u64), String> {
    let map = &state.sample_id_to_number;
    const MISMATCH: &str = "Task not submitted. Sample number and ID do not match previous submission.";

    match (task.sample_id, task.sample_number) {
        (Some(id), Some(n)) => match map.get(&id) {
            Some(&bound) if bound != n => Err(MISMATCH.into()),
            Some(_) => Ok((id, n)),
            None => {
                if map.values().any(|&v| v == n) {
                    Err(MISMATCH.into())
                } else {
                    Ok((id, n))
                }
            }
        },
        (Some(id), None) => {
            let n = match map.get(&id) {
                Some(&bound) => bound,
                None => map.values().max().map_or(1, |&hi| hi + 1),
            };
            Ok((id, n))
        }
        (None, number) => {
            // no id given; the sample number defaults to 1
            let n = number.unwrap_or(1);
            let id = map
                .iter()
                .find(|(_, &v)| v == n)
                .map(|(&id, _)| id)
                .unwrap_or_else(Uuid::new_v4);
            Ok((id, n))
        }
    }
}

/// Builds the resubmission task: the replacement's content under the
/// original's id, priority, and sample binding.
fn merge_replacement(original: &Task, replacement: Option<Task>, task_id: Uuid) -> Task {
    let mut task = replacement.unwrap_or_else(|| original.clone());
    task.id = task_id;
    task.priority = original.priority;
    task.sample_id = original.sample_id;
    task.sample_number = original.sample_number;
    task
}
