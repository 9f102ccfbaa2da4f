// src/sched/collect.rs — completion polling and post-processing
//
// update_active walks the active queue, asks each instrument whether the
// dispatched work finished, and moves completed tasks to history while
// updating the channel-occupancy table. A failed status query or data
// readout keeps the task active with an annotated response; it is retried on
// every pass until an operator intervenes.

use tracing::{error, info};

use crate::error::Result;
use crate::status::Status;
use crate::task::{Task, TaskType};

use super::{Occupant, Scheduler};

impl Scheduler {
    /// Polls all active tasks and collects the completed ones. Returns
    /// whether anything was collected.
    pub fn update_active(&self) -> bool {
        let tasks = match self.active.get_all() {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "active queue retrieval failed");
                return false;
            }
        };

        let mut collected = false;
        for mut task in tasks {
            if self.check_task(&mut task) {
                match self.post_process_task(&mut task) {
                    Ok(true) => collected = true,
                    Ok(false) => {}
                    Err(e) => error!(task_id = %task.id, error = %e, "post-processing failed"),
                }
            } else {
                // keep the annotated waiting state visible
                if let Err(e) = self.active.replace(&task) {
                    error!(task_id = %task.id, error = %e, "active queue update failed");
                }
            }
        }
        collected
    }

    /// True once every sub-task's device (or named channel) reports ready
    /// again. Sub-tasks already flagged as finished are not re-queried.
    fn check_task(&self, task: &mut Task) -> bool {
        let mut completed = true;
        for i in 0..task.tasks.len() {
            let already_done = task.tasks[i]
                .md
                .get("execution_response")
                .and_then(serde_json::Value::as_str)
                .map_or(false, |s| s.contains("Success."));
            if already_done {
                continue;
            }

            let device_name = task.tasks[i].device.clone();
            let Some((request, device_status, channel_status)) = self.device_snapshot(&device_name)
            else {
                task.tasks[i].set_md("execution_response", "Unknown device.");
                task.set_md("execution_response", "Waiting. Unknown device.");
                completed = false;
                continue;
            };
            if request != Status::Success {
                task.tasks[i].set_md(
                    "execution_response",
                    format!("Status request unsuccessful with response: {request}."),
                );
                task.set_md("execution_response", "Waiting. Status request unsuccessful.");
                completed = false;
                continue;
            }

            let done = match task.tasks[i].channel {
                // channel-less sub-task, e.g. init
                None => device_status.is_ready(),
                // a channel is collected once it idles, even while the
                // device itself is still busy elsewhere
                Some(channel) => channel_status
                    .get(channel)
                    .copied()
                    .map_or(false, Status::is_ready),
            };
            if !done {
                task.tasks[i].set_md(
                    "execution_response",
                    format!("Not finished. Device status: {device_status}."),
                );
                task.set_md("execution_response", "Waiting. Not finished.");
                completed = false;
                continue;
            }
            task.tasks[i].set_md("execution_response", "Success.");
        }

        if completed {
            task.set_md("execution_response", "Success.");
        }
        completed
    }

    /// Type-specific bookkeeping for a finished task, then the move from
    /// the active to the history queue. Measurement readout failures keep
    /// the task active.
    fn post_process_task(&self, task: &mut Task) -> Result<bool> {
        match task.task_type {
            TaskType::Init => {
                let Some(sub) = task.first() else {
                    return Ok(false);
                };
                let number_of_channels = self
                    .device_handle(&sub.device)
                    .map(|handle| {
                        handle
                            .lock()
                            .expect("device lock poisoned")
                            .number_of_channels()
                    })
                    .unwrap_or(1);
                let mut state = self.state_lock();
                state
                    .channel_po
                    .insert(sub.device.clone(), vec![None; number_of_channels]);
            }

            TaskType::Measure => {
                if !self.collect_measurement(task)? {
                    return Ok(false);
                }
            }

            TaskType::Prepare => {
                if let Some(channel) = task.tasks[0].channel {
                    self.set_occupant(
                        &task.tasks[0].device.clone(),
                        channel,
                        Some(Occupant {
                            task_id: task.id,
                            sample_number: task.sample_number.unwrap_or_default(),
                            priority: task.priority.unwrap_or_default(),
                        }),
                    )?;
                }
            }

            TaskType::Transfer => {
                // material leaves the source slot and arrives at the target
                let source = task.first().map(|s| (s.device.clone(), s.channel));
                let target = task.last().map(|s| (s.device.clone(), s.channel));
                if let Some((device, Some(channel))) = source {
                    if let Some(prior) = self.occupant(&device, channel) {
                        task.task_history.push(prior.task_id);
                        self.set_occupant(&device, channel, None)?;
                    }
                }
                if let Some((device, Some(channel))) = target {
                    self.set_occupant(
                        &device,
                        channel,
                        Some(Occupant {
                            task_id: task.id,
                            sample_number: task.sample_number.unwrap_or_default(),
                            priority: task.priority.unwrap_or_default(),
                        }),
                    )?;
                }
            }

            TaskType::Nochannel | TaskType::Shutdown | TaskType::None => {}
        }

        task.set_md("execution_response", "Success.");
        self.active.remove(task.id)?;
        self.history.put(task)?;
        {
            let state = self.state_lock();
            self.store_channel_po(&state)?;
        }
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            sample_number = task.sample_number,
            "task collected"
        );
        Ok(true)
    }

    /// Reads the measurement data and makes the task the occupant of its
    /// channel, keeping a trail to the prior occupant in the task history.
    /// Returns false (task stays active) when the device cannot be read.
    fn collect_measurement(&self, task: &mut Task) -> Result<bool> {
        let device_name = task.tasks[0].device.clone();

        let Some((request, device_status, _)) = self.device_snapshot(&device_name) else {
            task.set_md(
                "execution_response",
                format!("Cannot get status from device {device_name}. Cannot read out data."),
            );
            self.active.replace(task)?;
            return Ok(false);
        };
        if request != Status::Success {
            task.set_md(
                "execution_response",
                format!("Cannot get status from device {device_name}. Cannot read out data."),
            );
            self.active.replace(task)?;
            return Ok(false);
        }
        if !device_status.is_ready() {
            task.set_md(
                "execution_response",
                format!("Device {device_name} busy or down. Cannot read out data."),
            );
            self.active.replace(task)?;
            return Ok(false);
        }

        let channel = task.tasks[0].channel;
        let (read_status, data) = match self.device_handle(&device_name) {
            Some(handle) => {
                let device = handle.lock().expect("device lock poisoned");
                device.read(channel.unwrap_or(0))
            }
            None => (Status::Error, serde_json::Value::Null),
        };
        if read_status != Status::Success {
            task.set_md(
                "execution_response",
                format!("Failure reading measurement data from device {device_name}."),
            );
            self.active.replace(task)?;
            return Ok(false);
        }

        task.tasks[0].set_md("measurement_data", data);
        if let Some(channel) = channel {
            if let Some(prior) = self.occupant(&device_name, channel) {
                task.task_history.push(prior.task_id);
            }
            self.set_occupant(
                &device_name,
                channel,
                Some(Occupant {
                    task_id: task.id,
                    sample_number: task.sample_number.unwrap_or_default(),
                    priority: task.priority.unwrap_or_default(),
                }),
            )?;
        }
        Ok(true)
    }
}
