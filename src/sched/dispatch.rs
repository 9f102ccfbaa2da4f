// src/sched/dispatch.rs — dispatch cycle
//
// One call to execute_one walks the task-type bands in fixed order and tries
// to dispatch the highest-priority task whose sample is not blocked. An
// unresolved dependency or a route conflict with a non-mixing device ends
// the whole cycle; everything else blocks only the offending sample number
// for the rest of the cycle.

use chrono::Utc;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::status::Status;
use crate::task::{Task, TaskType};

use super::{Occupant, Scheduler};

const DISPATCH_BANDS: [&[TaskType]; 3] = [
    &[TaskType::Init],
    &[
        TaskType::Prepare,
        TaskType::Transfer,
        TaskType::Measure,
        TaskType::Nochannel,
    ],
    &[TaskType::Shutdown],
];

impl Scheduler {
    /// One dispatch attempt. Returns whether a task was handed to its
    /// instrument(s) and moved to the active queue.
    pub fn execute_one(&self) -> bool {
        let mut blocked: Vec<u64> = Vec::new();

        for band in DISPATCH_BANDS {
            loop {
                let candidate = match self.queue.get_and_remove_by_priority(band, false, &blocked) {
                    Ok(Some(task)) => task,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "queue retrieval failed");
                        return false;
                    }
                };

                // An unresolved dependency stops submission of this and all
                // lower-priority samples until the next cycle.
                if self.dependency_unresolved(&candidate) {
                    let mut state = self.state_lock();
                    state.dependency_stalls += 1;
                    debug!(
                        task_id = %candidate.id,
                        stalls = state.dependency_stalls,
                        "dispatch cycle ended on unresolved dependency"
                    );
                    return false;
                }

                if candidate.task_type != TaskType::Init
                    && candidate.task_type != TaskType::Shutdown
                {
                    match self.route_blocked(&candidate) {
                        Ok(false) => {}
                        Ok(true) => {
                            debug!(
                                task_id = %candidate.id,
                                sample_number = candidate.sample_number,
                                "dispatch cycle ended on non-mixing route conflict"
                            );
                            return false;
                        }
                        Err(e) => {
                            error!(error = %e, "route check failed");
                            return false;
                        }
                    }
                }

                let sample_number = candidate.sample_number.unwrap_or_default();
                match self.process_task(candidate) {
                    Ok(true) => return true,
                    Ok(false) => blocked.push(sample_number),
                    Err(e) => {
                        error!(error = %e, "task processing failed");
                        blocked.push(sample_number);
                    }
                }
            }
        }
        false
    }

    /// True while a task the candidate depends on is still scheduled.
    fn dependency_unresolved(&self, candidate: &Task) -> bool {
        if let Some(dep) = candidate.dependency_sample_number {
            let pending = self
                .queue
                .get_task_by_sample_number(dep)
                .unwrap_or_default()
                .iter()
                .any(|t| t.id != candidate.id);
            if pending {
                return true;
            }
        }
        if let Some(dep) = candidate.dependency_id {
            if dep != candidate.id {
                if let Ok(Some(_)) = self.queue.get_task_by_id(dep) {
                    return true;
                }
            }
        }
        false
    }

    /// Sample-mixing route check. Projects the sample's future device path
    /// and refuses dispatch while a non-mixing device on that path could
    /// end up holding more distinct samples than it has channels, counted
    /// over the span of currently scheduled sample numbers.
    fn route_blocked(&self, task: &Task) -> Result<bool> {
        let non_mixing: Vec<String> = {
            let state = self.state_lock();
            state
                .devices
                .iter()
                .filter(|(_, entry)| !entry.sample_mixing)
                .map(|(name, _)| name.clone())
                .collect()
        };
        if non_mixing.is_empty() {
            return Ok(false);
        }
        let (Some(first), Some(sample_number)) = (task.first(), task.sample_number) else {
            return Ok(false);
        };

        let path = self
            .queue
            .get_future_devices(sample_number, &first.device, first.channel)?;
        for (device, _channel) in path {
            if !non_mixing.contains(&device) {
                continue;
            }
            let Some(handle) = self.device_handle(&device) else {
                continue;
            };
            let number_of_channels = {
                let device = handle.lock().expect("device lock poisoned");
                device.number_of_channels()
            };
            match self.queue.get_lowest_sample_number()? {
                // queue empty apart from this task; safe to run
                None => break,
                Some(lowest) => {
                    let span = sample_number.saturating_sub(lowest);
                    if span > (number_of_channels as u64).saturating_sub(1) {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Runs the pre-submission checks and, if they pass, hands every
    /// sub-task to its instrument. On success the task moves from the
    /// scheduled to the active queue; on any failure it stays scheduled with
    /// an annotated response.
    pub(crate) fn process_task(&self, mut task: Task) -> Result<bool> {
        task.set_md("submission_response", "");
        for sub in &mut task.tasks {
            sub.set_md("submission_response", "");
        }

        // Devices must be reachable and ready before any further checks;
        // init is the exception since its device is not registered yet.
        if task.task_type != TaskType::Init {
            for i in 0..task.tasks.len() {
                let device_name = task.tasks[i].device.clone();
                let Some((request, device_status, channel_status)) =
                    self.device_snapshot(&device_name)
                else {
                    return self.park(task, i, "Unknown device.");
                };
                if request != Status::Success {
                    let response = format!(
                        "Could not get status from device. Request status: {request}."
                    );
                    return self.park(task, i, &response);
                }
                if !device_status.is_ready() {
                    let response = format!("Waiting. Device status is {device_status}.");
                    return self.park(task, i, &response);
                }
                if let Some(channel) = task.tasks[i].channel {
                    let status = channel_status
                        .get(channel)
                        .copied()
                        .unwrap_or(Status::Invalid);
                    if !status.is_ready() {
                        let response = format!("Waiting. Channel status is {status}.");
                        return self.park(task, i, &response);
                    }
                }
                task.tasks[i].set_md("submission_response", "Subtask passed pre-submission checks.");
            }
        }

        let pre_check = match task.task_type {
            TaskType::Init => self.register_device(&task),
            TaskType::Prepare => self.pre_process_prepare(&mut task),
            TaskType::Measure => self.pre_process_measure(&mut task),
            TaskType::Transfer => self.pre_process_transfer(&mut task),
            TaskType::Nochannel | TaskType::Shutdown => {
                Ok("Success. No check performed for this task type.".into())
            }
            TaskType::None => Err("Unknown task type.".into()),
        };
        match pre_check {
            Ok(response) => task.set_md("submission_response", response),
            Err(response) => {
                task.set_md("submission_response", response);
                self.queue.replace(&task)?;
                return Ok(false);
            }
        }

        // Last line of defense: never address a (device, channel) an active
        // task is still using. Catches same-sample overlap the occupancy
        // checks cannot see and transfers through passive devices.
        if self.active.find_interference(&task)? {
            task.set_md(
                "submission_response",
                "Waiting for ongoing task at device or channel to finish.",
            );
            self.queue.replace(&task)?;
            return Ok(false);
        }

        // Dispatch sends a command per sub-task and returns without waiting;
        // results are collected by update_active.
        task.set_md("execution_start_time", Utc::now().to_rfc3339());
        let mut dispatched = true;
        for i in 0..task.tasks.len() {
            let device_name = task.tasks[i].device.clone();
            let Some(handle) = self.device_handle(&device_name) else {
                dispatched = false;
                task.tasks[i].set_md("submission_device_response", "Unknown device.");
                continue;
            };
            let (status, response) = {
                let mut device = handle.lock().expect("device lock poisoned");
                device.execute_task(&task.tasks[i], task.task_type)
            };
            task.tasks[i].set_md("submission_device_response", response);
            if status != Status::Success {
                dispatched = false;
            }
        }

        if dispatched {
            task.set_md("submission_device_response", "Task successfully submitted.");
            self.active.put(&task)?;
            self.queue.remove(task.id)?;
            info!(
                task_id = %task.id,
                task_type = %task.task_type,
                sample_number = task.sample_number,
                "task dispatched"
            );
            Ok(true)
        } else {
            task.set_md(
                "submission_device_response",
                "Task failed at instrument. See sub-task data.",
            );
            self.queue.replace(&task)?;
            Ok(false)
        }
    }

    /// Annotates a failed pre-submission check on the sub-task and the task,
    /// then puts the task back for the next cycle.
    fn park(&self, mut task: Task, sub_index: usize, response: &str) -> Result<bool> {
        let full = format!(
            "{response}; device: {}; subtask: {}.",
            task.tasks[sub_index].device,
            sub_index + 1
        );
        task.tasks[sub_index].set_md("submission_response", full.clone());
        task.set_md("submission_response", full);
        self.queue.replace(&task)?;
        Ok(false)
    }

    fn pre_process_prepare(&self, task: &mut Task) -> std::result::Result<String, String> {
        if task.tasks.len() != 1 {
            return Err("Multiple preparations per task not supported.".into());
        }
        if !self.device_initialized(&task.tasks[0].device) {
            return Err("Device not initialized.".into());
        }
        if task.tasks[0].channel.is_some() {
            // preset channels are taken as-is
            return Ok("Success.".into());
        }
        let sample_number = task.sample_number.unwrap_or_default();
        self.select_channel(&mut task.tasks[0], sample_number)?;
        Ok("Success.".into())
    }

    fn pre_process_measure(&self, task: &mut Task) -> std::result::Result<String, String> {
        if task.tasks.len() != 1 {
            return Err("Multiple measurements per task not supported.".into());
        }
        let sample_number = task.sample_number.unwrap_or_default();
        let priority = task.priority.unwrap_or_default();
        let task_id = task.id;
        let sub = &mut task.tasks[0];

        if !self.device_initialized(&sub.device) {
            return Err("Device not initialized.".into());
        }
        if sub.non_channel_storage.is_some() && sub.channel.is_some() {
            return Err("Channel and non-channel storage simultaneously provided.".into());
        }

        if let Some(channel) = sub.channel {
            let len = self.occupancy_len(&sub.device).unwrap_or(0);
            if channel >= len {
                return Err("Invalid channel number.".into());
            }
            return match self.occupant(&sub.device, channel) {
                None => {
                    // a manual channel can create a new sample on measurement
                    self.set_occupant(
                        &sub.device,
                        channel,
                        Some(Occupant {
                            task_id,
                            sample_number,
                            priority,
                        }),
                    )
                    .map_err(|e| format!("Storage failure: {e}"))?;
                    Ok("Success. Created sample on measurement.".into())
                }
                Some(occupant) if occupant.sample_number != sample_number => {
                    Err("Wrong sample in measurement channel.".into())
                }
                Some(_) => Ok("Success.".into()),
            };
        }

        if sub.non_channel_storage.is_some() {
            return Ok("Success. Non-channel measurement has no checks.".into());
        }

        match self.find_sample_slot(&sub.device, sample_number) {
            Some(channel) => {
                sub.channel = Some(channel);
                Ok("Success.".into())
            }
            None => Err("Did not find the sample to measure.".into()),
        }
    }

    fn pre_process_transfer(&self, task: &mut Task) -> std::result::Result<String, String> {
        if task.tasks.is_empty() {
            return Err("Transfer tasks need at least one sub-task.".into());
        }
        let sample_number = task.sample_number.unwrap_or_default();
        let priority = task.priority.unwrap_or_default();
        let task_id = task.id;

        for i in 0..task.tasks.len() {
            let device_name = task.tasks[i].device.clone();
            if !self.device_initialized(&device_name) {
                return Err("Device not initialized.".into());
            }
            if task.tasks[i].non_channel_storage.is_some() && task.tasks[i].channel.is_some() {
                return Err(
                    "Transfer rejected. Channel and non-channel storage simultaneously provided."
                        .into(),
                );
            }

            let passive = {
                let handle = self
                    .device_handle(&device_name)
                    .ok_or_else(|| "Unknown device.".to_string())?;
                let device = handle.lock().expect("device lock poisoned");
                device.passive()
            };
            if i == 0 && passive {
                return Err(format!("Passive device {device_name} cannot initiate transfer."));
            }

            if let Some(channel) = task.tasks[i].channel {
                let len = self.occupancy_len(&device_name).unwrap_or(0);
                if channel >= len {
                    return Err("Invalid channel number.".into());
                }
                if i == 0 {
                    match self.occupant(&device_name, channel) {
                        None => {
                            // a manual source channel can create a new
                            // sample, e.g. a stock solution on the handler
                            self.set_occupant(
                                &device_name,
                                channel,
                                Some(Occupant {
                                    task_id,
                                    sample_number,
                                    priority,
                                }),
                            )
                            .map_err(|e| format!("Storage failure: {e}"))?;
                            task.tasks[i]
                                .set_md("submission_response", "Success. Created sample on transfer.");
                        }
                        Some(occupant) if occupant.sample_number != sample_number => {
                            return Err("Wrong sample in source channel.".into());
                        }
                        Some(_) => {}
                    }
                } else if !passive && self.occupant(&device_name, channel).is_some() {
                    return Err("Device channel not empty.".into());
                }
            } else if task.tasks[i].non_channel_storage.is_some() {
                task.tasks[i].set_md(
                    "submission_response",
                    "Success. Non-channel transfer has no checks.",
                );
            } else if i == 0 {
                match self.find_sample_slot(&device_name, sample_number) {
                    Some(channel) => task.tasks[i].channel = Some(channel),
                    None => {
                        return Err("Channel auto-select did not find the sample to transfer.".into())
                    }
                }
            } else {
                self.select_channel(&mut task.tasks[i], sample_number)?;
            }
        }
        Ok("Success.".into())
    }
}
