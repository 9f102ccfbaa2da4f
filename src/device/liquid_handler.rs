// src/device/liquid_handler.rs — liquid-handler instrument binding

use std::time::Duration;

use super::{Device, DeviceCore};
use crate::status::Status;
use crate::task::{ChannelMode, SubTask, TaskType};

/// Liquid handler: prepares samples and initiates transfers. Any final vial
/// counts as a channel.
pub struct LiquidHandler {
    core: DeviceCore,
}

impl LiquidHandler {
    pub fn new(
        name: &str,
        address: Option<&str>,
        simulated: bool,
        timeout: Duration,
    ) -> LiquidHandler {
        LiquidHandler {
            core: DeviceCore::new(name, address, simulated, false, timeout),
        }
    }
}

impl Device for LiquidHandler {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn number_of_channels(&self) -> usize {
        self.core.number_of_channels
    }

    fn channel_mode(&self) -> Option<ChannelMode> {
        self.core.channel_mode
    }

    fn passive(&self) -> bool {
        self.core.passive
    }

    fn init(&mut self, subtask: &SubTask) -> (Status, String) {
        self.core.init(subtask)
    }

    fn execute_task(&mut self, subtask: &SubTask, task_type: TaskType) -> (Status, String) {
        let window = DeviceCore::window(subtask);
        match task_type {
            TaskType::Init => self.init(subtask),
            TaskType::Prepare => self.core.dispatch("prepare", subtask, subtask.channel, window),
            TaskType::Transfer => self.core.dispatch("transfer", subtask, subtask.channel, window),
            TaskType::Nochannel => self.core.dispatch("nochannel", subtask, None, window),
            TaskType::Shutdown => self.core.dispatch("shutdown", subtask, None, window),
            _ => (
                Status::Invalid,
                "Task type not supported by liquid handler.".into(),
            ),
        }
    }

    fn get_device_and_channel_status(&self) -> (Status, Status, Vec<Status>) {
        self.core.status_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measure_is_rejected() {
        let mut dev = LiquidHandler::new("lh1", None, true, Duration::from_secs(1));
        let sub = SubTask::default();
        let (status, _) = dev.execute_task(&sub, TaskType::Measure);
        assert_eq!(status, Status::Invalid);
    }
}
