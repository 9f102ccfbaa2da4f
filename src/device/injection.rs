// src/device/injection.rs — injection-valve instrument binding

use std::time::Duration;

use super::{Device, DeviceCore};
use crate::status::Status;
use crate::task::{ChannelMode, SubTask, TaskType};

/// Flow-through injection valve. Passive: it cannot initiate a transfer and
/// its channel occupancy is not enforced for samples passing through. The
/// hardware has exactly two positions.
pub struct Injection {
    core: DeviceCore,
}

impl Injection {
    pub fn new(name: &str, address: Option<&str>, simulated: bool, timeout: Duration) -> Injection {
        Injection {
            core: DeviceCore::new(name, address, simulated, true, timeout),
        }
    }
}

impl Device for Injection {
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
        if subtask.number_of_channels != 2 {
            return (
                Status::Invalid,
                "Number of channels must be 2 for an injection device.".into(),
            );
        }
        self.core.init(subtask)
    }

    fn execute_task(&mut self, subtask: &SubTask, task_type: TaskType) -> (Status, String) {
        let window = DeviceCore::window(subtask);
        match task_type {
            TaskType::Init => self.init(subtask),
            TaskType::Transfer => self.core.dispatch("transfer", subtask, subtask.channel, window),
            TaskType::Nochannel => self.core.dispatch("nochannel", subtask, None, window),
            TaskType::Shutdown => self.core.dispatch("shutdown", subtask, None, window),
            _ => (
                Status::Invalid,
                "Task type not supported by injection device.".into(),
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
    fn injection_devices_are_passive_and_two_channel() {
        let mut dev = Injection::new("valve1", None, true, Duration::from_secs(1));
        assert!(dev.passive());

        let bad = SubTask {
            number_of_channels: 3,
            ..SubTask::default()
        };
        assert_eq!(dev.init(&bad).0, Status::Invalid);

        let good = SubTask {
            number_of_channels: 2,
            ..SubTask::default()
        };
        assert_eq!(dev.init(&good).0, Status::Success);
        assert_eq!(dev.number_of_channels(), 2);
    }
}
