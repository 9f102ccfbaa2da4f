// src/device/qcmd.rs — QCMD instrument binding

use std::time::Duration;

use serde_json::{json, Value};

use super::{Device, DeviceCore};
use crate::status::Status;
use crate::task::{ChannelMode, SubTask, TaskType};

/// Quartz crystal microbalance. Accepts measurements and incoming
/// transfers; it cannot prepare samples.
pub struct Qcmd {
    core: DeviceCore,
}

impl Qcmd {
    pub fn new(name: &str, address: Option<&str>, simulated: bool, timeout: Duration) -> Qcmd {
        Qcmd {
            core: DeviceCore::new(name, address, simulated, false, timeout),
        }
    }

    /// Single-tone dummy dataset returned by simulated reads.
    fn dummy_dataset() -> Value {
        json!({
            "time": [0.0, 10.0, 20.0, 30.0],
            "frequency": [0.0, -1.0, -2.0, -3.0],
            "dissipation": [100.0, 200.0, 300.0, 400.0],
            "temperature": [300.0, 300.0, 300.0, 300.0]
        })
    }

    fn data_command(&self, command: &str) -> (Status, Option<Value>) {
        self.core.raw_command(command)
    }
}

impl Device for Qcmd {
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
        match task_type {
            TaskType::Init => self.init(subtask),
            TaskType::Measure => {
                let window = DeviceCore::window(subtask);
                self.core.dispatch("measure", subtask, subtask.channel, window)
            }
            TaskType::Transfer => {
                self.core
                    .dispatch("transfer", subtask, subtask.channel, DeviceCore::window(subtask))
            }
            TaskType::Nochannel => {
                self.core
                    .dispatch("nochannel", subtask, None, DeviceCore::window(subtask))
            }
            TaskType::Shutdown => self.core.dispatch("shutdown", subtask, None, DeviceCore::window(subtask)),
            _ => (Status::Invalid, "Task type not supported by QCMD.".into()),
        }
    }

    fn get_device_and_channel_status(&self) -> (Status, Status, Vec<Status>) {
        self.core.status_snapshot()
    }

    /// Retrieves the dataset collected since the measurement started; called
    /// once after the run stopped.
    fn read(&self, _channel: usize) -> (Status, Value) {
        if self.core.simulated {
            return (Status::Success, Qcmd::dummy_dataset());
        }
        let (stop_status, _) = self.data_command("stop");
        if stop_status != Status::Success {
            return (stop_status, Value::Null);
        }
        match self.data_command("get_data") {
            (Status::Success, Some(data)) => (Status::Success, data),
            (Status::Success, None) => (Status::Success, Qcmd::dummy_dataset()),
            (status, _) => (status, Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_read_returns_the_dummy_dataset() {
        let dev = Qcmd::new("qcmd1", None, true, Duration::from_secs(1));
        let (status, data) = dev.read(0);
        assert_eq!(status, Status::Success);
        assert_eq!(data["frequency"][1], -1.0);
    }

    #[test]
    fn prepare_is_rejected() {
        let mut dev = Qcmd::new("qcmd1", None, true, Duration::from_secs(1));
        let sub = SubTask::default();
        let (status, _) = dev.execute_task(&sub, TaskType::Prepare);
        assert_eq!(status, Status::Invalid);
    }
}
