// src/device/mod.rs — uniform instrument interface
//
// Every instrument binding speaks the same contract: non-blocking dispatch,
// one atomic status snapshot covering the device and all channels, and a
// post-measurement read. Simulated instances replace network calls with
// deterministic busy windows and fake successes so the scheduler can be
// exercised without hardware.

mod injection;
mod liquid_handler;
mod qcmd;

pub use injection::Injection;
pub use liquid_handler::LiquidHandler;
pub use qcmd::Qcmd;

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::status::Status;
use crate::task::{ChannelMode, SubTask, TaskType};

/// Busy window used by simulated dispatches that carry no acquisition time.
const SIM_WINDOW: Duration = Duration::from_millis(50);

/// Capability contract the scheduler consumes. A non-`success` request
/// status anywhere means "unknown state": not done and not dispatchable,
/// never a reason to drop a task.
pub trait Device: Send {
    fn name(&self) -> &str;
    fn number_of_channels(&self) -> usize;
    fn channel_mode(&self) -> Option<ChannelMode>;
    /// Passive instruments cannot initiate a transfer and their channel
    /// occupancy is not enforced for pass-through.
    fn passive(&self) -> bool;
    /// Adopts address, channel mode, and channel count from the init
    /// sub-task and brings the instrument up.
    fn init(&mut self, subtask: &SubTask) -> (Status, String);
    /// Dispatches one operation; returns as soon as the instrument accepts
    /// the command.
    fn execute_task(&mut self, subtask: &SubTask, task_type: TaskType) -> (Status, String);
    /// Single atomic snapshot: (request status, device status, per-channel
    /// status).
    fn get_device_and_channel_status(&self) -> (Status, Status, Vec<Status>);
    /// Fetches measurement data once a measure completed. The default
    /// returns an empty dataset.
    fn read(&self, _channel: usize) -> (Status, Value) {
        (Status::Success, json!({}))
    }
}

/// HTTP link to a physical instrument. The wire shape is a POST with
/// `{"command": ..., "value": ...}`; 200 means success, anything else is an
/// error.
pub(crate) struct DeviceLink {
    client: reqwest::blocking::Client,
}

impl DeviceLink {
    fn new(timeout: Duration) -> DeviceLink {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .expect("http client construction");
        DeviceLink { client }
    }

    fn command(&self, address: Option<&str>, command: &str, value: &Value) -> (Status, Option<Value>) {
        let Some(address) = address else {
            return (Status::Invalid, None);
        };
        let body = json!({ "command": command, "value": value });
        let response = match self.client.post(address).json(&body).send() {
            Ok(r) => r,
            Err(_) => return (Status::Error, None),
        };
        if !response.status().is_success() {
            return (Status::Error, None);
        }
        match response.json::<Value>() {
            Ok(payload) => (Status::Success, payload.get("result").cloned()),
            Err(_) => (Status::Error, None),
        }
    }
}

/// Deterministic stand-in for instrument state while simulating.
struct SimEngine {
    device_busy_until: Option<Instant>,
    channel_busy_until: Vec<Option<Instant>>,
}

impl SimEngine {
    fn new(channels: usize) -> SimEngine {
        SimEngine {
            device_busy_until: None,
            channel_busy_until: vec![None; channels],
        }
    }

    fn resize(&mut self, channels: usize) {
        self.channel_busy_until = vec![None; channels];
        self.device_busy_until = None;
    }

    fn begin(&mut self, channel: Option<usize>, window: Duration) {
        let until = Instant::now() + window;
        match channel {
            Some(c) if c < self.channel_busy_until.len() => {
                self.channel_busy_until[c] = Some(until)
            }
            _ => self.device_busy_until = Some(until),
        }
    }

    fn device_status(&self) -> Status {
        match self.device_busy_until {
            Some(until) if Instant::now() < until => Status::Busy,
            _ => Status::Up,
        }
    }

    fn channel_statuses(&self) -> Vec<Status> {
        self.channel_busy_until
            .iter()
            .map(|slot| match slot {
                Some(until) if Instant::now() < *until => Status::Busy,
                _ => Status::Idle,
            })
            .collect()
    }
}

/// State and plumbing shared by all instrument bindings.
pub(crate) struct DeviceCore {
    pub name: String,
    pub address: Option<String>,
    pub number_of_channels: usize,
    pub channel_mode: Option<ChannelMode>,
    pub passive: bool,
    pub simulated: bool,
    link: DeviceLink,
    sim: SimEngine,
}

impl DeviceCore {
    pub fn new(
        name: &str,
        address: Option<&str>,
        simulated: bool,
        passive: bool,
        timeout: Duration,
    ) -> DeviceCore {
        DeviceCore {
            name: name.to_string(),
            address: address.map(str::to_string),
            number_of_channels: 1,
            channel_mode: None,
            passive,
            simulated,
            link: DeviceLink::new(timeout),
            sim: SimEngine::new(1),
        }
    }

    /// Adopts the init sub-task's settings, then brings the instrument up.
    pub fn init(&mut self, subtask: &SubTask) -> (Status, String) {
        if let Some(address) = &subtask.device_address {
            self.address = Some(address.clone());
        }
        self.channel_mode = subtask.channel_mode;
        self.number_of_channels = subtask.number_of_channels.max(1);
        self.sim.resize(self.number_of_channels);
        self.dispatch("init", subtask, None, SIM_WINDOW)
    }

    /// Sends one command to the instrument, or opens a simulated busy
    /// window. Returns immediately either way.
    pub fn dispatch(
        &mut self,
        command: &str,
        subtask: &SubTask,
        channel: Option<usize>,
        window: Duration,
    ) -> (Status, String) {
        if self.simulated {
            self.sim.begin(channel, window);
            return (Status::Success, format!("Simulated {command} accepted."));
        }
        let value = match serde_json::to_value(subtask) {
            Ok(v) => v,
            Err(e) => return (Status::Error, format!("Cannot serialize sub-task: {e}")),
        };
        match self.link.command(self.address.as_deref(), command, &value) {
            (Status::Success, _) => (Status::Success, format!("Command {command} accepted.")),
            (status, _) => (status, format!("Command {command} failed with status {status}.")),
        }
    }

    /// Busy window for a dispatched sub-task: the acquisition time when one
    /// is given, a short fixed window otherwise.
    pub fn window(subtask: &SubTask) -> Duration {
        match subtask.acquisition_time {
            Some(secs) if secs > 0.0 => Duration::from_secs_f64(secs),
            _ => SIM_WINDOW,
        }
    }

    /// Bare command with no payload, for auxiliary endpoints such as the
    /// QCMD data readout.
    pub fn raw_command(&self, command: &str) -> (Status, Option<Value>) {
        self.link.command(self.address.as_deref(), command, &Value::Null)
    }

    pub fn status_snapshot(&self) -> (Status, Status, Vec<Status>) {
        if self.simulated {
            return (
                Status::Success,
                self.sim.device_status(),
                self.sim.channel_statuses(),
            );
        }
        let (request, payload) = self
            .link
            .command(self.address.as_deref(), "status", &Value::Null);
        if request != Status::Success {
            return (request, Status::Down, Vec::new());
        }
        let Some(payload) = payload else {
            return (Status::Error, Status::Down, Vec::new());
        };
        let device = payload
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(Status::Invalid);
        let channels = payload
            .get("channel_status")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(Status::Invalid)
                    })
                    .collect()
            })
            .unwrap_or_default();
        (Status::Success, device, channels)
    }
}

/// Builds an instrument binding for a declared device type. Returns `None`
/// for types the scheduler does not know.
pub fn create_device(
    device_type: &str,
    name: &str,
    address: Option<&str>,
    simulated: bool,
    timeout: Duration,
) -> Option<Box<dyn Device>> {
    match device_type.to_ascii_lowercase().as_str() {
        "injection" => Some(Box::new(Injection::new(name, address, simulated, timeout))),
        "lh" | "liquid_handler" => {
            Some(Box::new(LiquidHandler::new(name, address, simulated, timeout)))
        }
        "qcmd" => Some(Box::new(Qcmd::new(name, address, simulated, timeout))),
        _ => None,
    }
}

pub fn known_device_type(device_type: &str) -> bool {
    matches!(
        device_type.to_ascii_lowercase().as_str(),
        "injection" | "lh" | "liquid_handler" | "qcmd"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_dispatch_opens_a_busy_window() {
        let mut dev = Qcmd::new("qcmd1", None, true, Duration::from_secs(1));
        let sub = SubTask {
            device: "qcmd1".into(),
            number_of_channels: 2,
            ..SubTask::default()
        };
        let (status, _) = dev.init(&sub);
        assert_eq!(status, Status::Success);

        // wait out the init window
        std::thread::sleep(SIM_WINDOW + Duration::from_millis(10));
        let (req, device, channels) = dev.get_device_and_channel_status();
        assert_eq!(req, Status::Success);
        assert!(device.is_ready());
        assert_eq!(channels.len(), 2);

        let measure = SubTask {
            device: "qcmd1".into(),
            channel: Some(1),
            ..SubTask::default()
        };
        let (status, _) = dev.execute_task(&measure, TaskType::Measure);
        assert_eq!(status, Status::Success);
        let (_, _, channels) = dev.get_device_and_channel_status();
        assert_eq!(channels[1], Status::Busy);
        assert_eq!(channels[0], Status::Idle);

        std::thread::sleep(SIM_WINDOW + Duration::from_millis(10));
        let (_, _, channels) = dev.get_device_and_channel_status();
        assert_eq!(channels[1], Status::Idle);
    }

    #[test]
    fn unknown_device_types_are_refused() {
        assert!(create_device("nmr", "nmr1", None, true, Duration::from_secs(1)).is_none());
        assert!(known_device_type("QCMD"));
        assert!(!known_device_type("nmr"));
    }
}
