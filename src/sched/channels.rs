// src/sched/channels.rs — channel occupancy and selection

use crate::error::Result;
use crate::task::{ChannelMode, SubTask};

use super::{Occupant, Scheduler};

impl Scheduler {
    /// A device counts as initialized once its init task was collected and
    /// the occupancy table carries an entry for it.
    pub(crate) fn device_initialized(&self, device_name: &str) -> bool {
        self.state_lock().channel_po.contains_key(device_name)
    }

    pub(crate) fn occupancy_len(&self, device_name: &str) -> Option<usize> {
        self.state_lock().channel_po.get(device_name).map(Vec::len)
    }

    pub(crate) fn occupant(&self, device_name: &str, channel: usize) -> Option<Occupant> {
        self.state_lock()
            .channel_po
            .get(device_name)
            .and_then(|slots| slots.get(channel).cloned())
            .flatten()
    }

    pub(crate) fn set_occupant(
        &self,
        device_name: &str,
        channel: usize,
        occupant: Option<Occupant>,
    ) -> Result<()> {
        let mut state = self.state_lock();
        if let Some(slots) = state.channel_po.get_mut(device_name) {
            if let Some(slot) = slots.get_mut(channel) {
                *slot = occupant;
            }
        }
        self.store_channel_po(&state)
    }

    /// The occupancy slot holding this sample on this device. With several
    /// slots holding the same sample, the one whose occupying task has the
    /// highest priority wins.
    pub(crate) fn find_sample_slot(&self, device_name: &str, sample_number: u64) -> Option<usize> {
        let state = self.state_lock();
        let slots = state.channel_po.get(device_name)?;
        let mut best: Option<(usize, f64)> = None;
        for (index, slot) in slots.iter().enumerate() {
            if let Some(occupant) = slot {
                if occupant.sample_number == sample_number {
                    match best {
                        Some((_, priority)) if priority >= occupant.priority => {}
                        _ => best = Some((index, occupant.priority)),
                    }
                }
            }
        }
        best.map(|(index, _)| index)
    }

    /// Channels free on `device_name`: not addressed by any active task, and
    /// (unless the device is passive) empty in the occupancy table.
    pub(crate) fn free_channels(&self, device_name: &str) -> std::result::Result<Vec<usize>, String> {
        let handle = self
            .device_handle(device_name)
            .ok_or_else(|| "Unknown device.".to_string())?;
        let (number_of_channels, passive) = {
            let device = handle.lock().expect("device lock poisoned");
            (device.number_of_channels(), device.passive())
        };
        let active_busy = self
            .active
            .find_channels(None, Some(device_name))
            .map_err(|e| format!("Storage failure: {e}"))?;

        let state = self.state_lock();
        let occupied = state.channel_po.get(device_name);
        let mut free = Vec::new();
        for channel in 0..number_of_channels {
            if active_busy.contains(&channel) {
                continue;
            }
            if !passive {
                let held = occupied
                    .and_then(|slots| slots.get(channel))
                    .map_or(false, Option::is_some);
                if held {
                    continue;
                }
            }
            free.push(channel);
        }
        Ok(free)
    }

    /// Finds and assigns a free channel for a sub-task, honoring the
    /// device's channel-selection mode.
    pub(crate) fn select_channel(
        &self,
        subtask: &mut SubTask,
        sample_number: u64,
    ) -> std::result::Result<(), String> {
        let handle = self
            .device_handle(&subtask.device)
            .ok_or_else(|| "Unknown device.".to_string())?;
        let mode = {
            let device = handle.lock().expect("device lock poisoned");
            device.channel_mode()
        };

        let free = self.free_channels(&subtask.device)?;
        if free.is_empty() {
            return Err("No free channels available.".into());
        }

        match mode {
            None => {
                subtask.channel = Some(free[0]);
                Ok(())
            }
            Some(ChannelMode::Reuse) => {
                let used = self.used_channels(sample_number, &subtask.device)?;
                let channel = used
                    .iter()
                    .find(|c| free.contains(c))
                    .copied()
                    .unwrap_or(free[0]);
                subtask.channel = Some(channel);
                Ok(())
            }
            Some(ChannelMode::New) => {
                let used = self.used_channels(sample_number, &subtask.device)?;
                match free.iter().find(|c| !used.contains(c)) {
                    Some(&channel) => {
                        subtask.channel = Some(channel);
                        Ok(())
                    }
                    None => Err("No free unused channels.".into()),
                }
            }
        }
    }

    /// Channels this sample has used on this device, across the history and
    /// active queues.
    fn used_channels(
        &self,
        sample_number: u64,
        device_name: &str,
    ) -> std::result::Result<Vec<usize>, String> {
        let mut used = self
            .history
            .find_channels(Some(sample_number), Some(device_name))
            .map_err(|e| format!("Storage failure: {e}"))?;
        let active = self
            .active
            .find_channels(Some(sample_number), Some(device_name))
            .map_err(|e| format!("Storage failure: {e}"))?;
        for channel in active {
            if !used.contains(&channel) {
                used.push(channel);
            }
        }
        used.sort_unstable();
        Ok(used)
    }
}
