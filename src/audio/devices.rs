//! Audio device enumeration for the host UI.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: i32,
    pub name: String,
}

fn collect<I: Iterator<Item = cpal::Device>>(devices: I) -> Vec<AudioDeviceInfo> {
    devices
        .enumerate()
        .filter_map(|(i, dev)| {
            dev.name().ok().map(|name| AudioDeviceInfo {
                id: i as i32,
                name,
            })
        })
        .collect()
}

/// List available audio input devices.
pub fn list_input_devices() -> Vec<AudioDeviceInfo> {
    match cpal::default_host().input_devices() {
        Ok(devices) => collect(devices),
        Err(e) => {
            tracing::warn!("Failed to enumerate input devices: {}", e);
            Vec::new()
        }
    }
}

/// List available audio output devices.
pub fn list_output_devices() -> Vec<AudioDeviceInfo> {
    match cpal::default_host().output_devices() {
        Ok(devices) => collect(devices),
        Err(e) => {
            tracing::warn!("Failed to enumerate output devices: {}", e);
            Vec::new()
        }
    }
}
