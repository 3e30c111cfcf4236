//! Audio endpoint enumeration

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::AudioError;

/// One capturable endpoint, as shown by `--list-endpoint`
#[derive(Debug, Clone)]
pub struct EndpointInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

/// List endpoints whose rendered audio can be captured.
///
/// Output devices come first (WASAPI exposes loopback capture on them);
/// monitor-style inputs such as PulseAudio "Monitor of ..." sources follow.
pub fn list_endpoints() -> Vec<EndpointInfo> {
    let host = cpal::default_host();
    let mut endpoints = Vec::new();

    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(devices) = host.output_devices() {
        for device in devices {
            if let Ok(name) = device.name() {
                endpoints.push(EndpointInfo {
                    id: format!("output:{name}"),
                    is_default: default_name.as_ref() == Some(&name),
                    name,
                });
            }
        }
    }

    if let Ok(devices) = host.input_devices() {
        for device in devices {
            if let Ok(name) = device.name() {
                if endpoints.iter().any(|e| e.name == name) {
                    continue;
                }
                endpoints.push(EndpointInfo {
                    id: format!("input:{name}"),
                    is_default: false,
                    name,
                });
            }
        }
    }

    endpoints
}

/// Resolve an endpoint id (or `"default"`) to a cpal device
pub fn find_endpoint(id: &str) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    if id == "default" {
        return host
            .default_output_device()
            .ok_or_else(|| AudioError::EndpointNotFound("no default output device".to_string()));
    }

    let (devices, name) = if let Some(name) = id.strip_prefix("output:") {
        (host.output_devices(), name)
    } else if let Some(name) = id.strip_prefix("input:") {
        (host.input_devices(), name)
    } else {
        (host.output_devices(), id)
    };

    let devices = devices.map_err(|e| AudioError::EndpointNotFound(e.to_string()))?;
    for device in devices {
        if let Ok(device_name) = device.name() {
            if device_name == name {
                return Ok(device);
            }
        }
    }

    Err(AudioError::EndpointNotFound(id.to_string()))
}
