//! Audio device enumeration and selection.
//!
//! Meeting audio arrives on a loopback-style device (VB-Cable, "Stereo Mix",
//! a PipeWire monitor), so the recommendation heuristics here *prefer*
//! loopback-like names — the opposite of a dictation tool.

use serde::{Deserialize, Serialize};

use crate::config::AudioConfig;

/// Metadata about an audio input device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Position in the host's input-device enumeration.
    pub index: usize,
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
    /// Heuristic flag for devices that capture system/output audio.
    pub is_loopback_like: bool,
    /// Heuristic recommendation for meeting-audio capture.
    pub is_recommended: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "cable output",
    "vb-audio",
    "blackhole",
    "mixage stereo",
    "mezcla estereo",
    "mix stereo",
    "speakers (",
    "headphones (",
];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Score a device name for meeting-audio capture suitability.
///
/// Higher is better: loopback devices carry the remote participants' audio,
/// plain microphones only pick up the local room.
pub fn capture_preference_score(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = 0;
    if is_loopback_like_name(&lowered) {
        score += 8;
    }
    if lowered.contains("cable") || lowered.contains("monitor of") {
        score += 4;
    }
    if lowered.contains("default") {
        score += 1;
    }
    score
}

/// List all available audio input devices on the system.
///
/// Returns an empty `Vec` if cpal is unavailable or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => {
            let mut list = devices
                .enumerate()
                .map(|(idx, device)| {
                    let name = device
                        .name()
                        .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                    let is_default = default_name.as_deref() == Some(name.as_str());
                    let is_loopback_like = is_loopback_like_name(&name);
                    DeviceInfo {
                        index: idx,
                        name,
                        is_default,
                        is_loopback_like,
                        is_recommended: false,
                    }
                })
                .collect::<Vec<_>>();

            if let Some(best) = list
                .iter()
                .enumerate()
                .max_by_key(|(_, d)| {
                    capture_preference_score(&d.name) + if d.is_default { 2 } else { 0 }
                })
                .map(|(i, _)| i)
            {
                list[best].is_recommended = true;
            }

            list
        }
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            vec![]
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

/// Name of the current platform default input device, if any.
#[cfg(feature = "audio-cpal")]
pub fn default_input_device_name() -> Option<String> {
    use cpal::traits::{DeviceTrait, HostTrait};
    cpal::default_host()
        .default_input_device()
        .and_then(|d| d.name().ok())
}

#[cfg(not(feature = "audio-cpal"))]
pub fn default_input_device_name() -> Option<String> {
    None
}

/// Resolve the device to bind under the current configuration.
///
/// Priority: explicit index → name-substring pin → platform default →
/// first enumerated device. Name pins resolve afresh on every call so a
/// device that appears mid-session is picked up at the next bind attempt.
#[cfg(feature = "audio-cpal")]
pub fn resolve_device(config: &AudioConfig) -> crate::error::Result<(usize, String, cpal::Device)> {
    use cpal::traits::{DeviceTrait, HostTrait};

    use crate::error::ParoloError;

    let host = cpal::default_host();
    let devices: Vec<(String, cpal::Device)> = host
        .input_devices()
        .map_err(|e| ParoloError::AudioDevice(e.to_string()))?
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
            (name, device)
        })
        .collect();
    if devices.is_empty() {
        return Err(ParoloError::NoInputDevice);
    }

    if let Some(index) = config.device_index {
        let count = devices.len();
        return devices
            .into_iter()
            .enumerate()
            .nth(index)
            .map(|(idx, (name, device))| (idx, name, device))
            .ok_or_else(|| {
                ParoloError::AudioDevice(format!(
                    "AUDIO_DEVICE_INDEX={index} is out of range (only {count} input devices)"
                ))
            });
    }

    if let Some(pin) = &config.device_name {
        let needle = pin.to_ascii_lowercase();
        if let Some((idx, (name, device))) = devices
            .into_iter()
            .enumerate()
            .find(|(_, (name, _))| name.to_ascii_lowercase().contains(&needle))
        {
            return Ok((idx, name, device));
        }
        tracing::warn!(pin = pin.as_str(), "pinned device name not found, falling back");
        // Re-enumerate: the iterator above was consumed by the search.
        return resolve_fallback();
    }

    resolve_fallback()
}

#[cfg(feature = "audio-cpal")]
fn resolve_fallback() -> crate::error::Result<(usize, String, cpal::Device)> {
    use cpal::traits::{DeviceTrait, HostTrait};

    use crate::error::ParoloError;

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let devices: Vec<(String, cpal::Device)> = host
        .input_devices()
        .map_err(|e| ParoloError::AudioDevice(e.to_string()))?
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
            (name, device)
        })
        .collect();
    if devices.is_empty() {
        return Err(ParoloError::NoInputDevice);
    }

    let chosen = devices
        .iter()
        .position(|(name, _)| default_name.as_deref() == Some(name.as_str()))
        .unwrap_or(0);
    let (name, device) = devices
        .into_iter()
        .nth(chosen)
        .expect("chosen index is in range");
    Ok((chosen, name, device))
}

/// Multi-line device report for `--diagnose-audio`.
pub fn diagnose_report(config: &AudioConfig) -> String {
    let devices = list_input_devices();
    let mut out = String::new();
    out.push_str("Audio device diagnosis\n");
    out.push_str("======================\n");
    if devices.is_empty() {
        out.push_str("No input devices found.\n");
        out.push_str("On Windows, install VB-Cable and set it as the capture device.\n");
        out.push_str("On Linux, enable a PipeWire/PulseAudio monitor source.\n");
        return out;
    }
    for d in &devices {
        out.push_str(&format!(
            "[{}] {}{}{}{}\n",
            d.index,
            d.name,
            if d.is_default { " (default)" } else { "" },
            if d.is_loopback_like { " (loopback-like)" } else { "" },
            if d.is_recommended { " (recommended)" } else { "" },
        ));
    }
    out.push_str(&format!(
        "\nConfigured: index={:?} name-pin={:?} rate={} Hz, frame={} ms\n",
        config.device_index,
        config.device_name,
        config.sample_rate,
        (config.chunk_duration * 1000.0) as u64,
    ));
    if !devices.iter().any(|d| d.is_loopback_like) {
        out.push_str(
            "Warning: no loopback-like device found — the pipeline will only hear the local microphone.\n",
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{capture_preference_score, is_loopback_like_name};

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("CABLE Output (VB-Audio Virtual Cable)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
    }

    #[test]
    fn scores_loopback_higher_than_microphone() {
        let loopback = capture_preference_score("CABLE Output (VB-Audio Virtual Cable)");
        let mic = capture_preference_score("Microphone Array (USB PnP Audio Device)");
        assert!(loopback > mic);
    }
}
