//! Speaker control tools

use std::sync::Arc;

use super::Tool;
use crate::voice::{PlaybackHandle, VolumeControl};
use crate::{Error, Result};

/// Sets the speaker volume, absolutely or relative to the current level
pub struct VolumeTool {
    control: Arc<dyn VolumeControl>,
}

impl VolumeTool {
    #[must_use]
    pub fn new(control: Arc<dyn VolumeControl>) -> Self {
        Self { control }
    }
}

impl Tool for VolumeTool {
    fn name(&self) -> &str {
        "set_volume"
    }

    fn description(&self) -> &str {
        "Set the speaker volume. Pass 'level' (0-100) for an absolute value or 'change' (e.g. 10 or -10) to adjust relative to the current volume."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "level": {
                    "type": "number",
                    "description": "Absolute volume percentage, 0-100"
                },
                "change": {
                    "type": "number",
                    "description": "Relative change in percentage points"
                }
            }
        })
    }

    fn call(&self, arguments: &serde_json::Value) -> Result<String> {
        let level = arguments.get("level").and_then(serde_json::Value::as_f64);
        let change = arguments.get("change").and_then(serde_json::Value::as_f64);

        let target = match (level, change) {
            (Some(level), None) => level,
            (None, Some(change)) => f64::from(self.control.percent()) + change,
            (Some(_), Some(_)) => {
                return Err(Error::Tool("pass either 'level' or 'change', not both".into()));
            }
            (None, None) => return Err(Error::Tool("missing 'level' or 'change'".into())),
        };

        if !target.is_finite() {
            return Err(Error::Tool("volume must be a finite number".into()));
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let percent = target.round().clamp(0.0, 100.0) as u8;
        let applied = self.control.set_percent(percent)?;

        Ok(format!("volume set to {applied}%"))
    }
}

/// Stops whatever is currently playing
pub struct StopPlaybackTool {
    playback: PlaybackHandle,
}

impl StopPlaybackTool {
    #[must_use]
    pub const fn new(playback: PlaybackHandle) -> Self {
        Self { playback }
    }
}

impl Tool for StopPlaybackTool {
    fn name(&self) -> &str {
        "stop_playback"
    }

    fn description(&self) -> &str {
        "Stop the audio that is currently playing on the speaker"
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    fn call(&self, _arguments: &serde_json::Value) -> Result<String> {
        if self.playback.request_stop() {
            Ok("playback stopped".to_string())
        } else {
            Err(Error::Tool("playback controller is not accepting requests".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Records every change it is asked to make
    #[derive(Default)]
    struct FakeVolume {
        changes: Mutex<Vec<u8>>,
    }

    impl VolumeControl for FakeVolume {
        fn set_percent(&self, percent: u8) -> Result<u8> {
            self.changes.lock().unwrap().push(percent);
            Ok(percent)
        }

        fn percent(&self) -> u8 {
            self.changes.lock().unwrap().last().copied().unwrap_or(50)
        }
    }

    #[test]
    fn test_absolute_level_is_one_change() {
        let volume = Arc::new(FakeVolume::default());
        let tool = VolumeTool::new(volume.clone());

        let text = tool.call(&serde_json::json!({ "level": 20 })).unwrap();
        assert_eq!(text, "volume set to 20%");
        assert_eq!(*volume.changes.lock().unwrap(), vec![20]);
    }

    #[test]
    fn test_out_of_range_is_clamped() {
        let volume = Arc::new(FakeVolume::default());
        let tool = VolumeTool::new(volume.clone());

        tool.call(&serde_json::json!({ "level": 150 })).unwrap();
        tool.call(&serde_json::json!({ "level": -5 })).unwrap();
        assert_eq!(*volume.changes.lock().unwrap(), vec![100, 0]);
    }

    #[test]
    fn test_relative_change() {
        let volume = Arc::new(FakeVolume::default());
        let tool = VolumeTool::new(volume.clone());

        tool.call(&serde_json::json!({ "change": 15 })).unwrap();
        tool.call(&serde_json::json!({ "change": -80 })).unwrap();
        assert_eq!(*volume.changes.lock().unwrap(), vec![65, 0]);
    }

    #[test]
    fn test_requires_exactly_one_argument() {
        let volume = Arc::new(FakeVolume::default());
        let tool = VolumeTool::new(volume.clone());

        assert!(tool.call(&serde_json::json!({})).is_err());
        assert!(tool.call(&serde_json::json!({ "level": 1, "change": 1 })).is_err());
        assert!(volume.changes.lock().unwrap().is_empty());
    }
}
