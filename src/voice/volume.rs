//! Output volume

use std::process::Command;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::{Error, Result};

/// Sets the speaker volume
pub trait VolumeControl: Send + Sync {
    /// Set the volume to `percent` (clamped to 0..=100)
    ///
    /// Returns the percentage applied.
    ///
    /// # Errors
    ///
    /// Returns error if the device rejects the change
    fn set_percent(&self, percent: u8) -> Result<u8>;

    /// Last applied percentage
    fn percent(&self) -> u8;
}

/// Volume command configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConfig {
    /// Command template; `{level}` is replaced by the hardware level
    pub command: String,
    /// Hardware level at 0%
    pub hw_min: u32,
    /// Hardware level at 100%
    pub hw_max: u32,
    /// Percentage assumed before the first change
    pub initial_percent: u8,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            command: "termux-volume music {level}".to_string(),
            hw_min: 0,
            hw_max: 15,
            initial_percent: 50,
        }
    }
}

/// Changes volume by running a shell-free command line
#[derive(Debug)]
pub struct CommandVolume {
    config: VolumeConfig,
    current: AtomicU8,
}

impl CommandVolume {
    /// Create a controller
    ///
    /// # Errors
    ///
    /// Returns error if the command template is empty or the hardware
    /// range is inverted
    pub fn new(config: VolumeConfig) -> Result<Self> {
        if config.command.split_whitespace().next().is_none() {
            return Err(Error::Config("volume command is empty".into()));
        }
        if config.hw_min > config.hw_max {
            return Err(Error::Config(format!(
                "volume range {}..={} is inverted",
                config.hw_min, config.hw_max
            )));
        }

        Ok(Self {
            current: AtomicU8::new(config.initial_percent.min(100)),
            config,
        })
    }

    /// Hardware level for a percentage
    #[must_use]
    pub fn level_for(&self, percent: u8) -> u32 {
        let span = u64::from(self.config.hw_max - self.config.hw_min);
        let scaled = (u64::from(percent.min(100)) * span + 50) / 100;
        // scaled <= span, so the sum stays within hw_max
        self.config.hw_min + u32::try_from(scaled).unwrap_or(u32::MAX - self.config.hw_min)
    }

    fn command_line(&self, level: u32) -> Vec<String> {
        let level = level.to_string();
        self.config
            .command
            .split_whitespace()
            .map(|part| part.replace("{level}", &level))
            .collect()
    }
}

impl VolumeControl for CommandVolume {
    fn set_percent(&self, percent: u8) -> Result<u8> {
        let percent = percent.min(100);
        let level = self.level_for(percent);
        let argv = self.command_line(level);

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Config("volume command is empty".into()))?;

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::Device(format!("failed to run {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Device(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        self.current.store(percent, Ordering::Release);
        tracing::info!(percent, level, "volume changed");
        Ok(percent)
    }

    fn percent(&self) -> u8 {
        self.current.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(command: &str) -> CommandVolume {
        CommandVolume::new(VolumeConfig {
            command: command.to_string(),
            ..VolumeConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_level_mapping() {
        let v = volume("true {level}");
        assert_eq!(v.level_for(0), 0);
        assert_eq!(v.level_for(20), 3);
        assert_eq!(v.level_for(50), 8);
        assert_eq!(v.level_for(100), 15);
        assert_eq!(v.level_for(255), 15);
    }

    #[test]
    fn test_level_mapping_wide_range() {
        let v = CommandVolume::new(VolumeConfig {
            command: "true {level}".to_string(),
            hw_min: 0,
            hw_max: u32::MAX,
            ..VolumeConfig::default()
        })
        .unwrap();
        assert_eq!(v.level_for(0), 0);
        assert_eq!(v.level_for(50), u32::MAX / 2 + 1);
        assert_eq!(v.level_for(100), u32::MAX);

        let offset = CommandVolume::new(VolumeConfig {
            command: "true {level}".to_string(),
            hw_min: 1_000_000_000,
            hw_max: 4_000_000_000,
            ..VolumeConfig::default()
        })
        .unwrap();
        assert_eq!(offset.level_for(100), 4_000_000_000);
        assert_eq!(offset.level_for(10), 1_300_000_000);
    }

    #[test]
    fn test_command_substitution() {
        let v = volume("termux-volume music {level}");
        assert_eq!(v.command_line(7), vec!["termux-volume", "music", "7"]);
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(CommandVolume::new(VolumeConfig {
            command: "  ".into(),
            ..VolumeConfig::default()
        })
        .is_err());
        assert!(CommandVolume::new(VolumeConfig {
            hw_min: 10,
            hw_max: 5,
            ..VolumeConfig::default()
        })
        .is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_set_percent_runs_command() {
        let v = volume("true {level}");
        assert_eq!(v.set_percent(120).unwrap(), 100);
        assert_eq!(v.percent(), 100);

        let failing = volume("false {level}");
        assert!(failing.set_percent(10).is_err());
        assert_eq!(failing.percent(), 50);
    }
}
