//! Tools the model can call during a turn

mod calculator;
mod playback;
mod registry;
mod time;

use std::sync::Arc;

pub use calculator::{CalculatorTool, evaluate, format_number};
pub use playback::{StopPlaybackTool, VolumeTool};
pub use registry::{Tool, ToolDefinition, ToolInvocation, ToolOutcome, ToolRegistry};
pub use time::{CurrentTimeTool, describe_time};

use crate::voice::{PlaybackHandle, VolumeControl};

/// Registry with every built-in tool
///
/// The volume tool is only registered when a volume control is available.
#[must_use]
pub fn builtin_registry(
    playback: PlaybackHandle,
    volume: Option<Arc<dyn VolumeControl>>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new()
        .with_tool(Arc::new(CurrentTimeTool))
        .with_tool(Arc::new(CalculatorTool))
        .with_tool(Arc::new(StopPlaybackTool::new(playback)));

    if let Some(volume) = volume {
        registry.register(Arc::new(VolumeTool::new(volume)));
    }

    registry
}
