//! Host scripting seam.
//!
//! The live host application (the process that can actually run George
//! scripts) is only ever reached through the [`Communicator`] trait. Command
//! execution, the worker loop and all tests go through this seam, so no
//! module-global "current host" state exists anywhere in the crate.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::planner::{LayerBehavior, LayerData};

/// Scene metadata gathered from the live host in one query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneData {
    pub fps: f64,
    pub frame_start: i32,
    pub frame_end: i32,
    pub mark_in: i32,
    pub mark_out: i32,
    /// Scene start frame offset (`tv_startframe`)
    pub start_frame: i32,
    pub field_order: Option<String>,
    /// Raw background color tokens (type followed by values)
    pub bg_color: Vec<String>,
    pub layers: Vec<LayerData>,
    pub exposure_frames_by_layer_id: HashMap<String, Vec<i32>>,
    pub behavior_by_layer_id: HashMap<String, LayerBehavior>,
}

/// Scripting surface of a running host instance.
///
/// Implementations own the actual process binding; this crate ships only the
/// in-memory [`RecordingCommunicator`] used by tests and the mock worker.
pub trait Communicator: Send {
    /// Run an inline George script and return its textual result.
    fn execute_george(&mut self, script: &str) -> Result<String>;

    /// Run a multi-line George script through a script file on disk.
    ///
    /// Used for scripts too long or too quote-heavy for inline execution.
    fn execute_george_through_file(&mut self, script: &str) -> Result<()>;

    /// Gather layers, exposure frames, behaviors and scene metadata.
    fn collect_scene_data(&mut self) -> Result<SceneData>;

    fn open_workfile(&mut self, path: &str) -> Result<()>;

    fn close_workfile(&mut self) -> Result<()>;

    /// Whether the underlying host process is still running.
    fn is_host_alive(&self) -> bool {
        true
    }
}

/// In-memory host double: records every script, answers with canned results.
///
/// Backs unit tests and the built-in "mock" worker host.
#[derive(Debug, Default)]
pub struct RecordingCommunicator {
    pub executed_scripts: Vec<String>,
    pub opened_workfiles: Vec<String>,
    pub workfile_open: bool,
    pub scene_data: SceneData,
    /// Result returned for inline scripts, keyed by script text
    pub canned_results: HashMap<String, String>,
    pub host_alive: bool,
}

impl RecordingCommunicator {
    pub fn new() -> Self {
        Self {
            host_alive: true,
            ..Self::default()
        }
    }
}

impl Communicator for RecordingCommunicator {
    fn execute_george(&mut self, script: &str) -> Result<String> {
        self.executed_scripts.push(script.to_string());
        Ok(self
            .canned_results
            .get(script)
            .cloned()
            .unwrap_or_default())
    }

    fn execute_george_through_file(&mut self, script: &str) -> Result<()> {
        self.executed_scripts.push(script.to_string());
        Ok(())
    }

    fn collect_scene_data(&mut self) -> Result<SceneData> {
        Ok(self.scene_data.clone())
    }

    fn open_workfile(&mut self, path: &str) -> Result<()> {
        self.opened_workfiles.push(path.to_string());
        self.workfile_open = true;
        Ok(())
    }

    fn close_workfile(&mut self) -> Result<()> {
        self.workfile_open = false;
        Ok(())
    }

    fn is_host_alive(&self) -> bool {
        self.host_alive
    }
}
