//! Command protocol: scripted operations serialized to a job payload,
//! executed in a remote host, results merged back.
//!
//! The variant set is closed. Deserialization goes through an explicit
//! discriminator match, so an unknown command name is a named error
//! ([`CommandError::UnknownCommand`]) instead of a stringly lookup surprise.
//!
//! Lifecycle of one command: created client-side, queued into a batch,
//! shipped inside a job, executed exactly once in order against the live
//! host, result attached, merged back into the sender's objects by id.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use log::debug;
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::communicator::Communicator;
use crate::job::JobStatus;
use crate::sender::JobQueueClient;

/// Wire discriminators of the closed command set.
pub const CMD_EXECUTE_GEORGE_SIMPLE: &str = "execute_george_simple";
pub const CMD_EXECUTE_GEORGE_THROUGH_FILE: &str = "execute_george_through_file";
pub const CMD_COLLECT_SCENE_DATA: &str = "collect_scene_data";

pub const KNOWN_COMMANDS: &[&str] = &[
    CMD_EXECUTE_GEORGE_SIMPLE,
    CMD_EXECUTE_GEORGE_THROUGH_FILE,
    CMD_COLLECT_SCENE_DATA,
];

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command \"{0}\", expected one of: execute_george_simple, execute_george_through_file, collect_scene_data")]
    UnknownCommand(String),

    #[error("malformed command payload: {0}")]
    MalformedPayload(String),
}

/// Per-execution context passed explicitly to every command.
///
/// Replaces the "current root" module globals of older pipeline code; two
/// batches can execute side by side without cross-contamination.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Local mount of the shared jobs root; substituted for the batch's
    /// root-dir placeholder so sender and worker may see different
    /// filesystem roots
    pub jobs_root: Option<String>,
}

/// Variant payload of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// Inline George script with a synchronous string result
    ExecuteGeorgeSimple { script: String },

    /// Script executed via file on disk; `tmp_file_keys` name `{key}`
    /// placeholders that become scratch files read back into the result
    ExecuteGeorgeThroughFile {
        script: String,
        tmp_file_keys: Vec<String>,
        root_dir_key: Option<String>,
    },

    /// Gather layers/exposure/behavior/scene metadata from the live host
    CollectSceneData,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::ExecuteGeorgeSimple { .. } => CMD_EXECUTE_GEORGE_SIMPLE,
            CommandKind::ExecuteGeorgeThroughFile { .. } => CMD_EXECUTE_GEORGE_THROUGH_FILE,
            CommandKind::CollectSceneData => CMD_COLLECT_SCENE_DATA,
        }
    }
}

/// One unit of host-side work with its identity and (eventual) result.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: String,
    pub kind: CommandKind,
    pub result: Option<Value>,
    pub done: bool,
}

impl Command {
    fn with_kind(kind: CommandKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            result: None,
            done: false,
        }
    }

    pub fn execute_george_simple(script: impl Into<String>) -> Self {
        Self::with_kind(CommandKind::ExecuteGeorgeSimple {
            script: script.into(),
        })
    }

    pub fn execute_george_through_file(
        script: impl Into<String>,
        tmp_file_keys: Vec<String>,
        root_dir_key: Option<String>,
    ) -> Self {
        Self::with_kind(CommandKind::ExecuteGeorgeThroughFile {
            script: script.into(),
            tmp_file_keys,
            root_dir_key,
        })
    }

    pub fn collect_scene_data() -> Self {
        Self::with_kind(CommandKind::CollectSceneData)
    }

    /// Serialize to the wire form (`{"id", "command", ...variant keys}`).
    pub fn command_data(&self) -> Value {
        let mut data = json!({
            "id": self.id,
            "command": self.kind.name(),
        });
        match &self.kind {
            CommandKind::ExecuteGeorgeSimple { script } => {
                data["script"] = json!(script);
            }
            CommandKind::ExecuteGeorgeThroughFile {
                script,
                tmp_file_keys,
                root_dir_key,
            } => {
                data["script"] = json!(script);
                data["tmp_file_keys"] = json!(tmp_file_keys);
                data["root_dir_key"] = json!(root_dir_key);
            }
            CommandKind::CollectSceneData => {}
        }
        data
    }

    /// Reconstruct a command from its wire form.
    pub fn from_existing(data: &Value) -> Result<Self, CommandError> {
        let id = data
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CommandError::MalformedPayload("missing \"id\"".to_string()))?
            .to_string();
        let name = data
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CommandError::MalformedPayload("missing \"command\"".to_string()))?;

        let script = || {
            data.get("script")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| CommandError::MalformedPayload("missing \"script\"".to_string()))
        };

        let kind = match name {
            CMD_EXECUTE_GEORGE_SIMPLE => CommandKind::ExecuteGeorgeSimple { script: script()? },
            CMD_EXECUTE_GEORGE_THROUGH_FILE => {
                let tmp_file_keys = data
                    .get("tmp_file_keys")
                    .and_then(|v| v.as_array())
                    .map(|keys| {
                        keys.iter()
                            .filter_map(|k| k.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                let root_dir_key = data
                    .get("root_dir_key")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                CommandKind::ExecuteGeorgeThroughFile {
                    script: script()?,
                    tmp_file_keys,
                    root_dir_key,
                }
            }
            CMD_COLLECT_SCENE_DATA => CommandKind::CollectSceneData,
            other => return Err(CommandError::UnknownCommand(other.to_string())),
        };

        Ok(Self {
            id,
            kind,
            result: None,
            done: false,
        })
    }

    /// Wire form of this command's execution result.
    pub fn result_data(&self) -> Value {
        json!({
            "id": self.id,
            "result": self.result,
            "done": self.done,
        })
    }

    /// Run this command against the live host and attach its result.
    ///
    /// Any failure propagates and aborts the remaining batch; there is no
    /// per-command retry.
    pub fn execute(
        &mut self,
        communicator: &mut dyn Communicator,
        context: &ExecutionContext,
    ) -> Result<()> {
        debug!("Executing command \"{}\" ({})", self.kind.name(), self.id);
        let result = match &self.kind {
            CommandKind::ExecuteGeorgeSimple { script } => {
                Value::String(communicator.execute_george(script)?)
            }
            CommandKind::ExecuteGeorgeThroughFile {
                script,
                tmp_file_keys,
                root_dir_key,
            } => execute_through_file(communicator, context, script, tmp_file_keys, root_dir_key)?,
            CommandKind::CollectSceneData => {
                serde_json::to_value(communicator.collect_scene_data()?)?
            }
        };
        self.result = Some(result);
        self.done = true;
        Ok(())
    }
}

/// Substitute scratch-file and root-dir placeholders, execute, read back.
fn execute_through_file(
    communicator: &mut dyn Communicator,
    context: &ExecutionContext,
    script: &str,
    tmp_file_keys: &[String],
    root_dir_key: &Option<String>,
) -> Result<Value> {
    let mut script = script.to_string();

    if let Some(root_key) = root_dir_key {
        let jobs_root = context
            .jobs_root
            .as_deref()
            .with_context(|| format!("command uses root dir key \"{}\" but no jobs root is configured", root_key))?;
        script = script.replace(
            &format!("{{{}}}", root_key),
            &jobs_root.replace('\\', "/"),
        );
    }

    // Each placeholder gets its own uniquely named scratch file, owned
    // exclusively by this command and removed after read-back
    let mut tmp_files: Vec<(String, PathBuf)> = Vec::new();
    for key in tmp_file_keys {
        let path = std::env::temp_dir().join(format!("georgeq_{}.txt", Uuid::new_v4()));
        fs::write(&path, b"").with_context(|| format!("failed to create {}", path.display()))?;
        let path_str = path.to_string_lossy().replace('\\', "/");
        script = script.replace(&format!("{{{}}}", key), &path_str);
        tmp_files.push((key.clone(), path));
    }

    let exec_result = communicator.execute_george_through_file(&script);

    let mut outputs: HashMap<String, String> = HashMap::new();
    let mut read_error = None;
    for (key, path) in &tmp_files {
        match fs::read_to_string(path) {
            Ok(content) => {
                outputs.insert(key.clone(), content);
            }
            Err(err) if read_error.is_none() => {
                read_error = Some(
                    anyhow::anyhow!(err)
                        .context(format!("failed to read back scratch file for \"{}\"", key)),
                );
            }
            Err(_) => {}
        }
        fs::remove_file(path).ok();
    }

    exec_result?;
    if let Some(err) = read_error {
        return Err(err);
    }

    if tmp_files.is_empty() {
        Ok(Value::Bool(true))
    } else {
        Ok(serde_json::to_value(outputs)?)
    }
}

/// Sender-side batch: owns its commands, builds the job payload, merges
/// results back after the round trip.
#[derive(Debug)]
pub struct SenderCommands {
    workfile: String,
    host_name: String,
    commands: Vec<Command>,
}

impl SenderCommands {
    pub fn new(workfile: impl Into<String>, host_name: impl Into<String>) -> Self {
        Self {
            workfile: workfile.into(),
            host_name: host_name.into(),
            commands: Vec::new(),
        }
    }

    pub fn add_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Job payload: `{workfile, function: "commands", commands: [...]}`.
    pub fn job_data(&self) -> Value {
        json!({
            "workfile": self.workfile.replace('\\', "/"),
            "function": "commands",
            "commands": self.commands.iter().map(Command::command_data).collect::<Vec<_>>(),
        })
    }

    /// Submit the batch as one job and block until it finishes.
    ///
    /// On success every command carries its result and is marked done; a
    /// failed job surfaces as [`crate::job::JobError::Failed`].
    pub fn send_job_and_wait(&mut self, client: &JobQueueClient) -> Result<()> {
        let job_id = client.send_job(&self.host_name, self.job_data())?;
        let status = client.wait_for_job(&job_id)?;
        self.merge_results(&status)
    }

    /// Merge per-command results by id - robust against reordering.
    fn merge_results(&mut self, status: &JobStatus) -> Result<()> {
        let results = status
            .result
            .as_ref()
            .and_then(|v| v.as_array())
            .context("job status misses per-command results")?;

        let mut result_by_id: HashMap<&str, &Value> = HashMap::new();
        for entry in results {
            if let Some(id) = entry.get("id").and_then(|v| v.as_str()) {
                result_by_id.insert(id, entry);
            }
        }

        for command in &mut self.commands {
            let entry = result_by_id
                .get(command.id.as_str())
                .with_context(|| format!("no result for command {}", command.id))?;
            command.result = entry.get("result").cloned();
            command.done = entry
                .get("done")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
        }
        Ok(())
    }
}

/// Processor-side batch: deserialized from a job payload and executed
/// against the live host, workfile bracketed around the run.
#[derive(Debug)]
pub struct ProcessorCommands {
    workfile: String,
    commands: Vec<Command>,
}

impl ProcessorCommands {
    pub fn from_job_data(data: &Value) -> Result<Self> {
        let workfile = data
            .get("workfile")
            .and_then(|v| v.as_str())
            .context("job data misses \"workfile\"")?
            .to_string();

        let function = data.get("function").and_then(|v| v.as_str());
        if function != Some("commands") {
            bail!(
                "unsupported job function {:?}, expected \"commands\"",
                function
            );
        }

        let raw_commands = data
            .get("commands")
            .and_then(|v| v.as_array())
            .context("job data misses \"commands\"")?;
        let mut commands = Vec::with_capacity(raw_commands.len());
        for raw in raw_commands {
            commands.push(Command::from_existing(raw)?);
        }

        Ok(Self { workfile, commands })
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Open the workfile, run every command in order, close the workfile.
    ///
    /// The first failing command aborts the batch; the workfile close still
    /// runs so the host is not left with a stale project open.
    pub fn execute(
        &mut self,
        communicator: &mut dyn Communicator,
        context: &ExecutionContext,
    ) -> Result<()> {
        communicator.open_workfile(&self.workfile)?;

        let mut outcome = Ok(());
        for command in &mut self.commands {
            outcome = command.execute(communicator, context);
            if outcome.is_err() {
                break;
            }
        }

        let close_outcome = communicator.close_workfile();
        outcome?;
        close_outcome
    }

    /// Wire form of all command results, in execution order.
    pub fn result_data(&self) -> Value {
        Value::Array(self.commands.iter().map(Command::result_data).collect())
    }
}
