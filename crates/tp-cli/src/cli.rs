use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use tp_context::SnapshotKind;
use tp_core::types::{AgentGuidance, Priority, SubTaskStatus, TaskStatus};
use tp_engine::commands::WorkflowTaskArg;
use tp_engine::{Command, TaskUpdate, WorkflowTaskSpec};

/// taskpilot -- dependency-aware task workflows for AI coding agents.
#[derive(Debug, Parser)]
#[command(name = "tp", version, about)]
pub struct Cli {
    /// Config file (default: `TASKPILOT_CONFIG`, then ~/.taskpilot/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override `general.data_dir`.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Pretty-print the JSON envelope.
    #[arg(long, global = true)]
    pub pretty: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a task.
    Create {
        content: String,
        #[arg(long, value_parser = parse_enum::<Priority>)]
        priority: Option<Priority>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Task that must complete first (repeatable).
        #[arg(long = "depends-on")]
        dependencies: Vec<Uuid>,
    },

    /// Change a task's fields.
    Update(UpdateArgs),

    /// Move a task to any status the transition rules allow.
    SetStatus {
        id: Uuid,
        #[arg(value_parser = parse_enum::<TaskStatus>)]
        status: TaskStatus,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Start a task (blocked instead if dependencies are unmet).
    Start { id: Uuid },

    /// Complete a task.
    Complete {
        id: Uuid,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Cancel a task.
    Cancel {
        id: Uuid,
        #[arg(long)]
        notes: Option<String>,
    },

    Pause { id: Uuid },

    Resume { id: Uuid },

    Delete { id: Uuid },

    /// List tasks, most recently updated first.
    List {
        #[arg(long, value_parser = parse_enum::<TaskStatus>)]
        status: Option<TaskStatus>,
        #[arg(long)]
        workflow: Option<Uuid>,
    },

    Get { id: Uuid },

    /// Counts per status and session flags.
    Summary,

    /// Create or inspect workflows.
    #[command(subcommand)]
    Workflow(WorkflowCommand),

    #[command(subcommand)]
    Subtask(SubtaskCommand),

    /// Estimate effort and propose subtasks.
    Analyze { id: Uuid },

    /// Record where work on a task stands.
    Checkpoint {
        id: Uuid,
        note: String,
        /// Environment entry as KEY=VALUE (repeatable).
        #[arg(long = "env", value_parser = parse_key_value)]
        environment: Vec<(String, String)>,
    },

    /// Turn auto-progression on or off (flips it when omitted).
    Auto {
        #[arg(value_parser = parse_switch)]
        enabled: Option<bool>,
    },

    Approve {
        id: Uuid,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Recovery report for a task; `--generate` asks the model.
    Guidance {
        id: Uuid,
        #[arg(long)]
        generate: bool,
    },

    /// Ordered next steps for a task.
    Next { id: Uuid },

    /// Reset the session, archiving it unless `--no-archive`.
    Clear {
        #[arg(long)]
        no_archive: bool,
    },

    /// List archived sessions.
    Archived,

    #[command(subcommand)]
    Context(ContextCommand),

    /// Run a raw JSON command (`-` reads it from stdin).
    Exec { json: String },
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    pub id: Uuid,
    #[arg(long)]
    pub content: Option<String>,
    #[arg(long, value_parser = parse_enum::<Priority>)]
    pub priority: Option<Priority>,
    /// Replace the tags (repeatable).
    #[arg(long = "tag")]
    pub tags: Vec<String>,
    /// Replace the dependencies (repeatable).
    #[arg(long = "depends-on", conflicts_with = "no_dependencies")]
    pub dependencies: Vec<Uuid>,
    /// Remove every dependency.
    #[arg(long)]
    pub no_dependencies: bool,
    /// Estimated effort in minutes.
    #[arg(long)]
    pub estimate: Option<f64>,
    /// Actual effort in minutes.
    #[arg(long)]
    pub actual: Option<f64>,
    #[arg(long)]
    pub instructions: Option<String>,
    #[arg(long)]
    pub objective: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum WorkflowCommand {
    /// Create a chain of tasks, each depending on the previous one.
    Create {
        #[arg(required = true)]
        steps: Vec<String>,
        /// 1-based step that needs approval before it may start (repeatable).
        #[arg(long = "approve")]
        approval_steps: Vec<usize>,
        #[arg(long)]
        analyze: bool,
    },
    /// Progress of a workflow (defaults to the current one).
    Status { id: Option<Uuid> },
}

#[derive(Debug, Subcommand)]
pub enum SubtaskCommand {
    Add { task_id: Uuid, content: String },
    Update {
        task_id: Uuid,
        subtask_id: Uuid,
        #[arg(long, value_parser = parse_enum::<SubTaskStatus>)]
        status: Option<SubTaskStatus>,
        #[arg(long)]
        content: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ContextCommand {
    /// Append an event to a workflow's context log.
    Add {
        #[arg(value_parser = parse_enum::<SnapshotKind>)]
        kind: SnapshotKind,
        content: String,
        #[arg(long)]
        workflow: Option<Uuid>,
        #[arg(long)]
        task: Option<Uuid>,
        #[arg(long, value_parser = parse_enum::<Priority>)]
        priority: Option<Priority>,
    },
    /// Render the context an agent would receive for `prompt`.
    Show {
        prompt: String,
        #[arg(long)]
        workflow: Option<Uuid>,
    },
}

/// What the session should run.
#[derive(Debug)]
pub enum Request {
    Command(Command),
    /// Raw JSON, parsed by the engine so errors come back as envelopes.
    Raw(String),
}

impl Commands {
    pub fn into_request(self) -> Result<Request> {
        let command = match self {
            Commands::Create {
                content,
                priority,
                tags,
                dependencies,
            } => Command::CreateTask {
                content,
                priority,
                tags,
                dependencies,
            },
            Commands::Update(args) => args.into_command()?,
            Commands::SetStatus { id, status, notes } => Command::SetStatus { id, status, notes },
            Commands::Start { id } => Command::StartTask { id },
            Commands::Complete { id, notes } => Command::CompleteTask { id, notes },
            Commands::Cancel { id, notes } => Command::CancelTask { id, notes },
            Commands::Pause { id } => Command::PauseTask { id },
            Commands::Resume { id } => Command::ResumeTask { id },
            Commands::Delete { id } => Command::DeleteTask { id },
            Commands::List { status, workflow } => Command::ListTasks {
                status,
                workflow_id: workflow,
            },
            Commands::Get { id } => Command::GetTask { id },
            Commands::Summary => Command::Summary,
            Commands::Workflow(WorkflowCommand::Create {
                steps,
                approval_steps,
                analyze,
            }) => {
                if let Some(bad) = approval_steps.iter().find(|n| **n == 0 || **n > steps.len()) {
                    bail!("--approve {bad} is outside 1..={}", steps.len());
                }
                let tasks = steps
                    .into_iter()
                    .enumerate()
                    .map(|(i, content)| {
                        let spec = WorkflowTaskSpec::new(content);
                        let spec = if approval_steps.contains(&(i + 1)) {
                            spec.with_approval()
                        } else {
                            spec
                        };
                        WorkflowTaskArg::Spec(spec)
                    })
                    .collect();
                Command::CreateWorkflow { tasks, analyze }
            }
            Commands::Workflow(WorkflowCommand::Status { id }) => {
                Command::WorkflowStatus { workflow_id: id }
            }
            Commands::Subtask(SubtaskCommand::Add { task_id, content }) => {
                Command::AddSubtask { task_id, content }
            }
            Commands::Subtask(SubtaskCommand::Update {
                task_id,
                subtask_id,
                status,
                content,
            }) => Command::UpdateSubtask {
                task_id,
                subtask_id,
                status,
                content,
            },
            Commands::Analyze { id } => Command::Analyze { id },
            Commands::Checkpoint {
                id,
                note,
                environment,
            } => Command::Checkpoint {
                id,
                note,
                environment: environment.into_iter().collect::<BTreeMap<_, _>>(),
            },
            Commands::Auto { enabled } => Command::ToggleAutoProgression { enabled },
            Commands::Approve { id, notes } => Command::Approve { id, notes },
            Commands::Guidance { id, generate } => {
                if generate {
                    Command::RequestGuidance { id }
                } else {
                    Command::GetGuidance { id }
                }
            }
            Commands::Next { id } => Command::GetNextSteps { id },
            Commands::Clear { no_archive } => Command::Clear {
                archive: !no_archive,
            },
            Commands::Archived => Command::ListArchived,
            Commands::Context(ContextCommand::Add {
                kind,
                content,
                workflow,
                task,
                priority,
            }) => Command::AddContext {
                workflow_id: workflow,
                kind,
                content,
                task_id: task,
                priority,
            },
            Commands::Context(ContextCommand::Show { prompt, workflow }) => Command::GetContext {
                workflow_id: workflow,
                prompt,
            },
            Commands::Exec { json } => return Ok(Request::Raw(json)),
        };
        Ok(Request::Command(command))
    }
}

impl UpdateArgs {
    fn into_command(self) -> Result<Command> {
        let guidance = (self.instructions.is_some() || self.objective.is_some()).then(|| {
            AgentGuidance {
                instructions: self.instructions,
                parent_objective: self.objective,
                ..Default::default()
            }
        });
        let dependencies = if self.no_dependencies {
            Some(Vec::new())
        } else {
            (!self.dependencies.is_empty()).then_some(self.dependencies)
        };
        let update = TaskUpdate {
            content: self.content,
            priority: self.priority,
            tags: (!self.tags.is_empty()).then_some(self.tags),
            dependencies,
            guidance,
            estimated_minutes: self.estimate,
            actual_minutes: self.actual,
        };
        if update.is_empty() {
            bail!("nothing to update; pass at least one field");
        }
        Ok(Command::UpdateTask {
            id: self.id,
            update,
        })
    }
}

// ---------------------------------------------------------------------------
// Value parsers
// ---------------------------------------------------------------------------

/// Parse a snake_case enum through its serde representation.
fn parse_enum<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
    serde_json::from_value(serde_json::Value::String(normalized))
        .map_err(|_| format!("unrecognised value '{raw}'"))
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn parse_switch(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        other => Err(format!("expected on or off, got '{other}'")),
    }
}

/// Read the `exec` payload, taking `-` to mean stdin.
pub fn read_raw(json: String) -> Result<String> {
    if json != "-" {
        return Ok(json);
    }
    std::io::read_to_string(std::io::stdin()).context("failed to read command from stdin")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(args: &[&str]) -> Request {
        let mut argv = vec!["tp"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)
            .expect("parse")
            .command
            .into_request()
            .expect("request")
    }

    fn command(args: &[&str]) -> Command {
        match request(args) {
            Request::Command(c) => c,
            Request::Raw(raw) => panic!("unexpected raw request {raw}"),
        }
    }

    #[test]
    fn create_collects_tags_and_dependencies() {
        let dep = Uuid::new_v4();
        let cmd = command(&[
            "create",
            "write docs",
            "--priority",
            "high",
            "--tag",
            "docs",
            "--depends-on",
            &dep.to_string(),
        ]);
        let Command::CreateTask {
            content,
            priority,
            tags,
            dependencies,
        } = cmd
        else {
            panic!("expected create_task");
        };
        assert_eq!(content, "write docs");
        assert_eq!(priority, Some(Priority::High));
        assert_eq!(tags, vec!["docs"]);
        assert_eq!(dependencies, vec![dep]);
    }

    #[test]
    fn statuses_accept_dashes() {
        let id = Uuid::new_v4();
        let cmd = command(&["set-status", &id.to_string(), "in-progress"]);
        assert!(matches!(
            cmd,
            Command::SetStatus {
                status: TaskStatus::InProgress,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["tp", "set-status", &id.to_string(), "finished"]).is_err());
    }

    #[test]
    fn workflow_marks_approval_steps() {
        let cmd = command(&["workflow", "create", "plan", "deploy", "--approve", "2"]);
        let Command::CreateWorkflow { tasks, analyze } = cmd else {
            panic!("expected create_workflow");
        };
        assert!(!analyze);
        let specs: Vec<WorkflowTaskSpec> = tasks.into_iter().map(Into::into).collect();
        assert!(!specs[0].approval_required);
        assert!(specs[1].approval_required);
    }

    #[test]
    fn approval_step_out_of_range_is_rejected() {
        let cli = Cli::try_parse_from(["tp", "workflow", "create", "plan", "--approve", "3"])
            .expect("parse");
        assert!(cli.command.into_request().is_err());
    }

    #[test]
    fn update_requires_a_field() {
        let id = Uuid::new_v4().to_string();
        let cli = Cli::try_parse_from(["tp", "update", &id]).expect("parse");
        assert!(cli.command.into_request().is_err());

        let cmd = command(&["update", &id, "--no-dependencies", "--estimate", "30"]);
        let Command::UpdateTask { update, .. } = cmd else {
            panic!("expected update_task");
        };
        assert_eq!(update.dependencies, Some(vec![]));
        assert_eq!(update.estimated_minutes, Some(30.0));
        assert!(update.tags.is_none());
    }

    #[test]
    fn checkpoint_environment_pairs() {
        let id = Uuid::new_v4().to_string();
        let cmd = command(&["checkpoint", &id, "halfway", "--env", "branch=main"]);
        let Command::Checkpoint { environment, .. } = cmd else {
            panic!("expected checkpoint");
        };
        assert_eq!(environment["branch"], "main");
        assert!(Cli::try_parse_from(["tp", "checkpoint", &id, "x", "--env", "novalue"]).is_err());
    }

    #[test]
    fn auto_switch_and_guidance_modes() {
        assert!(matches!(
            command(&["auto", "on"]),
            Command::ToggleAutoProgression { enabled: Some(true) }
        ));
        assert!(matches!(
            command(&["auto"]),
            Command::ToggleAutoProgression { enabled: None }
        ));
        let id = Uuid::new_v4().to_string();
        assert!(matches!(
            command(&["guidance", &id, "--generate"]),
            Command::RequestGuidance { .. }
        ));
        assert!(matches!(
            command(&["guidance", &id]),
            Command::GetGuidance { .. }
        ));
        assert!(matches!(
            command(&["clear", "--no-archive"]),
            Command::Clear { archive: false }
        ));
    }

    #[test]
    fn exec_passes_raw_json_through() {
        match request(&["exec", r#"{"command":"summary"}"#]) {
            Request::Raw(raw) => assert_eq!(raw, r#"{"command":"summary"}"#),
            Request::Command(c) => panic!("unexpected command {c:?}"),
        }
    }
}
