//! `muster`: the embedded CLI adapter over the in-memory orchestrator.
//!
//! `serve` hosts a long-running `OrchestratorHandle` behind
//! `muster-server`'s REST/WebSocket API. `submit` and `workflow run` can
//! either drive a throwaway in-process engine to completion and exit
//! (the default) or, with `--server`, act as a client of an
//! already-running `serve` process. `status` and `instances` always
//! talk to a server, since there is nothing in-process to report on
//! otherwise.

mod client;
mod config;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use muster_core::config::{CliOverrides, EngineConfig};
use muster_core::error::EngineError;
use muster_core::orchestrator::OrchestratorHandle;
use muster_core::types::{Payload, Priority, Task, TaskState, WorkerId};
use muster_core::workflow::WorkflowExecutor;

use client::ServerClient;

/// Exit codes, per the external-interface contract.
const EXIT_OK: i32 = 0;
const EXIT_GENERIC_FAILURE: i32 = 1;
const EXIT_INVALID_USAGE: i32 = 2;
const EXIT_CONFIG_ERROR: i32 = 3;
const EXIT_WORKFLOW_INVALID: i32 = 4;

#[derive(Parser)]
#[command(name = "muster", about = "In-memory orchestrator for long-lived worker processes")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, help = "Override max_instances")]
    max_instances: Option<usize>,
    #[arg(long, global = true, help = "Override the worker command, e.g. \"/bin/bash\"")]
    worker_command: Option<String>,
    #[arg(long, global = true, help = "Override the default task timeout, in seconds")]
    default_task_timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST/WebSocket server, hosting a live orchestrator.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 7878)]
        port: u16,
    },
    /// Submit a single task and wait for its result.
    Submit {
        #[arg(long)]
        name: Option<String>,
        #[arg(long, conflicts_with = "command_str")]
        prompt: Option<String>,
        #[arg(long = "command", conflicts_with = "prompt")]
        command_str: Option<String>,
        #[arg(long)]
        directory: Option<String>,
        #[arg(long, value_enum, default_value = "normal")]
        priority: CliPriority,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long)]
        pinned_instance: Option<WorkerId>,
        /// How many workers to spawn when running in-process (ignored with --server).
        #[arg(long, default_value_t = 1)]
        instances: usize,
        /// Talk to a running server instead of spinning up a throwaway engine.
        #[arg(long)]
        server: Option<String>,
    },
    /// Run a YAML workflow document to completion.
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Print the aggregate status of a running server.
    Status {
        #[arg(long)]
        server: Option<String>,
    },
    /// Manage instances on a running server.
    Instances {
        #[command(subcommand)]
        action: InstancesAction,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    Run {
        file: PathBuf,
        #[arg(long)]
        server: Option<String>,
    },
}

#[derive(Subcommand)]
enum InstancesAction {
    List {
        #[arg(long)]
        server: Option<String>,
    },
    Spawn {
        count: usize,
        #[arg(long)]
        server: Option<String>,
    },
    Scale {
        target: usize,
        #[arg(long)]
        server: Option<String>,
    },
    Terminate {
        id: WorkerId,
        #[arg(long)]
        server: Option<String>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl From<CliPriority> for Priority {
    fn from(p: CliPriority) -> Self {
        match p {
            CliPriority::Low => Priority::Low,
            CliPriority::Normal => Priority::Normal,
            CliPriority::High => Priority::High,
            CliPriority::Critical => Priority::Critical,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let overrides = CliOverrides {
        max_instances: cli.max_instances,
        default_task_timeout_secs: cli.default_task_timeout_secs,
        output_buffer_bytes: None,
        worker_command: cli.worker_command,
        health_sweep_interval_secs: None,
        stop_grace_secs: None,
    };

    match cli.command {
        Command::Serve { bind, port } => run_serve(overrides, &bind, port).await,
        Command::Submit {
            name,
            prompt,
            command_str,
            directory,
            priority,
            timeout_secs,
            pinned_instance,
            instances,
            server,
        } => {
            run_submit(
                overrides,
                name,
                prompt,
                command_str,
                directory,
                priority.into(),
                timeout_secs,
                pinned_instance,
                instances,
                server,
            )
            .await
        }
        Command::Workflow {
            action: WorkflowAction::Run { file, server },
        } => run_workflow(overrides, file, server).await,
        Command::Status { server } => run_status(server).await,
        Command::Instances { action } => run_instances(action).await,
    }
}

fn resolve_config(overrides: CliOverrides) -> Result<EngineConfig, i32> {
    EngineConfig::resolve(&overrides).map_err(|e| {
        tracing::error!(error = %e, "configuration error");
        EXIT_CONFIG_ERROR
    })
}

async fn run_serve(overrides: CliOverrides, bind: &str, port: u16) -> i32 {
    let config = match resolve_config(overrides) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let handle = Arc::new(OrchestratorHandle::start(config));
    match muster_server::run_serve(handle, bind, port).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            tracing::error!(error = %e, "server error");
            EXIT_GENERIC_FAILURE
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_submit(
    overrides: CliOverrides,
    name: Option<String>,
    prompt: Option<String>,
    command_str: Option<String>,
    directory: Option<String>,
    priority: Priority,
    timeout_secs: Option<u64>,
    pinned_instance: Option<WorkerId>,
    instances: usize,
    server: Option<String>,
) -> i32 {
    let payload = match (prompt, command_str) {
        (Some(prompt), None) => Payload::Prompt { prompt },
        (None, Some(command)) => Payload::Command {
            command,
            working_directory: directory,
        },
        _ => {
            eprintln!("exactly one of --prompt or --command is required");
            return EXIT_INVALID_USAGE;
        }
    };

    if let Some(server) = server {
        let client = ServerClient::new(config::resolve_server_url(Some(&server)));
        let body = serde_json::json!({
            "name": name,
            "prompt": match &payload { Payload::Prompt { prompt } => Some(prompt.clone()), _ => None },
            "command": match &payload { Payload::Command { command, .. } => Some(command.clone()), _ => None },
            "directory": match &payload { Payload::Command { working_directory, .. } => working_directory.clone(), _ => None },
            "priority": priority,
            "pinned_instance": pinned_instance,
            "timeout_secs": timeout_secs,
        });
        let task_id = match client.submit_task(body).await {
            Ok(id) => id,
            Err(e) => {
                eprintln!("submit failed: {e}");
                return EXIT_GENERIC_FAILURE;
            }
        };
        match client.await_terminal(task_id).await {
            Ok(task) => print_task_outcome(&task),
            Err(e) => {
                eprintln!("failed polling task result: {e}");
                EXIT_GENERIC_FAILURE
            }
        }
    } else {
        let config = match resolve_config(overrides) {
            Ok(c) => c,
            Err(code) => return code,
        };
        let default_timeout = config.default_task_timeout;
        let handle = OrchestratorHandle::start(config);
        if let Err(e) = handle.spawn_instances(instances).await {
            eprintln!("failed to spawn instances: {e}");
            handle.stop().await;
            return EXIT_GENERIC_FAILURE;
        }

        let task = Task::new(
            name.unwrap_or_else(|| "task".to_string()),
            payload,
            priority,
            HashSet::new(),
            pinned_instance,
            timeout_secs.map(Duration::from_secs).unwrap_or(default_timeout),
        );

        let id = match handle.submit(task).await {
            Ok(id) => id,
            Err(e) => {
                eprintln!("submit failed: {e}");
                handle.stop().await;
                return EXIT_GENERIC_FAILURE;
            }
        };
        let results = handle.await_terminal(&[id]).await;
        handle.stop().await;
        print_task_outcome(&results[0])
    }
}

fn print_task_outcome(task: &Task) -> i32 {
    println!("{}", serde_json::to_string_pretty(task).unwrap_or_default());
    match task.state {
        TaskState::Completed => EXIT_OK,
        _ => EXIT_GENERIC_FAILURE,
    }
}

async fn run_workflow(overrides: CliOverrides, file: PathBuf, server: Option<String>) -> i32 {
    let yaml = match std::fs::read_to_string(&file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to read {}: {e}", file.display());
            return EXIT_INVALID_USAGE;
        }
    };

    if let Some(server) = server {
        let client = ServerClient::new(config::resolve_server_url(Some(&server)));
        match client.execute_workflow(yaml).await {
            Ok((workflow_id, task_ids)) => {
                println!("workflow {workflow_id} submitted: {} tasks", task_ids.len());
                let mut failed = false;
                for id in task_ids {
                    match client.await_terminal(id).await {
                        Ok(task) => {
                            if task.state != TaskState::Completed {
                                failed = true;
                            }
                            println!("{}: {}", task.name, task.state);
                        }
                        Err(e) => {
                            eprintln!("failed polling task {id}: {e}");
                            failed = true;
                        }
                    }
                }
                if failed { EXIT_GENERIC_FAILURE } else { EXIT_OK }
            }
            Err(e) => {
                eprintln!("workflow execution failed: {e}");
                match e.downcast_ref::<client::HttpStatusError>() {
                    Some(se) if se.status == reqwest::StatusCode::BAD_REQUEST => EXIT_WORKFLOW_INVALID,
                    _ => EXIT_GENERIC_FAILURE,
                }
            }
        }
    } else {
        let config = match resolve_config(overrides) {
            Ok(c) => c,
            Err(code) => return code,
        };
        let doc = match WorkflowExecutor::parse(&yaml) {
            Ok(doc) => doc,
            Err(e) => {
                eprintln!("workflow document invalid: {e}");
                return EXIT_WORKFLOW_INVALID;
            }
        };

        let handle = OrchestratorHandle::start(config);
        let result = WorkflowExecutor::run(&handle, doc).await;
        let code = match result {
            Ok(tasks) => {
                let mut failed = false;
                for t in &tasks {
                    println!("{}: {}", t.name, t.state);
                    if t.state != TaskState::Completed {
                        failed = true;
                    }
                }
                if failed { EXIT_GENERIC_FAILURE } else { EXIT_OK }
            }
            Err(EngineError::WorkflowInvalid(msg)) => {
                eprintln!("workflow document invalid: {msg}");
                EXIT_WORKFLOW_INVALID
            }
            Err(e) => {
                eprintln!("workflow execution failed: {e}");
                EXIT_GENERIC_FAILURE
            }
        };
        handle.stop().await;
        code
    }
}

async fn run_status(server: Option<String>) -> i32 {
    let client = ServerClient::new(config::resolve_server_url(server.as_deref()));
    match client.status().await {
        Ok(status) => {
            println!("{}", serde_json::to_string_pretty(&status).unwrap_or_default());
            EXIT_OK
        }
        Err(e) => {
            eprintln!("status failed: {e}");
            EXIT_GENERIC_FAILURE
        }
    }
}

async fn run_instances(action: InstancesAction) -> i32 {
    match action {
        InstancesAction::List { server } => {
            let client = ServerClient::new(config::resolve_server_url(server.as_deref()));
            match client.list_instances().await {
                Ok(workers) => {
                    println!("{}", serde_json::to_string_pretty(&workers).unwrap_or_default());
                    EXIT_OK
                }
                Err(e) => {
                    eprintln!("failed to list instances: {e}");
                    EXIT_GENERIC_FAILURE
                }
            }
        }
        InstancesAction::Spawn { count, server } => {
            let client = ServerClient::new(config::resolve_server_url(server.as_deref()));
            match client.spawn_instances(count).await {
                Ok(ids) => {
                    for id in ids {
                        println!("{id}");
                    }
                    EXIT_OK
                }
                Err(e) => {
                    eprintln!("failed to spawn instances: {e}");
                    EXIT_GENERIC_FAILURE
                }
            }
        }
        InstancesAction::Scale { target, server } => {
            let client = ServerClient::new(config::resolve_server_url(server.as_deref()));
            match client.scale_instances(target).await {
                Ok(current) => {
                    println!("pool size now {current}");
                    EXIT_OK
                }
                Err(e) => {
                    eprintln!("failed to scale: {e}");
                    EXIT_GENERIC_FAILURE
                }
            }
        }
        InstancesAction::Terminate { id, server } => {
            let client = ServerClient::new(config::resolve_server_url(server.as_deref()));
            match client.terminate_instance(id).await {
                Ok(true) => EXIT_OK,
                Ok(false) => {
                    eprintln!("instance {id} not found");
                    EXIT_GENERIC_FAILURE
                }
                Err(e) => {
                    eprintln!("failed to terminate instance: {e}");
                    EXIT_GENERIC_FAILURE
                }
            }
        }
    }
}
