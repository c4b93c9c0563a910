use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use ik_runner::{BatchResult, IkBatchConfig, TrialPlan, TrialSource};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ik", version = "0.3.0", about = "Batch OpenSim inverse kinematics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BatchArgs {
    /// Generic model (.osim)
    #[arg(long)]
    model: PathBuf,
    /// Inverse kinematics setup template (.xml)
    #[arg(long)]
    setup_template: PathBuf,
    /// Setup file rewritten before each trial
    #[arg(long)]
    setup_output: PathBuf,
    /// Directory for the .mot results
    #[arg(long)]
    mot_output: PathBuf,
    /// YAML/JSON table of trial -> [start, end]
    #[arg(long)]
    onsets: Option<PathBuf>,
    /// Prefix for output names, typically the model name
    #[arg(long)]
    prefix: Option<String>,
    /// Marker files (.trc); a directory stands for the .trc files inside it
    #[arg(required = true)]
    trials: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[command(flatten)]
        batch: BatchArgs,
        #[arg(long)]
        opensim_cmd: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Participant {
        #[arg(long)]
        project: PathBuf,
        #[arg(long)]
        participant: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        templates: PathBuf,
        #[arg(long)]
        opensim_cmd: Option<PathBuf>,
        /// Print the planned trials without running the solver
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[command(flatten)]
        batch: BatchArgs,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ik=info,ik_runner=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            batch,
            opensim_cmd,
            json,
        } => {
            let config = batch_config(batch)?;
            let result = ik_runner::run_ik(&config, opensim_cmd.as_deref())?;
            log_finished(&result);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "batch": serde_json::to_value(&result)?,
                })));
            }
            print_batch(&result);
        }
        Commands::Participant {
            project,
            participant,
            model,
            templates,
            opensim_cmd,
            dry_run,
            json,
        } => {
            let layout = ik_runner::ParticipantLayout::new(project, participant, model, templates);
            if !ik_runner::has_markers(&layout.participant_dir()) {
                return Err(anyhow!(
                    "not a participant directory (missing {}): {}",
                    layout.markers_dir().display(),
                    layout.participant_dir().display()
                ));
            }
            let config = layout.to_batch_config()?;
            if dry_run {
                let plans = ik_runner::plan_batch(&config, &ik_runner::TrcReader)?;
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "participant",
                        "dry_run": true,
                        "trials": serde_json::to_value(&plans)?,
                    })));
                }
                print_trials(&plans);
                return Ok(None);
            }
            let result = ik_runner::run_ik(&config, opensim_cmd.as_deref())?;
            log_finished(&result);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "participant",
                    "dry_run": false,
                    "batch": serde_json::to_value(&result)?,
                })));
            }
            print_batch(&result);
        }
        Commands::Describe { batch, json } => {
            let config = batch_config(batch)?;
            let plans = ik_runner::plan_batch(&config, &ik_runner::TrcReader)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "trials": serde_json::to_value(&plans)?,
                })));
            }
            print_trials(&plans);
        }
    }
    Ok(None)
}

fn batch_config(args: BatchArgs) -> Result<IkBatchConfig> {
    let onsets = match &args.onsets {
        Some(path) => Some(ik_runner::load_onsets(path)?),
        None => None,
    };
    Ok(IkBatchConfig {
        model: args.model,
        setup_template: args.setup_template,
        setup_output: args.setup_output,
        trials: trial_source(&args.trials)?,
        mot_output: args.mot_output,
        onsets,
        prefix: args.prefix,
    })
}

fn trial_source(inputs: &[PathBuf]) -> Result<TrialSource> {
    if let [single] = inputs {
        if !single.is_dir() {
            return Ok(TrialSource::One(single.clone()));
        }
    }
    let mut paths = Vec::new();
    for input in inputs {
        if input.is_dir() {
            paths.extend(ik_runner::discover_trials(input)?);
        } else {
            paths.push(input.clone());
        }
    }
    Ok(TrialSource::Many(paths))
}

fn print_trials(plans: &[TrialPlan]) {
    for plan in plans {
        println!(
            "{}\t{:.3}\t{:.3}\t{}\t{}",
            plan.setup.name,
            plan.window.start,
            plan.window.end,
            plan.window.source.as_str(),
            plan.setup.output_motion_file.display()
        );
    }
}

fn log_finished(result: &BatchResult) {
    info!(
        trials = result.trials.len(),
        elapsed_ms = (result.finished_at - result.started_at).num_milliseconds(),
        "batch finished"
    );
}

fn print_batch(result: &BatchResult) {
    print_trials(&result.trials);
    println!("setup_output: {}", result.setup_output.display());
    println!("trials: {}", result.trials.len());
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Participant { json, .. }
        | Commands::Describe { json, .. } => *json,
    }
}
