use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

mod engine;
mod layout;
mod setup;
mod trc;

pub use engine::{KinematicsEngine, OpenSimCmd, DEFAULT_OPENSIM_CMD, OPENSIM_CMD_ENV};
pub use layout::{has_markers, ParticipantLayout};
pub use setup::{render_setup, IkSetup};
pub use trc::{FrameRange, MarkerReader, TrcError, TrcReader};

/// Subtracted from the last recorded frame time when the window comes from
/// the marker file. The solver is unstable when asked for the exact last frame.
pub const END_FRAME_EPSILON: f64 = 1e-2;

/// Trial identifier -> `[start, end]` in seconds.
pub type OnsetMap = BTreeMap<String, [f64; 2]>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trial {
    pub path: PathBuf,
    pub id: String,
}

impl Trial {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let id = trial_id(&path)?;
        Ok(Self { path, id })
    }
}

/// Marker files for a batch: one path or an ordered list of paths.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialSource {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

impl TrialSource {
    pub fn to_trials(&self) -> Result<Vec<Trial>> {
        let paths: Vec<&PathBuf> = match self {
            TrialSource::One(path) => vec![path],
            TrialSource::Many(paths) => paths.iter().collect(),
        };
        if paths.is_empty() {
            bail!("no marker files given for inverse kinematics");
        }
        paths.into_iter().map(|p| Trial::new(p.clone())).collect()
    }
}

impl From<PathBuf> for TrialSource {
    fn from(value: PathBuf) -> Self {
        TrialSource::One(value)
    }
}

impl From<&Path> for TrialSource {
    fn from(value: &Path) -> Self {
        TrialSource::One(value.to_path_buf())
    }
}

impl From<&str> for TrialSource {
    fn from(value: &str) -> Self {
        TrialSource::One(PathBuf::from(value))
    }
}

impl From<Vec<PathBuf>> for TrialSource {
    fn from(value: Vec<PathBuf>) -> Self {
        TrialSource::Many(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSource {
    Onsets,
    MarkerFile,
}

impl WindowSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowSource::Onsets => "onsets",
            WindowSource::MarkerFile => "marker_file",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
    pub source: WindowSource,
}

/// Inputs of one inverse kinematics batch.
#[derive(Debug, Clone)]
pub struct IkBatchConfig {
    /// Generic (usually scaled) model, `.osim`.
    pub model: PathBuf,
    /// Inverse kinematics setup template, `.xml`.
    pub setup_template: PathBuf,
    /// Where each trial's configured setup is written before it runs.
    /// Overwritten per trial; the last trial's setup is what remains.
    pub setup_output: PathBuf,
    pub trials: TrialSource,
    /// Directory receiving the `.mot` results.
    pub mot_output: PathBuf,
    pub onsets: Option<OnsetMap>,
    /// Put in front of every output name, typically the model name.
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialPlan {
    pub trial: Trial,
    pub window: TimeWindow,
    pub setup: IkSetup,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub trials: Vec<TrialPlan>,
    pub setup_output: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub fn trial_id(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("marker file path has no file stem: {}", path.display()))
}

pub fn output_filename(prefix: Option<&str>, id: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{}_{}", prefix, id),
        _ => id.to_string(),
    }
}

/// Onsets win when the table has the trial; otherwise the marker file is read.
/// No table at all means every trial falls back to its marker file.
pub fn resolve_window(
    trial: &Trial,
    onsets: Option<&OnsetMap>,
    reader: &dyn MarkerReader,
) -> Result<TimeWindow> {
    if let Some([start, end]) = onsets.and_then(|table| table.get(&trial.id)).copied() {
        return Ok(TimeWindow {
            start,
            end,
            source: WindowSource::Onsets,
        });
    }
    let range = reader
        .frame_range(&trial.path)
        .with_context(|| format!("reading marker data {}", trial.path.display()))?;
    Ok(TimeWindow {
        start: range.first,
        end: range.last - END_FRAME_EPSILON,
        source: WindowSource::MarkerFile,
    })
}

pub fn plan_trial(
    config: &IkBatchConfig,
    trial: &Trial,
    reader: &dyn MarkerReader,
) -> Result<TrialPlan> {
    let name = output_filename(config.prefix.as_deref(), &trial.id);
    let window = resolve_window(trial, config.onsets.as_ref(), reader)?;
    let setup = IkSetup {
        output_motion_file: config.mot_output.join(format!("{}.mot", name)),
        name,
        model_file: config.model.clone(),
        marker_file: trial.path.clone(),
        results_directory: config.mot_output.clone(),
        start_time: window.start,
        end_time: window.end,
    };
    Ok(TrialPlan {
        trial: trial.clone(),
        window,
        setup,
    })
}

/// Every trial's setup, without touching the solver.
pub fn plan_batch(config: &IkBatchConfig, reader: &dyn MarkerReader) -> Result<Vec<TrialPlan>> {
    config
        .trials
        .to_trials()?
        .iter()
        .map(|trial| plan_trial(config, trial, reader))
        .collect()
}

/// Runs the trials in order: window, setup record, solver. The first failure
/// ends the batch; results of earlier trials stay on disk.
pub fn run_batch(
    config: &IkBatchConfig,
    engine: &mut dyn KinematicsEngine,
    reader: &dyn MarkerReader,
) -> Result<BatchResult> {
    let trials = config.trials.to_trials()?;
    ensure_dir(&config.mot_output)?;
    let started_at = Utc::now();
    let mut completed = Vec::with_capacity(trials.len());
    for trial in &trials {
        println!("\t{}", trial.id);
        let plan = plan_trial(config, trial, reader)?;
        info!(
            trial = %trial.id,
            name = %plan.setup.name,
            start = plan.window.start,
            end = plan.window.end,
            window = plan.window.source.as_str(),
            "running inverse kinematics"
        );
        engine
            .write_setup(&plan.setup, &config.setup_output)
            .with_context(|| format!("writing setup {}", config.setup_output.display()))?;
        debug!(setup = %config.setup_output.display(), "setup written");
        engine
            .run(&plan.setup, &config.setup_output)
            .with_context(|| format!("inverse kinematics failed for trial {}", trial.id))?;
        completed.push(plan);
    }
    Ok(BatchResult {
        trials: completed,
        setup_output: config.setup_output.clone(),
        started_at,
        finished_at: Utc::now(),
    })
}

/// Loads the model and template into `opensim-cmd` once, then runs the batch.
pub fn run_ik(config: &IkBatchConfig, program: Option<&Path>) -> Result<BatchResult> {
    let mut engine = OpenSimCmd::load(program, &config.model, &config.setup_template)?;
    info!(
        program = %engine.program().display(),
        model = %config.model.display(),
        "solver ready"
    );
    run_batch(config, &mut engine, &TrcReader)
}

/// Reads an onset table from YAML or JSON. Accepts a bare mapping of trial
/// names to `[start, end]`, or a participant configuration carrying the table
/// under `onset`. A configuration without onsets gives an empty table.
pub fn load_onsets(path: &Path) -> Result<OnsetMap> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading onsets {}", path.display()))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing onsets {}", path.display()))?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    let table = match json_value {
        Value::Null => return Ok(OnsetMap::new()),
        Value::Object(mut map) => match map.remove("onset") {
            Some(Value::Null) => {
                debug!(path = %path.display(), "empty onset field, using marker windows");
                return Ok(OnsetMap::new());
            }
            Some(nested @ Value::Object(_)) => nested,
            Some(other) => {
                return Err(anyhow!(
                    "onset field of {} must be a mapping, found {}",
                    path.display(),
                    value_type_name(&other)
                ))
            }
            // Only a mapping made entirely of windows is a bare table.
            None if map.values().all(Value::is_array) => Value::Object(map),
            None => {
                debug!(path = %path.display(), "no onset field, using marker windows");
                return Ok(OnsetMap::new());
            }
        },
        other => {
            return Err(anyhow!(
                "onsets {} must be a mapping, found {}",
                path.display(),
                value_type_name(&other)
            ))
        }
    };
    serde_json::from_value(table)
        .with_context(|| format!("onsets {} must map trial names to [start, end]", path.display()))
}

/// `*.trc` files directly inside `dir`, sorted by name.
pub fn discover_trials(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_trc = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("trc"))
            .unwrap_or(false);
        if is_trc {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(crate) fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))
}

pub(crate) fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}
