use crate::setup::{render_setup, root_element, validate_template, IkSetup};
use crate::atomic_write_bytes;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

pub const OPENSIM_CMD_ENV: &str = "OPENSIM_CMD";
pub const DEFAULT_OPENSIM_CMD: &str = "opensim-cmd";

const MODEL_ROOT: &str = "OpenSimDocument";

/// The inverse kinematics solver. Receives a complete setup for every call
/// and keeps nothing from one trial to the next.
pub trait KinematicsEngine {
    /// Serializes `setup` to `path`, replacing whatever was there.
    fn write_setup(&mut self, setup: &IkSetup, path: &Path) -> Result<()>;

    /// Solves the trial described by `setup`, previously written to `setup_path`.
    fn run(&mut self, setup: &IkSetup, setup_path: &Path) -> Result<()>;
}

/// Drives OpenSim through `opensim-cmd run-tool <setup.xml>`.
#[derive(Debug, Clone)]
pub struct OpenSimCmd {
    program: PathBuf,
    template: String,
}

impl OpenSimCmd {
    /// Checks the model and reads the setup template. Done once per batch.
    pub fn load(program: Option<&Path>, model: &Path, template: &Path) -> Result<Self> {
        if !model.is_file() {
            return Err(anyhow!("model file not found: {}", model.display()));
        }
        let model_xml = fs::read_to_string(model)
            .with_context(|| format!("reading model {}", model.display()))?;
        let root = root_element(&model_xml)
            .with_context(|| format!("parsing model {}", model.display()))?;
        if root.as_deref() != Some(MODEL_ROOT) {
            return Err(anyhow!(
                "{} is not an OpenSim model: root element is {}",
                model.display(),
                root.map(|r| format!("<{}>", r)).unwrap_or_else(|| "missing".to_string())
            ));
        }
        let template_xml = fs::read_to_string(template)
            .with_context(|| format!("reading setup template {}", template.display()))?;
        validate_template(&template_xml)
            .with_context(|| format!("loading setup template {}", template.display()))?;
        Ok(Self {
            program: resolve_program(program),
            template: template_xml,
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl KinematicsEngine for OpenSimCmd {
    fn write_setup(&mut self, setup: &IkSetup, path: &Path) -> Result<()> {
        let xml = render_setup(&self.template, setup)?;
        atomic_write_bytes(path, xml.as_bytes())
    }

    fn run(&mut self, setup: &IkSetup, setup_path: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("run-tool").arg(setup_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::piped());
        debug!(
            program = %self.program.display(),
            setup = %setup_path.display(),
            "spawning solver"
        );
        let child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", self.program.display()))?;
        let output = child.wait_with_output()?;
        if output.status.success() {
            return Ok(());
        }
        let stderr_tail = String::from_utf8_lossy(&output.stderr)
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("solver exited without output")
            .to_string();
        let status = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        warn!(trial = %setup.name, status = %status, stderr = %stderr_tail, "solver failed");
        Err(anyhow!(
            "{} run-tool exited with status {} for {}: {}",
            self.program.display(),
            status,
            setup.name,
            stderr_tail
        ))
    }
}

/// Explicit path, then `$OPENSIM_CMD`, then `opensim-cmd` on `PATH`.
fn resolve_program(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(OPENSIM_CMD_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OPENSIM_CMD))
}
