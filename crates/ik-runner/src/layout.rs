//! Participant project layout.
//!
//! ```text
//! {project}/{participant}/
//!     0_markers/*.trc
//!     _models/{model}_scaled_markers.osim
//!     _xml/{model}_ik.xml
//!     _conf.yaml                (optional, `onset` table)
//!     1_inverse_kinematic/
//! {templates}/{model}_ik.xml
//! ```

use crate::{discover_trials, load_onsets, IkBatchConfig, TrialSource};
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MARKERS_DIR: &str = "0_markers";
pub const MODELS_DIR: &str = "_models";
pub const SETUP_DIR: &str = "_xml";
pub const CONF_FILE: &str = "_conf.yaml";
pub const IK_OUTPUT_DIR: &str = "1_inverse_kinematic";

#[derive(Debug, Clone)]
pub struct ParticipantLayout {
    pub project: PathBuf,
    pub participant: String,
    pub model: String,
    pub templates: PathBuf,
}

impl ParticipantLayout {
    pub fn new(
        project: impl Into<PathBuf>,
        participant: impl Into<String>,
        model: impl Into<String>,
        templates: impl Into<PathBuf>,
    ) -> Self {
        Self {
            project: project.into(),
            participant: participant.into(),
            model: model.into(),
            templates: templates.into(),
        }
    }

    pub fn participant_dir(&self) -> PathBuf {
        self.project.join(&self.participant)
    }

    pub fn markers_dir(&self) -> PathBuf {
        self.participant_dir().join(MARKERS_DIR)
    }

    pub fn model_path(&self) -> PathBuf {
        self.participant_dir()
            .join(MODELS_DIR)
            .join(format!("{}_scaled_markers.osim", self.model))
    }

    pub fn setup_template(&self) -> PathBuf {
        self.templates.join(format!("{}_ik.xml", self.model))
    }

    pub fn setup_output(&self) -> PathBuf {
        self.participant_dir()
            .join(SETUP_DIR)
            .join(format!("{}_ik.xml", self.model))
    }

    pub fn mot_output(&self) -> PathBuf {
        self.participant_dir().join(IK_OUTPUT_DIR)
    }

    pub fn conf_path(&self) -> PathBuf {
        self.participant_dir().join(CONF_FILE)
    }

    /// Every marker file of the participant, onsets from `_conf.yaml` when it
    /// exists, and the model name as output prefix.
    pub fn to_batch_config(&self) -> Result<IkBatchConfig> {
        let markers = self.markers_dir();
        let trials = discover_trials(&markers)?;
        if trials.is_empty() {
            return Err(anyhow!("no .trc files in {}", markers.display()));
        }
        let conf = self.conf_path();
        let onsets = if conf.is_file() {
            Some(load_onsets(&conf)?)
        } else {
            debug!(conf = %conf.display(), "no participant configuration, using marker windows");
            None
        };
        Ok(IkBatchConfig {
            model: self.model_path(),
            setup_template: self.setup_template(),
            setup_output: self.setup_output(),
            trials: TrialSource::Many(trials),
            mot_output: self.mot_output(),
            onsets,
            prefix: Some(self.model.clone()),
        })
    }
}

/// `true` when `path` looks like a participant directory.
pub fn has_markers(path: &Path) -> bool {
    path.join(MARKERS_DIR).is_dir()
}
