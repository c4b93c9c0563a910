use anyhow::{anyhow, Result};
use chrono::Utc;
use ik_runner::{
    run_batch, IkBatchConfig, IkSetup, KinematicsEngine, OnsetMap, OpenSimCmd, TrcReader,
    TrialSource, WindowSource,
};
use std::fs;
use std::path::{Path, PathBuf};

const TEMPLATE: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\" ?>
<OpenSimDocument Version=\"30000\">
\t<InverseKinematicsTool name=\"generic\">
\t\t<model_file>Unassigned</model_file>
\t\t<marker_file>Unassigned</marker_file>
\t\t<output_motion_file>Unassigned</output_motion_file>
\t\t<results_directory>./</results_directory>
\t\t<time_range> -Inf Inf</time_range>
\t</InverseKinematicsTool>
</OpenSimDocument>
";

/// Records every call and writes the setup as JSON.
#[derive(Default)]
struct RecordingEngine {
    runs: Vec<IkSetup>,
    fail_on: Option<String>,
}

impl KinematicsEngine for RecordingEngine {
    fn write_setup(&mut self, setup: &IkSetup, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_vec_pretty(setup)?)?;
        Ok(())
    }

    fn run(&mut self, setup: &IkSetup, setup_path: &Path) -> Result<()> {
        assert!(setup_path.exists(), "setup must be written before run");
        if self.fail_on.as_deref() == Some(setup.name.as_str()) {
            return Err(anyhow!("solver diverged"));
        }
        fs::write(&setup.output_motion_file, format!("name={}\n", setup.name))?;
        self.runs.push(setup.clone());
        Ok(())
    }
}

fn temp_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "ik_batch_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&root).expect("temp root");
    root
}

fn write_trc(path: &Path, times: &[f64]) {
    let mut text = String::from(
        "PathFileType\t4\t(X/Y/Z)\ttrial.trc\n\
DataRate\tCameraRate\tNumFrames\tNumMarkers\tUnits\tOrigDataRate\tOrigDataStartFrame\tOrigNumFrames\n\
100.00\t100.00\t0\t1\tmm\t100.00\t1\t0\n\
Frame#\tTime\tSTER\t\t\n\
\t\tX1\tY1\tZ1\n\n",
    );
    for (i, t) in times.iter().enumerate() {
        text.push_str(&format!("{}\t{}\t1.0\t2.0\t3.0\n", i + 1, t));
    }
    fs::write(path, text).expect("write trc");
}

fn config(root: &Path, trials: Vec<PathBuf>, onsets: Option<OnsetMap>) -> IkBatchConfig {
    let model = root.join("wu_scaled_markers.osim");
    let template = root.join("wu_ik_template.xml");
    fs::write(&model, "<OpenSimDocument />").expect("model");
    fs::write(&template, TEMPLATE).expect("template");
    IkBatchConfig {
        model,
        setup_template: template,
        setup_output: root.join("_xml").join("wu_ik.xml"),
        trials: TrialSource::Many(trials),
        mot_output: root.join("1_inverse_kinematic"),
        onsets,
        prefix: Some("wu".to_string()),
    }
}

#[test]
fn trials_run_in_order_and_last_setup_remains() {
    let root = temp_root("order");
    let markers = root.join("0_markers");
    fs::create_dir_all(&markers).unwrap();
    fs::create_dir_all(root.join("_xml")).unwrap();
    let abd = markers.join("abd1.trc");
    let flex = markers.join("flex1.trc");
    write_trc(&abd, &[0.0, 0.01, 0.02, 1.5]);
    write_trc(&flex, &[0.3, 0.31]);

    let mut onsets = OnsetMap::new();
    onsets.insert("flex1".to_string(), [0.5, 0.9]);
    let cfg = config(&root, vec![abd.clone(), flex.clone()], Some(onsets));

    let mut engine = RecordingEngine::default();
    let result = run_batch(&cfg, &mut engine, &TrcReader).expect("batch");

    let names: Vec<_> = engine.runs.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["wu_abd1", "wu_flex1"]);
    assert_eq!(engine.runs[0].start_time, 0.0);
    assert_eq!(engine.runs[0].end_time, 1.5 - 0.01);
    assert_eq!((engine.runs[1].start_time, engine.runs[1].end_time), (0.5, 0.9));
    assert_eq!(result.trials[0].window.source, WindowSource::MarkerFile);
    assert_eq!(result.trials[1].window.source, WindowSource::Onsets);

    assert!(cfg.mot_output.join("wu_abd1.mot").exists());
    assert!(cfg.mot_output.join("wu_flex1.mot").exists());

    let on_disk: serde_json::Value =
        serde_json::from_slice(&fs::read(&cfg.setup_output).unwrap()).unwrap();
    assert_eq!(on_disk["name"], "wu_flex1");
    assert_eq!(on_disk["marker_file"], flex.display().to_string());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn failure_stops_the_batch_and_keeps_earlier_outputs() {
    let root = temp_root("abort");
    fs::create_dir_all(root.join("_xml")).unwrap();
    let paths: Vec<PathBuf> = ["t1", "t2", "t3"]
        .iter()
        .map(|n| {
            let p = root.join(format!("{}.trc", n));
            write_trc(&p, &[0.0, 1.0]);
            p
        })
        .collect();
    let cfg = config(&root, paths, None);

    let mut engine = RecordingEngine {
        fail_on: Some("wu_t2".to_string()),
        ..Default::default()
    };
    let err = run_batch(&cfg, &mut engine, &TrcReader).expect_err("t2 fails");
    assert!(err.to_string().contains("t2"), "unexpected: {}", err);
    assert!(format!("{:#}", err).contains("solver diverged"));
    assert_eq!(engine.runs.len(), 1);
    assert!(cfg.mot_output.join("wu_t1.mot").exists());
    assert!(!cfg.mot_output.join("wu_t3.mot").exists());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn missing_marker_file_without_onset_is_fatal() {
    let root = temp_root("missing");
    let cfg = config(&root, vec![root.join("ghost.trc")], None);
    let mut engine = RecordingEngine::default();
    let err = run_batch(&cfg, &mut engine, &TrcReader).expect_err("unreadable trial");
    assert!(format!("{:#}", err).contains("ghost.trc"));
    assert!(engine.runs.is_empty());
    let _ = fs::remove_dir_all(root);
}

#[test]
fn single_path_matches_one_element_list() {
    let root = temp_root("single");
    fs::create_dir_all(root.join("_xml")).unwrap();
    let trc = root.join("flex1.trc");
    write_trc(&trc, &[0.1, 0.2, 0.3]);

    let mut listed = config(&root, vec![trc.clone()], None);
    let mut engine_listed = RecordingEngine::default();
    run_batch(&listed, &mut engine_listed, &TrcReader).expect("listed");

    listed.trials = TrialSource::from(trc.as_path());
    let mut engine_single = RecordingEngine::default();
    run_batch(&listed, &mut engine_single, &TrcReader).expect("single");

    assert_eq!(engine_listed.runs, engine_single.runs);
    let _ = fs::remove_dir_all(root);
}

#[cfg(unix)]
#[test]
fn opensim_engine_writes_xml_setup_for_each_trial() {
    let root = temp_root("xml");
    let a = root.join("a.trc");
    let b = root.join("b.trc");
    write_trc(&a, &[0.0, 2.0]);
    write_trc(&b, &[1.0, 3.0]);
    let cfg = config(&root, vec![a, b.clone()], None);

    let mut engine =
        OpenSimCmd::load(Some(Path::new("true")), &cfg.model, &cfg.setup_template).expect("load");
    let result = run_batch(&cfg, &mut engine, &TrcReader).expect("batch");
    assert_eq!(result.trials.len(), 2);

    let xml = fs::read_to_string(&cfg.setup_output).expect("setup");
    assert!(xml.contains("<InverseKinematicsTool name=\"wu_b\">"));
    assert!(xml.contains(&format!("<marker_file>{}</marker_file>", b.display())));
    assert!(xml.contains(&format!(
        "<output_motion_file>{}</output_motion_file>",
        cfg.mot_output.join("wu_b.mot").display()
    )));
    assert!(xml.contains(&format!("<time_range>1 {}</time_range>", 3.0 - 0.01)));
    assert!(!xml.contains("wu_a"));
    let _ = fs::remove_dir_all(root);
}
