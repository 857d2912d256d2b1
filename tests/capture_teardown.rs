//! End-to-end coverage for device log capture under orchestration: per-suite
//! markers, final teardown, and the line-justified marker table.

#[path = "common/doubles.rs"]
mod doubles;

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use doubles::{
    EventLog, RunRecorder, ScriptedApp, ScriptedLauncher, ScriptedStorage, SuiteRecorder,
    init_test_logging, one_passing_test_script,
};
use ruslan::{
    LogCapture, Orchestrator, OrchestratorConfig, RemoteProcess, TestSuiteDescriptor,
};
use tempfile::TempDir;

/// Width of one producer line, `logline\n`.
const LINE_WIDTH: u64 = 8;

fn suite(name: &str) -> TestSuiteDescriptor {
    TestSuiteDescriptor {
        name: name.to_owned(),
        instrument_args: Vec::new(),
        test_parameters: Vec::new(),
        uploads: Vec::new(),
        clean_data_on_start: false,
    }
}

fn orchestrator(
    config: OrchestratorConfig,
    log: &EventLog,
    launcher: ScriptedLauncher,
) -> Orchestrator<ScriptedApp, ScriptedStorage, ScriptedLauncher> {
    init_test_logging();
    let mut orchestrator = Orchestrator::new(
        config,
        ScriptedApp::new(log.clone()),
        ScriptedStorage::new(log.clone()),
        launcher,
    );
    orchestrator.add_run_listener(Box::new(RunRecorder::new(log.clone())));
    orchestrator.add_suite_listener(Box::new(SuiteRecorder::new(log.clone())));
    orchestrator
}

/// Spawns a producer that emits fixed-width lines until stopped, standing in
/// for a live logcat stream.
fn spawn_line_producer() -> RemoteProcess {
    RemoteProcess::spawn(
        "sh",
        &["-c", "while :; do printf 'logline\\n'; sleep 0.01; done"],
    )
    .expect("spawn producer")
}

fn utf8_dir(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp dir")
}

fn read_marker_table(path: &Utf8PathBuf) -> BTreeMap<String, u64> {
    let text = std::fs::read_to_string(path.as_std_path()).expect("marker table readable");
    text.lines()
        .map(|line| {
            let (key, offset) = line.split_once('=').expect("key=offset line");
            (key.to_owned(), offset.parse::<u64>().expect("numeric offset"))
        })
        .collect()
}

#[tokio::test]
async fn teardown_writes_a_line_justified_marker_table() {
    let dir = TempDir::new().expect("temp dir");
    let root = utf8_dir(&dir);
    let sink = root.join("device.log");
    let table = root.join("suites.markers");

    let capture = LogCapture::open(spawn_line_producer(), sink.clone())
        .await
        .expect("open capture");

    let log = EventLog::new();
    let mut launcher = ScriptedLauncher::new(log.clone());
    launcher.enqueue_script(one_passing_test_script("com.example.FooTest", "works"));
    launcher.enqueue_script(one_passing_test_script("com.example.BarTest", "works"));
    let config = OrchestratorConfig::builder()
        .marker_table_path(table.clone())
        .build()
        .expect("valid config");
    let mut orchestrator = orchestrator(config, &log, launcher);
    orchestrator.attach_log_capture(capture);

    orchestrator
        .execute(vec![suite("alpha"), suite("beta")])
        .await
        .expect("plan completes");

    let markers = read_marker_table(&table);
    assert_eq!(
        markers.keys().cloned().collect::<Vec<_>>(),
        vec![
            "alpha.end".to_owned(),
            "alpha.start".to_owned(),
            "beta.end".to_owned(),
            "beta.start".to_owned(),
        ]
    );
    for (key, offset) in &markers {
        assert_eq!(
            offset % LINE_WIDTH,
            0,
            "marker {key} at {offset} is not on a line boundary"
        );
    }
    let alpha_start = markers.get("alpha.start").expect("alpha.start");
    let alpha_end = markers.get("alpha.end").expect("alpha.end");
    let beta_start = markers.get("beta.start").expect("beta.start");
    let beta_end = markers.get("beta.end").expect("beta.end");
    assert!(alpha_start <= alpha_end, "got {markers:?}");
    assert!(beta_start <= beta_end, "got {markers:?}");

    let captured = std::fs::read(sink.as_std_path()).expect("sink readable");
    assert!(!captured.is_empty(), "the sink received producer output");

    log.assert_order(&[
        "suite-started:alpha",
        "suite-ended:alpha",
        "suite-started:beta",
        "suite-ended:beta",
    ]);
    assert!(!log.contains("suite-failed"), "got {:?}", log.events());
}

#[tokio::test]
async fn marker_table_defaults_to_the_sink_path_with_suffix() {
    let dir = TempDir::new().expect("temp dir");
    let root = utf8_dir(&dir);
    let sink = root.join("device.log");

    let capture = LogCapture::open(spawn_line_producer(), sink.clone())
        .await
        .expect("open capture");

    let log = EventLog::new();
    let mut launcher = ScriptedLauncher::new(log.clone());
    launcher.enqueue_script(one_passing_test_script("com.example.FooTest", "works"));
    let mut orchestrator = orchestrator(OrchestratorConfig::default(), &log, launcher);
    orchestrator.attach_log_capture(capture);

    orchestrator
        .execute(vec![suite("smoke")])
        .await
        .expect("plan completes");

    let table = Utf8PathBuf::from(format!("{sink}.markers"));
    let markers = read_marker_table(&table);
    assert!(markers.contains_key("smoke.start"), "got {markers:?}");
    assert!(markers.contains_key("smoke.end"), "got {markers:?}");
    assert_eq!(log.count_of("suite-"), 2, "got {:?}", log.events());
}
