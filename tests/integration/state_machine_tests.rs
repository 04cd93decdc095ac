//! Integration tests for the mode orchestrator's prerequisite handling.
//!
//! Tooling commands are plain shell commands that create the marker
//! directories, so every transition is observable on disk.

use gui_launcher::orchestrator::spawner::ChildState;
use gui_launcher::orchestrator::state_machine::{LauncherState, ModeOrchestrator, RunTarget};
use gui_launcher::orchestrator::terminator::is_running;
use gui_launcher::AppError;

use super::test_helpers::{
    closed_port, pid_recording_command, read_pid, spawn_http_stub, test_config,
};

#[test]
fn initial_state_follows_markers() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    assert_eq!(
        ModeOrchestrator::detect_state(&config),
        LauncherState::Uninstalled
    );

    std::fs::create_dir(temp.path().join("node_modules")).expect("marker");
    assert_eq!(
        ModeOrchestrator::detect_state(&config),
        LauncherState::Installed
    );

    std::fs::create_dir(temp.path().join("build")).expect("build dir");
    assert_eq!(ModeOrchestrator::detect_state(&config), LauncherState::Built);
}

/// Building without installed dependencies installs them first.
#[tokio::test]
async fn build_installs_missing_dependencies_first() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let mut orchestrator = ModeOrchestrator::new(&config);
    assert_eq!(orchestrator.state(), LauncherState::Uninstalled);

    orchestrator.build().await.expect("build succeeds");

    // The build command itself fails unless node_modules already exists.
    assert!(temp.path().join("node_modules").is_dir());
    assert!(temp.path().join("build").join("index.html").is_file());
    assert_eq!(orchestrator.state(), LauncherState::Built);
}

/// An existing install marker skips the install command entirely.
#[tokio::test]
async fn ensure_installed_skips_when_marker_present() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(temp.path().join("node_modules")).expect("marker");
    let mut config = test_config(temp.path());
    config.frontend.install_command = "false".into();

    let mut orchestrator = ModeOrchestrator::new(&config);
    orchestrator
        .ensure_installed()
        .await
        .expect("install is skipped");
}

/// Reinstalling over an existing build keeps the build.
#[tokio::test]
async fn explicit_install_keeps_existing_build() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(temp.path().join("build")).expect("build dir");
    let config = test_config(temp.path());
    let mut orchestrator = ModeOrchestrator::new(&config);
    assert_eq!(orchestrator.state(), LauncherState::Built);

    orchestrator.install().await.expect("install succeeds");

    assert!(temp.path().join("node_modules").is_dir());
    assert_eq!(orchestrator.state(), LauncherState::Built);
}

/// Launching without a build artifact produces it before running.
#[tokio::test]
async fn launch_builds_missing_artifact_first() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let mut orchestrator = ModeOrchestrator::new(&config);

    orchestrator.prepare_launch().await.expect("launch prepared");

    assert!(temp.path().join("build").is_dir());
    assert_eq!(
        orchestrator.state(),
        LauncherState::Running(RunTarget::Prod)
    );
}

/// An existing artifact is launched as-is.
#[tokio::test]
async fn launch_reuses_existing_artifact() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(temp.path().join("build")).expect("build dir");
    let mut config = test_config(temp.path());
    config.frontend.build_command = "false".into();
    config.frontend.install_command = "false".into();

    let mut orchestrator = ModeOrchestrator::new(&config);
    orchestrator
        .prepare_launch()
        .await
        .expect("no build needed");
    assert_eq!(
        orchestrator.state(),
        LauncherState::Running(RunTarget::Prod)
    );
}

/// A failing install aborts with the command's exit code and never runs
/// the dependent build.
#[tokio::test]
async fn failing_install_aborts_build() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.frontend.install_command = "sh -c 'exit 3'".into();

    let mut orchestrator = ModeOrchestrator::new(&config);
    let err = orchestrator.build().await.expect_err("install fails");

    assert!(matches!(
        &err,
        AppError::Subprocess { step, code: Some(3), .. } if step == "install"
    ));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(orchestrator.state(), LauncherState::Exited(3));
    assert!(!temp.path().join("build").exists());
}

/// A build command that succeeds without producing output is still a
/// failure for launch.
#[tokio::test]
async fn build_without_output_fails_launch() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.frontend.build_command = "true".into();

    let mut orchestrator = ModeOrchestrator::new(&config);
    let err = orchestrator.prepare_launch().await.expect_err("no artifact");
    assert!(matches!(err, AppError::Subprocess { ref step, .. } if step == "build"));
    assert!(matches!(orchestrator.state(), LauncherState::Exited(_)));
}

/// A reachable dev server moves the orchestrator to `Running(Dev)` and
/// hands back a live child.
#[tokio::test]
async fn dev_starts_once_server_answers() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(temp.path().join("node_modules")).expect("marker");
    let (port, server) = spawn_http_stub().await;
    let mut config = test_config(temp.path());
    config.dev_server.port = port;

    let mut orchestrator = ModeOrchestrator::new(&config);
    let mut child = orchestrator.start_dev().await.expect("dev started");
    assert_eq!(orchestrator.state(), LauncherState::Running(RunTarget::Dev));
    assert!(is_running(child.pid()));

    let killed = child
        .terminate(config.children_grace(), config.process_grace())
        .await
        .expect("terminate");
    assert!(!killed);
    assert_eq!(child.state(), ChildState::Terminated);
    assert!(!is_running(child.pid()));

    let again = child
        .terminate(config.children_grace(), config.process_grace())
        .await
        .expect("second terminate");
    assert!(!again, "terminating twice is a no-op");
    server.abort();
}

/// When the dev server never answers, it is torn down before the timeout
/// error is reported.
#[tokio::test]
async fn dev_timeout_cleans_up_child() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(temp.path().join("node_modules")).expect("marker");
    let pid_file = temp.path().join("dev.pid");
    let mut config = test_config(temp.path());
    config.dev_server.port = closed_port().await;
    config.dev_server.launch_timeout_seconds = 1;
    config.frontend.dev_command = pid_recording_command(&pid_file);

    let mut orchestrator = ModeOrchestrator::new(&config);
    let err = orchestrator.start_dev().await.expect_err("never ready");

    assert!(matches!(err, AppError::ReadinessTimeout { .. }));
    assert_eq!(orchestrator.state(), LauncherState::Exited(1));
    let pid = read_pid(&pid_file).await;
    assert!(!is_running(pid), "dev server {pid} leaked after timeout");
}

/// A dev command that exits early but leaves its server running is still
/// cleaned up when the server never answers on the expected port.
#[tokio::test]
async fn dev_timeout_stops_processes_left_by_exited_root() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(temp.path().join("node_modules")).expect("marker");
    let pid_file = temp.path().join("server.pid");
    let mut config = test_config(temp.path());
    config.dev_server.port = closed_port().await;
    config.dev_server.launch_timeout_seconds = 1;
    config.frontend.dev_command = format!(
        "sh -c 'sleep 300 & echo $! > \"{}\"; exit 0'",
        pid_file.display()
    );

    let mut orchestrator = ModeOrchestrator::new(&config);
    let err = orchestrator.start_dev().await.expect_err("never ready");

    assert!(matches!(err, AppError::ReadinessTimeout { .. }));
    let server = read_pid(&pid_file).await;
    assert!(!is_running(server), "server {server} outlived its launcher");
}
