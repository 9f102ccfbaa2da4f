// tests/cli.rs — labschedctl smoke tests

use assert_cmd::Command;

#[test]
fn help_lists_the_control_surface() {
    let mut cmd = Command::cargo_bin("labschedctl").unwrap();
    let assert = cmd.arg("--help").assert().success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    for subcommand in ["serve", "submit", "inspect", "cancel", "resubmit", "shutdown"] {
        assert!(output.contains(subcommand), "missing subcommand {subcommand}");
    }
}

#[test]
fn submit_requires_a_readable_file() {
    let mut cmd = Command::cargo_bin("labschedctl").unwrap();
    cmd.args(["submit", "/nonexistent/task.json"]).assert().failure();
}
