use std::process::Command;

/// Startup fails on the missing key, but the "starting" record must already
/// have been written, and only to stderr.
#[test]
fn json_logs_go_to_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let out = Command::new(env!("CARGO_BIN_EXE_blindkeyd"))
        .args(["--log-format", "json", "--bind", "127.0.0.1:0", "--rsa-key"])
        .arg(dir.path().join("missing.pem"))
        .env_remove("RUST_LOG")
        .output()
        .unwrap();

    assert!(!out.status.success());
    assert!(out.stdout.is_empty(), "stdout: {}", String::from_utf8_lossy(&out.stdout));
    let stderr = String::from_utf8_lossy(&out.stderr);
    let record = stderr
        .lines()
        .find(|l| l.contains("starting key oracle"))
        .unwrap_or_else(|| panic!("no startup record in stderr: {stderr}"));
    assert!(record.trim_start().starts_with('{'), "{record}");
}
