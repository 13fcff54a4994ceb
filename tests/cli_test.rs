use std::process::Command;
use tempfile::TempDir;

fn termtap(temp_dir: &TempDir) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_termtap"));
    command
        .env("TERMTAP_DATA_DIR", temp_dir.path().join("data"))
        .env_remove("RUST_LOG");
    command
}

#[test]
fn test_export_ca_with_https_disabled_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let out = temp_dir.path().join("ca.pem");

    let output = termtap(&temp_dir)
        .args(["proxy", "--https=false", "--export-ca"])
        .arg(&out)
        .output()
        .expect("Failed to run termtap");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error:"), "stderr: {stderr}");
    assert!(stderr.contains("HTTPS"), "stderr: {stderr}");
    assert!(!out.exists());
}

#[test]
fn test_export_ca_writes_certificate() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let out = temp_dir.path().join("exported").join("termtap.pem");

    let output = termtap(&temp_dir)
        .args(["proxy", "--export-ca"])
        .arg(&out)
        .output()
        .expect("Failed to run termtap");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("macOS"));
    assert!(stdout.contains("Linux"));

    let pem = std::fs::read_to_string(&out).expect("Missing exported certificate");
    assert!(pem.contains("BEGIN CERTIFICATE"));
    assert!(!pem.contains("PRIVATE KEY"));
}

#[test]
fn test_invalid_port_fails_before_binding() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    let output = termtap(&temp_dir)
        .args(["proxy", "--port", "not-a-port"])
        .output()
        .expect("Failed to run termtap");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not-a-port"), "stderr: {stderr}");
}
