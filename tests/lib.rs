use std::process::Command;

#[test]
fn help_exits_successfully() {
    let output = Command::new(env!("CARGO_BIN_EXE_peernet"))
        .arg("--help")
        .output()
        .expect("failed to run binary");
    assert!(output.status.success());
}

#[test]
fn connect_help_exits_successfully() {
    let output = Command::new(env!("CARGO_BIN_EXE_peernet"))
        .args(["connect", "--help"])
        .output()
        .expect("failed to run binary");
    assert!(output.status.success());
}

#[test]
fn rejects_malformed_server_address() {
    let output = Command::new(env!("CARGO_BIN_EXE_peernet"))
        .args(["connect", "--servers", "not-a-valid-server"])
        .output()
        .expect("failed to run binary");
    assert!(!output.status.success());
}
