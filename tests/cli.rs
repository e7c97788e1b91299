use std::{fs, process::Command};

mod utils;

use utils::{fixture, init, with_temp_dir};

fn llvm2smt() -> Command {
    Command::new(env!("CARGO_BIN_EXE_llvm2smt"))
}

#[test]
fn translate_writes_script_to_output_file() {
    init();

    with_temp_dir(|dir| {
        let output = dir.path().join("branch.smt2");

        let status = llvm2smt()
            .arg("translate")
            .arg(fixture("branch.ll"))
            .arg("-o")
            .arg(&output)
            .status()
            .unwrap();
        assert!(status.success());

        let script = fs::read_to_string(&output).unwrap();
        assert!(script.starts_with("(set-option :produce-models true)\n"));
        assert!(script.contains("(check-sat)"));

        let stdout = llvm2smt()
            .arg("translate")
            .arg(fixture("branch.ll"))
            .output()
            .unwrap()
            .stdout;
        assert_eq!(String::from_utf8(stdout).unwrap(), script);
    });
}

#[test]
fn translation_errors_name_their_stage() {
    init();

    let output = llvm2smt()
        .args(["-v", "error", "translate", "--atomic"])
        .arg(fixture("vectors.ll"))
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.starts_with("translate failed: unsupported construct"), "{}", stderr);
}

#[test]
fn skipped_functions_still_fail_the_run() {
    init();

    let output = llvm2smt()
        .args(["-v", "error", "translate"])
        .arg(fixture("vectors.ll"))
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("; function @plain, goal assert\n"), "{}", stdout);
    assert!(stdout.contains("; @nested skipped: "), "{}", stdout);
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.starts_with("translate failed: unsupported construct"), "{}", stderr);

    let output = llvm2smt()
        .args(["-v", "error", "check"])
        .arg(fixture("vectors.ll"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("@nested: error: unsupported construct"), "{}", stdout);
    assert!(stdout.contains("@plain: "), "{}", stdout);
}

#[test]
fn missing_input_is_reported() {
    init();

    with_temp_dir(|dir| {
        let output = llvm2smt()
            .arg("translate")
            .arg(dir.path().join("missing.ll"))
            .output()
            .unwrap();

        assert!(!output.status.success());
        let stderr = String::from_utf8(output.stderr).unwrap();
        assert!(stderr.starts_with("parse failed: cannot read input"), "{}", stderr);
    });
}

#[test]
fn check_reports_verdicts_and_traces() {
    init();

    let output = llvm2smt()
        .args(["check", "--goal", "reach:error", "--function", "overflow"])
        .arg(fixture("memory.ll"))
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.starts_with("@overflow: sat\n"), "{}", stdout);
    assert!(stdout.contains("  overflow.%a = 200 (i8 -56)\n"), "{}", stdout);
    assert!(stdout.contains("  trace: entry -> error\n"), "{}", stdout);
}
