use assert_cmd::prelude::*; // Add methods on commands
use predicates::prelude::*; // Used for writing assertions
use std::process::Command; // Run programs

#[test]
fn no_subcommand_fails() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("stbridge")?;
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("help"));
    Ok(())
}

#[test]
fn check_prints_drive_table() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut cmd = Command::cargo_bin("stbridge")?;
    cmd.arg("check")
        .arg("-d").arg(format!("C={}",dir.path().display()))
        .arg("-d").arg(format!("D={}:ro",dir.path().display()))
        .assert()
        .success()
        .stdout(predicate::str::contains("C: ->"))
        .stdout(predicate::str::contains("(read only)"));
    Ok(())
}

#[test]
fn check_rejects_floppy_letters() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("stbridge")?;
    cmd.arg("check")
        .arg("-d").arg("A=/tmp")
        .assert()
        .failure();
    Ok(())
}

#[test]
fn check_reads_a_drive_map() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let map_path = dir.path().join("drives.json");
    std::fs::write(&map_path,format!(
        "{{\"C\": {{\"root\": \"{}\"}}, \"D\": {{\"root\": \"{}\", \"read_only\": true}}}}",
        dir.path().display(),dir.path().display()))?;
    let mut cmd = Command::cargo_bin("stbridge")?;
    cmd.arg("check")
        .arg("-m").arg(&map_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("D: ->"));
    Ok(())
}

#[test]
fn serve_requires_drives() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("stbridge")?;
    cmd.arg("serve")
        .arg("-s").arg("/tmp/stbridge-test-nodrives.sock")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no drives"));
    Ok(())
}
