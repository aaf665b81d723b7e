//! End-to-end checks of the `kappa-rs` command surface.

use std::fs;
use std::path::Path;

use kappa_cli::cli::{run, CliError};
use tempfile::TempDir;

const FRAME: &str = concat!(
    "1\n",
    "Lattice=\"3.6 0.0 0.0 0.0 3.6 0.0 0.0 0.0 3.6\" Properties=species:S:1:pos:R:3\n",
    "Cu 0.0 0.0 0.0\n",
);

fn write_workload(dir: &Path) -> std::path::PathBuf {
    let input = dir.join("structures.extxyz");
    fs::write(&input, FRAME).unwrap();
    let config = dir.join("run.toml");
    fs::write(
        &config,
        format!(
            r#"
[data]
input_path = "{input}"
save_cond = "{cond}"

[relax]
fmax = 0.05
steps = 50
log = "{log}"

[force_constant]
displacement = 0.01
fc2_supercell = 4.0
fc3_supercell = 1.0
fc3_cutoff = 100.0
fc3_format = "binary"

[conductivity]
solver = "rta"
q_points = 2.0
temperature = 300.0
"#,
            input = input.display(),
            cond = dir.join("cond").display(),
            log = dir.join("run.log").display(),
        ),
    )
    .unwrap();
    config
}

#[test]
fn run_command_produces_conductivity_artifacts() {
    let temp = TempDir::new().unwrap();
    let config = write_workload(temp.path());

    let code = run(["run", "--config", config.to_str().unwrap()]).unwrap();
    assert_eq!(code, 0);

    let csv = fs::read_to_string(temp.path().join("cond/kappa_total.csv")).unwrap();
    assert!(csv.starts_with("index,temperature,xx,yy,zz,yz,xz,xy\n"));
    assert!(csv.lines().nth(1).unwrap().starts_with("0,300,"));

    let log = fs::read_to_string(temp.path().join("run.log")).unwrap();
    assert!(log.contains("kappa-rs terminated."));
}

#[test]
fn check_config_accepts_a_valid_file() {
    let temp = TempDir::new().unwrap();
    let config = write_workload(temp.path());
    assert_eq!(
        run(["check-config", "--config", config.to_str().unwrap()]).unwrap(),
        0
    );
}

#[test]
fn check_config_rejects_an_invalid_file() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("bad.toml");
    fs::write(&config, "[data]\n").unwrap();

    let error = run(["check-config", "--config", config.to_str().unwrap()]).unwrap_err();
    assert!(matches!(error, CliError::Compute(_)));
    assert_eq!(error.exit_code(), 2);
}
