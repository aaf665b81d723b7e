//! End-to-end export workflow: relax a structure, build both force-constant
//! orders, and emit the solver input files.

use std::fs;

use kappa_core::calculator::LennardJonesPotential;
use kappa_core::config::Config;
use kappa_core::pipeline;
use tempfile::TempDir;

const FRAME: &str = concat!(
    "1\n",
    "Lattice=\"3.6 0.0 0.0 0.0 3.6 0.0 0.0 0.0 3.6\" Properties=species:S:1:pos:R:3\n",
    "Cu 0.0 0.0 0.0\n",
);

#[test]
fn export_run_writes_solver_inputs_per_structure() {
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("structures.extxyz");
    fs::write(&input, FRAME).unwrap();

    let config = Config::parse(&format!(
        r#"
[data]
input_path = "{input}"
save_fc2 = "{fc2}"
save_fc3 = "{fc3}"
save_control = "{control}"

[relax]
fmax = 0.05
steps = 50
log = "{log}"

[force_constant]
displacement = 0.01
fc2_supercell = 4.0
fc3_supercell = 1.0
fc3_cutoff = 100.0

[conductivity]
solver = "shengbte"
q_points = 2.0
temperature = 300.0
"#,
        input = input.display(),
        fc2 = temp.path().join("fc2").display(),
        fc3 = temp.path().join("fc3").display(),
        control = temp.path().join("control").display(),
        log = temp.path().join("run.log").display(),
    ))
    .unwrap();

    let potential = LennardJonesPotential::default();
    pipeline::run(&config, &potential).unwrap();

    let fc2 = fs::read_to_string(temp.path().join("fc2/FORCE_CONSTANTS_2ND_0")).unwrap();
    assert_eq!(fc2.lines().next().unwrap(), "8 8");

    let fc3 = fs::read_to_string(temp.path().join("fc3/FORCE_CONSTANTS_3RD_0")).unwrap();
    let blocks: usize = fc3.lines().next().unwrap().trim().parse().unwrap();
    assert!(blocks > 0);

    let control = fs::read_to_string(temp.path().join("control/CONTROL_0")).unwrap();
    assert!(control.contains("nelements="));
    assert!(control.contains("scalebroad=0.1"));
    assert_eq!(control.matches("&end").count(), 4);

    let log = fs::read_to_string(temp.path().join("run.log")).unwrap();
    assert!(log.contains("kappa-rs terminated."));
    assert!(log.contains("Q_mesh"));
}
