//! Direct third-order path for the ShengBTE workflow.
//!
//! Instead of going through the dense assembly and binary container, this
//! path evaluates the pair displacements and writes the sparse
//! `FORCE_CONSTANTS_3RD` triplet blocks ShengBTE consumes, returning how
//! many displaced supercells contributed.

use super::{
    assemble_fc3, count_non_null, evaluate_displaced_forces, generate_fc3_displacements,
    symmetrize_fc3, ForceConstants3,
};
use crate::calculator::BatchEvaluator;
use crate::domain::{KappaError, KappaResult};
use crate::structure::{build_supercell, Structure, Supercell};
use nalgebra::Vector3;
use std::fs;
use std::path::Path;

/// Run displacements for one structure and write `FORCE_CONSTANTS_3RD`.
/// `cutoff` is in nm, as ShengBTE inputs are; supercell multipliers must be
/// diagonal, which [`build_supercell`] already guarantees.
pub fn run_thirdorder(
    unit: &Structure,
    multiplier: [usize; 3],
    cutoff: f64,
    magnitude: f64,
    evaluator: &BatchEvaluator,
    path: &Path,
) -> KappaResult<usize> {
    let supercell = build_supercell(unit, multiplier)?;
    let cutoff_angstrom = cutoff * 10.0;
    let entries = generate_fc3_displacements(&supercell, magnitude, cutoff_angstrom);
    let displacement_count = count_non_null(&entries);
    if displacement_count == 0 {
        return Err(KappaError::computation(
            "FC3.SHENGBTE",
            format!("cutoff {cutoff} nm leaves no displaced pairs"),
        ));
    }

    let nsat = supercell.structure.len();
    let references: Vec<Option<&Structure>> = entries
        .iter()
        .map(|entry| entry.as_ref().map(|pair| &pair.structure))
        .collect();
    let forces = evaluate_displaced_forces(evaluator, &references, nsat)?;

    let mut fc3 = assemble_fc3(&supercell, magnitude, &forces)?;
    symmetrize_fc3(&supercell, &mut fc3);
    write_fc3_text(path, &supercell, &fc3, cutoff_angstrom)?;
    Ok(displacement_count)
}

/// Sparse triplet blocks: a block count line, then per in-cutoff triplet a
/// blank line, a 1-based block index, the two partner cell vectors in nm,
/// the 1-based atom triple, and the 27 labeled tensor components.
pub fn write_fc3_text(
    path: &Path,
    supercell: &Supercell,
    fc3: &ForceConstants3,
    cutoff_angstrom: f64,
) -> KappaResult<()> {
    let nsat = fc3.nsat;
    let cell = supercell.structure.cell;
    let cell_vector = |offset: [i32; 3]| -> Vector3<f64> {
        cell.row(0).transpose() * offset[0] as f64
            + cell.row(1).transpose() * offset[1] as f64
            + cell.row(2).transpose() * offset[2] as f64
    };

    let mut triplets = Vec::new();
    for p in 0..fc3.nprim {
        let anchor = p * supercell.ncells();
        for j in 0..nsat {
            if j != anchor && supercell.structure.pair_distance(anchor, j) > cutoff_angstrom {
                continue;
            }
            for k in 0..nsat {
                if k != anchor && supercell.structure.pair_distance(anchor, k) > cutoff_angstrom {
                    continue;
                }
                triplets.push((p, j, k));
            }
        }
    }

    let mut content = String::new();
    content.push_str(&format!("{}\n", triplets.len()));
    for (block, &(p, j, k)) in triplets.iter().enumerate() {
        let rj = cell_vector(supercell.offsets[j]) * 0.1;
        let rk = cell_vector(supercell.offsets[k]) * 0.1;
        content.push_str(&format!("\n{}\n", block + 1));
        content.push_str(&format!("{:16.10} {:16.10} {:16.10}\n", rj[0], rj[1], rj[2]));
        content.push_str(&format!("{:16.10} {:16.10} {:16.10}\n", rk[0], rk[1], rk[2]));
        content.push_str(&format!(
            "{} {} {}\n",
            p + 1,
            supercell.parent[j] + 1,
            supercell.parent[k] + 1
        ));
        for a in 0..3 {
            for b in 0..3 {
                for c in 0..3 {
                    content.push_str(&format!(
                        " {} {} {} {:20.10e}\n",
                        a + 1,
                        b + 1,
                        c + 1,
                        fc3.at(p, j, k, a, b, c)
                    ));
                }
            }
        }
    }

    fs::write(path, content).map_err(|error| {
        KappaError::io_system("FC3.SHENGBTE", format!("{}: {error}", path.display()))
    })
}
