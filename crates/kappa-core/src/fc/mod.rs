//! Second- and third-order force constants by finite displacement.
//!
//! Displacement sets are ordered and may contain null entries (out-of-cutoff
//! pairs); nulls are preserved in position so force arrays stay aligned
//! index-for-index, with zero-filled rows standing in for skipped
//! evaluations.

pub mod builder;
pub mod persistence;
pub mod thirdorder;

use crate::domain::{KappaError, KappaResult};
use crate::structure::{Structure, Supercell};
use nalgebra::Vector3;

/// One displaced supercell for second-order force constants.
#[derive(Debug, Clone)]
pub struct Displacement {
    pub structure: Structure,
    pub atom: usize,
    pub axis: usize,
    pub sign: f64,
}

/// One doubly-displaced supercell for third-order force constants.
#[derive(Debug, Clone)]
pub struct PairDisplacement {
    pub structure: Structure,
    pub first: (usize, usize, f64),
    pub second: (usize, usize, f64),
}

const SIGNS: [f64; 2] = [1.0, -1.0];
const PAIR_SIGNS: [(f64, f64); 4] = [(1.0, 1.0), (1.0, -1.0), (-1.0, 1.0), (-1.0, -1.0)];

/// Supercell index of the cell-0 image of primitive atom `p`.
fn cell0_index(supercell: &Supercell, p: usize) -> usize {
    p * supercell.ncells()
}

fn displaced(structure: &Structure, shifts: &[(usize, usize, f64)], magnitude: f64) -> Structure {
    let mut displaced = structure.clone();
    for &(atom, axis, sign) in shifts {
        let mut delta = Vector3::zeros();
        delta[axis] = sign * magnitude;
        displaced.positions[atom] += delta;
    }
    displaced
}

/// Plus/minus displacement of every primitive atom along every Cartesian
/// axis; ordered primitive atom, then axis, then sign.
pub fn generate_fc2_displacements(
    supercell: &Supercell,
    magnitude: f64,
) -> Vec<Option<Displacement>> {
    let nprim = supercell.structure.len() / supercell.ncells();
    let mut entries = Vec::with_capacity(nprim * 6);
    for p in 0..nprim {
        let atom = cell0_index(supercell, p);
        for axis in 0..3 {
            for sign in SIGNS {
                entries.push(Some(Displacement {
                    structure: displaced(&supercell.structure, &[(atom, axis, sign)], magnitude),
                    atom,
                    axis,
                    sign,
                }));
            }
        }
    }
    entries
}

/// Pair displacements for fc3: primitive atom x axis x supercell partner x
/// axis x four sign combinations. Pairs beyond `cutoff` are null entries.
pub fn generate_fc3_displacements(
    supercell: &Supercell,
    magnitude: f64,
    cutoff: f64,
) -> Vec<Option<PairDisplacement>> {
    let nsat = supercell.structure.len();
    let nprim = nsat / supercell.ncells();
    let mut entries = Vec::with_capacity(nprim * 3 * nsat * 3 * 4);
    for p in 0..nprim {
        let atom = cell0_index(supercell, p);
        for axis in 0..3 {
            for partner in 0..nsat {
                let within_cutoff = atom == partner
                    || supercell.structure.pair_distance(atom, partner) <= cutoff;
                for partner_axis in 0..3 {
                    for (sign, partner_sign) in PAIR_SIGNS {
                        if within_cutoff {
                            entries.push(Some(PairDisplacement {
                                structure: displaced(
                                    &supercell.structure,
                                    &[(atom, axis, sign), (partner, partner_axis, partner_sign)],
                                    magnitude,
                                ),
                                first: (atom, axis, sign),
                                second: (partner, partner_axis, partner_sign),
                            }));
                        } else {
                            entries.push(None);
                        }
                    }
                }
            }
        }
    }
    entries
}

pub fn count_non_null<T>(entries: &[Option<T>]) -> usize {
    entries.iter().filter(|entry| entry.is_some()).count()
}

/// Evaluate the non-null displaced structures and return forces aligned
/// index-for-index with `entries`, zero-filled at null positions.
pub fn evaluate_displaced_forces(
    evaluator: &crate::calculator::BatchEvaluator,
    entries: &[Option<&Structure>],
    nsat: usize,
) -> KappaResult<Vec<Vec<Vector3<f64>>>> {
    let live: Vec<Structure> = entries
        .iter()
        .flatten()
        .map(|structure| (*structure).clone())
        .collect();
    let results = evaluator.evaluate_all(&live)?;
    let mut evaluated = results.into_iter();
    entries
        .iter()
        .map(|entry| match entry {
            Some(_) => evaluated
                .next()
                .map(|result| result.forces)
                .ok_or_else(|| {
                    KappaError::internal("FC.FORCES", "fewer results than displacements")
                }),
            None => Ok(vec![Vector3::zeros(); nsat]),
        })
        .collect()
}

/// Dense (n, n, 3, 3) second-order force constants in eV per square angstrom.
#[derive(Debug, Clone, PartialEq)]
pub struct ForceConstants2 {
    pub n: usize,
    pub data: Vec<f64>,
}

impl ForceConstants2 {
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n * 9],
        }
    }

    #[inline]
    pub fn at(&self, i: usize, j: usize, a: usize, b: usize) -> f64 {
        self.data[((i * self.n + j) * 3 + a) * 3 + b]
    }

    #[inline]
    pub fn at_mut(&mut self, i: usize, j: usize, a: usize, b: usize) -> &mut f64 {
        &mut self.data[((i * self.n + j) * 3 + a) * 3 + b]
    }

    pub fn max_abs_difference(&self, other: &Self) -> f64 {
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

/// Dense (nprim, nsat, nsat, 3, 3, 3) third-order force constants.
#[derive(Debug, Clone, PartialEq)]
pub struct ForceConstants3 {
    pub nprim: usize,
    pub nsat: usize,
    pub data: Vec<f64>,
}

impl ForceConstants3 {
    pub fn zeros(nprim: usize, nsat: usize) -> Self {
        Self {
            nprim,
            nsat,
            data: vec![0.0; nprim * nsat * nsat * 27],
        }
    }

    #[inline]
    pub fn index(&self, p: usize, j: usize, k: usize, a: usize, b: usize, c: usize) -> usize {
        ((((p * self.nsat + j) * self.nsat + k) * 3 + a) * 3 + b) * 3 + c
    }

    #[inline]
    pub fn at(&self, p: usize, j: usize, k: usize, a: usize, b: usize, c: usize) -> f64 {
        self.data[self.index(p, j, k, a, b, c)]
    }

    pub fn norm(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum::<f64>().sqrt()
    }
}

fn check_force_shape(
    forces: &[Vec<Vector3<f64>>],
    expected_sets: usize,
    expected_atoms: usize,
) -> KappaResult<()> {
    if forces.len() != expected_sets {
        return Err(KappaError::computation(
            "FC.FORCES",
            format!(
                "{} force sets for {} displacements",
                forces.len(),
                expected_sets
            ),
        ));
    }
    for set in forces {
        if set.len() != expected_atoms {
            return Err(KappaError::computation(
                "FC.FORCES",
                format!("force set has {} rows, expected {}", set.len(), expected_atoms),
            ));
        }
    }
    Ok(())
}

/// Assemble fc2 from the displacement ordering of
/// [`generate_fc2_displacements`] and its index-aligned forces. Rows for
/// atoms outside cell 0 are filled in by translational image mapping.
pub fn assemble_fc2(
    supercell: &Supercell,
    magnitude: f64,
    forces: &[Vec<Vector3<f64>>],
) -> KappaResult<ForceConstants2> {
    let nsat = supercell.structure.len();
    let ncells = supercell.ncells();
    let nprim = nsat / ncells;
    check_force_shape(forces, nprim * 6, nsat)?;

    let mut fc2 = ForceConstants2::zeros(nsat);
    for p in 0..nprim {
        let row = cell0_index(supercell, p);
        for axis in 0..3 {
            for (sign_index, sign) in SIGNS.iter().enumerate() {
                let entry = (p * 3 + axis) * 2 + sign_index;
                let weight = -sign / (2.0 * magnitude);
                for j in 0..nsat {
                    for b in 0..3 {
                        *fc2.at_mut(row, j, axis, b) += weight * forces[entry][j][b];
                    }
                }
            }
        }
    }

    // Translational completion: every image row repeats the cell-0 row with
    // the partner index shifted by the same lattice offset.
    for i in 0..nsat {
        let offset = supercell.offsets[i];
        if offset == [0, 0, 0] {
            continue;
        }
        let row = cell0_index(supercell, supercell.parent[i]);
        for j in 0..nsat {
            let shifted = supercell.translated_index(j, offset);
            for a in 0..3 {
                for b in 0..3 {
                    *fc2.at_mut(i, shifted, a, b) = fc2.at(row, j, a, b);
                }
            }
        }
    }
    Ok(fc2)
}

/// Restore transpose symmetry and the acoustic sum rule.
pub fn symmetrize_fc2(fc2: &mut ForceConstants2) {
    let n = fc2.n;
    for i in 0..n {
        for j in 0..=i {
            for a in 0..3 {
                for b in 0..3 {
                    let mean = 0.5 * (fc2.at(i, j, a, b) + fc2.at(j, i, b, a));
                    *fc2.at_mut(i, j, a, b) = mean;
                    *fc2.at_mut(j, i, b, a) = mean;
                }
            }
        }
    }
    for i in 0..n {
        for a in 0..3 {
            for b in 0..3 {
                let total: f64 = (0..n).map(|j| fc2.at(i, j, a, b)).sum();
                *fc2.at_mut(i, i, a, b) -= total;
            }
        }
    }
}

/// Assemble fc3 from the ordering of [`generate_fc3_displacements`].
/// Zero-filled force rows at null entries contribute nothing, so
/// out-of-cutoff triplets stay exactly zero.
pub fn assemble_fc3(
    supercell: &Supercell,
    magnitude: f64,
    forces: &[Vec<Vector3<f64>>],
) -> KappaResult<ForceConstants3> {
    let nsat = supercell.structure.len();
    let ncells = supercell.ncells();
    let nprim = nsat / ncells;
    check_force_shape(forces, nprim * 3 * nsat * 3 * 4, nsat)?;

    let mut fc3 = ForceConstants3::zeros(nprim, nsat);
    let denominator = 4.0 * magnitude * magnitude;
    for p in 0..nprim {
        for a in 0..3 {
            for j in 0..nsat {
                for b in 0..3 {
                    for (sign_index, (sign, partner_sign)) in PAIR_SIGNS.iter().enumerate() {
                        let entry = (((p * 3 + a) * nsat + j) * 3 + b) * 4 + sign_index;
                        let weight = -(sign * partner_sign) / denominator;
                        for k in 0..nsat {
                            for c in 0..3 {
                                let index = fc3.index(p, j, k, a, b, c);
                                fc3.data[index] += weight * forces[entry][k][c];
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(fc3)
}

/// Restore permutation symmetry between the two displaced atoms (where both
/// live in cell 0) and project out the translational sum over the third
/// index.
pub fn symmetrize_fc3(supercell: &Supercell, fc3: &mut ForceConstants3) {
    let nprim = fc3.nprim;
    let nsat = fc3.nsat;

    for p in 0..nprim {
        for q in 0..nprim {
            let pj = cell0_index(supercell, q);
            let qj = cell0_index(supercell, p);
            for k in 0..nsat {
                for a in 0..3 {
                    for b in 0..3 {
                        for c in 0..3 {
                            let forward = fc3.index(p, pj, k, a, b, c);
                            let swapped = fc3.index(q, qj, k, b, a, c);
                            let mean = 0.5 * (fc3.data[forward] + fc3.data[swapped]);
                            fc3.data[forward] = mean;
                            fc3.data[swapped] = mean;
                        }
                    }
                }
            }
        }
    }

    for p in 0..nprim {
        for j in 0..nsat {
            for a in 0..3 {
                for b in 0..3 {
                    for c in 0..3 {
                        let total: f64 =
                            (0..nsat).map(|k| fc3.at(p, j, k, a, b, c)).sum();
                        let correction = total / nsat as f64;
                        for k in 0..nsat {
                            let index = fc3.index(p, j, k, a, b, c);
                            fc3.data[index] -= correction;
                        }
                    }
                }
            }
        }
    }
}

/// Everything the conductivity stage needs for one structure.
#[derive(Debug, Clone)]
pub struct ForceConstantBundle {
    pub unit: Structure,
    pub fc2_supercell: Supercell,
    pub fc3_multiplier: [usize; 3],
    pub fc2: Option<ForceConstants2>,
    pub fc3: Option<ForceConstants3>,
    pub fc2_displacement_count: usize,
    pub fc3_displacement_count: usize,
}
