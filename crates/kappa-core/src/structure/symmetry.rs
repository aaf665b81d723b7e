//! Space-group identification and crystal symmetry operations.
//!
//! Space-group numbers come from `moyo`. The explicit operation search below
//! is only as general as the relaxation constraint needs: integer rotation
//! candidates that preserve the metric tensor, paired with a translation and
//! an atom permutation.

use super::Structure;
use crate::domain::{KappaError, KappaResult};
use moyo::MoyoDataset;
use moyo::base::{AngleTolerance, Cell, Lattice};
use moyo::data::Setting;
use nalgebra::{Matrix3, Vector3};

/// International space-group number (1-230) detected at `symprec`.
pub fn spacegroup_number(structure: &Structure, symprec: f64) -> KappaResult<i32> {
    structure.require_valid_cell()?;
    let lattice = Lattice::new(structure.cell);
    let positions = structure.fractional_positions()?;
    let numbers: Vec<i32> = structure
        .atomic_numbers()?
        .into_iter()
        .map(|z| z as i32)
        .collect();

    let cell = Cell::new(lattice, positions, numbers);
    let dataset = MoyoDataset::new(&cell, symprec, AngleTolerance::Default, Setting::Spglib, true)
        .map_err(|error| {
            KappaError::computation("SYMMETRY.SEARCH", format!("moyo search failed: {error:?}"))
        })?;
    Ok(dataset.number)
}

/// One crystal symmetry operation: an integer rotation acting on column
/// fractional coordinates, a fractional translation, and the induced atom
/// permutation (`permutation[i]` is the image of atom `i`).
#[derive(Debug, Clone)]
pub struct SymmetryOperation {
    pub rotation: Matrix3<i32>,
    pub translation: Vector3<f64>,
    pub permutation: Vec<usize>,
}

impl SymmetryOperation {
    /// The rotation in Cartesian coordinates: C W C^-1 with C = cell^T.
    pub fn cartesian_rotation(&self, cell: &Matrix3<f64>) -> KappaResult<Matrix3<f64>> {
        let columns = cell.transpose();
        let inverse = columns.try_inverse().ok_or_else(|| {
            KappaError::computation("SYMMETRY.CELL", "cell matrix is singular")
        })?;
        Ok(columns * self.rotation.cast::<f64>() * inverse)
    }
}

/// Find all symmetry operations of the structure at `symprec`.
pub fn find_symmetry_operations(
    structure: &Structure,
    symprec: f64,
) -> KappaResult<Vec<SymmetryOperation>> {
    structure.require_valid_cell()?;
    let fractional = structure.fractional_positions()?;
    let metric = structure.cell * structure.cell.transpose();
    let metric_tolerance = symprec.max(1e-8) * metric.norm().max(1.0) * 10.0;

    let mut operations = Vec::new();
    for rotation in lattice_point_group(&metric, metric_tolerance) {
        for translation in candidate_translations(structure, &fractional, &rotation, symprec) {
            if let Some(permutation) =
                atom_mapping(structure, &fractional, &rotation, &translation, symprec)
            {
                operations.push(SymmetryOperation {
                    rotation,
                    translation,
                    permutation,
                });
                break;
            }
        }
    }
    Ok(operations)
}

/// Symmetrize a force set over the given operations. The projection keeps
/// relaxation inside the symmetry-invariant subspace, so the detected space
/// group cannot drift from numerical noise.
pub fn symmetrize_forces(
    structure: &Structure,
    operations: &[SymmetryOperation],
    forces: &[Vector3<f64>],
) -> KappaResult<Vec<Vector3<f64>>> {
    if operations.is_empty() {
        return Ok(forces.to_vec());
    }

    let mut symmetrized = vec![Vector3::zeros(); forces.len()];
    for operation in operations {
        let rotation = operation.cartesian_rotation(&structure.cell)?;
        for (source, &target) in operation.permutation.iter().enumerate() {
            symmetrized[target] += rotation * forces[source];
        }
    }
    let weight = 1.0 / operations.len() as f64;
    for force in &mut symmetrized {
        *force *= weight;
    }
    Ok(symmetrized)
}

/// Integer rotations with entries in {-1, 0, 1} that preserve the metric
/// tensor. 3^9 candidates; the metric filter cuts them to the point group.
fn lattice_point_group(metric: &Matrix3<f64>, tolerance: f64) -> Vec<Matrix3<i32>> {
    let mut rotations = Vec::new();
    let entries = [-1i32, 0, 1];
    let mut candidate = [0i32; 9];
    enumerate_entries(&entries, &mut candidate, 0, &mut |values| {
        let rotation = Matrix3::from_row_slice(values);
        let rotation_f = rotation.cast::<f64>();
        if (rotation_f.determinant().abs() - 1.0).abs() > 0.5 {
            return;
        }
        let transformed = rotation_f.transpose() * metric * rotation_f;
        if (transformed - metric).norm() < tolerance {
            rotations.push(rotation);
        }
    });
    rotations
}

fn enumerate_entries(
    entries: &[i32; 3],
    candidate: &mut [i32; 9],
    index: usize,
    visit: &mut impl FnMut(&[i32; 9]),
) {
    if index == 9 {
        visit(candidate);
        return;
    }
    for &value in entries {
        candidate[index] = value;
        enumerate_entries(entries, candidate, index + 1, visit);
    }
}

fn candidate_translations(
    structure: &Structure,
    fractional: &[Vector3<f64>],
    rotation: &Matrix3<i32>,
    symprec: f64,
) -> Vec<Vector3<f64>> {
    if structure.is_empty() {
        // A bare lattice still admits the pure rotation.
        return vec![Vector3::zeros()];
    }
    let rotation_f = rotation.cast::<f64>();
    let rotated = rotation_f * fractional[0];
    let reference_species = &structure.species[0];

    let mut translations = Vec::new();
    for (index, position) in fractional.iter().enumerate() {
        if &structure.species[index] != reference_species {
            continue;
        }
        let mut translation = position - rotated;
        for axis in 0..3 {
            translation[axis] -= translation[axis].floor();
            if translation[axis] > 1.0 - symprec {
                translation[axis] = 0.0;
            }
        }
        translations.push(translation);
    }
    translations
}

fn atom_mapping(
    structure: &Structure,
    fractional: &[Vector3<f64>],
    rotation: &Matrix3<i32>,
    translation: &Vector3<f64>,
    symprec: f64,
) -> Option<Vec<usize>> {
    let rotation_f = rotation.cast::<f64>();
    let mut permutation = vec![usize::MAX; fractional.len()];
    let mut taken = vec![false; fractional.len()];

    for (source, position) in fractional.iter().enumerate() {
        let image = rotation_f * position + translation;
        let mut matched = None;
        for (target, candidate) in fractional.iter().enumerate() {
            if taken[target] || structure.species[target] != structure.species[source] {
                continue;
            }
            if fractional_distance(&image, candidate) < symprec * 10.0 {
                matched = Some(target);
                break;
            }
        }
        let target = matched?;
        permutation[source] = target;
        taken[target] = true;
    }
    Some(permutation)
}

fn fractional_distance(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    let mut accumulated = 0.0;
    for axis in 0..3 {
        let mut delta = (a[axis] - b[axis]).abs();
        delta -= delta.floor();
        delta = delta.min(1.0 - delta);
        accumulated += delta * delta;
    }
    accumulated.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};

    fn rocksalt() -> Structure {
        Structure::new(
            vec!["Na".to_string(), "Cl".to_string()],
            Matrix3::identity() * 5.0,
            vec![Vector3::zeros(), Vector3::new(2.5, 2.5, 2.5)],
        )
        .unwrap()
    }

    #[test]
    fn cubic_cell_has_full_point_group() {
        let metric = Matrix3::identity() * 25.0;
        let rotations = lattice_point_group(&metric, 1e-6);
        assert_eq!(rotations.len(), 48);
    }

    #[test]
    fn operations_close_under_identity() {
        let structure = rocksalt();
        let operations = find_symmetry_operations(&structure, 1e-5).unwrap();
        assert!(!operations.is_empty());
        assert!(
            operations
                .iter()
                .any(|op| op.rotation == Matrix3::identity() && op.translation.norm() < 1e-8)
        );
        for operation in &operations {
            assert_eq!(operation.permutation.len(), structure.len());
        }
    }

    #[test]
    fn force_projection_kills_symmetry_breaking_components() {
        let structure = rocksalt();
        let operations = find_symmetry_operations(&structure, 1e-5).unwrap();
        // Atoms on inversion centers of a cubic crystal cannot carry a net force.
        let forces = vec![Vector3::new(0.1, -0.2, 0.05), Vector3::new(-0.3, 0.1, 0.2)];
        let projected = symmetrize_forces(&structure, &operations, &forces).unwrap();
        for force in projected {
            assert!(force.norm() < 1e-12, "residual force {force:?}");
        }
    }

    #[test]
    fn symmetrize_without_operations_is_identity() {
        let structure = rocksalt();
        let forces = vec![Vector3::new(0.1, 0.0, 0.0), Vector3::new(0.0, 0.2, 0.0)];
        let projected = symmetrize_forces(&structure, &[], &forces).unwrap();
        assert_eq!(projected, forces);
    }
}
