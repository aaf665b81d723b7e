//! Atomic structure model and the cell geometry helpers the pipeline stages
//! share: supercell resolution, q-mesh derivation, and post-relaxation
//! canonicalization.

pub mod elements;
pub mod io;
pub mod symmetry;

use crate::domain::{KappaError, KappaResult};
use nalgebra::{Matrix3, Vector3};
use std::collections::BTreeMap;

pub const SYMPREC: f64 = 1e-5;

/// Open key-value side channel carried per structure. Later stages read
/// derived scalars (space-group number, per-structure meshes or cutoffs)
/// back by name.
#[derive(Debug, Clone, PartialEq)]
pub enum InfoValue {
    Scalar(f64),
    Vector(Vec<f64>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    pub species: Vec<String>,
    /// Rows are the lattice vectors a, b, c in angstrom.
    pub cell: Matrix3<f64>,
    /// Cartesian positions, one per species entry.
    pub positions: Vec<Vector3<f64>>,
    pub pbc: bool,
    pub info: BTreeMap<String, InfoValue>,
}

impl Structure {
    pub fn new(
        species: Vec<String>,
        cell: Matrix3<f64>,
        positions: Vec<Vector3<f64>>,
    ) -> KappaResult<Self> {
        if species.len() != positions.len() {
            return Err(KappaError::input_validation(
                "STRUCTURE.SHAPE",
                format!(
                    "{} species entries but {} positions",
                    species.len(),
                    positions.len()
                ),
            ));
        }
        Ok(Self {
            species,
            cell,
            positions,
            pbc: true,
            info: BTreeMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.species.len()
    }

    pub fn is_empty(&self) -> bool {
        self.species.is_empty()
    }

    pub fn volume(&self) -> f64 {
        self.cell.determinant()
    }

    pub fn require_valid_cell(&self) -> KappaResult<()> {
        if self.volume() <= 0.0 {
            return Err(KappaError::input_validation(
                "STRUCTURE.CELL",
                format!("cell volume {} is not positive", self.volume()),
            ));
        }
        Ok(())
    }

    pub fn cell_lengths(&self) -> [f64; 3] {
        [
            self.cell.row(0).norm(),
            self.cell.row(1).norm(),
            self.cell.row(2).norm(),
        ]
    }

    /// Cell angles alpha, beta, gamma in degrees.
    pub fn cell_angles(&self) -> [f64; 3] {
        let a = self.cell.row(0).transpose();
        let b = self.cell.row(1).transpose();
        let c = self.cell.row(2).transpose();
        let angle = |u: &Vector3<f64>, v: &Vector3<f64>| {
            (u.dot(v) / (u.norm() * v.norm())).clamp(-1.0, 1.0).acos() * 180.0
                / std::f64::consts::PI
        };
        [angle(&b, &c), angle(&a, &c), angle(&a, &b)]
    }

    /// Reciprocal cell without the 2-pi factor: rows b_i with a_i . b_j = delta_ij.
    pub fn reciprocal_cell(&self) -> KappaResult<Matrix3<f64>> {
        let inverse = self.cell.try_inverse().ok_or_else(|| {
            KappaError::computation("STRUCTURE.CELL", "cell matrix is singular")
        })?;
        Ok(inverse.transpose())
    }

    pub fn fractional_positions(&self) -> KappaResult<Vec<Vector3<f64>>> {
        let inverse = self.cell.try_inverse().ok_or_else(|| {
            KappaError::computation("STRUCTURE.CELL", "cell matrix is singular")
        })?;
        let to_frac = inverse.transpose();
        Ok(self.positions.iter().map(|p| to_frac * p).collect())
    }

    pub fn set_fractional_positions(&mut self, fractional: &[Vector3<f64>]) {
        let to_cart = self.cell.transpose();
        self.positions = fractional.iter().map(|f| to_cart * f).collect();
    }

    pub fn atomic_numbers(&self) -> KappaResult<Vec<usize>> {
        self.species
            .iter()
            .map(|symbol| {
                elements::atomic_number_for_symbol(symbol).ok_or_else(|| {
                    KappaError::input_validation(
                        "STRUCTURE.SPECIES",
                        format!("unknown element symbol '{symbol}'"),
                    )
                })
            })
            .collect()
    }

    pub fn masses(&self) -> KappaResult<Vec<f64>> {
        self.species
            .iter()
            .map(|symbol| {
                elements::atomic_mass_for_symbol(symbol).ok_or_else(|| {
                    KappaError::input_validation(
                        "STRUCTURE.SPECIES",
                        format!("no atomic mass for element '{symbol}'"),
                    )
                })
            })
            .collect()
    }

    /// Species in first-seen order, deduplicated. ShengBTE and the run record
    /// both enumerate elements this way.
    pub fn ordered_elements(&self) -> Vec<String> {
        let mut ordered: Vec<String> = Vec::new();
        for symbol in &self.species {
            if !ordered.contains(symbol) {
                ordered.push(symbol.clone());
            }
        }
        ordered
    }

    /// Empirical formula: counts reduced by their gcd, alphabetical symbols.
    pub fn empirical_formula(&self) -> String {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for symbol in &self.species {
            *counts.entry(symbol.as_str()).or_insert(0) += 1;
        }
        let divisor = counts.values().copied().fold(0, gcd).max(1);
        let mut formula = String::new();
        for (symbol, count) in counts {
            formula.push_str(symbol);
            let reduced = count / divisor;
            if reduced > 1 {
                formula.push_str(&reduced.to_string());
            }
        }
        formula
    }

    pub fn info_scalar(&self, key: &str) -> KappaResult<f64> {
        match self.info.get(key) {
            Some(InfoValue::Scalar(value)) => Ok(*value),
            Some(_) => Err(KappaError::input_validation(
                "STRUCTURE.INFO",
                format!("info field '{key}' is not a scalar"),
            )),
            None => Err(KappaError::input_validation(
                "STRUCTURE.INFO",
                format!("info field '{key}' is missing"),
            )),
        }
    }

    pub fn info_vector3(&self, key: &str) -> KappaResult<[f64; 3]> {
        match self.info.get(key) {
            Some(InfoValue::Vector(values)) if values.len() == 3 => {
                Ok([values[0], values[1], values[2]])
            }
            Some(InfoValue::Scalar(value)) => Ok([*value; 3]),
            Some(_) => Err(KappaError::input_validation(
                "STRUCTURE.INFO",
                format!("info field '{key}' is not a 3-vector"),
            )),
            None => Err(KappaError::input_validation(
                "STRUCTURE.INFO",
                format!("info field '{key}' is missing"),
            )),
        }
    }

    /// Minimum interatomic distance under minimum-image periodic boundary
    /// conditions. Used to derive physical fc3 cutoffs.
    pub fn min_interatomic_distance(&self) -> KappaResult<f64> {
        if self.len() < 2 {
            return Err(KappaError::computation(
                "STRUCTURE.DISTANCES",
                "need at least two atoms for a pair distance",
            ));
        }
        let mut minimum = f64::INFINITY;
        for i in 0..self.len() {
            for j in (i + 1)..self.len() {
                minimum = minimum.min(self.pair_distance(i, j));
            }
        }
        Ok(minimum)
    }

    /// Minimum-image distance between atoms i and j.
    pub fn pair_distance(&self, i: usize, j: usize) -> f64 {
        let delta = self.positions[j] - self.positions[i];
        let mut minimum = f64::INFINITY;
        for na in -1..=1 {
            for nb in -1..=1 {
                for nc in -1..=1 {
                    let shift = self.cell.row(0).transpose() * na as f64
                        + self.cell.row(1).transpose() * nb as f64
                        + self.cell.row(2).transpose() * nc as f64;
                    minimum = minimum.min((delta + shift).norm());
                }
            }
        }
        minimum
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Supercell with the bookkeeping the force-constant stages need: which
/// primitive atom each supercell atom images, and at which integer offset.
#[derive(Debug, Clone)]
pub struct Supercell {
    pub structure: Structure,
    pub multiplier: [usize; 3],
    /// Primitive-atom index per supercell atom.
    pub parent: Vec<usize>,
    /// Integer cell offset per supercell atom.
    pub offsets: Vec<[i32; 3]>,
}

impl Supercell {
    pub fn ncells(&self) -> usize {
        self.multiplier[0] * self.multiplier[1] * self.multiplier[2]
    }

    /// Index of the image of supercell atom `atom` translated by `shift`
    /// (an integer offset modulo the multiplier).
    pub fn translated_index(&self, atom: usize, shift: [i32; 3]) -> usize {
        let [na, nb, nc] = self.multiplier;
        let offset = self.offsets[atom];
        let wrapped = [
            (offset[0] + shift[0]).rem_euclid(na as i32),
            (offset[1] + shift[1]).rem_euclid(nb as i32),
            (offset[2] + shift[2]).rem_euclid(nc as i32),
        ];
        let cell_index =
            (wrapped[0] as usize * nb + wrapped[1] as usize) * nc + wrapped[2] as usize;
        self.parent[atom] * self.ncells() + cell_index
    }
}

/// Build a diagonal supercell. Atom ordering is parent-atom major with the
/// integer offsets in lexicographic order, so images of one primitive atom
/// stay contiguous.
pub fn build_supercell(unit: &Structure, multiplier: [usize; 3]) -> KappaResult<Supercell> {
    unit.require_valid_cell()?;
    let [na, nb, nc] = multiplier;
    if na == 0 || nb == 0 || nc == 0 {
        return Err(KappaError::input_validation(
            "STRUCTURE.SUPERCELL",
            format!("degenerate supercell multiplier {multiplier:?}"),
        ));
    }

    let mut cell = unit.cell;
    cell.set_row(0, &(unit.cell.row(0) * na as f64));
    cell.set_row(1, &(unit.cell.row(1) * nb as f64));
    cell.set_row(2, &(unit.cell.row(2) * nc as f64));

    let mut species = Vec::with_capacity(unit.len() * na * nb * nc);
    let mut positions = Vec::with_capacity(unit.len() * na * nb * nc);
    let mut parent = Vec::with_capacity(unit.len() * na * nb * nc);
    let mut offsets = Vec::with_capacity(unit.len() * na * nb * nc);

    for (index, position) in unit.positions.iter().enumerate() {
        for ia in 0..na {
            for ib in 0..nb {
                for ic in 0..nc {
                    let shift = unit.cell.row(0).transpose() * ia as f64
                        + unit.cell.row(1).transpose() * ib as f64
                        + unit.cell.row(2).transpose() * ic as f64;
                    species.push(unit.species[index].clone());
                    positions.push(position + shift);
                    parent.push(index);
                    offsets.push([ia as i32, ib as i32, ic as i32]);
                }
            }
        }
    }

    let mut structure = Structure::new(species, cell, positions)?;
    structure.pbc = unit.pbc;
    Ok(Supercell {
        structure,
        multiplier,
        parent,
        offsets,
    })
}

/// Diagonal supercell multiplier from a target minimum edge length, by
/// per-axis ceiling division of target length by cell-vector length.
pub fn resolve_supercell_multiplier(target: [f64; 3], cell: &Matrix3<f64>) -> [usize; 3] {
    let lengths = [
        cell.row(0).norm(),
        cell.row(1).norm(),
        cell.row(2).norm(),
    ];
    let mut multiplier = [1usize; 3];
    for axis in 0..3 {
        multiplier[axis] = (target[axis] / lengths[axis]).ceil().max(1.0) as usize;
    }
    multiplier
}

/// q-point mesh from a density: ceil(density * 2 pi |b_i|) per axis, where
/// b_i are the reciprocal cell rows without the 2-pi factor.
pub fn get_mesh(density: [f64; 3], structure: &Structure) -> KappaResult<[usize; 3]> {
    let reciprocal = structure.reciprocal_cell()?;
    let mut mesh = [1usize; 3];
    for axis in 0..3 {
        let length = reciprocal.row(axis).norm() * 2.0 * std::f64::consts::PI;
        mesh[axis] = (density[axis] * length).ceil().max(1.0) as usize;
    }
    Ok(mesh)
}

/// Wrap fractional coordinates into [0, 1), snapping values within `symprec`
/// of a cell boundary to exactly zero.
pub fn wrap_positions(structure: &mut Structure, symprec: f64) -> KappaResult<()> {
    let mut fractional = structure.fractional_positions()?;
    for position in &mut fractional {
        for axis in 0..3 {
            let mut value = position[axis] - position[axis].floor();
            if value > 1.0 - symprec || value < symprec {
                value = 0.0;
            }
            position[axis] = value;
        }
    }
    structure.set_fractional_positions(&fractional);
    Ok(())
}

/// Rotate the lattice into the standard crystallographic frame derived from
/// the cell lengths and angles (a along x, b in the xy plane). Fractional
/// coordinates are carried along unchanged.
pub fn rotate_to_standard(structure: &Structure, prec: f64) -> KappaResult<Structure> {
    let [a, b, c] = structure.cell_lengths();
    let [alpha, beta, gamma] = structure
        .cell_angles()
        .map(|angle| angle * std::f64::consts::PI / 180.0);

    let c2 = (alpha.cos() - beta.cos() * gamma.cos()) / gamma.sin();
    let c3 = (1.0 - beta.cos().powi(2) - c2.powi(2)).sqrt();

    let mut rotated_cell = Matrix3::new(
        a,
        0.0,
        0.0,
        b * gamma.cos(),
        b * gamma.sin(),
        0.0,
        c * beta.cos(),
        c * c2,
        c * c3,
    );
    for entry in rotated_cell.iter_mut() {
        if entry.abs() < prec {
            *entry = 0.0;
        }
    }

    let fractional = structure.fractional_positions()?;
    let mut rotated = structure.clone();
    rotated.cell = rotated_cell;
    rotated.set_fractional_positions(&fractional);
    Ok(rotated)
}

/// Post-relaxation canonicalization: rotate into the standard frame unless
/// the rotation changes the detected space group (rotation is an
/// optimization, not a requirement), then wrap fractional coordinates.
pub fn canonicalize(structure: &Structure, recorded_spg: i32) -> KappaResult<Structure> {
    let mut canonical = match rotate_to_standard(structure, 1e-10) {
        Ok(rotated) => match symmetry::spacegroup_number(&rotated, SYMPREC) {
            Ok(number) if number == recorded_spg => rotated,
            Ok(number) => {
                tracing::warn!(
                    from = recorded_spg,
                    to = number,
                    "rotating cell changed the space group; keeping original orientation"
                );
                structure.clone()
            }
            Err(error) => {
                tracing::warn!(%error, "symmetry check after rotation failed; keeping original orientation");
                structure.clone()
            }
        },
        Err(error) => {
            tracing::warn!(%error, "cell rotation failed; keeping original orientation");
            structure.clone()
        }
    };
    wrap_positions(&mut canonical, SYMPREC)?;
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};

    fn cubic(side: f64) -> Structure {
        Structure::new(
            vec!["Si".to_string(), "Si".to_string()],
            Matrix3::identity() * side,
            vec![
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(side / 2.0, side / 2.0, side / 2.0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn structure_rejects_mismatched_lengths() {
        let result = Structure::new(
            vec!["Si".to_string()],
            Matrix3::identity(),
            vec![Vector3::zeros(), Vector3::zeros()],
        );
        assert!(result.is_err());
    }

    #[test]
    fn mesh_for_cubic_cell_matches_density_rule() {
        // ceil(19 * 2pi / 10) = 12 on each axis.
        let structure = cubic(10.0);
        let mesh = get_mesh([19.0; 3], &structure).unwrap();
        assert_eq!(mesh, [12, 12, 12]);
        assert_eq!(get_mesh([19.0; 3], &structure).unwrap(), mesh);
    }

    #[test]
    fn supercell_multiplier_uses_ceiling_division() {
        let cell = Matrix3::identity() * 4.0;
        assert_eq!(resolve_supercell_multiplier([10.0; 3], &cell), [3, 3, 3]);
        assert_eq!(resolve_supercell_multiplier([4.0, 8.0, 9.0], &cell), [1, 2, 3]);
    }

    #[test]
    fn supercell_tracks_parents_and_offsets() {
        let unit = cubic(4.0);
        let supercell = build_supercell(&unit, [2, 1, 1]).unwrap();
        assert_eq!(supercell.structure.len(), 4);
        assert_eq!(supercell.parent, vec![0, 0, 1, 1]);
        assert_eq!(supercell.offsets[1], [1, 0, 0]);
        assert!((supercell.structure.volume() - 2.0 * unit.volume()).abs() < 1e-9);
        // Translating the cell-0 image by one cell lands on the offset-1 image.
        assert_eq!(supercell.translated_index(0, [1, 0, 0]), 1);
        assert_eq!(supercell.translated_index(1, [1, 0, 0]), 0);
    }

    #[test]
    fn wrap_snaps_boundary_coordinates() {
        let mut structure = cubic(10.0);
        structure.positions[0] = Vector3::new(9.999999999, 5.0, -1e-12);
        wrap_positions(&mut structure, 1e-5).unwrap();
        let fractional = structure.fractional_positions().unwrap();
        assert!(fractional[0][0].abs() < 1e-12);
        assert!((fractional[0][1] - 0.5).abs() < 1e-9);
        assert!(fractional[0][2].abs() < 1e-12);
    }

    #[test]
    fn rotation_preserves_lengths_and_angles() {
        let mut structure = cubic(5.0);
        // Shear the cell so it is not already standard.
        structure.cell = Matrix3::new(5.0, 0.0, 0.0, 1.0, 5.0, 0.0, 0.5, 0.3, 5.0);
        let rotated = rotate_to_standard(&structure, 1e-10).unwrap();
        let before_lengths = structure.cell_lengths();
        let after_lengths = rotated.cell_lengths();
        for axis in 0..3 {
            assert!((before_lengths[axis] - after_lengths[axis]).abs() < 1e-9);
        }
        assert!(rotated.cell[(0, 1)].abs() < 1e-12);
        assert!(rotated.cell[(0, 2)].abs() < 1e-12);
        assert!(rotated.cell[(1, 2)].abs() < 1e-12);
    }

    #[test]
    fn empirical_formula_reduces_counts() {
        let structure = Structure::new(
            vec![
                "O".to_string(),
                "Si".to_string(),
                "O".to_string(),
                "Si".to_string(),
            ],
            Matrix3::identity() * 5.0,
            vec![Vector3::zeros(); 4],
        )
        .unwrap();
        assert_eq!(structure.empirical_formula(), "OSi");
        assert_eq!(cubic(4.0).empirical_formula(), "Si");
    }

    #[test]
    fn min_distance_respects_periodic_images() {
        let structure = Structure::new(
            vec!["Si".to_string(), "Si".to_string()],
            Matrix3::identity() * 10.0,
            vec![Vector3::new(0.5, 0.0, 0.0), Vector3::new(9.5, 0.0, 0.0)],
        )
        .unwrap();
        assert!((structure.min_interatomic_distance().unwrap() - 1.0).abs() < 1e-9);
    }
}
