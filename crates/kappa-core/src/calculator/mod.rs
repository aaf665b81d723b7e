//! Potential evaluation boundary and the batch evaluator.
//!
//! The pipeline consumes potentials through [`PotentialEvaluator`], a
//! capability object injected at construction. The built-in implementation is
//! a Lennard-Jones pair potential; machine-learned evaluators plug in through
//! the same trait, with an optional jointly-batched entry point.

use crate::domain::{KappaError, KappaResult};
use crate::structure::{Structure, elements};
use nalgebra::{Matrix3, Vector3};

/// Energy, forces, and raw 3x3 stress for one structure.
#[derive(Debug, Clone)]
pub struct EvalResult {
    pub energy: f64,
    pub forces: Vec<Vector3<f64>>,
    pub stress3: Matrix3<f64>,
}

impl EvalResult {
    /// Sign-flipped 6-component stress in xx, yy, zz, yz, xz, xy order.
    pub fn voigt_stress(&self) -> [f64; 6] {
        let s = &self.stress3;
        [
            -s[(0, 0)],
            -s[(1, 1)],
            -s[(2, 2)],
            -s[(1, 2)],
            -s[(0, 2)],
            -s[(0, 1)],
        ]
    }
}

pub trait PotentialEvaluator: Send + Sync {
    fn evaluate(&self, structure: &Structure) -> KappaResult<EvalResult>;

    /// Joint evaluation of one batch. Backends with real batched inference
    /// override this; the default falls back to sequential evaluation.
    fn evaluate_batch(&self, structures: &[&Structure]) -> KappaResult<Vec<EvalResult>> {
        structures
            .iter()
            .map(|structure| self.evaluate(structure))
            .collect()
    }
}

/// How the batch evaluator groups structures before handing them to the
/// potential backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    /// One structure per call; a failure propagates to the caller.
    Single,
    /// Fixed-size groups.
    Fixed { batch_size: usize },
    /// Group size derived so each batch carries roughly `avg_atom_num` atoms
    /// per structure on average, bounding peak memory.
    AtomBalanced { avg_atom_num: usize },
}

pub struct BatchEvaluator<'a> {
    potential: &'a dyn PotentialEvaluator,
    strategy: BatchStrategy,
}

impl<'a> BatchEvaluator<'a> {
    pub fn new(potential: &'a dyn PotentialEvaluator, strategy: BatchStrategy) -> Self {
        Self {
            potential,
            strategy,
        }
    }

    /// Evaluate every structure, returning results index-aligned with the
    /// input regardless of the internal grouping.
    pub fn evaluate_all(&self, structures: &[Structure]) -> KappaResult<Vec<EvalResult>> {
        if structures.is_empty() {
            return Ok(Vec::new());
        }
        match self.strategy {
            BatchStrategy::Single => structures
                .iter()
                .map(|structure| self.potential.evaluate(structure))
                .collect(),
            BatchStrategy::Fixed { batch_size } => self.evaluate_batched(structures, batch_size),
            BatchStrategy::AtomBalanced { avg_atom_num } => {
                let total_atoms: usize = structures.iter().map(Structure::len).sum();
                let batch_size = if total_atoms == 0 {
                    1
                } else {
                    avg_atom_num * structures.len() / total_atoms
                };
                self.evaluate_batched(structures, batch_size)
            }
        }
    }

    fn evaluate_batched(
        &self,
        structures: &[Structure],
        batch_size: usize,
    ) -> KappaResult<Vec<EvalResult>> {
        let batch_size = batch_size.max(1);
        let mut results = Vec::with_capacity(structures.len());
        for chunk in structures.chunks(batch_size) {
            let refs: Vec<&Structure> = chunk.iter().collect();
            let mut batch = self.potential.evaluate_batch(&refs)?;
            if batch.len() != chunk.len() {
                return Err(KappaError::internal(
                    "CALC.BATCH",
                    format!(
                        "backend returned {} results for a batch of {}",
                        batch.len(),
                        chunk.len()
                    ),
                ));
            }
            // Forces come back padded to the largest structure in the batch
            // from some backends; truncate to each structure's atom count.
            for (structure, result) in chunk.iter().zip(&mut batch) {
                result.forces.truncate(structure.len());
            }
            results.append(&mut batch);
        }
        Ok(results)
    }
}

/// Lennard-Jones parameters per element, with Lorentz-Berthelot mixing.
#[derive(Debug, Clone, Copy)]
struct PairParameters {
    sigma: f64,
    epsilon: f64,
}

// sigma in angstrom, epsilon in eV. Generic dispersion-scale values; the
// point of this backend is a smooth, stable energy surface, not chemistry.
const PAIR_TABLE: [(usize, PairParameters); 8] = [
    (1, PairParameters { sigma: 2.57, epsilon: 0.0019 }),
    (6, PairParameters { sigma: 3.43, epsilon: 0.0045 }),
    (8, PairParameters { sigma: 3.12, epsilon: 0.0026 }),
    (11, PairParameters { sigma: 2.66, epsilon: 0.0130 }),
    (14, PairParameters { sigma: 3.83, epsilon: 0.0175 }),
    (17, PairParameters { sigma: 3.52, epsilon: 0.0098 }),
    (29, PairParameters { sigma: 3.50, epsilon: 0.0022 }),
    (47, PairParameters { sigma: 3.15, epsilon: 0.0156 }),
];

const FALLBACK_PARAMETERS: PairParameters = PairParameters {
    sigma: 3.00,
    epsilon: 0.0100,
};

fn parameters_for(atomic_number: usize) -> PairParameters {
    PAIR_TABLE
        .iter()
        .find(|(z, _)| *z == atomic_number)
        .map(|(_, parameters)| *parameters)
        .unwrap_or(FALLBACK_PARAMETERS)
}

/// Built-in Lennard-Jones potential over periodic images within a cutoff.
#[derive(Debug, Clone)]
pub struct LennardJonesPotential {
    pub cutoff: f64,
}

impl Default for LennardJonesPotential {
    fn default() -> Self {
        Self { cutoff: 10.0 }
    }
}

impl LennardJonesPotential {
    pub fn new(cutoff: f64) -> Self {
        Self { cutoff }
    }
}

impl PotentialEvaluator for LennardJonesPotential {
    fn evaluate(&self, structure: &Structure) -> KappaResult<EvalResult> {
        structure.require_valid_cell()?;
        let numbers = structure.atomic_numbers()?;
        let volume = structure.volume();

        let lengths = structure.cell_lengths();
        let reach = |axis: usize| -> i32 {
            if structure.pbc {
                (self.cutoff / lengths[axis]).ceil() as i32
            } else {
                0
            }
        };
        let (ra, rb, rc) = (reach(0), reach(1), reach(2));

        let mut energy = 0.0;
        let mut forces = vec![Vector3::zeros(); structure.len()];
        let mut stress3 = Matrix3::zeros();
        let cutoff_squared = self.cutoff * self.cutoff;

        for i in 0..structure.len() {
            let pi = parameters_for(numbers[i]);
            for j in 0..structure.len() {
                let pj = parameters_for(numbers[j]);
                let sigma = 0.5 * (pi.sigma + pj.sigma);
                let epsilon = (pi.epsilon * pj.epsilon).sqrt();
                for na in -ra..=ra {
                    for nb in -rb..=rb {
                        for nc in -rc..=rc {
                            if i == j && na == 0 && nb == 0 && nc == 0 {
                                continue;
                            }
                            let shift = structure.cell.row(0).transpose() * na as f64
                                + structure.cell.row(1).transpose() * nb as f64
                                + structure.cell.row(2).transpose() * nc as f64;
                            let rij = structure.positions[i] - structure.positions[j] - shift;
                            let r2 = rij.norm_squared();
                            if r2 > cutoff_squared || r2 < 1e-12 {
                                continue;
                            }
                            let sr2 = sigma * sigma / r2;
                            let sr6 = sr2 * sr2 * sr2;
                            let sr12 = sr6 * sr6;
                            // Halved: every pair is visited from both sides.
                            energy += 2.0 * epsilon * (sr12 - sr6);
                            let magnitude = 24.0 * epsilon * (2.0 * sr12 - sr6) / r2;
                            let force = rij * magnitude;
                            forces[i] += force;
                            stress3 += rij * force.transpose() * 0.5;
                        }
                    }
                }
            }
        }

        stress3 /= -volume;
        Ok(EvalResult {
            energy,
            forces,
            stress3,
        })
    }
}

/// Assert element symbols are resolvable before a long run starts.
pub fn validate_species(structure: &Structure) -> KappaResult<()> {
    for symbol in &structure.species {
        if elements::atomic_number_for_symbol(symbol).is_none() {
            return Err(KappaError::input_validation(
                "CALC.SPECIES",
                format!("unknown element symbol '{symbol}'"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};

    fn dimer(distance: f64) -> Structure {
        let mut structure = Structure::new(
            vec!["Si".to_string(), "Si".to_string()],
            Matrix3::identity() * 50.0,
            vec![
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(distance, 0.0, 0.0),
            ],
        )
        .unwrap();
        structure.pbc = false;
        structure
    }

    struct IndexTaggedPotential;

    impl PotentialEvaluator for IndexTaggedPotential {
        fn evaluate(&self, structure: &Structure) -> KappaResult<EvalResult> {
            // Tag the result with the structure's first coordinate so order
            // scrambling would be visible.
            Ok(EvalResult {
                energy: structure.positions[0][0],
                forces: vec![Vector3::zeros(); structure.len()],
                stress3: Matrix3::zeros(),
            })
        }
    }

    fn tagged_structures(count: usize) -> Vec<Structure> {
        (0..count)
            .map(|index| {
                Structure::new(
                    vec!["Si".to_string()],
                    Matrix3::identity() * 10.0,
                    vec![Vector3::new(index as f64, 0.0, 0.0)],
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn batch_output_order_matches_input_for_all_strategies() {
        let potential = IndexTaggedPotential;
        let structures = tagged_structures(7);
        let strategies = [
            BatchStrategy::Single,
            BatchStrategy::Fixed { batch_size: 1 },
            BatchStrategy::Fixed { batch_size: 3 },
            BatchStrategy::Fixed { batch_size: 100 },
            BatchStrategy::AtomBalanced { avg_atom_num: 2 },
        ];
        for strategy in strategies {
            let evaluator = BatchEvaluator::new(&potential, strategy);
            let results = evaluator.evaluate_all(&structures).unwrap();
            assert_eq!(results.len(), 7);
            for (index, result) in results.iter().enumerate() {
                assert_eq!(result.energy, index as f64, "strategy {strategy:?}");
            }
        }
    }

    #[test]
    fn atom_balanced_batch_size_never_drops_below_one() {
        let potential = IndexTaggedPotential;
        let evaluator =
            BatchEvaluator::new(&potential, BatchStrategy::AtomBalanced { avg_atom_num: 0 });
        let results = evaluator.evaluate_all(&tagged_structures(3)).unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn lj_forces_are_opposite_and_central() {
        let potential = LennardJonesPotential::default();
        let result = potential.evaluate(&dimer(3.5)).unwrap();
        assert_eq!(result.forces.len(), 2);
        assert!((result.forces[0] + result.forces[1]).norm() < 1e-10);
        assert!(result.forces[0][1].abs() < 1e-12);
        assert!(result.energy < 0.0);
    }

    #[test]
    fn lj_minimum_sits_at_two_to_the_sixth_sigma() {
        let potential = LennardJonesPotential::default();
        let sigma = 3.83; // Si table entry
        let minimum = 2f64.powf(1.0 / 6.0) * sigma;
        let at_minimum = potential.evaluate(&dimer(minimum)).unwrap();
        assert!(at_minimum.forces[0].norm() < 1e-8);
        let compressed = potential.evaluate(&dimer(minimum - 0.2)).unwrap();
        assert!(compressed.energy > at_minimum.energy);
    }

    #[test]
    fn voigt_stress_flips_sign_and_reorders() {
        let result = EvalResult {
            energy: 0.0,
            forces: Vec::new(),
            stress3: Matrix3::new(1.0, 6.0, 5.0, 6.0, 2.0, 4.0, 5.0, 4.0, 3.0),
        };
        assert_eq!(
            result.voigt_stress(),
            [-1.0, -2.0, -3.0, -4.0, -5.0, -6.0]
        );
    }
}
