//! Geometry relaxation under a potential evaluator.
//!
//! The relaxer copies the input structure, optionally projects forces onto
//! the symmetry-invariant subspace, optionally extends the degrees of freedom
//! with a strain-driven cell filter, and iterates FIRE or LBFGS until the
//! force residual drops below `fmax` or the step budget runs out. Running out
//! of steps is reported, never fatal.

use crate::calculator::PotentialEvaluator;
use crate::domain::{KappaError, KappaResult};
use crate::structure::symmetry::{self, SymmetryOperation};
use crate::structure::{SYMPREC, Structure};
use nalgebra::Matrix3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Fire,
    Lbfgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellFilter {
    None,
    UnitCell,
    Frechet,
}

#[derive(Debug, Clone)]
pub struct RelaxOptions {
    pub fmax: f64,
    pub steps: usize,
    pub optimizer: OptimizerKind,
    pub cell_filter: CellFilter,
    pub fix_symm: bool,
}

impl Default for RelaxOptions {
    fn default() -> Self {
        Self {
            fmax: 1e-4,
            steps: 1000,
            optimizer: OptimizerKind::Fire,
            cell_filter: CellFilter::Frechet,
            fix_symm: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelaxOutcome {
    pub structure: Structure,
    pub converged: bool,
    pub steps_taken: usize,
}

pub struct Relaxer<'a> {
    potential: &'a dyn PotentialEvaluator,
    options: RelaxOptions,
}

impl<'a> Relaxer<'a> {
    pub fn new(potential: &'a dyn PotentialEvaluator, options: RelaxOptions) -> Self {
        Self { potential, options }
    }

    /// Relax a copy of `structure`. The evaluator handle is not retained on
    /// the returned structure.
    pub fn relax(&self, structure: &Structure) -> KappaResult<RelaxOutcome> {
        structure.require_valid_cell()?;
        let operations = if self.options.fix_symm {
            symmetry::find_symmetry_operations(structure, SYMPREC)?
        } else {
            Vec::new()
        };

        let mut state = DofState::new(structure.clone(), self.options.cell_filter);
        let mut driver = match self.options.optimizer {
            OptimizerKind::Fire => Driver::Fire(Fire::new(state.len())),
            OptimizerKind::Lbfgs => Driver::Lbfgs(Lbfgs::new()),
        };

        let mut converged = false;
        let mut steps_taken = 0;
        for step in 0..self.options.steps {
            let forces = state.dof_forces(self.potential, &operations)?;
            let residual = max_component_norm(&forces);
            tracing::debug!(step, residual, "relaxation step");
            if residual < self.options.fmax {
                converged = true;
                steps_taken = step;
                break;
            }
            let displacement = driver.step(&state.dof(), &forces);
            state.apply(&displacement);
            steps_taken = step + 1;
        }

        if !converged {
            // Budget exhausted; re-check in case the last step landed below
            // the threshold.
            let forces = state.dof_forces(self.potential, &operations)?;
            converged = max_component_norm(&forces) < self.options.fmax;
        }

        Ok(RelaxOutcome {
            structure: state.into_structure(),
            converged,
            steps_taken,
        })
    }
}

/// Flat degree-of-freedom vector: 3N Cartesian coordinates, plus 9 strain
/// components when a cell filter is active. Strain is measured against the
/// cell captured at relaxation start and scaled by the filter's cell factor.
struct DofState {
    structure: Structure,
    reference_cell: Matrix3<f64>,
    strain: Matrix3<f64>,
    cell_filter: CellFilter,
    cell_factor: f64,
}

impl DofState {
    fn new(structure: Structure, cell_filter: CellFilter) -> Self {
        let cell_factor = match cell_filter {
            CellFilter::None => 1.0,
            // ASE-style scaling keeps cell and atomic steps commensurate.
            CellFilter::UnitCell | CellFilter::Frechet => (structure.len() as f64).max(1.0),
        };
        let reference_cell = structure.cell;
        Self {
            structure,
            reference_cell,
            strain: Matrix3::zeros(),
            cell_filter,
            cell_factor,
        }
    }

    fn len(&self) -> usize {
        let atoms = self.structure.len() * 3;
        match self.cell_filter {
            CellFilter::None => atoms,
            _ => atoms + 9,
        }
    }

    fn dof(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.len());
        for position in &self.structure.positions {
            flat.extend_from_slice(&[position[0], position[1], position[2]]);
        }
        if self.cell_filter != CellFilter::None {
            for row in 0..3 {
                for column in 0..3 {
                    flat.push(self.strain[(row, column)] * self.cell_factor);
                }
            }
        }
        flat
    }

    fn apply(&mut self, displacement: &[f64]) {
        for (index, position) in self.structure.positions.iter_mut().enumerate() {
            position[0] += displacement[3 * index];
            position[1] += displacement[3 * index + 1];
            position[2] += displacement[3 * index + 2];
        }
        if self.cell_filter != CellFilter::None {
            let base = self.structure.len() * 3;
            for row in 0..3 {
                for column in 0..3 {
                    self.strain[(row, column)] +=
                        displacement[base + 3 * row + column] / self.cell_factor;
                }
            }
            let deformation = self.deformation();
            // Row convention: each lattice vector maps through the deformation.
            self.structure.cell = self.reference_cell * deformation.transpose();
        }
    }

    fn deformation(&self) -> Matrix3<f64> {
        match self.cell_filter {
            CellFilter::None | CellFilter::UnitCell => Matrix3::identity() + self.strain,
            // Frechet filter: exponential map of the strain, second order.
            CellFilter::Frechet => {
                Matrix3::identity()
                    + self.strain
                    + self.strain * self.strain * 0.5
            }
        }
    }

    /// Generalized forces on the DOF vector, with symmetry projection applied
    /// to the atomic block.
    fn dof_forces(
        &self,
        potential: &dyn PotentialEvaluator,
        operations: &[SymmetryOperation],
    ) -> KappaResult<Vec<f64>> {
        let result = potential.evaluate(&self.structure)?;
        if result.forces.len() != self.structure.len() {
            return Err(KappaError::internal(
                "RELAX.FORCES",
                format!(
                    "evaluator returned {} forces for {} atoms",
                    result.forces.len(),
                    self.structure.len()
                ),
            ));
        }
        let atomic = if operations.is_empty() {
            result.forces
        } else {
            symmetry::symmetrize_forces(&self.structure, operations, &result.forces)?
        };

        let mut flat = Vec::with_capacity(self.len());
        for force in &atomic {
            flat.extend_from_slice(&[force[0], force[1], force[2]]);
        }
        if self.cell_filter != CellFilter::None {
            let volume = self.structure.volume();
            let strain_force = result.stress3 * (-volume / self.cell_factor);
            for row in 0..3 {
                for column in 0..3 {
                    flat.push(strain_force[(row, column)]);
                }
            }
        }
        Ok(flat)
    }

    fn into_structure(self) -> Structure {
        self.structure
    }
}

/// Convergence measure: max Euclidean norm over consecutive 3-component
/// blocks of the generalized force vector.
fn max_component_norm(forces: &[f64]) -> f64 {
    forces
        .chunks(3)
        .map(|chunk| chunk.iter().map(|v| v * v).sum::<f64>().sqrt())
        .fold(0.0, f64::max)
}

enum Driver {
    Fire(Fire),
    Lbfgs(Lbfgs),
}

impl Driver {
    fn step(&mut self, dof: &[f64], forces: &[f64]) -> Vec<f64> {
        match self {
            Self::Fire(fire) => fire.step(forces),
            Self::Lbfgs(lbfgs) => lbfgs.step(dof, forces),
        }
    }
}

/// Fast inertial relaxation engine with the standard adaptive-timestep
/// parameter set.
struct Fire {
    velocity: Vec<f64>,
    dt: f64,
    dt_max: f64,
    alpha: f64,
    steps_since_reset: usize,
}

impl Fire {
    const ALPHA_START: f64 = 0.1;
    const F_ALPHA: f64 = 0.99;
    const F_INC: f64 = 1.1;
    const F_DEC: f64 = 0.5;
    const N_MIN: usize = 5;
    const MAX_STEP: f64 = 0.2;

    fn new(dof_len: usize) -> Self {
        Self {
            velocity: vec![0.0; dof_len],
            dt: 0.1,
            dt_max: 1.0,
            alpha: Self::ALPHA_START,
            steps_since_reset: 0,
        }
    }

    fn step(&mut self, forces: &[f64]) -> Vec<f64> {
        let power: f64 = self
            .velocity
            .iter()
            .zip(forces)
            .map(|(v, f)| v * f)
            .sum();

        if power > 0.0 {
            let v_norm = norm(&self.velocity);
            let f_norm = norm(forces).max(1e-30);
            for (v, f) in self.velocity.iter_mut().zip(forces) {
                *v = (1.0 - self.alpha) * *v + self.alpha * f / f_norm * v_norm;
            }
            if self.steps_since_reset > Self::N_MIN {
                self.dt = (self.dt * Self::F_INC).min(self.dt_max);
                self.alpha *= Self::F_ALPHA;
            }
            self.steps_since_reset += 1;
        } else {
            self.velocity.iter_mut().for_each(|v| *v = 0.0);
            self.alpha = Self::ALPHA_START;
            self.dt *= Self::F_DEC;
            self.steps_since_reset = 0;
        }

        for (v, f) in self.velocity.iter_mut().zip(forces) {
            *v += self.dt * f;
        }
        let mut displacement: Vec<f64> = self.velocity.iter().map(|v| v * self.dt).collect();
        clamp_step(&mut displacement, Self::MAX_STEP);
        displacement
    }
}

/// Limited-memory BFGS with two-loop recursion and a conservative trust step.
struct Lbfgs {
    history: usize,
    h0: f64,
    max_step: f64,
    s_list: Vec<Vec<f64>>,
    y_list: Vec<Vec<f64>>,
    previous_dof: Option<Vec<f64>>,
    previous_gradient: Option<Vec<f64>>,
}

impl Lbfgs {
    fn new() -> Self {
        Self {
            history: 10,
            h0: 1.0 / 70.0,
            max_step: 0.2,
            s_list: Vec::new(),
            y_list: Vec::new(),
            previous_dof: None,
            previous_gradient: None,
        }
    }

    fn step(&mut self, dof: &[f64], forces: &[f64]) -> Vec<f64> {
        let gradient: Vec<f64> = forces.iter().map(|f| -f).collect();

        if let (Some(prev_dof), Some(prev_grad)) =
            (self.previous_dof.take(), self.previous_gradient.take())
        {
            let s: Vec<f64> = dof.iter().zip(&prev_dof).map(|(a, b)| a - b).collect();
            let y: Vec<f64> = gradient.iter().zip(&prev_grad).map(|(a, b)| a - b).collect();
            if dot(&s, &y) > 1e-12 {
                self.s_list.push(s);
                self.y_list.push(y);
                if self.s_list.len() > self.history {
                    self.s_list.remove(0);
                    self.y_list.remove(0);
                }
            }
        }

        // Two-loop recursion for the quasi-Newton direction.
        let mut q = gradient.clone();
        let mut alphas = Vec::with_capacity(self.s_list.len());
        for (s, y) in self.s_list.iter().zip(&self.y_list).rev() {
            let rho = 1.0 / dot(s, y);
            let alpha = rho * dot(s, &q);
            for (qi, yi) in q.iter_mut().zip(y) {
                *qi -= alpha * yi;
            }
            alphas.push((alpha, rho));
        }
        for value in q.iter_mut() {
            *value *= self.h0;
        }
        for ((s, y), (alpha, rho)) in self
            .s_list
            .iter()
            .zip(&self.y_list)
            .zip(alphas.into_iter().rev())
        {
            let beta = rho * dot(y, &q);
            for (qi, si) in q.iter_mut().zip(s) {
                *qi += (alpha - beta) * si;
            }
        }

        let mut displacement: Vec<f64> = q.iter().map(|value| -value).collect();
        clamp_step(&mut displacement, self.max_step);

        self.previous_dof = Some(dof.to_vec());
        self.previous_gradient = Some(gradient);
        displacement
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(values: &[f64]) -> f64 {
    dot(values, values).sqrt()
}

/// Scale the whole step down so no 3-component block moves farther than
/// `max_step`.
fn clamp_step(displacement: &mut [f64], max_step: f64) {
    let largest = max_component_norm(displacement);
    if largest > max_step {
        let scale = max_step / largest;
        for value in displacement.iter_mut() {
            *value *= scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::LennardJonesPotential;
    use nalgebra::{Matrix3, Vector3};

    fn perturbed_dimer() -> Structure {
        let mut structure = Structure::new(
            vec!["Si".to_string(), "Si".to_string()],
            Matrix3::identity() * 50.0,
            vec![
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(4.0, 0.1, 0.0),
            ],
        )
        .unwrap();
        structure.pbc = false;
        structure
    }

    fn relax_options(optimizer: OptimizerKind) -> RelaxOptions {
        RelaxOptions {
            fmax: 1e-4,
            steps: 2000,
            optimizer,
            cell_filter: CellFilter::None,
            fix_symm: false,
        }
    }

    #[test]
    fn fire_relaxes_dimer_to_lj_minimum() {
        let potential = LennardJonesPotential::default();
        let relaxer = Relaxer::new(&potential, relax_options(OptimizerKind::Fire));
        let input = perturbed_dimer();
        let outcome = relaxer.relax(&input).unwrap();
        assert!(outcome.converged, "not converged in {}", outcome.steps_taken);
        let distance = (outcome.structure.positions[1] - outcome.structure.positions[0]).norm();
        let expected = 2f64.powf(1.0 / 6.0) * 3.83;
        assert!((distance - expected).abs() < 1e-2, "distance {distance}");
        // Caller's structure is untouched.
        assert_eq!(input.positions[1], Vector3::new(4.0, 0.1, 0.0));
    }

    #[test]
    fn lbfgs_relaxes_dimer_to_lj_minimum() {
        let potential = LennardJonesPotential::default();
        let relaxer = Relaxer::new(&potential, relax_options(OptimizerKind::Lbfgs));
        let outcome = relaxer.relax(&perturbed_dimer()).unwrap();
        assert!(outcome.converged);
        let distance = (outcome.structure.positions[1] - outcome.structure.positions[0]).norm();
        let expected = 2f64.powf(1.0 / 6.0) * 3.83;
        assert!((distance - expected).abs() < 1e-2, "distance {distance}");
    }

    #[test]
    fn exhausted_step_budget_reports_non_convergence() {
        let potential = LennardJonesPotential::default();
        let options = RelaxOptions {
            steps: 1,
            ..relax_options(OptimizerKind::Fire)
        };
        let relaxer = Relaxer::new(&potential, options);
        let outcome = relaxer.relax(&perturbed_dimer()).unwrap();
        assert!(!outcome.converged);
        assert_eq!(outcome.steps_taken, 1);
    }

    #[test]
    fn cell_filter_adds_strain_degrees_of_freedom() {
        let structure = perturbed_dimer();
        let state = DofState::new(structure.clone(), CellFilter::UnitCell);
        assert_eq!(state.len(), structure.len() * 3 + 9);
        let bare = DofState::new(structure, CellFilter::None);
        assert_eq!(bare.len(), 6);
    }
}
