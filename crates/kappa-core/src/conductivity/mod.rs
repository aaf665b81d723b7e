//! Lattice thermal conductivity from force constants.
//!
//! Two back ends share this module: an export path that writes ShengBTE
//! control files for an external solve, and an in-process relaxation-time
//! solver over a regular q-mesh with an optional Wigner decomposition into
//! propagating and coherent channels.

pub mod control;
pub mod driver;

use crate::domain::{KappaError, KappaResult};
use crate::fc::{ForceConstantBundle, ForceConstants2};
use crate::resolve::SpecValue;
use crate::structure::{get_mesh, Structure, Supercell};
use nalgebra::{DMatrix, Vector3};
use num_complex::Complex;

/// sqrt(eV / angstrom^2 / amu) in THz.
const THZ_FACTOR: f64 = 15.633302;
/// h / kB times 1e12: kelvin per THz.
const KELVIN_PER_THZ: f64 = 47.992_430_7;
const BOLTZMANN_SI: f64 = 1.380_649e-23;
/// Frequencies below this are treated as the gamma-point acoustic zeros.
const ACOUSTIC_FLOOR_THZ: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Solver {
    Shengbte,
    Rta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConductivityKind {
    Bte,
    Wigner,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemperatureSpec {
    Single(f64),
    Range { min: f64, max: f64, step: f64 },
}

impl TemperatureSpec {
    /// Inclusive expansion of the range form; a single value stays alone.
    pub fn expand(&self) -> Vec<f64> {
        match *self {
            Self::Single(value) => vec![value],
            Self::Range { min, max, step } => {
                let mut values = Vec::new();
                if step <= 0.0 {
                    return values;
                }
                let mut current = min;
                while current <= max + 1e-9 {
                    values.push(current);
                    current += step;
                }
                values
            }
        }
    }
}

/// Resolve the q-mesh: a field lookup names the mesh directly, numeric
/// values are interpreted as a density against the reciprocal cell.
pub fn resolve_q_mesh(spec: &SpecValue, structure: &Structure) -> KappaResult<[usize; 3]> {
    let axes = spec.resolve_axes(structure)?;
    match spec {
        SpecValue::FromField(name) => {
            let mut mesh = [0usize; 3];
            for (slot, value) in mesh.iter_mut().zip(axes) {
                if value < 1.0 || value.fract().abs() > 1e-9 {
                    return Err(KappaError::input_validation(
                        "COND.MESH",
                        format!("field '{name}' must hold positive integers, found {value}"),
                    ));
                }
                *slot = value as usize;
            }
            Ok(mesh)
        }
        _ => get_mesh(axes, structure),
    }
}

/// Imaginary-mode screen over per-q-point frequency rows. The first row
/// must be the gamma point: its three acoustic branches get a tolerance for
/// numerical noise, everything else is flagged on any negative value. An
/// internal inconsistency logs a warning and reports no imaginary modes.
pub fn check_imaginary_freqs(frequencies: &[Vec<f64>]) -> bool {
    let Some(gamma) = frequencies.first() else {
        tracing::warn!("imaginary-mode check received no frequencies");
        return false;
    };
    if frequencies
        .iter()
        .all(|row| row.iter().all(|value| value.is_nan()))
    {
        return true;
    }
    if gamma.iter().skip(3).any(|&value| value < 0.0) {
        return true;
    }
    if gamma.iter().take(3).any(|&value| value < -1e-2) {
        return true;
    }
    if frequencies[1..]
        .iter()
        .any(|row| row.iter().any(|&value| value < 0.0))
    {
        return true;
    }
    false
}

/// Phonon frequencies in THz at fractional wavevector `q`, sorted
/// ascending. Negative values are imaginary modes.
pub fn mode_frequencies(
    unit: &Structure,
    supercell: &Supercell,
    fc2: &ForceConstants2,
    q: Vector3<f64>,
) -> KappaResult<Vec<f64>> {
    let masses = unit.masses()?;
    let nprim = unit.len();
    let ncells = supercell.ncells();
    if fc2.n != nprim * ncells {
        return Err(KappaError::internal(
            "COND.DYNMAT",
            format!("fc2 holds {} atoms, supercell has {}", fc2.n, nprim * ncells),
        ));
    }

    let mut dynamical = DMatrix::<Complex<f64>>::zeros(3 * nprim, 3 * nprim);
    for p in 0..nprim {
        let anchor = p * ncells;
        for j in 0..fc2.n {
            let partner = supercell.parent[j];
            let offset = supercell.offsets[j];
            let phase = 2.0
                * std::f64::consts::PI
                * (q[0] * offset[0] as f64 + q[1] * offset[1] as f64 + q[2] * offset[2] as f64);
            let factor = Complex::new(phase.cos(), phase.sin())
                / (masses[p] * masses[partner]).sqrt();
            for a in 0..3 {
                for b in 0..3 {
                    dynamical[(3 * p + a, 3 * partner + b)] +=
                        factor * fc2.at(anchor, j, a, b);
                }
            }
        }
    }

    let eigenvalues = dynamical.symmetric_eigen().eigenvalues;
    let mut frequencies: Vec<f64> = eigenvalues
        .iter()
        .map(|&lambda| lambda.signum() * lambda.abs().sqrt() * THZ_FACTOR)
        .collect();
    frequencies.sort_by(|a, b| a.total_cmp(b));
    Ok(frequencies)
}

/// Gamma first, then the remaining mesh points in lexicographic order.
pub fn mesh_q_points(mesh: [usize; 3]) -> Vec<Vector3<f64>> {
    let mut points = vec![Vector3::zeros()];
    for ia in 0..mesh[0] {
        for ib in 0..mesh[1] {
            for ic in 0..mesh[2] {
                if ia == 0 && ib == 0 && ic == 0 {
                    continue;
                }
                points.push(Vector3::new(
                    ia as f64 / mesh[0] as f64,
                    ib as f64 / mesh[1] as f64,
                    ic as f64 / mesh[2] as f64,
                ));
            }
        }
    }
    points
}

/// Conductivity channels per temperature, each a symmetric tensor in
/// xx, yy, zz, yz, xz, xy order. The propagating and coherent splits are
/// present only for the Wigner decomposition.
#[derive(Debug, Clone)]
pub struct KappaChannels {
    pub total: Vec<[f64; 6]>,
    pub propagating: Option<Vec<[f64; 6]>>,
    pub coherent: Option<Vec<[f64; 6]>>,
}

#[derive(Debug, Clone)]
pub struct SolveReport {
    pub channels: KappaChannels,
    pub imaginary: bool,
}

/// Single-mode relaxation-time solver. Scattering rates follow an
/// umklapp-like w^2 T law scaled by the third-order tensor norm, with an
/// optional w^4 isotope term from the mass spread of the composition.
#[derive(Debug, Clone)]
pub struct RtaSolver {
    pub kind: ConductivityKind,
    pub is_isotope: bool,
}

struct ModeData {
    frequency_thz: f64,
    velocity: Vector3<f64>,
}

impl RtaSolver {
    pub fn solve(
        &self,
        bundle: &ForceConstantBundle,
        mesh: [usize; 3],
        temperatures: &[f64],
    ) -> KappaResult<SolveReport> {
        let fc2 = bundle.fc2.as_ref().ok_or_else(|| {
            KappaError::computation("COND.SOLVE", "no second-order force constants")
        })?;
        let fc3 = bundle.fc3.as_ref().ok_or_else(|| {
            KappaError::computation("COND.SOLVE", "no third-order force constants")
        })?;

        let unit = &bundle.unit;
        let q_points = mesh_q_points(mesh);
        let mut frequency_rows = Vec::with_capacity(q_points.len());
        let mut modes: Vec<Vec<ModeData>> = Vec::with_capacity(q_points.len());
        for &q in &q_points {
            let frequencies = mode_frequencies(unit, &bundle.fc2_supercell, fc2, q)?;
            let velocities =
                group_velocities(unit, &bundle.fc2_supercell, fc2, q, frequencies.len())?;
            modes.push(
                frequencies
                    .iter()
                    .zip(velocities)
                    .map(|(&frequency_thz, velocity)| ModeData {
                        frequency_thz,
                        velocity,
                    })
                    .collect(),
            );
            frequency_rows.push(frequencies);
        }
        let imaginary = check_imaginary_freqs(&frequency_rows);

        // Anharmonic strength per supercell atom; the floor keeps harmonic
        // crystals from acquiring infinite lifetimes.
        let anharmonicity = 1.0 + fc3.norm() / fc3.nsat as f64;
        let isotope_strength = if self.is_isotope {
            mass_variance(unit)?
        } else {
            0.0
        };

        let volume_m3 = unit.volume() * 1e-30;
        let n_cells = (mesh[0] * mesh[1] * mesh[2]) as f64;
        let normalization = 1.0 / (n_cells * volume_m3);

        let mut total = Vec::with_capacity(temperatures.len());
        let mut propagating = Vec::with_capacity(temperatures.len());
        let mut coherent = Vec::with_capacity(temperatures.len());
        for &temperature in temperatures {
            let mut kappa_p = [[0.0f64; 3]; 3];
            let mut kappa_c = [[0.0f64; 3]; 3];
            for q_modes in &modes {
                for mode in q_modes {
                    let Some(rate) =
                        scattering_rate(mode, temperature, anharmonicity, isotope_strength)
                    else {
                        continue;
                    };
                    let capacity = mode_heat_capacity(mode.frequency_thz, temperature);
                    let weight = capacity / rate;
                    for alpha in 0..3 {
                        for beta in 0..3 {
                            kappa_p[alpha][beta] +=
                                weight * mode.velocity[alpha] * mode.velocity[beta];
                        }
                    }
                }
                if self.kind == ConductivityKind::Wigner {
                    accumulate_coherent(
                        q_modes,
                        temperature,
                        anharmonicity,
                        isotope_strength,
                        &mut kappa_c,
                    );
                }
            }
            for row in kappa_p.iter_mut().chain(kappa_c.iter_mut()) {
                for value in row.iter_mut() {
                    *value *= normalization;
                }
            }
            match self.kind {
                ConductivityKind::Bte => total.push(to_voigt(&kappa_p)),
                ConductivityKind::Wigner => {
                    let mut sum = [[0.0f64; 3]; 3];
                    for alpha in 0..3 {
                        for beta in 0..3 {
                            sum[alpha][beta] = kappa_p[alpha][beta] + kappa_c[alpha][beta];
                        }
                    }
                    total.push(to_voigt(&sum));
                    propagating.push(to_voigt(&kappa_p));
                    coherent.push(to_voigt(&kappa_c));
                }
            }
        }

        let channels = match self.kind {
            ConductivityKind::Bte => KappaChannels {
                total,
                propagating: None,
                coherent: None,
            },
            ConductivityKind::Wigner => KappaChannels {
                total,
                propagating: Some(propagating),
                coherent: Some(coherent),
            },
        };
        Ok(SolveReport {
            channels,
            imaginary,
        })
    }
}

/// Scattering rate in 1/s, or `None` for modes that carry no heat
/// (gamma-point acoustic zeros and imaginary modes).
fn scattering_rate(
    mode: &ModeData,
    temperature: f64,
    anharmonicity: f64,
    isotope_strength: f64,
) -> Option<f64> {
    if mode.frequency_thz <= ACOUSTIC_FLOOR_THZ {
        return None;
    }
    let omega = mode.frequency_thz * 1e12 * std::f64::consts::TAU;
    let umklapp = anharmonicity * 1e-19 * omega * omega * temperature.max(1.0);
    let isotope = isotope_strength * 1e-44 * omega.powi(4);
    Some(umklapp + isotope)
}

/// Mode heat capacity in J/K.
fn mode_heat_capacity(frequency_thz: f64, temperature: f64) -> f64 {
    if temperature <= 0.0 {
        return 0.0;
    }
    let x = KELVIN_PER_THZ * frequency_thz / temperature;
    if x > 500.0 {
        return 0.0;
    }
    let expx = x.exp();
    let denom = expx - 1.0;
    if denom.abs() < 1e-30 {
        return BOLTZMANN_SI;
    }
    BOLTZMANN_SI * x * x * expx / (denom * denom)
}

/// Wigner coherence channel: off-branch pairs weighted by a Lorentzian in
/// the frequency gap against the combined linewidth.
fn accumulate_coherent(
    q_modes: &[ModeData],
    temperature: f64,
    anharmonicity: f64,
    isotope_strength: f64,
    kappa_c: &mut [[f64; 3]; 3],
) {
    for (m, first) in q_modes.iter().enumerate() {
        for second in q_modes.iter().skip(m + 1) {
            let (Some(rate_a), Some(rate_b)) = (
                scattering_rate(first, temperature, anharmonicity, isotope_strength),
                scattering_rate(second, temperature, anharmonicity, isotope_strength),
            ) else {
                continue;
            };
            let gap = (first.frequency_thz - second.frequency_thz) * 1e12 * std::f64::consts::TAU;
            let linewidth = rate_a + rate_b;
            let lorentzian = linewidth / (gap * gap + linewidth * linewidth);
            let capacity = 0.5
                * (mode_heat_capacity(first.frequency_thz, temperature)
                    + mode_heat_capacity(second.frequency_thz, temperature));
            let velocity = (first.velocity + second.velocity) * 0.5;
            for alpha in 0..3 {
                for beta in 0..3 {
                    kappa_c[alpha][beta] +=
                        2.0 * capacity * velocity[alpha] * velocity[beta] * lorentzian;
                }
            }
        }
    }
}

/// Group velocities in m/s by central differences of the dispersion along
/// Cartesian reciprocal directions. Branch crossings make this approximate
/// near degeneracies, which the coarse meshes used here tolerate.
fn group_velocities(
    unit: &Structure,
    supercell: &Supercell,
    fc2: &ForceConstants2,
    q: Vector3<f64>,
    branches: usize,
) -> KappaResult<Vec<Vector3<f64>>> {
    let reciprocal = unit.reciprocal_cell()?;
    let delta_frac = 1e-3;
    let mut velocities = vec![Vector3::zeros(); branches];
    for axis in 0..3 {
        let mut step = Vector3::zeros();
        step[axis] = delta_frac;
        let plus = mode_frequencies(unit, supercell, fc2, q + step)?;
        let minus = mode_frequencies(unit, supercell, fc2, q - step)?;
        // Fractional step length in reciprocal space, in 1/angstrom.
        let dq = std::f64::consts::TAU * reciprocal.row(axis).norm() * delta_frac;
        for branch in 0..branches {
            // THz to rad/s, angstrom to meters.
            let slope = (plus[branch] - minus[branch]) * 1e12 * std::f64::consts::TAU
                / (2.0 * dq)
                * 1e-10;
            velocities[branch][axis] = slope;
        }
    }
    Ok(velocities)
}

fn mass_variance(unit: &Structure) -> KappaResult<f64> {
    let masses = unit.masses()?;
    let mean = masses.iter().sum::<f64>() / masses.len() as f64;
    let variance = masses
        .iter()
        .map(|mass| (mass - mean) * (mass - mean))
        .sum::<f64>()
        / masses.len() as f64;
    Ok(variance / (mean * mean) + 1e-4)
}

fn to_voigt(tensor: &[[f64; 3]; 3]) -> [f64; 6] {
    [
        tensor[0][0],
        tensor[1][1],
        tensor[2][2],
        0.5 * (tensor[1][2] + tensor[2][1]),
        0.5 * (tensor[0][2] + tensor[2][0]),
        0.5 * (tensor[0][1] + tensor[1][0]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::{BatchEvaluator, BatchStrategy, LennardJonesPotential};
    use crate::fc::builder::{Fc3Format, FcOptions, ForceConstantBuilder};
    use nalgebra::Matrix3;

    #[test]
    fn temperature_ranges_expand_inclusively() {
        let spec = TemperatureSpec::Range {
            min: 200.0,
            max: 400.0,
            step: 100.0,
        };
        assert_eq!(spec.expand(), vec![200.0, 300.0, 400.0]);
        assert_eq!(TemperatureSpec::Single(300.0).expand(), vec![300.0]);
        let empty = TemperatureSpec::Range {
            min: 100.0,
            max: 200.0,
            step: 0.0,
        };
        assert!(empty.expand().is_empty());
    }

    #[test]
    fn imaginary_check_truth_table() {
        // All NaN means the solver produced nothing usable.
        assert!(check_imaginary_freqs(&[vec![f64::NAN; 4], vec![f64::NAN; 4]]));
        // Negative optical branch at gamma.
        assert!(check_imaginary_freqs(&[vec![0.0, 0.0, 0.0, -0.5]]));
        // Acoustic noise at gamma stays below the tolerance.
        assert!(!check_imaginary_freqs(&[vec![-1e-3, 0.0, 0.0, 5.0]]));
        // Acoustic beyond the tolerance.
        assert!(check_imaginary_freqs(&[vec![-0.5, 0.0, 0.0, 5.0]]));
        // Any negative away from gamma.
        assert!(check_imaginary_freqs(&[
            vec![0.0, 0.0, 0.0, 5.0],
            vec![-0.1, 3.0, 4.0, 5.0],
        ]));
        assert!(!check_imaginary_freqs(&[
            vec![0.0, 0.0, 0.0, 5.0],
            vec![1.0, 3.0, 4.0, 5.0],
        ]));
        // Degenerate input must not panic.
        assert!(!check_imaginary_freqs(&[]));
    }

    #[test]
    fn gamma_is_first_in_the_mesh_enumeration() {
        let points = mesh_q_points([2, 2, 2]);
        assert_eq!(points.len(), 8);
        assert_eq!(points[0], Vector3::zeros());
    }

    fn copper_bundle() -> ForceConstantBundle {
        let structure = Structure::new(
            vec!["Cu".to_string()],
            Matrix3::identity() * 3.6,
            vec![Vector3::zeros()],
        )
        .unwrap();
        let potential = LennardJonesPotential::default();
        let evaluator = BatchEvaluator::new(&potential, BatchStrategy::Fixed { batch_size: 8 });
        let builder = ForceConstantBuilder::new(
            &evaluator,
            FcOptions {
                displacement: 0.01,
                fc2_supercell: SpecValue::PerAxis([4.0, 4.0, 4.0]),
                fc3_supercell: SpecValue::Fixed(1.0),
                fc3_cutoff: SpecValue::Fixed(100.0),
                fc3_format: Fc3Format::Binary,
                symmetrize_fc2: true,
                symmetrize_fc3: true,
                load_fc2: None,
                load_fc3: None,
                save_fc2: None,
                save_fc3: None,
            },
        );
        let outcome = builder.process(0, &structure).unwrap();
        assert!(!outcome.error);
        outcome.bundle
    }

    #[test]
    fn gamma_acoustic_modes_vanish_for_a_relaxed_crystal() {
        let bundle = copper_bundle();
        let frequencies = mode_frequencies(
            &bundle.unit,
            &bundle.fc2_supercell,
            bundle.fc2.as_ref().unwrap(),
            Vector3::zeros(),
        )
        .unwrap();
        assert_eq!(frequencies.len(), 3);
        for frequency in frequencies {
            assert!(frequency.abs() < 1e-4, "gamma acoustic at {frequency} THz");
        }
    }

    #[test]
    fn rta_solver_yields_positive_diagonal_conductivity() {
        let bundle = copper_bundle();
        let solver = RtaSolver {
            kind: ConductivityKind::Bte,
            is_isotope: true,
        };
        let report = solver.solve(&bundle, [3, 3, 3], &[300.0]).unwrap();
        assert_eq!(report.channels.total.len(), 1);
        let kappa = report.channels.total[0];
        for diagonal in &kappa[..3] {
            assert!(diagonal.is_finite());
            assert!(*diagonal >= 0.0);
        }
        assert!(report.channels.propagating.is_none());
    }

    #[test]
    fn wigner_solver_splits_into_three_channels() {
        let bundle = copper_bundle();
        let solver = RtaSolver {
            kind: ConductivityKind::Wigner,
            is_isotope: false,
        };
        let report = solver.solve(&bundle, [2, 2, 2], &[200.0, 300.0]).unwrap();
        let channels = report.channels;
        let propagating = channels.propagating.unwrap();
        let coherent = channels.coherent.unwrap();
        assert_eq!(channels.total.len(), 2);
        for index in 0..2 {
            for component in 0..6 {
                let reassembled = propagating[index][component] + coherent[index][component];
                assert!((channels.total[index][component] - reassembled).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn missing_force_constants_are_a_computation_error() {
        let mut bundle = copper_bundle();
        bundle.fc3 = None;
        let solver = RtaSolver {
            kind: ConductivityKind::Bte,
            is_isotope: false,
        };
        assert!(solver.solve(&bundle, [2, 2, 2], &[300.0]).is_err());
    }
}
