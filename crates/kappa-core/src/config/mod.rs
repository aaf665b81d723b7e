//! TOML run configuration.
//!
//! Five sections with defaults matching common practice; only
//! `data.input_path` is required. Choice fields deserialize into enums so an
//! invalid value fails at startup, and cross-section consistency is checked
//! once after parsing.

use crate::calculator::BatchStrategy;
use crate::conductivity::driver::ConductivityOptions;
use crate::conductivity::{ConductivityKind, Solver, TemperatureSpec};
use crate::domain::{KappaError, KappaResult};
use crate::fc::builder::{Fc3Format, FcOptions};
use crate::relax::{CellFilter, OptimizerKind, RelaxOptions};
use crate::resolve::SpecValue;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Scalar, per-axis, or named-field value as written in the TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawSpec {
    Scalar(f64),
    PerAxis([f64; 3]),
    Field(String),
}

impl RawSpec {
    fn to_spec_value(&self) -> SpecValue {
        match self {
            RawSpec::Scalar(value) => SpecValue::Fixed(*value),
            RawSpec::PerAxis(values) => SpecValue::PerAxis(*values),
            RawSpec::Field(name) => SpecValue::FromField(name.clone()),
        }
    }

    fn display(&self) -> String {
        match self {
            RawSpec::Scalar(value) => value.to_string(),
            RawSpec::PerAxis(values) => format!("[{}, {}, {}]", values[0], values[1], values[2]),
            RawSpec::Field(name) => name.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawTemperature {
    Scalar(f64),
    Triple([f64; 3]),
}

impl RawTemperature {
    fn to_temperature_spec(&self) -> TemperatureSpec {
        match self {
            RawTemperature::Scalar(value) => TemperatureSpec::Single(*value),
            RawTemperature::Triple([min, max, step]) => TemperatureSpec::Range {
                min: *min,
                max: *max,
                step: *step,
            },
        }
    }

    fn display(&self) -> String {
        match self {
            RawTemperature::Scalar(value) => value.to_string(),
            RawTemperature::Triple([min, max, step]) => format!("[{min}, {max}, {step}]"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataSection {
    pub input_path: PathBuf,
    pub save_relax: Option<PathBuf>,
    pub save_fc2: Option<PathBuf>,
    pub save_fc3: Option<PathBuf>,
    pub save_cond: Option<PathBuf>,
    pub save_control: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CalculatorKind {
    Pair,
    PairBatch,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalculatorSection {
    #[serde(default = "default_calculator_kind")]
    pub kind: CalculatorKind,
    pub batch_size: Option<usize>,
    pub avg_atom_num: Option<usize>,
}

fn default_calculator_kind() -> CalculatorKind {
    CalculatorKind::Pair
}

impl Default for CalculatorSection {
    fn default() -> Self {
        Self {
            kind: CalculatorKind::Pair,
            batch_size: None,
            avg_atom_num: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptChoice {
    Fire,
    Lbfgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellFilterChoice {
    None,
    Unitcell,
    Frechet,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelaxSection {
    pub relaxed_input_path: Option<PathBuf>,
    #[serde(default = "default_fmax")]
    pub fmax: f64,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_opt")]
    pub opt: OptChoice,
    #[serde(default = "default_cell_filter")]
    pub cell_filter: CellFilterChoice,
    #[serde(default = "default_true")]
    pub fix_symm: bool,
    #[serde(default = "default_log")]
    pub log: String,
}

fn default_fmax() -> f64 {
    1e-4
}
fn default_steps() -> usize {
    1000
}
fn default_opt() -> OptChoice {
    OptChoice::Fire
}
fn default_cell_filter() -> CellFilterChoice {
    CellFilterChoice::Frechet
}
fn default_true() -> bool {
    true
}
fn default_log() -> String {
    "-".to_string()
}

impl Default for RelaxSection {
    fn default() -> Self {
        Self {
            relaxed_input_path: None,
            fmax: default_fmax(),
            steps: default_steps(),
            opt: default_opt(),
            cell_filter: default_cell_filter(),
            fix_symm: true,
            log: default_log(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fc3FormatChoice {
    Binary,
    Shengbte,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForceConstantSection {
    #[serde(default = "default_displacement")]
    pub displacement: f64,
    #[serde(default = "default_fc2_supercell")]
    pub fc2_supercell: RawSpec,
    #[serde(default = "default_fc3_supercell")]
    pub fc3_supercell: RawSpec,
    #[serde(default = "default_fc3_format")]
    pub fc3_format: Fc3FormatChoice,
    #[serde(default = "default_fc3_cutoff")]
    pub fc3_cutoff: RawSpec,
    #[serde(default)]
    pub symmetrize_fc2: bool,
    #[serde(default = "default_true")]
    pub symmetrize_fc3: bool,
    pub load_fc2: Option<PathBuf>,
    pub load_fc3: Option<PathBuf>,
}

fn default_displacement() -> f64 {
    0.03
}
fn default_fc2_supercell() -> RawSpec {
    RawSpec::Scalar(25.0)
}
fn default_fc3_supercell() -> RawSpec {
    RawSpec::Scalar(15.0)
}
fn default_fc3_format() -> Fc3FormatChoice {
    Fc3FormatChoice::Shengbte
}
fn default_fc3_cutoff() -> RawSpec {
    RawSpec::Scalar(1e7)
}

impl Default for ForceConstantSection {
    fn default() -> Self {
        Self {
            displacement: default_displacement(),
            fc2_supercell: default_fc2_supercell(),
            fc3_supercell: default_fc3_supercell(),
            fc3_format: default_fc3_format(),
            fc3_cutoff: default_fc3_cutoff(),
            symmetrize_fc2: false,
            symmetrize_fc3: true,
            load_fc2: None,
            load_fc3: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverChoice {
    Shengbte,
    Rta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindChoice {
    Bte,
    Wigner,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConductivitySection {
    #[serde(default = "default_solver")]
    pub solver: SolverChoice,
    #[serde(default = "default_kind")]
    pub kind: KindChoice,
    #[serde(default = "default_q_points")]
    pub q_points: RawSpec,
    #[serde(default = "default_temperature")]
    pub temperature: RawTemperature,
    #[serde(default = "default_true")]
    pub is_isotope: bool,
    #[serde(default)]
    pub convergence: bool,
}

fn default_solver() -> SolverChoice {
    SolverChoice::Shengbte
}
fn default_kind() -> KindChoice {
    KindChoice::Bte
}
fn default_q_points() -> RawSpec {
    RawSpec::Scalar(19.0)
}
fn default_temperature() -> RawTemperature {
    RawTemperature::Scalar(300.0)
}

impl Default for ConductivitySection {
    fn default() -> Self {
        Self {
            solver: default_solver(),
            kind: default_kind(),
            q_points: default_q_points(),
            temperature: default_temperature(),
            is_isotope: true,
            convergence: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub data: DataSection,
    #[serde(default)]
    pub calculator: CalculatorSection,
    #[serde(default)]
    pub relax: RelaxSection,
    #[serde(default)]
    pub force_constant: ForceConstantSection,
    #[serde(default)]
    pub conductivity: ConductivitySection,
}

impl Config {
    pub fn load(path: &Path) -> KappaResult<Self> {
        let content = fs::read_to_string(path).map_err(|error| {
            KappaError::io_system("CONFIG.READ", format!("{}: {error}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> KappaResult<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|error| KappaError::input_validation("CONFIG.PARSE", error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-section consistency, applied after defaulting.
    fn validate(&self) -> KappaResult<()> {
        if self.calculator.kind == CalculatorKind::PairBatch
            && self.calculator.batch_size.is_none()
            && self.calculator.avg_atom_num.is_none()
        {
            return Err(KappaError::input_validation(
                "CONFIG.CALCULATOR",
                "pair-batch needs batch_size or avg_atom_num",
            ));
        }
        match self.conductivity.solver {
            SolverChoice::Shengbte => {
                if self.data.save_fc2.is_none()
                    || self.data.save_fc3.is_none()
                    || self.data.save_control.is_none()
                {
                    return Err(KappaError::input_validation(
                        "CONFIG.CONDUCTIVITY",
                        "the shengbte solver needs save_fc2, save_fc3 and save_control",
                    ));
                }
                if self.force_constant.fc3_format != Fc3FormatChoice::Shengbte {
                    return Err(KappaError::input_validation(
                        "CONFIG.CONDUCTIVITY",
                        "the shengbte solver needs fc3_format = \"shengbte\"",
                    ));
                }
                if self.conductivity.kind != KindChoice::Bte {
                    return Err(KappaError::input_validation(
                        "CONFIG.CONDUCTIVITY",
                        "the shengbte solver only handles kind = \"bte\"",
                    ));
                }
            }
            SolverChoice::Rta => {
                if self.data.save_cond.is_none() {
                    return Err(KappaError::input_validation(
                        "CONFIG.CONDUCTIVITY",
                        "the rta solver needs save_cond",
                    ));
                }
                if self.conductivity.convergence {
                    return Err(KappaError::input_validation(
                        "CONFIG.CONDUCTIVITY",
                        "convergence iteration is only available with the shengbte solver",
                    ));
                }
            }
        }
        if let RawTemperature::Triple([_, _, step]) = self.conductivity.temperature {
            if step <= 0.0 {
                return Err(KappaError::input_validation(
                    "CONFIG.CONDUCTIVITY",
                    "temperature step must be positive",
                ));
            }
        }
        Ok(())
    }

    pub fn batch_strategy(&self) -> BatchStrategy {
        match self.calculator.kind {
            CalculatorKind::Pair => BatchStrategy::Single,
            CalculatorKind::PairBatch => match (
                self.calculator.batch_size,
                self.calculator.avg_atom_num,
            ) {
                (Some(batch_size), _) => BatchStrategy::Fixed { batch_size },
                (None, Some(avg_atom_num)) => BatchStrategy::AtomBalanced { avg_atom_num },
                (None, None) => BatchStrategy::Single,
            },
        }
    }

    pub fn relax_options(&self) -> RelaxOptions {
        RelaxOptions {
            fmax: self.relax.fmax,
            steps: self.relax.steps,
            optimizer: match self.relax.opt {
                OptChoice::Fire => OptimizerKind::Fire,
                OptChoice::Lbfgs => OptimizerKind::Lbfgs,
            },
            cell_filter: match self.relax.cell_filter {
                CellFilterChoice::None => CellFilter::None,
                CellFilterChoice::Unitcell => CellFilter::UnitCell,
                CellFilterChoice::Frechet => CellFilter::Frechet,
            },
            fix_symm: self.relax.fix_symm,
        }
    }

    pub fn fc_options(&self) -> FcOptions {
        FcOptions {
            displacement: self.force_constant.displacement,
            fc2_supercell: self.force_constant.fc2_supercell.to_spec_value(),
            fc3_supercell: self.force_constant.fc3_supercell.to_spec_value(),
            fc3_cutoff: self.force_constant.fc3_cutoff.to_spec_value(),
            fc3_format: match self.force_constant.fc3_format {
                Fc3FormatChoice::Binary => Fc3Format::Binary,
                Fc3FormatChoice::Shengbte => Fc3Format::Shengbte,
            },
            symmetrize_fc2: self.force_constant.symmetrize_fc2,
            symmetrize_fc3: self.force_constant.symmetrize_fc3,
            load_fc2: self.force_constant.load_fc2.clone(),
            load_fc3: self.force_constant.load_fc3.clone(),
            save_fc2: self.data.save_fc2.clone(),
            save_fc3: self.data.save_fc3.clone(),
        }
    }

    pub fn conductivity_options(&self) -> ConductivityOptions {
        ConductivityOptions {
            solver: match self.conductivity.solver {
                SolverChoice::Shengbte => Solver::Shengbte,
                SolverChoice::Rta => Solver::Rta,
            },
            kind: match self.conductivity.kind {
                KindChoice::Bte => ConductivityKind::Bte,
                KindChoice::Wigner => ConductivityKind::Wigner,
            },
            q_points: self.conductivity.q_points.to_spec_value(),
            temperature: self.conductivity.temperature.to_temperature_spec(),
            is_isotope: self.conductivity.is_isotope,
            convergence: self.conductivity.convergence,
            save_control: self.data.save_control.clone(),
            save_cond: self.data.save_cond.clone(),
        }
    }

    /// Effective configuration as key/value pairs for the run-log echo.
    pub fn echo_pairs(&self) -> Vec<(String, String)> {
        let path = |value: &Option<PathBuf>| {
            value
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "None".to_string())
        };
        vec![
            (
                "input_path".to_string(),
                self.data.input_path.display().to_string(),
            ),
            ("save_relax".to_string(), path(&self.data.save_relax)),
            ("save_fc2".to_string(), path(&self.data.save_fc2)),
            ("save_fc3".to_string(), path(&self.data.save_fc3)),
            ("save_cond".to_string(), path(&self.data.save_cond)),
            ("save_control".to_string(), path(&self.data.save_control)),
            (
                "calculator".to_string(),
                format!("{:?}", self.calculator.kind),
            ),
            ("fmax".to_string(), self.relax.fmax.to_string()),
            ("steps".to_string(), self.relax.steps.to_string()),
            ("opt".to_string(), format!("{:?}", self.relax.opt)),
            (
                "cell_filter".to_string(),
                format!("{:?}", self.relax.cell_filter),
            ),
            ("fix_symm".to_string(), self.relax.fix_symm.to_string()),
            (
                "displacement".to_string(),
                self.force_constant.displacement.to_string(),
            ),
            (
                "fc2_supercell".to_string(),
                self.force_constant.fc2_supercell.display(),
            ),
            (
                "fc3_supercell".to_string(),
                self.force_constant.fc3_supercell.display(),
            ),
            (
                "fc3_cutoff".to_string(),
                self.force_constant.fc3_cutoff.display(),
            ),
            (
                "solver".to_string(),
                format!("{:?}", self.conductivity.solver),
            ),
            ("kind".to_string(), format!("{:?}", self.conductivity.kind)),
            ("q_points".to_string(), self.conductivity.q_points.display()),
            (
                "temperature".to_string(),
                self.conductivity.temperature.display(),
            ),
            (
                "is_isotope".to_string(),
                self.conductivity.is_isotope.to_string(),
            ),
        ]
    }
}
