//! Per-structure force-constant orchestration.
//!
//! Resolves supercells and the fc3 cutoff, runs or loads each order, and
//! reports what happened in the run table's notation. A failed order marks
//! the structure instead of aborting the batch.

use super::{
    assemble_fc2, assemble_fc3, count_non_null, evaluate_displaced_forces,
    generate_fc2_displacements, generate_fc3_displacements, persistence, symmetrize_fc2,
    symmetrize_fc3, thirdorder, Displacement, ForceConstantBundle, ForceConstants2,
    ForceConstants3,
};
use crate::calculator::BatchEvaluator;
use crate::domain::{KappaError, KappaResult};
use crate::resolve::SpecValue;
use crate::structure::{build_supercell, resolve_supercell_multiplier, Structure, Supercell};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fc3Format {
    /// Dense tensor kept in memory and persisted in the binary container.
    Binary,
    /// Sparse `FORCE_CONSTANTS_3RD` text written for ShengBTE.
    Shengbte,
}

#[derive(Debug, Clone)]
pub struct FcOptions {
    pub displacement: f64,
    pub fc2_supercell: SpecValue,
    pub fc3_supercell: SpecValue,
    pub fc3_cutoff: SpecValue,
    pub fc3_format: Fc3Format,
    pub symmetrize_fc2: bool,
    pub symmetrize_fc3: bool,
    pub load_fc2: Option<PathBuf>,
    pub load_fc3: Option<PathBuf>,
    pub save_fc2: Option<PathBuf>,
    pub save_fc3: Option<PathBuf>,
}

/// What one structure contributed: the tensors for the in-process solver
/// plus the run-table annotations.
#[derive(Debug, Clone)]
pub struct FcOutcome {
    pub bundle: ForceConstantBundle,
    pub fc2_record: String,
    pub fc3_record: String,
    pub error: bool,
}

/// Resolve a supercell spec: a field lookup names the multiplier directly,
/// fixed values are target edge lengths in angstrom.
pub fn resolve_multiplier(spec: &SpecValue, structure: &Structure) -> KappaResult<[usize; 3]> {
    let axes = spec.resolve_axes(structure)?;
    match spec {
        SpecValue::FromField(name) => {
            let mut multiplier = [0usize; 3];
            for (slot, value) in multiplier.iter_mut().zip(axes) {
                if value < 1.0 || value.fract().abs() > 1e-9 {
                    return Err(KappaError::input_validation(
                        "FC.SUPERCELL",
                        format!("field '{name}' must hold positive integers, found {value}"),
                    ));
                }
                *slot = value as usize;
            }
            Ok(multiplier)
        }
        _ => Ok(resolve_supercell_multiplier(axes, &structure.cell)),
    }
}

/// Resolve the fc3 pair cutoff. Positive values are distances in angstrom
/// (converted to nm for the ShengBTE path); a negative value is a relative
/// multiplier on the minimum interatomic distance of the reference
/// supercell, clamped to half its shortest edge.
pub fn resolve_fc3_cutoff(
    spec: &SpecValue,
    format: Fc3Format,
    structure: &Structure,
    reference_multiplier: [usize; 3],
) -> KappaResult<f64> {
    let mut cutoff = spec.resolve_scalar(structure)?;
    if cutoff < 0.0 {
        let reference = build_supercell(structure, reference_multiplier)?;
        let dmin = reference.structure.min_interatomic_distance()?;
        let half_edge = reference
            .structure
            .cell_lengths()
            .into_iter()
            .fold(f64::INFINITY, f64::min)
            * 0.5;
        cutoff = (dmin * -cutoff).min(half_edge);
    }
    if format == Fc3Format::Shengbte {
        cutoff /= 10.0;
    }
    Ok(cutoff)
}

fn ensure_dir(path: &Path) -> KappaResult<()> {
    fs::create_dir_all(path).map_err(|error| {
        KappaError::io_system("FC.MKDIR", format!("{}: {error}", path.display()))
    })
}

fn record_string(multiplier: [usize; 3], count: usize) -> String {
    format!(
        "[{},{},{}]*{}",
        multiplier[0], multiplier[1], multiplier[2], count
    )
}

pub struct ForceConstantBuilder<'a> {
    evaluator: &'a BatchEvaluator<'a>,
    options: FcOptions,
}

impl<'a> ForceConstantBuilder<'a> {
    pub fn new(evaluator: &'a BatchEvaluator<'a>, options: FcOptions) -> Self {
        Self { evaluator, options }
    }

    pub fn options(&self) -> &FcOptions {
        &self.options
    }

    /// Process one relaxed structure. Errors in resolving supercells or the
    /// cutoff abort this structure; errors inside an order are absorbed into
    /// the outcome's error flag.
    pub fn process(&self, index: usize, structure: &Structure) -> KappaResult<FcOutcome> {
        let fc2_multiplier = resolve_multiplier(&self.options.fc2_supercell, structure)?;
        let fc3_multiplier = resolve_multiplier(&self.options.fc3_supercell, structure)?;
        let cutoff = resolve_fc3_cutoff(
            &self.options.fc3_cutoff,
            self.options.fc3_format,
            structure,
            fc2_multiplier,
        )?;
        let fc2_supercell = build_supercell(structure, fc2_multiplier)?;
        let mut error = false;

        // The displacement count is fixed once the set is generated; a
        // failed evaluation still reports it next to the error flag.
        let fc2_entries = generate_fc2_displacements(&fc2_supercell, self.options.displacement);
        let fc2_count = count_non_null(&fc2_entries);
        let fc2 = match self.run_fc2(index, &fc2_supercell, &fc2_entries) {
            Ok(fc2) => Some(fc2),
            Err(failure) => {
                tracing::error!(index, %failure, "fc2 calculation failed");
                error = true;
                None
            }
        };

        let (fc3, fc3_count) = match self.run_fc3(index, structure, fc3_multiplier, cutoff) {
            Ok(outcome) => outcome,
            Err(failure) => {
                tracing::error!(index, %failure, "fc3 calculation failed");
                error = true;
                (
                    None,
                    self.fc3_count_after_failure(structure, fc3_multiplier, cutoff),
                )
            }
        };

        Ok(FcOutcome {
            fc2_record: record_string(fc2_multiplier, fc2_count),
            fc3_record: record_string(fc3_multiplier, fc3_count),
            bundle: ForceConstantBundle {
                unit: structure.clone(),
                fc2_supercell,
                fc3_multiplier,
                fc2,
                fc3,
                fc2_displacement_count: fc2_count,
                fc3_displacement_count: fc3_count,
            },
            error,
        })
    }

    /// A failed external-format export never fixed a displacement count, so
    /// the table shows zero; the dense path still reports the generated set.
    fn fc3_count_after_failure(
        &self,
        structure: &Structure,
        multiplier: [usize; 3],
        cutoff: f64,
    ) -> usize {
        if self.options.fc3_format == Fc3Format::Shengbte {
            return 0;
        }
        match build_supercell(structure, multiplier) {
            Ok(supercell) => count_non_null(&generate_fc3_displacements(
                &supercell,
                self.options.displacement,
                cutoff,
            )),
            Err(_) => 0,
        }
    }

    fn run_fc2(
        &self,
        index: usize,
        supercell: &Supercell,
        entries: &[Option<Displacement>],
    ) -> KappaResult<ForceConstants2> {
        if let Some(load_dir) = &self.options.load_fc2 {
            let path = load_dir.join(format!("FORCE_CONSTANTS_2ND_{index}"));
            let fc2 = persistence::read_fc2(&path)?;
            if fc2.n != supercell.structure.len() {
                return Err(KappaError::input_validation(
                    "FC2.LOAD",
                    format!(
                        "{}: holds {} atoms, supercell has {}",
                        path.display(),
                        fc2.n,
                        supercell.structure.len()
                    ),
                ));
            }
            return Ok(fc2);
        }

        let references: Vec<Option<&Structure>> = entries
            .iter()
            .map(|entry| entry.as_ref().map(|displacement| &displacement.structure))
            .collect();
        let forces =
            evaluate_displaced_forces(self.evaluator, &references, supercell.structure.len())?;
        let mut fc2 = assemble_fc2(supercell, self.options.displacement, &forces)?;
        if self.options.symmetrize_fc2 {
            symmetrize_fc2(&mut fc2);
        }
        if let Some(save_dir) = &self.options.save_fc2 {
            ensure_dir(save_dir)?;
            persistence::write_fc2(&save_dir.join(format!("FORCE_CONSTANTS_2ND_{index}")), &fc2)?;
        }
        Ok(fc2)
    }

    fn run_fc3(
        &self,
        index: usize,
        structure: &Structure,
        multiplier: [usize; 3],
        cutoff: f64,
    ) -> KappaResult<(Option<ForceConstants3>, usize)> {
        if let Some(load_dir) = &self.options.load_fc3 {
            let supercell = build_supercell(structure, multiplier)?;
            let entries =
                generate_fc3_displacements(&supercell, self.options.displacement, cutoff);
            let fc3 = persistence::read_fc3(&load_dir.join(format!("fc3_{index}.bin")))?;
            return Ok((Some(fc3), count_non_null(&entries)));
        }

        match self.options.fc3_format {
            Fc3Format::Shengbte => {
                let save_dir = self.options.save_fc3.as_ref().ok_or_else(|| {
                    KappaError::input_validation(
                        "FC3.SHENGBTE",
                        "the ShengBTE fc3 path needs a save_fc3 directory",
                    )
                })?;
                ensure_dir(save_dir)?;
                let count = thirdorder::run_thirdorder(
                    structure,
                    multiplier,
                    cutoff,
                    self.options.displacement,
                    self.evaluator,
                    &save_dir.join(format!("FORCE_CONSTANTS_3RD_{index}")),
                )?;
                Ok((None, count))
            }
            Fc3Format::Binary => {
                let supercell = build_supercell(structure, multiplier)?;
                let entries =
                    generate_fc3_displacements(&supercell, self.options.displacement, cutoff);
                let count = count_non_null(&entries);
                let references: Vec<Option<&Structure>> = entries
                    .iter()
                    .map(|entry| entry.as_ref().map(|pair| &pair.structure))
                    .collect();
                let forces = evaluate_displaced_forces(
                    self.evaluator,
                    &references,
                    supercell.structure.len(),
                )?;
                let mut fc3 = assemble_fc3(&supercell, self.options.displacement, &forces)?;
                if self.options.symmetrize_fc3 {
                    symmetrize_fc3(&supercell, &mut fc3);
                }
                if let Some(save_dir) = &self.options.save_fc3 {
                    ensure_dir(save_dir)?;
                    persistence::write_fc3(&save_dir.join(format!("fc3_{index}.bin")), &fc3)?;
                }
                Ok((Some(fc3), count))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::{
        BatchStrategy, EvalResult, LennardJonesPotential, PotentialEvaluator,
    };
    use crate::structure::InfoValue;
    use nalgebra::{Matrix3, Vector3};
    use tempfile::TempDir;

    fn copper_cell() -> Structure {
        Structure::new(
            vec!["Cu".to_string()],
            Matrix3::identity() * 3.6,
            vec![Vector3::zeros()],
        )
        .unwrap()
    }

    fn options(format: Fc3Format) -> FcOptions {
        FcOptions {
            displacement: 0.01,
            fc2_supercell: SpecValue::Fixed(5.0),
            fc3_supercell: SpecValue::Fixed(1.0),
            fc3_cutoff: SpecValue::Fixed(100.0),
            fc3_format: format,
            symmetrize_fc2: true,
            symmetrize_fc3: true,
            load_fc2: None,
            load_fc3: None,
            save_fc2: None,
            save_fc3: None,
        }
    }

    #[test]
    fn multiplier_resolution_ceils_target_lengths_and_trusts_fields() {
        let mut structure = copper_cell();
        assert_eq!(
            resolve_multiplier(&SpecValue::Fixed(5.0), &structure).unwrap(),
            [2, 2, 2]
        );
        structure.info.insert(
            "sc".to_string(),
            InfoValue::Vector(vec![3.0, 1.0, 2.0]),
        );
        assert_eq!(
            resolve_multiplier(&SpecValue::FromField("sc".to_string()), &structure).unwrap(),
            [3, 1, 2]
        );
        structure
            .info
            .insert("bad".to_string(), InfoValue::Vector(vec![1.5, 1.0, 1.0]));
        assert!(
            resolve_multiplier(&SpecValue::FromField("bad".to_string()), &structure).is_err()
        );
    }

    #[test]
    fn negative_cutoff_derives_from_the_nearest_neighbor_distance() {
        let structure = copper_cell();
        let cutoff = resolve_fc3_cutoff(
            &SpecValue::Fixed(-1.5),
            Fc3Format::Binary,
            &structure,
            [2, 2, 2],
        )
        .unwrap();
        // Nearest neighbors sit one lattice constant apart; 1.5x that is
        // clamped to half the supercell edge.
        assert!((cutoff - 3.6).abs() < 1e-9);
    }

    #[test]
    fn shengbte_cutoffs_convert_to_nanometers() {
        let structure = copper_cell();
        let cutoff = resolve_fc3_cutoff(
            &SpecValue::Fixed(4.0),
            Fc3Format::Shengbte,
            &structure,
            [2, 2, 2],
        )
        .unwrap();
        assert!((cutoff - 0.4).abs() < 1e-12);
    }

    #[test]
    fn process_builds_both_orders_and_records_counts() {
        let temp = TempDir::new().unwrap();
        let potential = LennardJonesPotential::default();
        let evaluator = BatchEvaluator::new(&potential, BatchStrategy::Fixed { batch_size: 4 });
        let mut opts = options(Fc3Format::Binary);
        opts.save_fc2 = Some(temp.path().join("fc2"));
        opts.save_fc3 = Some(temp.path().join("fc3"));
        let builder = ForceConstantBuilder::new(&evaluator, opts);

        let outcome = builder.process(0, &copper_cell()).unwrap();
        assert!(!outcome.error);
        // 8 supercell atoms never enter the record; only the primitive count
        // times six signed axis displacements does.
        assert_eq!(outcome.fc2_record, "[2,2,2]*6");
        assert_eq!(outcome.fc3_record, "[1,1,1]*36");
        assert!(outcome.bundle.fc2.is_some());
        assert!(outcome.bundle.fc3.is_some());
        assert!(temp.path().join("fc2/FORCE_CONSTANTS_2ND_0").exists());
        assert!(temp.path().join("fc3/fc3_0.bin").exists());
    }

    #[test]
    fn saved_force_constants_load_back_identically() {
        let temp = TempDir::new().unwrap();
        let potential = LennardJonesPotential::default();
        let evaluator = BatchEvaluator::new(&potential, BatchStrategy::Single);

        let mut save_opts = options(Fc3Format::Binary);
        save_opts.save_fc2 = Some(temp.path().join("fc2"));
        save_opts.save_fc3 = Some(temp.path().join("fc3"));
        let saved = ForceConstantBuilder::new(&evaluator, save_opts)
            .process(0, &copper_cell())
            .unwrap();

        let mut load_opts = options(Fc3Format::Binary);
        load_opts.load_fc2 = Some(temp.path().join("fc2"));
        load_opts.load_fc3 = Some(temp.path().join("fc3"));
        let loaded = ForceConstantBuilder::new(&evaluator, load_opts)
            .process(0, &copper_cell())
            .unwrap();

        let saved_fc2 = saved.bundle.fc2.unwrap();
        let loaded_fc2 = loaded.bundle.fc2.unwrap();
        assert!(saved_fc2.max_abs_difference(&loaded_fc2) < 1e-10);
        assert_eq!(saved.bundle.fc3.unwrap(), loaded.bundle.fc3.unwrap());
    }

    struct AlwaysFails;

    impl PotentialEvaluator for AlwaysFails {
        fn evaluate(&self, _structure: &Structure) -> KappaResult<EvalResult> {
            Err(KappaError::computation("TEST.FAIL", "backend unavailable"))
        }
    }

    #[test]
    fn evaluation_failures_mark_the_outcome_without_aborting() {
        let potential = AlwaysFails;
        let evaluator = BatchEvaluator::new(&potential, BatchStrategy::Single);
        let builder = ForceConstantBuilder::new(&evaluator, options(Fc3Format::Binary));
        let outcome = builder.process(3, &copper_cell()).unwrap();
        assert!(outcome.error);
        assert!(outcome.bundle.fc2.is_none());
        assert!(outcome.bundle.fc3.is_none());
        // The displacement sets were generated before the backend failed,
        // so the table still shows their sizes next to the error flag.
        assert_eq!(outcome.fc2_record, "[2,2,2]*6");
        assert_eq!(outcome.fc3_record, "[1,1,1]*36");
    }

    #[test]
    fn external_format_failure_reports_zero_third_order_displacements() {
        let temp = TempDir::new().unwrap();
        let potential = AlwaysFails;
        let evaluator = BatchEvaluator::new(&potential, BatchStrategy::Single);
        let mut opts = options(Fc3Format::Shengbte);
        opts.save_fc3 = Some(temp.path().join("fc3"));
        let builder = ForceConstantBuilder::new(&evaluator, opts);
        let outcome = builder.process(0, &copper_cell()).unwrap();
        assert!(outcome.error);
        assert_eq!(outcome.fc2_record, "[2,2,2]*6");
        assert_eq!(outcome.fc3_record, "[1,1,1]*0");
    }
}
