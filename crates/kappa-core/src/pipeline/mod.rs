//! End-to-end pipeline: read structures, relax, build force constants, and
//! run or export the conductivity stage.
//!
//! Stages are strictly sequential. A structure that fails a stage is carried
//! forward as a `StageFailure` so the remaining structures still run and the
//! final table shows one row per input.

use crate::calculator::{BatchEvaluator, PotentialEvaluator};
use crate::conductivity::driver::ConductivityDriver;
use crate::config::Config;
use crate::domain::{KappaResult, PipelineStage, StageFailure};
use crate::fc::builder::ForceConstantBuilder;
use crate::fc::ForceConstantBundle;
use crate::recorder::{Column, ProgressBar, RunContext, RunRecord};
use crate::relax::Relaxer;
use crate::structure::{canonicalize, io, symmetry, Structure, SYMPREC};

pub fn run(config: &Config, potential: &dyn PotentialEvaluator) -> KappaResult<()> {
    let mut context = RunContext::new(&config.relax.log, 0)?;
    context.banner()?;
    context.writeline("\nStarting kappa-rs\n")?;
    context.log_config(&config.echo_pairs())?;
    context.writeline("")?;

    let (structures, skip_relax) = match &config.relax.relaxed_input_path {
        Some(path) => (io::read_structures(path)?, true),
        None => (io::read_structures(&config.data.input_path)?, false),
    };
    context.record = RunRecord::new(structures.len());

    let relaxed = if skip_relax {
        seed_from_relaxed_input(structures, &mut context.record)
    } else {
        relax_stage(config, potential, &structures, &mut context)?
    };
    let relaxed = canonicalize_stage(relaxed);

    if let Some(path) = &config.data.save_relax {
        let survivors: Vec<Structure> = relaxed
            .iter()
            .filter_map(|entry| entry.as_ref().ok().cloned())
            .collect();
        io::write_structures(path, &survivors)?;
    }

    let evaluator = BatchEvaluator::new(potential, config.batch_strategy());
    let bundles = fc_stage(config, &evaluator, &relaxed, &mut context)?;
    context.writeline("Force-constant stage complete.")?;

    let units: Vec<Option<&Structure>> = relaxed.iter().map(|entry| entry.as_ref().ok()).collect();
    let driver = ConductivityDriver::new(config.conductivity_options());
    driver.run(&units, &bundles, &mut context.record)?;
    context.writeline("Conductivity stage complete.")?;

    context.log_results()?;
    context.terminate()
}

type StructureResults = Vec<Result<Structure, StageFailure>>;

/// Structures paired with the space-group number already recorded for them,
/// so the canonicalization stage does not repeat the symmetry search.
type RelaxedBatch = Vec<Result<(Structure, i32), StageFailure>>;

/// Pre-relaxed input skips the relax stage but still gets its formula and
/// symmetry recorded.
fn seed_from_relaxed_input(structures: Vec<Structure>, record: &mut RunRecord) -> RelaxedBatch {
    structures
        .into_iter()
        .enumerate()
        .map(|(index, structure)| {
            record.update(index, Column::Formula, structure.empirical_formula());
            let spg = symmetry::spacegroup_number(&structure, SYMPREC).unwrap_or(1);
            record.update(index, Column::SpgNum, spg);
            Ok((structure, spg))
        })
        .collect()
}

fn relax_stage(
    config: &Config,
    potential: &dyn PotentialEvaluator,
    structures: &[Structure],
    context: &mut RunContext,
) -> KappaResult<RelaxedBatch> {
    let relaxer = Relaxer::new(potential, config.relax_options());
    let progress = ProgressBar::new(structures.len(), "atom relax");
    let mut relaxed = Vec::with_capacity(structures.len());

    for (index, structure) in structures.iter().enumerate() {
        progress.update(index);
        context
            .record
            .update(index, Column::Formula, structure.empirical_formula());

        let outcome = symmetry::spacegroup_number(structure, SYMPREC)
            .and_then(|initial_spg| Ok((initial_spg, relaxer.relax(structure)?)));
        match outcome {
            Ok((initial_spg, outcome)) => {
                let final_spg = symmetry::spacegroup_number(&outcome.structure, SYMPREC)
                    .unwrap_or(initial_spg);
                let spg_same = final_spg == initial_spg;
                context.record.update(index, Column::SpgNum, final_spg);
                context.record.update_bool(index, Column::SpgSame, spg_same);
                context
                    .record
                    .update_bool(index, Column::Conv, outcome.converged);
                if !spg_same {
                    tracing::warn!(
                        index,
                        from = initial_spg,
                        to = final_spg,
                        "space group changed while relaxing"
                    );
                }
                if !outcome.converged {
                    tracing::warn!(
                        index,
                        steps = config.relax.steps,
                        "relaxation did not converge within the step budget"
                    );
                }
                relaxed.push(Ok((outcome.structure, final_spg)));
            }
            Err(error) => {
                let failure = StageFailure {
                    stage: PipelineStage::Relax,
                    structure_index: index,
                    message: error.to_string(),
                };
                tracing::error!(index, %failure, "relaxation failed");
                context.record.update_bool(index, Column::Conv, false);
                relaxed.push(Err(failure));
            }
        }
    }
    progress.finish();
    Ok(relaxed)
}

/// Rotate to the standard frame and wrap positions; a canonicalization
/// failure demotes the structure rather than the run.
fn canonicalize_stage(relaxed: RelaxedBatch) -> StructureResults {
    relaxed
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let (structure, spg) = entry?;
            canonicalize(&structure, spg).map_err(|error| {
                let failure = StageFailure {
                    stage: PipelineStage::Relax,
                    structure_index: index,
                    message: error.to_string(),
                };
                tracing::error!(index, %failure, "canonicalization failed");
                failure
            })
        })
        .collect()
}

fn fc_stage(
    config: &Config,
    evaluator: &BatchEvaluator,
    relaxed: &StructureResults,
    context: &mut RunContext,
) -> KappaResult<Vec<Option<ForceConstantBundle>>> {
    let builder = ForceConstantBuilder::new(evaluator, config.fc_options());
    let progress = ProgressBar::new(relaxed.len(), "processing fcs");
    let mut bundles = Vec::with_capacity(relaxed.len());

    for (index, entry) in relaxed.iter().enumerate() {
        progress.update(index);
        let Ok(structure) = entry else {
            bundles.push(None);
            continue;
        };
        match builder.process(index, structure) {
            Ok(outcome) => {
                context
                    .record
                    .update(index, Column::Fc2Super, &outcome.fc2_record);
                context
                    .record
                    .update(index, Column::Fc3Super, &outcome.fc3_record);
                context
                    .record
                    .update_bool(index, Column::FcCalcError, outcome.error);
                bundles.push(Some(outcome.bundle));
            }
            Err(error) => {
                let failure = StageFailure {
                    stage: PipelineStage::ForceConstants,
                    structure_index: index,
                    message: error.to_string(),
                };
                tracing::error!(index, %failure, "force-constant stage failed");
                context.record.update_bool(index, Column::FcCalcError, true);
                bundles.push(None);
            }
        }
    }
    progress.finish();
    Ok(bundles)
}
