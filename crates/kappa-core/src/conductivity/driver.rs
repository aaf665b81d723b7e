//! Conductivity stage driver.
//!
//! Either exports ShengBTE control files for an external solve or runs the
//! in-process relaxation-time solver and streams per-temperature rows into
//! CSV files. A structure that failed upstream, or fails here, produces NaN
//! rows instead of aborting the batch.

use super::control::write_control;
use super::{resolve_q_mesh, ConductivityKind, RtaSolver, Solver, TemperatureSpec};
use crate::domain::{KappaError, KappaResult};
use crate::fc::ForceConstantBundle;
use crate::recorder::{Column, ProgressBar, RunRecord};
use crate::resolve::SpecValue;
use crate::structure::Structure;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ConductivityOptions {
    pub solver: Solver,
    pub kind: ConductivityKind,
    pub q_points: SpecValue,
    pub temperature: TemperatureSpec,
    pub is_isotope: bool,
    pub convergence: bool,
    pub save_control: Option<PathBuf>,
    pub save_cond: Option<PathBuf>,
}

pub struct ConductivityDriver {
    options: ConductivityOptions,
}

impl ConductivityDriver {
    pub fn new(options: ConductivityOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ConductivityOptions {
        &self.options
    }

    /// `units` and `bundles` are index-aligned with the run record; a `None`
    /// bundle marks a structure whose force constants were lost upstream,
    /// a `None` unit one whose cell never survived relaxation.
    pub fn run(
        &self,
        units: &[Option<&Structure>],
        bundles: &[Option<ForceConstantBundle>],
        record: &mut RunRecord,
    ) -> KappaResult<()> {
        match self.options.solver {
            Solver::Shengbte => self.export_controls(units, bundles, record),
            Solver::Rta => self.solve_in_process(units, bundles, record),
        }
    }

    /// The q-mesh depends only on the unit cell, so it is recorded for every
    /// structure with a surviving cell even when its force constants failed.
    fn record_mesh(
        &self,
        index: usize,
        unit: Option<&Structure>,
        record: &mut RunRecord,
    ) -> Option<[usize; 3]> {
        let unit = unit?;
        match resolve_q_mesh(&self.options.q_points, unit) {
            Ok(mesh) => {
                record.update(index, Column::QMesh, mesh_string(mesh));
                Some(mesh)
            }
            Err(error) => {
                tracing::error!(index, %error, "q-mesh resolution failed");
                None
            }
        }
    }

    fn export_controls(
        &self,
        units: &[Option<&Structure>],
        bundles: &[Option<ForceConstantBundle>],
        record: &mut RunRecord,
    ) -> KappaResult<()> {
        let directory = self.options.save_control.as_ref().ok_or_else(|| {
            KappaError::input_validation(
                "COND.EXPORT",
                "the ShengBTE solver needs a save_control directory",
            )
        })?;
        ensure_dir(directory)?;

        for (index, bundle) in bundles.iter().enumerate() {
            let unit = units.get(index).copied().flatten();
            let mesh = self.record_mesh(index, unit, record);
            let (Some(bundle), Some(mesh)) = (bundle, mesh) else {
                continue;
            };
            write_control(
                &directory.join(format!("CONTROL_{index}")),
                &bundle.unit,
                bundle.fc2_supercell.multiplier,
                mesh,
                &self.options.temperature,
                self.options.convergence,
                self.options.is_isotope,
            )?;
        }
        Ok(())
    }

    fn solve_in_process(
        &self,
        units: &[Option<&Structure>],
        bundles: &[Option<ForceConstantBundle>],
        record: &mut RunRecord,
    ) -> KappaResult<()> {
        let directory = self.options.save_cond.as_ref().ok_or_else(|| {
            KappaError::input_validation(
                "COND.SOLVE",
                "the in-process solver needs a save_cond directory",
            )
        })?;
        ensure_dir(directory)?;
        let temperatures = self.options.temperature.expand();
        if temperatures.is_empty() {
            return Err(KappaError::input_validation(
                "COND.SOLVE",
                "temperature specification expands to nothing",
            ));
        }

        let wigner = self.options.kind == ConductivityKind::Wigner;
        let mut total_csv = open_kappa_csv(&directory.join("kappa_total.csv"))?;
        let mut split_csv = if wigner {
            Some((
                open_kappa_csv(&directory.join("kappa_p.csv"))?,
                open_kappa_csv(&directory.join("kappa_c.csv"))?,
            ))
        } else {
            None
        };

        let solver = RtaSolver {
            kind: self.options.kind,
            is_isotope: self.options.is_isotope,
        };
        let progress = ProgressBar::new(bundles.len(), "conductivity calculation");
        for (index, bundle) in bundles.iter().enumerate() {
            progress.update(index);
            let unit = units.get(index).copied().flatten();
            let mesh = self.record_mesh(index, unit, record);
            let channels = match (bundle, mesh) {
                (Some(bundle), Some(mesh)) => match solver.solve(bundle, mesh, &temperatures) {
                    Ok(report) => {
                        record.update_bool(index, Column::Imaginary, report.imaginary);
                        if report.imaginary {
                            tracing::warn!(index, "structure has imaginary frequencies");
                        }
                        Some(report.channels)
                    }
                    Err(error) => {
                        tracing::error!(index, %error, "conductivity solve failed");
                        None
                    }
                },
                _ => None,
            };

            let (total, propagating, coherent) = match &channels {
                Some(channels) => (
                    Some(&channels.total),
                    channels.propagating.as_ref(),
                    channels.coherent.as_ref(),
                ),
                None => (None, None, None),
            };
            write_kappa_rows(&mut total_csv, index, &temperatures, total)?;
            if let Some((p_csv, c_csv)) = &mut split_csv {
                write_kappa_rows(p_csv, index, &temperatures, propagating)?;
                write_kappa_rows(c_csv, index, &temperatures, coherent)?;
            }
        }
        progress.finish();
        Ok(())
    }
}

fn mesh_string(mesh: [usize; 3]) -> String {
    format!("[{},{},{}]", mesh[0], mesh[1], mesh[2])
}

fn ensure_dir(path: &Path) -> KappaResult<()> {
    fs::create_dir_all(path).map_err(|error| {
        KappaError::io_system("COND.MKDIR", format!("{}: {error}", path.display()))
    })
}

fn open_kappa_csv(path: &Path) -> KappaResult<csv::Writer<fs::File>> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|error| {
            KappaError::io_system("COND.CSV", format!("{}: {error}", path.display()))
        })?;
    writer
        .write_record(["index", "temperature", "xx", "yy", "zz", "yz", "xz", "xy"])
        .and_then(|_| writer.flush().map_err(csv::Error::from))
        .map_err(|error| {
            KappaError::io_system("COND.CSV", format!("{}: {error}", path.display()))
        })?;
    Ok(writer)
}

/// One row per temperature; a failed structure writes a literal NaN cell in
/// place of the six tensor components. Rows are flushed as they land so a
/// crashed run keeps everything completed so far.
fn write_kappa_rows(
    writer: &mut csv::Writer<fs::File>,
    index: usize,
    temperatures: &[f64],
    kappas: Option<&Vec<[f64; 6]>>,
) -> KappaResult<()> {
    let csv_error =
        |error: csv::Error| KappaError::io_system("COND.CSV", error.to_string());
    for (slot, &temperature) in temperatures.iter().enumerate() {
        let mut row = vec![index.to_string(), temperature.to_string()];
        match kappas.and_then(|values| values.get(slot)) {
            Some(kappa) => row.extend(kappa.iter().map(|value| value.to_string())),
            None => row.push("NaN".to_string()),
        }
        writer.write_record(&row).map_err(csv_error)?;
    }
    writer.flush().map_err(|error| {
        KappaError::io_system("COND.CSV", error.to_string())
    })
}
