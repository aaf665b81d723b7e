//! ShengBTE CONTROL file writer.
//!
//! One namelist file per structure; lattice vectors are written in the
//! configured angstrom cell with `lfactor = 0.1` so ShengBTE reads them as
//! nm, and every species/atom enumeration is 1-indexed Fortran style.

use super::TemperatureSpec;
use crate::domain::{KappaError, KappaResult};
use crate::structure::io::fmt_float;
use crate::structure::Structure;
use std::fs;
use std::path::Path;

pub fn write_control(
    path: &Path,
    structure: &Structure,
    fc2_multiplier: [usize; 3],
    mesh: [usize; 3],
    temperature: &TemperatureSpec,
    convergence: bool,
    is_isotope: bool,
) -> KappaResult<()> {
    let ordered = structure.ordered_elements();
    let fractional = structure.fractional_positions()?;
    let cell = structure.cell;

    let mut out = String::new();
    out.push_str("&allocations\n");
    out.push_str(&format!("        nelements={},\n", ordered.len()));
    out.push_str(&format!("        natoms={},\n", structure.len()));
    out.push_str(&format!(
        "        ngrid(:)={} {} {}\n",
        mesh[0], mesh[1], mesh[2]
    ));
    out.push_str("&end\n");

    out.push_str("&crystal\n");
    out.push_str("        lfactor = 0.1\n");
    for row in 0..3 {
        out.push_str(&format!(
            "        lattvec(:,{}) = {} {} {}\n",
            row + 1,
            fmt_float(cell[(row, 0)]),
            fmt_float(cell[(row, 1)]),
            fmt_float(cell[(row, 2)])
        ));
    }
    out.push_str("        elements =");
    for element in &ordered {
        out.push_str(&format!(" \"{element}\""));
    }
    out.push('\n');
    out.push_str("        types =");
    for symbol in &structure.species {
        let kind = ordered
            .iter()
            .position(|element| element == symbol)
            .ok_or_else(|| {
                KappaError::internal("COND.CONTROL", format!("species '{symbol}' not in order"))
            })?;
        out.push_str(&format!(" {}", kind + 1));
    }
    out.push('\n');
    for (index, position) in fractional.iter().enumerate() {
        out.push_str(&format!("        positions(:,{}) =", index + 1));
        for component in 0..3 {
            out.push_str(&format!(" {}", fmt_float(position[component])));
        }
        out.push('\n');
    }
    out.push_str(&format!(
        "        scell(:) = {} {} {}\n",
        fc2_multiplier[0], fc2_multiplier[1], fc2_multiplier[2]
    ));
    out.push_str("&end\n");

    out.push_str("&parameters\n");
    match temperature {
        TemperatureSpec::Range { min, max, step } => {
            out.push_str(&format!("        T_min = {}\n", fmt_float(*min)));
            out.push_str(&format!("        T_max = {}\n", fmt_float(*max)));
            out.push_str(&format!("        T_step = {}\n", fmt_float(*step)));
        }
        TemperatureSpec::Single(value) => {
            out.push_str(&format!("        T = {}\n", fmt_float(*value)));
        }
    }
    out.push_str("        scalebroad=0.1\n");
    out.push_str("&end\n");

    out.push_str("&flags\n");
    out.push_str("        nonanalytic = .false.\n");
    out.push_str(&format!(
        "        convergence = {}\n",
        fortran_bool(convergence)
    ));
    out.push_str(&format!("        isotopes = {}\n", fortran_bool(is_isotope)));
    out.push_str("&end\n");

    fs::write(path, out).map_err(|error| {
        KappaError::io_system("COND.CONTROL", format!("{}: {error}", path.display()))
    })
}

fn fortran_bool(value: bool) -> &'static str {
    if value { ".true." } else { ".false." }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};
    use tempfile::TempDir;

    fn rocksalt() -> Structure {
        Structure::new(
            vec!["Na".to_string(), "Cl".to_string()],
            Matrix3::identity() * 5.6,
            vec![Vector3::zeros(), Vector3::new(2.8, 2.8, 2.8)],
        )
        .unwrap()
    }

    #[test]
    fn control_file_carries_every_namelist_section() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("CONTROL_0");
        write_control(
            &path,
            &rocksalt(),
            [3, 3, 3],
            [12, 12, 12],
            &TemperatureSpec::Single(300.0),
            false,
            true,
        )
        .unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("&allocations\n        nelements=2,\n        natoms=2,\n"));
        assert!(content.contains("        ngrid(:)=12 12 12\n"));
        assert!(content.contains("        lfactor = 0.1\n"));
        assert!(content.contains("        lattvec(:,1) = 5.6 0.0 0.0\n"));
        assert!(content.contains("        elements = \"Na\" \"Cl\"\n"));
        assert!(content.contains("        types = 1 2\n"));
        assert!(content.contains("        positions(:,2) = 0.5 0.5 0.5\n"));
        assert!(content.contains("        scell(:) = 3 3 3\n"));
        assert!(content.contains("        T = 300.0\n"));
        assert!(content.contains("        scalebroad=0.1\n"));
        assert!(content.contains("        nonanalytic = .false.\n"));
        assert!(content.contains("        convergence = .false.\n"));
        assert!(content.contains("        isotopes = .true.\n"));
        assert_eq!(content.matches("&end\n").count(), 4);
    }

    #[test]
    fn temperature_ranges_use_the_min_max_step_keys() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("CONTROL_0");
        write_control(
            &path,
            &rocksalt(),
            [2, 2, 2],
            [8, 8, 8],
            &TemperatureSpec::Range {
                min: 100.0,
                max: 500.0,
                step: 50.0,
            },
            true,
            false,
        )
        .unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("        T_min = 100.0\n"));
        assert!(content.contains("        T_max = 500.0\n"));
        assert!(content.contains("        T_step = 50.0\n"));
        assert!(!content.contains("        T = "));
        assert!(content.contains("        convergence = .true.\n"));
    }

    #[test]
    fn rewriting_the_same_inputs_is_byte_identical() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("CONTROL_a");
        let second = temp.path().join("CONTROL_b");
        let spec = TemperatureSpec::Single(250.0);
        write_control(&first, &rocksalt(), [3, 3, 3], [9, 9, 9], &spec, false, true).unwrap();
        write_control(&second, &rocksalt(), [3, 3, 3], [9, 9, 9], &spec, false, true).unwrap();
        assert_eq!(
            fs::read(&first).unwrap(),
            fs::read(&second).unwrap()
        );
    }
}
