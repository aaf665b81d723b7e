//! Extended-XYZ structure input and output.
//!
//! Supports multi-frame files with a `Lattice="..."` comment entry and a
//! `Properties=species:S:1:pos:R:3` column layout. Unrecognized comment
//! entries are carried into the structure's info side channel.

use super::{InfoValue, Structure};
use crate::domain::{KappaError, KappaResult};
use nalgebra::{Matrix3, Vector3};
use std::fs;
use std::path::Path;

pub fn read_structures(path: &Path) -> KappaResult<Vec<Structure>> {
    let content = fs::read_to_string(path).map_err(|error| {
        KappaError::io_system("IO.READ", format!("{}: {error}", path.display()))
    })?;
    parse_extxyz(&content)
}

pub fn write_structures(path: &Path, structures: &[Structure]) -> KappaResult<()> {
    let mut content = String::new();
    for structure in structures {
        render_frame(&mut content, structure)?;
    }
    fs::write(path, content).map_err(|error| {
        KappaError::io_system("IO.WRITE", format!("{}: {error}", path.display()))
    })
}

pub fn parse_extxyz(content: &str) -> KappaResult<Vec<Structure>> {
    let mut lines = content.lines().peekable();
    let mut structures = Vec::new();

    while let Some(count_line) = lines.next() {
        let trimmed = count_line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let atom_count: usize = trimmed.parse().map_err(|_| {
            KappaError::input_validation(
                "IO.XYZ",
                format!("expected an atom count, found '{trimmed}'"),
            )
        })?;
        let comment = lines.next().ok_or_else(|| {
            KappaError::input_validation("IO.XYZ", "missing comment line after atom count")
        })?;
        let entries = parse_comment_entries(comment);

        let lattice_text = entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("lattice"))
            .map(|(_, value)| value.clone())
            .ok_or_else(|| {
                KappaError::input_validation("IO.XYZ", "frame comment is missing Lattice=\"...\"")
            })?;
        let cell = parse_lattice(&lattice_text)?;

        let mut species = Vec::with_capacity(atom_count);
        let mut positions = Vec::with_capacity(atom_count);
        for _ in 0..atom_count {
            let atom_line = lines.next().ok_or_else(|| {
                KappaError::input_validation("IO.XYZ", "frame truncated before all atoms were read")
            })?;
            let fields: Vec<&str> = atom_line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(KappaError::input_validation(
                    "IO.XYZ",
                    format!("atom line '{atom_line}' needs species and xyz"),
                ));
            }
            species.push(fields[0].to_string());
            positions.push(Vector3::new(
                parse_float(fields[1])?,
                parse_float(fields[2])?,
                parse_float(fields[3])?,
            ));
        }

        let mut structure = Structure::new(species, cell, positions)?;
        for (key, value) in entries {
            if key.eq_ignore_ascii_case("lattice") || key.eq_ignore_ascii_case("properties") {
                continue;
            }
            if key.eq_ignore_ascii_case("pbc") {
                structure.pbc = !value.to_ascii_lowercase().contains('f');
                continue;
            }
            structure.info.insert(key, parse_info_value(&value));
        }
        structures.push(structure);
    }

    Ok(structures)
}

fn render_frame(out: &mut String, structure: &Structure) -> KappaResult<()> {
    structure.require_valid_cell()?;
    let cell = structure.cell;
    out.push_str(&format!("{}\n", structure.len()));
    out.push_str("Lattice=\"");
    for row in 0..3 {
        for column in 0..3 {
            if row + column > 0 {
                out.push(' ');
            }
            out.push_str(&fmt_float(cell[(row, column)]));
        }
    }
    out.push_str("\" Properties=species:S:1:pos:R:3");
    for (key, value) in &structure.info {
        match value {
            InfoValue::Scalar(scalar) => {
                out.push_str(&format!(" {key}={}", fmt_float(*scalar)));
            }
            InfoValue::Vector(values) => {
                let joined: Vec<String> = values.iter().map(|v| fmt_float(*v)).collect();
                out.push_str(&format!(" {key}=\"{}\"", joined.join(" ")));
            }
            InfoValue::Text(text) => {
                out.push_str(&format!(" {key}=\"{text}\""));
            }
        }
    }
    out.push_str(&format!(
        " pbc=\"{}\"\n",
        if structure.pbc { "T T T" } else { "F F F" }
    ));

    for (symbol, position) in structure.species.iter().zip(&structure.positions) {
        out.push_str(&format!(
            "{symbol} {:.10} {:.10} {:.10}\n",
            position[0], position[1], position[2]
        ));
    }
    Ok(())
}

/// Python-style float rendering: always keeps a decimal point so a reread
/// cannot reinterpret the value as an integer column.
pub fn fmt_float(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

fn parse_float(token: &str) -> KappaResult<f64> {
    token.parse().map_err(|_| {
        KappaError::input_validation("IO.XYZ", format!("invalid float '{token}'"))
    })
}

fn parse_lattice(text: &str) -> KappaResult<Matrix3<f64>> {
    let values: Vec<f64> = text
        .split_whitespace()
        .map(parse_float)
        .collect::<KappaResult<_>>()?;
    if values.len() != 9 {
        return Err(KappaError::input_validation(
            "IO.XYZ",
            format!("Lattice needs 9 components, found {}", values.len()),
        ));
    }
    Ok(Matrix3::from_row_slice(&values))
}

fn parse_info_value(text: &str) -> InfoValue {
    if let Ok(scalar) = text.parse::<f64>() {
        return InfoValue::Scalar(scalar);
    }
    let parts: Vec<&str> = text.split_whitespace().collect();
    if parts.len() > 1 {
        if let Ok(values) = parts
            .iter()
            .map(|part| part.parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
        {
            return InfoValue::Vector(values);
        }
    }
    InfoValue::Text(text.to_string())
}

/// Split a comment line into key=value entries; values may be double-quoted
/// and contain spaces.
fn parse_comment_entries(comment: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut rest = comment.trim();
    while !rest.is_empty() {
        let Some(equals) = rest.find('=') else { break };
        let key = rest[..equals].trim().to_string();
        rest = &rest[equals + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"').unwrap_or(stripped.len());
            value = stripped[..end].to_string();
            rest = stripped[end..].strip_prefix('"').unwrap_or("").trim_start();
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            value = rest[..end].to_string();
            rest = rest[end..].trim_start();
        }
        if !key.is_empty() {
            entries.push((key, value));
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TWO_FRAMES: &str = r#"2
Lattice="5.0 0.0 0.0 0.0 5.0 0.0 0.0 0.0 5.0" Properties=species:S:1:pos:R:3 q_density=19.0
Si 0.0 0.0 0.0
Si 2.5 2.5 2.5
1
Lattice="4.0 0.0 0.0 0.0 4.0 0.0 0.0 0.0 4.0" Properties=species:S:1:pos:R:3 mesh="8 8 8"
Cu 0.0 0.0 0.0
"#;

    #[test]
    fn parses_multi_frame_files_with_info_entries() {
        let structures = parse_extxyz(TWO_FRAMES).unwrap();
        assert_eq!(structures.len(), 2);
        assert_eq!(structures[0].len(), 2);
        assert_eq!(structures[0].species[1], "Si");
        assert!((structures[0].info_scalar("q_density").unwrap() - 19.0).abs() < 1e-12);
        assert_eq!(structures[1].info_vector3("mesh").unwrap(), [8.0, 8.0, 8.0]);
    }

    #[test]
    fn rejects_truncated_frames() {
        assert!(parse_extxyz("3\nLattice=\"1 0 0 0 1 0 0 0 1\"\nSi 0 0 0\n").is_err());
        assert!(parse_extxyz("notanumber\n").is_err());
    }

    #[test]
    fn write_then_read_round_trips() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("structures.extxyz");
        let structures = parse_extxyz(TWO_FRAMES).unwrap();
        write_structures(&path, &structures).unwrap();
        let reread = read_structures(&path).unwrap();
        assert_eq!(reread.len(), structures.len());
        for (a, b) in structures.iter().zip(&reread) {
            assert_eq!(a.species, b.species);
            assert!((a.cell - b.cell).norm() < 1e-9);
            for (pa, pb) in a.positions.iter().zip(&b.positions) {
                assert!((pa - pb).norm() < 1e-9);
            }
        }
    }

    #[test]
    fn float_rendering_keeps_decimal_point() {
        assert_eq!(fmt_float(3.0), "3.0");
        assert_eq!(fmt_float(0.25), "0.25");
        assert_eq!(fmt_float(-2.0), "-2.0");
    }
}
