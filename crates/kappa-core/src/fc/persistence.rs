//! Force-constant files: a phonopy-compatible text format for fc2 and a
//! compact binary container for fc3.

use super::{ForceConstants2, ForceConstants3};
use crate::domain::{KappaError, KappaResult};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

/// Write fc2 in the plain text layout phonopy uses: an `N N` header, then
/// for every (i, j) pair a 1-indexed pair line followed by the 3x3 block.
pub fn write_fc2(path: &Path, fc2: &ForceConstants2) -> KappaResult<()> {
    let n = fc2.n;
    let mut content = String::new();
    content.push_str(&format!("{n} {n}\n"));
    for i in 0..n {
        for j in 0..n {
            content.push_str(&format!("{} {}\n", i + 1, j + 1));
            for a in 0..3 {
                content.push_str(&format!(
                    "{:22.15} {:22.15} {:22.15}\n",
                    fc2.at(i, j, a, 0),
                    fc2.at(i, j, a, 1),
                    fc2.at(i, j, a, 2)
                ));
            }
        }
    }
    fs::write(path, content).map_err(|error| {
        KappaError::io_system("FC2.WRITE", format!("{}: {error}", path.display()))
    })
}

pub fn read_fc2(path: &Path) -> KappaResult<ForceConstants2> {
    let content = fs::read_to_string(path).map_err(|error| {
        KappaError::io_system("FC2.READ", format!("{}: {error}", path.display()))
    })?;
    parse_fc2(&content)
}

pub fn parse_fc2(content: &str) -> KappaResult<ForceConstants2> {
    let mut tokens = content.split_whitespace();
    let mut next_number = |what: &str| -> KappaResult<f64> {
        let token = tokens.next().ok_or_else(|| {
            KappaError::input_validation("FC2.PARSE", format!("file truncated before {what}"))
        })?;
        token.parse().map_err(|_| {
            KappaError::input_validation("FC2.PARSE", format!("invalid number '{token}' for {what}"))
        })
    };

    let rows = next_number("row count")? as usize;
    let columns = next_number("column count")? as usize;
    if rows != columns || rows == 0 {
        return Err(KappaError::input_validation(
            "FC2.PARSE",
            format!("expected a square non-empty header, found {rows} {columns}"),
        ));
    }

    let n = rows;
    let mut fc2 = ForceConstants2::zeros(n);
    for _ in 0..n * n {
        let i = next_number("pair row index")? as usize;
        let j = next_number("pair column index")? as usize;
        if i == 0 || j == 0 || i > n || j > n {
            return Err(KappaError::input_validation(
                "FC2.PARSE",
                format!("pair index {i} {j} out of range for n={n}"),
            ));
        }
        for a in 0..3 {
            for b in 0..3 {
                *fc2.at_mut(i - 1, j - 1, a, b) = next_number("matrix element")?;
            }
        }
    }
    Ok(fc2)
}

const FC3_MAGIC: &[u8; 4] = b"KFC3";

/// Binary fc3 container: magic, two little-endian u32 dimensions, then the
/// dense payload as little-endian f64 in storage order.
pub fn write_fc3(path: &Path, fc3: &ForceConstants3) -> KappaResult<()> {
    let mut file = fs::File::create(path).map_err(|error| {
        KappaError::io_system("FC3.WRITE", format!("{}: {error}", path.display()))
    })?;
    let io_error =
        |error: std::io::Error| KappaError::io_system("FC3.WRITE", format!("{}: {error}", path.display()));
    file.write_all(FC3_MAGIC).map_err(io_error)?;
    file.write_all(&(fc3.nprim as u32).to_le_bytes()).map_err(io_error)?;
    file.write_all(&(fc3.nsat as u32).to_le_bytes()).map_err(io_error)?;
    let mut payload = Vec::with_capacity(fc3.data.len() * 8);
    for value in &fc3.data {
        payload.extend_from_slice(&value.to_le_bytes());
    }
    file.write_all(&payload).map_err(io_error)
}

pub fn read_fc3(path: &Path) -> KappaResult<ForceConstants3> {
    let mut file = fs::File::open(path).map_err(|error| {
        KappaError::io_system("FC3.READ", format!("{}: {error}", path.display()))
    })?;
    let io_error =
        |error: std::io::Error| KappaError::io_system("FC3.READ", format!("{}: {error}", path.display()));

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).map_err(io_error)?;
    if &magic != FC3_MAGIC {
        return Err(KappaError::input_validation(
            "FC3.READ",
            format!("{}: not a force-constant container", path.display()),
        ));
    }
    let mut word = [0u8; 4];
    file.read_exact(&mut word).map_err(io_error)?;
    let nprim = u32::from_le_bytes(word) as usize;
    file.read_exact(&mut word).map_err(io_error)?;
    let nsat = u32::from_le_bytes(word) as usize;
    if nprim == 0 || nsat == 0 || nsat % nprim != 0 {
        return Err(KappaError::input_validation(
            "FC3.READ",
            format!("{}: inconsistent dimensions {nprim} {nsat}", path.display()),
        ));
    }

    let count = nprim * nsat * nsat * 27;
    let mut payload = vec![0u8; count * 8];
    file.read_exact(&mut payload).map_err(io_error)?;
    let data = payload
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect();
    Ok(ForceConstants3 { nprim, nsat, data })
}
