//! Element symbol and atomic-mass tables keyed by atomic number.

pub const MAX_ATOMIC_NUMBER: usize = 96;

const ELEMENT_SYMBOLS: [&str; MAX_ATOMIC_NUMBER] = [
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S", "Cl",
    "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As",
    "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In",
    "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm", "Sm", "Eu", "Gd", "Tb",
    "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl",
    "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac", "Th", "Pa", "U", "Np", "Pu", "Am", "Cm",
];

const ATOMIC_MASSES: [f64; MAX_ATOMIC_NUMBER] = [
    1.008, 4.003, 6.941, 9.012, 10.811, 12.011, 14.007, 15.999, 18.998, 20.180, 22.990, 24.305,
    26.982, 28.086, 30.974, 32.065, 35.453, 39.948, 39.098, 40.078, 44.956, 47.867, 50.942,
    51.996, 54.938, 55.845, 58.933, 58.693, 63.546, 65.380, 69.723, 72.640, 74.922, 78.960,
    79.904, 83.798, 85.468, 87.620, 88.906, 91.224, 92.906, 95.960, 98.000, 101.070, 102.906,
    106.420, 107.868, 112.411, 114.818, 118.710, 121.760, 127.600, 126.904, 131.293, 132.905,
    137.327, 138.905, 140.116, 140.908, 144.242, 145.000, 150.360, 151.964, 157.250, 158.925,
    162.500, 164.930, 167.259, 168.934, 173.054, 174.967, 178.490, 180.948, 183.840, 186.207,
    190.230, 192.217, 195.084, 196.967, 200.590, 204.383, 207.200, 208.980, 209.000, 210.000,
    222.000, 223.000, 226.000, 227.000, 232.038, 231.036, 238.029, 237.000, 244.000, 243.000,
    247.000,
];

pub fn element_symbol(atomic_number: usize) -> Option<&'static str> {
    let index = index_for_atomic_number(atomic_number)?;
    Some(ELEMENT_SYMBOLS[index])
}

pub fn atomic_number_for_symbol(symbol: &str) -> Option<usize> {
    let normalized = symbol.trim();
    if normalized.is_empty() {
        return None;
    }

    ELEMENT_SYMBOLS
        .iter()
        .position(|candidate| candidate.eq_ignore_ascii_case(normalized))
        .map(|index| index + 1)
}

pub fn atomic_mass(atomic_number: usize) -> Option<f64> {
    let index = index_for_atomic_number(atomic_number)?;
    Some(ATOMIC_MASSES[index])
}

pub fn atomic_mass_for_symbol(symbol: &str) -> Option<f64> {
    atomic_number_for_symbol(symbol).and_then(atomic_mass)
}

const fn index_for_atomic_number(atomic_number: usize) -> Option<usize> {
    if atomic_number == 0 || atomic_number > MAX_ATOMIC_NUMBER {
        None
    } else {
        Some(atomic_number - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::{atomic_mass, atomic_mass_for_symbol, atomic_number_for_symbol, element_symbol};

    #[test]
    fn lookup_rejects_out_of_range_atomic_numbers() {
        assert!(element_symbol(0).is_none());
        assert!(element_symbol(200).is_none());
        assert!(atomic_mass(0).is_none());
    }

    #[test]
    fn known_symbol_roundtrip_matches_atomic_number() {
        assert_eq!(atomic_number_for_symbol("Si"), Some(14));
        assert_eq!(atomic_number_for_symbol("si"), Some(14));
        assert_eq!(atomic_number_for_symbol(" Cu "), Some(29));
        assert_eq!(element_symbol(14), Some("Si"));
        assert_eq!(atomic_number_for_symbol(""), None);
        assert_eq!(atomic_number_for_symbol("Xx"), None);
    }

    #[test]
    fn masses_are_positive_and_symbol_keyed() {
        assert!((atomic_mass_for_symbol("Si").unwrap() - 28.086).abs() < 1e-9);
        for z in 1..=super::MAX_ATOMIC_NUMBER {
            assert!(atomic_mass(z).unwrap() > 0.0);
        }
    }
}
