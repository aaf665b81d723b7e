//! Per-structure configuration values that are either fixed in the config or
//! read back from a structure's info side channel by name.

use crate::domain::{KappaError, KappaResult};
use crate::structure::Structure;

#[derive(Debug, Clone, PartialEq)]
pub enum SpecValue {
    Fixed(f64),
    PerAxis([f64; 3]),
    FromField(String),
}

impl SpecValue {
    /// Resolve to one value per axis for the given structure.
    pub fn resolve_axes(&self, structure: &Structure) -> KappaResult<[f64; 3]> {
        match self {
            Self::Fixed(value) => Ok([*value; 3]),
            Self::PerAxis(values) => Ok(*values),
            Self::FromField(name) => structure.info_vector3(name),
        }
    }

    /// Resolve to a single scalar; per-axis values are rejected.
    pub fn resolve_scalar(&self, structure: &Structure) -> KappaResult<f64> {
        match self {
            Self::Fixed(value) => Ok(*value),
            Self::PerAxis(_) => Err(KappaError::input_validation(
                "RESOLVE.SCALAR",
                "expected a scalar value, found a per-axis list",
            )),
            Self::FromField(name) => structure.info_scalar(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SpecValue;
    use crate::structure::{InfoValue, Structure};
    use nalgebra::{Matrix3, Vector3};

    fn structure_with_info() -> Structure {
        let mut structure = Structure::new(
            vec!["Si".to_string()],
            Matrix3::identity() * 5.0,
            vec![Vector3::zeros()],
        )
        .unwrap();
        structure
            .info
            .insert("cutoff".to_string(), InfoValue::Scalar(8.0));
        structure.info.insert(
            "mesh".to_string(),
            InfoValue::Vector(vec![4.0, 5.0, 6.0]),
        );
        structure
    }

    #[test]
    fn fixed_and_per_axis_resolve_without_the_structure_info() {
        let structure = structure_with_info();
        assert_eq!(
            SpecValue::Fixed(25.0).resolve_axes(&structure).unwrap(),
            [25.0; 3]
        );
        assert_eq!(
            SpecValue::PerAxis([1.0, 2.0, 3.0])
                .resolve_axes(&structure)
                .unwrap(),
            [1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn from_field_reads_the_side_channel() {
        let structure = structure_with_info();
        let value = SpecValue::FromField("cutoff".to_string());
        assert_eq!(value.resolve_scalar(&structure).unwrap(), 8.0);
        let mesh = SpecValue::FromField("mesh".to_string());
        assert_eq!(mesh.resolve_axes(&structure).unwrap(), [4.0, 5.0, 6.0]);
        assert!(
            SpecValue::FromField("absent".to_string())
                .resolve_scalar(&structure)
                .is_err()
        );
    }
}
