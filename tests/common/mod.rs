#![allow(dead_code)]

use nalgebra::DVector;
use openneb::geometry::Configuration;
use openneb::potential::{Evaluation, Potential, PotentialError};

/// Two minima at (±1, 0) joined over a curved saddle at (0, 0.3) with E = 1.
///
/// `E = (x² - 1)² + 2 (y - 0.3 (1 - x²))²`
pub struct CurvedDoubleWell;

impl Potential for CurvedDoubleWell {
    fn name(&self) -> &str {
        "curved-double-well"
    }

    fn evaluate(&self, config: &Configuration) -> Result<Evaluation, PotentialError> {
        let p = config.atom_position(0);
        let (x, y) = (p.x, p.y);
        let g = y - 0.3 * (1.0 - x * x);
        let energy = (x * x - 1.0).powi(2) + 2.0 * g * g;
        let de_dx = 4.0 * x * (x * x - 1.0) + 2.4 * x * g;
        let de_dy = 4.0 * g;
        Ok(Evaluation {
            energy,
            forces: DVector::from_vec(vec![-de_dx, -de_dy, 0.0]),
        })
    }
}

pub fn particle(x: f64, y: f64) -> Configuration {
    Configuration::new(vec!["X".to_string()], vec![x, y, 0.0])
}
