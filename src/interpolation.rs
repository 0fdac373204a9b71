//! Initial path guesses: linear interpolation and IDPP refinement.
//!
//! Linear interpolation places interior image `k` of `n` at
//! `start + k/(n+1) * d`, where `d` is the start-to-end displacement taken
//! under the minimum-image convention, so an atom that crosses a cell face
//! between the endpoints moves the short way round.
//!
//! The image-dependent pair potential (IDPP) then smooths the guess. For each
//! image at fraction `t` along the band every atom pair gets a target distance
//!
//! ```text
//! d_ij(t) = d_ij(start) + t * (d_ij(end) - d_ij(start))
//! ```
//!
//! and the image is relaxed, under the ordinary band force, on the surrogate
//! energy `Σ_{i<j} (d_ij - d_ij(t))² / d_ij⁴`. The result keeps interatomic
//! distances varying smoothly without ever calling the real potential.
//!
//! IDPP is skipped entirely for chains built with a relax subset.

use crate::geometry::Configuration;
use crate::neb::{Band, BandConfig};
use crate::optimizer::{run_optimizer, MdMin};
use crate::path::ImageChain;
use crate::potential::{Evaluation, Potential, PotentialError, Result};
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;

/// Spring constant used while relaxing on the IDPP surface.
const IDPP_SPRING_CONSTANT: f64 = 0.1;

/// Rewrites every interior image as a linear interpolant between the
/// endpoints. Fixed atoms are moved too.
pub fn interpolate_linear(chain: &mut ImageChain, mic: bool) {
    let start = chain.start_shared();
    let end = chain.end_shared();
    let displacement = if mic {
        start.mic_displacement(&end)
    } else {
        &end.coords - &start.coords
    };
    let n = chain.num_intermediate();
    for (k, image) in chain.interior_mut().iter_mut().enumerate() {
        let t = (k + 1) as f64 / (n + 1) as f64;
        image.set_positions_unconstrained(&(&start.coords + &displacement * t));
    }
}

/// Linear interpolant at fraction `t` between two configurations, carrying
/// `a`'s cell and constraints.
pub fn midpoint(a: &Configuration, b: &Configuration, t: f64) -> Configuration {
    let mut image = a.clone();
    let coords = &a.coords + a.mic_displacement(b) * t;
    image.set_positions_unconstrained(&coords);
    image
}

fn pair_distances(config: &Configuration) -> DMatrix<f64> {
    let n = config.num_atoms;
    let mut d = DMatrix::zeros(n, n);
    for i in 0..n {
        for j in (i + 1)..n {
            let r = config
                .minimum_image(config.atom_position(j) - config.atom_position(i))
                .norm();
            d[(i, j)] = r;
            d[(j, i)] = r;
        }
    }
    d
}

/// Surrogate potential pulling pair distances toward their interpolated
/// targets.
#[derive(Debug, Clone)]
pub struct IdppPotential {
    target: DMatrix<f64>,
}

impl IdppPotential {
    /// Targets for the image at `fraction` (0 = start, 1 = end).
    pub fn new(start: &Configuration, end: &Configuration, fraction: f64) -> Self {
        let d0 = pair_distances(start);
        let d1 = pair_distances(end);
        Self {
            target: &d0 + (&d1 - &d0) * fraction,
        }
    }
}

impl Potential for IdppPotential {
    fn name(&self) -> &str {
        "idpp"
    }

    fn evaluate(&self, config: &Configuration) -> Result<Evaluation> {
        let n = config.num_atoms;
        if self.target.nrows() != n {
            return Err(PotentialError::Calculation(format!(
                "IDPP targets built for {} atoms, got {}",
                self.target.nrows(),
                n
            )));
        }
        let mut energy = 0.0;
        let mut forces = DVector::zeros(3 * n);
        for i in 0..n {
            let ri = config.atom_position(i);
            for j in (i + 1)..n {
                let delta = config.minimum_image(config.atom_position(j) - ri);
                let d = delta.norm();
                if d < 1e-10 {
                    continue;
                }
                let dd = d - self.target[(i, j)];
                let d4 = d.powi(4);
                energy += dd * dd / d4;
                let de_dd = 2.0 * dd / d4 * (1.0 - 2.0 * dd / d);
                let f = delta * (de_dd / d);
                for k in 0..3 {
                    forces[3 * i + k] += f[k];
                    forces[3 * j + k] -= f[k];
                }
            }
        }
        Ok(Evaluation { energy, forces })
    }
}

/// Outcome of an IDPP refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdppOutcome {
    /// Whether the IDPP band force met the threshold
    pub converged: bool,
    /// Optimizer steps taken
    pub steps: usize,
    /// True when the chain is in relax-subset mode and nothing was done
    pub skipped: bool,
}

/// Refines the interior images on the IDPP surface.
///
/// A no-op for relax-subset chains. Fixed atoms are released for the
/// duration of the refinement and restored afterwards. Running out of steps
/// is reported through [`IdppOutcome::converged`] and a warning; the partly
/// refined geometry is kept.
pub fn interpolate_idpp(chain: &mut ImageChain, fmax: f64, steps: usize) -> Result<IdppOutcome> {
    if chain.relax_subset().is_some() {
        info!("relax subset active, skipping IDPP refinement");
        return Ok(IdppOutcome {
            converged: true,
            steps: 0,
            skipped: true,
        });
    }

    let start = chain.start_shared();
    let end = chain.end_shared();
    let last = chain.len() - 1;
    let potentials: Vec<Arc<dyn Potential>> = (0..chain.len())
        .map(|i| Arc::new(IdppPotential::new(&start, &end, i as f64 / last as f64)) as Arc<dyn Potential>)
        .collect();
    let saved: Vec<Vec<usize>> = chain
        .interior_mut()
        .iter_mut()
        .map(Configuration::clear_constraints)
        .collect();

    let config = BandConfig {
        spring_constant: IDPP_SPRING_CONSTANT,
        climb: false,
        climb_activation_fmax: 0.0,
    };
    let outcome = {
        let mut band = Band::new(chain, potentials, config)?;
        run_optimizer::<_, PotentialError, _>(&mut band, &mut MdMin::default(), fmax, steps, |_, _| Ok(()))
    };

    for (image, fixed) in chain.interior_mut().iter_mut().zip(&saved) {
        image
            .fix_atoms(fixed)
            .map_err(|e| PotentialError::Calculation(e.to_string()))?;
    }
    chain.clear_energies();

    let outcome = outcome?;
    if outcome.converged {
        info!("IDPP refinement converged in {} steps", outcome.steps);
    } else {
        warn!(
            "IDPP refinement stopped after {} steps with fmax {:.4} > {:.4}; using best-effort path",
            outcome.steps, outcome.fmax, fmax
        );
    }
    Ok(IdppOutcome {
        converged: outcome.converged,
        steps: outcome.steps,
        skipped: false,
    })
}

/// Sum of minimum-image distances between consecutive images.
pub fn path_length(chain: &ImageChain) -> f64 {
    (1..chain.len())
        .map(|i| chain.image(i - 1).mic_displacement(chain.image(i)).norm())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathBuilder;
    use nalgebra::{Matrix3, Vector3};

    fn atoms(coords: Vec<f64>) -> Configuration {
        Configuration::new(vec!["Pt".to_string(); coords.len() / 3], coords)
    }

    #[test]
    fn test_linear_mic_takes_short_way_across_boundary() {
        let cell = Matrix3::from_diagonal_element(10.0);
        let start = Arc::new(atoms(vec![9.0, 5.0, 5.0]).with_cell(cell, [true; 3]));
        let end = Arc::new(atoms(vec![1.0, 5.0, 5.0]).with_cell(cell, [true; 3]));
        let mut chain = PathBuilder::new().build(start, end, 3).unwrap();

        let xs: Vec<f64> = chain.interior().iter().map(|c| c.atom_position(0).x).collect();
        for (x, expected) in xs.iter().zip([9.5, 10.0, 10.5]) {
            assert!((x - expected).abs() < 1e-12);
        }
        let wrapped = path_length(&chain);

        interpolate_linear(&mut chain, false);
        let naive: f64 = (1..chain.len())
            .map(|i| (&chain.image(i).coords - &chain.image(i - 1).coords).norm())
            .sum();
        assert!((wrapped - 2.0).abs() < 1e-12);
        assert!((naive - 8.0).abs() < 1e-12);
    }

    #[test]
    fn test_idpp_forces_match_finite_differences() {
        let start = atoms(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.1, 0.0]);
        let end = atoms(vec![0.0, 0.0, 0.0, 1.5, 0.2, 0.0, 0.1, 1.6, 0.3]);
        let idpp = IdppPotential::new(&start, &end, 0.4);
        let trial = atoms(vec![0.05, -0.02, 0.0, 1.2, 0.1, 0.05, 0.0, 1.3, 0.1]);
        let eval = idpp.evaluate(&trial).unwrap();
        let h = 1e-6;
        for index in 0..9 {
            let mut plus = trial.clone();
            plus.coords[index] += h;
            let mut minus = trial.clone();
            minus.coords[index] -= h;
            let numeric = -(idpp.evaluate(&plus).unwrap().energy - idpp.evaluate(&minus).unwrap().energy) / (2.0 * h);
            assert!((eval.forces[index] - numeric).abs() < 1e-6);
        }
    }

    #[test]
    fn test_idpp_is_zero_at_endpoints() {
        let start = atoms(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        let end = atoms(vec![0.0, 0.0, 0.0, 2.0, 0.0, 0.0]);
        let eval = IdppPotential::new(&start, &end, 1.0).evaluate(&end).unwrap();
        assert!(eval.energy.abs() < 1e-15);
        assert!(eval.forces.norm() < 1e-15);
    }

    #[test]
    fn test_idpp_skipped_for_relax_subset() {
        let start = Arc::new(atoms(vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0, 2.0, 2.0]));
        let end = Arc::new(atoms(vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 3.0, 3.0, 3.0]));
        let mut chain = PathBuilder::new()
            .with_relax_subset(Some(vec![1]))
            .build(start, end, 1)
            .unwrap();
        let before = chain.image(1).clone();

        let outcome = interpolate_idpp(&mut chain, 0.1, 100).unwrap();
        assert!(outcome.skipped);
        assert_eq!(chain.image(1), &before);
        assert_eq!(chain.image(1).fixed(), &[0, 2]);
    }

    #[test]
    fn test_idpp_keeps_bond_lengths_smooth() {
        // diatomic rotating by 90 degrees: linear interpolation shrinks the
        // bond at the midpoint, IDPP restores it
        let start = Arc::new(atoms(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0]));
        let end = Arc::new(atoms(vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0]));
        let mut chain = PathBuilder::new().build(start, end, 1).unwrap();
        let bond = |c: &Configuration| (c.atom_position(1) - c.atom_position(0)).norm();
        let linear_bond = bond(chain.image(1));
        assert!((linear_bond - 0.5_f64.sqrt()).abs() < 1e-12);

        let outcome = interpolate_idpp(&mut chain, 0.01, 500).unwrap();
        assert!(!outcome.skipped);
        assert!(bond(chain.image(1)) > linear_bond + 0.05);
        assert!(chain.energies().iter().all(Option::is_none));
        assert_eq!(chain.image(0).atom_position(1), Vector3::new(1.0, 0.0, 0.0));
    }
}
