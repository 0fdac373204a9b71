//! Nudged Elastic Band relaxation.
//!
//! This module turns an [`ImageChain`] into an optimization problem. The
//! [`Band`] objective exposes the positions of all interior images as one flat
//! vector and returns the NEB band force for each of them; any optimizer from
//! [`crate::optimizer`] can then drive the band toward the minimum-energy path.
//!
//! # Band force
//!
//! For interior image `i` with true force `F_i` (potential forces, fixed atoms
//! zeroed) and unit tangent `τ_i`:
//!
//! ```text
//! F_i^band = F_i - (F_i · τ_i) τ_i  +  k (|R_{i+1} - R_i| - |R_i - R_{i-1}|) τ_i
//! ```
//!
//! The tangent follows the energy-weighted (improved tangent) scheme: it points
//! toward the higher-energy neighbour on monotonic stretches and blends both
//! neighbours at extrema. When the blend vanishes (flat energies) the bisector
//! of the two neighbour directions is used instead.
//!
//! # Climbing image
//!
//! With climbing enabled the highest-energy interior image instead feels
//!
//! ```text
//! F_climb = F - 2 (F · τ) τ
//! ```
//!
//! with no spring force, which drives it uphill along the path onto the
//! saddle point. Climbing switches on the first time the band fmax is at or
//! below the activation threshold and stays on.
//!
//! Endpoints never receive any force; they are energy references only and
//! are evaluated once when the band is set up.

use crate::checkpoint::RunDirectory;
use crate::geometry::max_atom_norm;
use crate::io::{self, ConvergenceLog, StructureError};
use crate::optimizer::{run_optimizer, Objective, OptimizerKind};
use crate::path::{ImageChain, PathError};
use crate::potential::{Potential, PotentialError};
use log::{info, warn};
use nalgebra::DVector;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised during band relaxation.
#[derive(Error, Debug)]
pub enum NebError {
    /// I/O error writing run artifacts
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The potential failed
    #[error("potential error: {0}")]
    Potential(#[from] PotentialError),
    /// Chain construction or editing failed
    #[error("path error: {0}")]
    Path(#[from] PathError),
    /// Structure file could not be read
    #[error("structure error: {0}")]
    Structure(#[from] StructureError),
}

/// Result type for band relaxation
pub type Result<T> = std::result::Result<T, NebError>;

/// One row of the convergence record, written after every band evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceRecord {
    /// Optimizer step (0 for the initial evaluation)
    pub step: usize,
    /// Largest per-atom band force over all interior images (eV/Å)
    pub max_band_force: f64,
    /// Highest image energy minus the start energy (eV)
    pub barrier_height: f64,
    /// Index of the highest-energy image
    pub max_energy_index: usize,
}

/// Force-field parameters of the band itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandConfig {
    /// Spring constant k (eV/Å²)
    pub spring_constant: f64,
    /// Whether the climbing image may be switched on
    pub climb: bool,
    /// Band fmax at which climbing switches on
    pub climb_activation_fmax: f64,
}

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            spring_constant: 0.1,
            climb: false,
            climb_activation_fmax: 0.5,
        }
    }
}

/// The band as an optimization objective.
///
/// Holds the chain mutably for its lifetime, so no second relaxation can
/// touch the same chain while this one runs.
pub struct Band<'a> {
    chain: &'a mut ImageChain,
    potentials: Vec<Arc<dyn Potential>>,
    config: BandConfig,
    climb_active: bool,
    climbing: Option<usize>,
    evaluations: usize,
}

impl<'a> Band<'a> {
    /// Creates a band with one potential per image, endpoints included.
    ///
    /// Endpoint energies that the chain does not know yet are evaluated here,
    /// once.
    ///
    /// # Arguments
    ///
    /// * `chain` - Chain to relax; only interior images are moved
    /// * `potentials` - One potential per image, `chain.len()` entries
    /// * `config` - Spring and climbing settings
    pub fn new(
        chain: &'a mut ImageChain,
        potentials: Vec<Arc<dyn Potential>>,
        config: BandConfig,
    ) -> std::result::Result<Self, PotentialError> {
        if potentials.len() != chain.len() {
            return Err(PotentialError::Calculation(format!(
                "{} potentials for {} images",
                potentials.len(),
                chain.len()
            )));
        }
        let last = chain.len() - 1;
        for index in [0, last] {
            if chain.energy(index).is_none() {
                let energy = potentials[index].evaluate(chain.image(index))?.energy;
                chain.set_energy(index, energy);
            }
        }
        Ok(Self {
            chain,
            potentials,
            config,
            climb_active: false,
            climbing: None,
            evaluations: 0,
        })
    }

    /// Creates a band where every image uses the same potential.
    pub fn shared(
        chain: &'a mut ImageChain,
        potential: Arc<dyn Potential>,
        config: BandConfig,
    ) -> std::result::Result<Self, PotentialError> {
        let potentials = vec![potential; chain.len()];
        Self::new(chain, potentials, config)
    }

    /// The chain being relaxed.
    pub fn chain(&self) -> &ImageChain {
        &*self.chain
    }

    /// Image currently treated as the climbing image.
    pub fn climbing_image(&self) -> Option<usize> {
        self.climbing
    }

    /// Number of band evaluations so far.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// Unit tangent at interior image `i`.
    fn tangent(&self, i: usize) -> DVector<f64> {
        let chain = &*self.chain;
        let t_plus = chain.image(i).mic_displacement(chain.image(i + 1));
        let t_minus = chain.image(i - 1).mic_displacement(chain.image(i));
        let e = chain.energy(i).unwrap_or(0.0);
        let e_plus = chain.energy(i + 1).unwrap_or(e);
        let e_minus = chain.energy(i - 1).unwrap_or(e);

        let mut tau = if e_plus > e && e > e_minus {
            t_plus.clone()
        } else if e_plus < e && e < e_minus {
            t_minus.clone()
        } else {
            let d_max = (e_plus - e).abs().max((e_minus - e).abs());
            let d_min = (e_plus - e).abs().min((e_minus - e).abs());
            if e_plus > e_minus {
                &t_plus * d_max + &t_minus * d_min
            } else {
                &t_plus * d_min + &t_minus * d_max
            }
        };

        let norm = tau.norm();
        if norm < 1e-12 {
            let (np, nm) = (t_plus.norm(), t_minus.norm());
            tau = DVector::zeros(t_plus.len());
            if np > 1e-12 {
                tau += &t_plus / np;
            }
            if nm > 1e-12 {
                tau += &t_minus / nm;
            }
        }
        let norm = tau.norm();
        if norm > 1e-12 {
            tau /= norm;
        }
        tau
    }

    /// Band force on interior image `i` given its true force.
    fn band_force(&self, i: usize, force: &DVector<f64>, climbing: bool) -> DVector<f64> {
        let tau = self.tangent(i);
        let parallel = force.dot(&tau);
        let mut band = if climbing {
            force - &tau * (2.0 * parallel)
        } else {
            let chain = &*self.chain;
            let next = chain.image(i).mic_displacement(chain.image(i + 1)).norm();
            let prev = chain.image(i - 1).mic_displacement(chain.image(i)).norm();
            let spring = self.config.spring_constant * (next - prev);
            force - &tau * parallel + &tau * spring
        };
        self.chain.image(i).zero_fixed(&mut band);
        band
    }

    fn highest_interior(&self) -> Option<usize> {
        (1..self.chain.len() - 1)
            .filter_map(|i| self.chain.energy(i).map(|e| (i, e)))
            .fold(None, |best: Option<(usize, f64)>, (i, e)| match best {
                Some((_, b)) if b >= e => best,
                _ => Some((i, e)),
            })
            .map(|(i, _)| i)
    }

    fn assemble(&self, true_forces: &[DVector<f64>], climbing: Option<usize>) -> DVector<f64> {
        let per_image = true_forces.first().map_or(0, |f| f.len());
        let mut flat = DVector::zeros(per_image * true_forces.len());
        for (k, force) in true_forces.iter().enumerate() {
            let i = k + 1;
            let band = self.band_force(i, force, climbing == Some(i));
            flat.rows_mut(k * per_image, per_image).copy_from(&band);
        }
        flat
    }
}

impl Objective for Band<'_> {
    fn positions(&self) -> DVector<f64> {
        let interior = self.chain.interior();
        let per_image = interior.first().map_or(0, |c| c.coords.len());
        DVector::from_iterator(
            per_image * interior.len(),
            interior.iter().flat_map(|c| c.coords.iter().copied()),
        )
    }

    fn set_positions(&mut self, positions: &DVector<f64>) {
        for (k, image) in self.chain.interior_mut().iter_mut().enumerate() {
            let per_image = image.coords.len();
            image.set_positions(&positions.rows(k * per_image, per_image).into_owned());
        }
    }

    fn evaluate(&mut self) -> std::result::Result<(f64, DVector<f64>), PotentialError> {
        let mut true_forces = Vec::with_capacity(self.chain.num_intermediate());
        for i in 1..self.chain.len() - 1 {
            let image = self.chain.image(i);
            let mut eval = self.potentials[i].evaluate(image)?;
            image.zero_fixed(&mut eval.forces);
            self.chain.set_energy(i, eval.energy);
            true_forces.push(eval.forces);
        }
        self.evaluations += 1;

        if self.climb_active {
            self.climbing = self.highest_interior();
        }
        let mut forces = self.assemble(&true_forces, self.climbing);

        if self.config.climb && !self.climb_active && max_atom_norm(&forces) <= self.config.climb_activation_fmax {
            self.climb_active = true;
            self.climbing = self.highest_interior();
            if let Some(i) = self.climbing {
                info!("climbing image switched on at image {}", i);
            }
            forces = self.assemble(&true_forces, self.climbing);
        }

        let energy = self
            .chain
            .energies()
            .iter()
            .flatten()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        Ok((energy, forces))
    }
}

/// Everything needed for one band relaxation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelaxSettings {
    /// Spring constant (eV/Å²)
    pub spring_constant: f64,
    /// Enable the climbing image
    pub climb: bool,
    /// Band fmax at which climbing switches on
    pub climb_activation_fmax: f64,
    /// Optimizer driving the band
    pub optimizer: OptimizerKind,
    /// Convergence threshold on the band fmax (eV/Å)
    pub fmax: f64,
    /// Step budget
    pub max_steps: usize,
}

impl Default for RelaxSettings {
    fn default() -> Self {
        Self {
            spring_constant: 0.1,
            climb: false,
            climb_activation_fmax: 0.5,
            optimizer: OptimizerKind::Bfgs,
            fmax: 0.05,
            max_steps: 1000,
        }
    }
}

impl RelaxSettings {
    fn band_config(&self) -> BandConfig {
        BandConfig {
            spring_constant: self.spring_constant,
            climb: self.climb,
            climb_activation_fmax: self.climb_activation_fmax.max(self.fmax),
        }
    }
}

/// Result of a band relaxation.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaxOutcome {
    /// Band fmax reached the threshold
    pub converged: bool,
    /// Optimizer steps taken
    pub steps: usize,
    /// One record per evaluation, in step order
    pub records: Vec<ConvergenceRecord>,
    /// Climbing image at the end of the run
    pub climbing_image: Option<usize>,
}

/// Relaxes `chain`, calling `on_step` after every band evaluation.
///
/// The callback receives the chain as it stands after the evaluation together
/// with the matching convergence record; it is where callers append frames to
/// the full trajectory and rows to the convergence log. An error from the
/// callback stops the run.
///
/// Running out of steps is not an error: the outcome reports
/// `converged: false` and a warning is logged.
pub fn relax_with<F>(
    chain: &mut ImageChain,
    potential: Arc<dyn Potential>,
    settings: &RelaxSettings,
    mut on_step: F,
) -> Result<RelaxOutcome>
where
    F: FnMut(&ImageChain, &ConvergenceRecord) -> Result<()>,
{
    let mut optimizer = settings.optimizer.build();
    let mut records = Vec::new();
    let (outcome, climbing_image) = {
        let mut band = Band::shared(chain, potential, settings.band_config())?;
        let outcome = run_optimizer(
            &mut band,
            optimizer.as_mut(),
            settings.fmax,
            settings.max_steps,
            |band, step| {
                let chain = band.chain();
                let record = ConvergenceRecord {
                    step: step.step,
                    max_band_force: step.fmax,
                    barrier_height: chain.barrier_height().unwrap_or(0.0),
                    max_energy_index: chain.max_energy_index().unwrap_or(0),
                };
                on_step(chain, &record)?;
                records.push(record);
                Ok::<(), NebError>(())
            },
        )?;
        (outcome, band.climbing_image())
    };

    if outcome.converged {
        info!(
            "band converged in {} steps (fmax {:.4} <= {:.4})",
            outcome.steps, outcome.fmax, settings.fmax
        );
    } else {
        warn!(
            "band not converged after {} steps (fmax {:.4} > {:.4})",
            outcome.steps, outcome.fmax, settings.fmax
        );
    }
    Ok(RelaxOutcome {
        converged: outcome.converged,
        steps: outcome.steps,
        records,
        climbing_image,
    })
}

/// Relaxes `chain` without per-step output.
pub fn relax(chain: &mut ImageChain, potential: Arc<dyn Potential>, settings: &RelaxSettings) -> Result<RelaxOutcome> {
    relax_with(chain, potential, settings, |_, _| Ok(()))
}

fn frames(chain: &ImageChain) -> Vec<(&crate::geometry::Configuration, Option<f64>)> {
    chain.images().enumerate().map(|(i, c)| (c, chain.energy(i))).collect()
}

/// Relaxes `chain` and writes every run artifact into `dir`.
///
/// Per evaluation, all images are appended to the full trajectory and one row
/// goes to the running log and the convergence table. At the end the compact
/// trajectory, the per-image folder and the energy profile are written.
pub fn run_in_directory(
    dir: &RunDirectory,
    chain: &mut ImageChain,
    potential: Arc<dyn Potential>,
    settings: &RelaxSettings,
) -> Result<RelaxOutcome> {
    let log = ConvergenceLog::open(&dir.log_path(), &dir.convergence_path(), false)?;
    let full = dir.full_trajectory_path();
    info!(
        "relaxing {} images with {} (k = {}, climb = {}, fmax = {}, max steps = {})",
        chain.len(),
        settings.optimizer,
        settings.spring_constant,
        settings.climb,
        settings.fmax,
        settings.max_steps
    );

    let outcome = relax_with(chain, potential, settings, |chain, record| {
        io::append_frames(&full, &frames(chain))?;
        log.append(record)?;
        Ok(())
    })?;

    let final_path = dir.final_trajectory_path();
    if final_path.exists() {
        std::fs::remove_file(&final_path)?;
    }
    io::append_frames(&final_path, &frames(chain))?;
    io::write_image_folder(&dir.images_dir(), chain)?;
    if let Some((forward, reverse)) = io::write_energy_profile(&dir.energy_profile_path(), chain)? {
        info!("forward barrier {:.4} eV, reverse barrier {:.4} eV", forward, reverse);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Configuration;
    use crate::optimizer::OptimizerKind;
    use crate::path::PathBuilder;
    use crate::potential::Evaluation;
    use std::cell::Cell;

    fn single(x: f64) -> Configuration {
        Configuration::new(vec!["X".to_string()], vec![x, 0.0, 0.0])
    }

    /// Flat energy, sideways force shrinking by `ratio` on every call.
    struct Decaying {
        force: Cell<f64>,
        ratio: f64,
    }

    impl Potential for Decaying {
        fn name(&self) -> &str {
            "decaying"
        }

        fn evaluate(&self, config: &Configuration) -> std::result::Result<Evaluation, PotentialError> {
            let f = self.force.get();
            self.force.set(f * self.ratio);
            let mut forces = DVector::zeros(config.coords.len());
            forces[1] = f;
            Ok(Evaluation { energy: 0.0, forces })
        }
    }

    /// Gaussian bump along x centred at `center`.
    struct Bump {
        center: f64,
    }

    impl Potential for Bump {
        fn name(&self) -> &str {
            "bump"
        }

        fn evaluate(&self, config: &Configuration) -> std::result::Result<Evaluation, PotentialError> {
            let mut forces = DVector::zeros(config.coords.len());
            let mut energy = 0.0;
            for atom in 0..config.num_atoms {
                let x = config.atom_position(atom).x - self.center;
                let e = (-x * x / 0.3).exp();
                energy += e;
                forces[3 * atom] = e * 2.0 * x / 0.3;
            }
            Ok(Evaluation { energy, forces })
        }
    }

    #[test]
    fn test_decaying_forces_converge_with_one_record_per_step() {
        let start = Arc::new(single(0.0));
        let end = Arc::new(single(2.0));
        let mut chain = PathBuilder::new().build(start, end, 1).unwrap();
        let potential = Arc::new(Decaying {
            force: Cell::new(1.0),
            ratio: 0.5,
        });
        let settings = RelaxSettings {
            optimizer: OptimizerKind::Fire,
            fmax: 0.05,
            max_steps: 50,
            ..RelaxSettings::default()
        };

        let outcome = relax(&mut chain, potential, &settings).unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.records.len(), outcome.steps + 1);
        for (expected, record) in outcome.records.iter().enumerate() {
            assert_eq!(record.step, expected);
        }
        let (last, earlier) = outcome.records.split_last().unwrap();
        assert!(last.max_band_force <= 0.05);
        assert!(earlier.iter().all(|r| r.max_band_force > 0.05));
    }

    #[test]
    fn test_non_convergence_is_reported_not_fatal() {
        let mut chain = PathBuilder::new()
            .build(Arc::new(single(0.0)), Arc::new(single(2.0)), 1)
            .unwrap();
        let potential = Arc::new(Decaying {
            force: Cell::new(1.0),
            ratio: 1.0,
        });
        let settings = RelaxSettings {
            max_steps: 3,
            ..RelaxSettings::default()
        };
        let outcome = relax(&mut chain, potential, &settings).unwrap();
        assert!(!outcome.converged);
        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.records.len(), 4);
    }

    #[test]
    fn test_climbing_image_finds_the_barrier_top() {
        let mut chain = PathBuilder::new()
            .build(Arc::new(single(0.0)), Arc::new(single(2.0)), 3)
            .unwrap();
        let settings = RelaxSettings {
            climb: true,
            optimizer: OptimizerKind::Fire,
            fmax: 1e-3,
            max_steps: 2000,
            ..RelaxSettings::default()
        };
        let outcome = relax(&mut chain, Arc::new(Bump { center: 0.8 }), &settings).unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.climbing_image, Some(2));
        assert!((chain.image(2).atom_position(0).x - 0.8).abs() < 1e-2);
        let barrier = chain.barrier_height().unwrap();
        let start_energy = (-0.64_f64 / 0.3).exp();
        assert!((barrier - (1.0 - start_energy)).abs() < 1e-3);
    }

    #[test]
    fn test_fixed_atoms_and_endpoints_never_move() {
        let pair = |x: f64| {
            Configuration::new(
                vec!["X".to_string(), "Y".to_string()],
                vec![x, 0.0, 0.0, 5.0 + x, 0.0, 0.0],
            )
        };
        let start = Arc::new(pair(0.0));
        let end = Arc::new(pair(2.0));
        let mut chain = PathBuilder::new()
            .with_relax_subset(Some(vec![0]))
            .build(Arc::clone(&start), Arc::clone(&end), 1)
            .unwrap();
        let fixed_before = chain.image(1).atom_position(1);

        let settings = RelaxSettings {
            max_steps: 20,
            ..RelaxSettings::default()
        };
        relax(&mut chain, Arc::new(Bump { center: 0.8 }), &settings).unwrap();
        assert_eq!(chain.image(1).atom_position(1), fixed_before);
        assert_eq!(chain.start(), start.as_ref());
        assert_eq!(chain.end(), end.as_ref());
    }

    #[test]
    fn test_tangent_falls_back_to_bisector_on_flat_energies() {
        let mut chain = PathBuilder::new()
            .build(Arc::new(single(0.0)), Arc::new(single(2.0)), 1)
            .unwrap();
        let flat = Arc::new(Decaying {
            force: Cell::new(0.0),
            ratio: 1.0,
        });
        let mut band = Band::shared(&mut chain, flat, BandConfig::default()).unwrap();
        band.evaluate().unwrap();
        let tau = band.tangent(1);
        assert!((tau[0] - 1.0).abs() < 1e-12);
        assert_eq!(band.evaluations(), 1);
    }
}
