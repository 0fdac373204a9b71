//! Endpoint relaxation and the degenerate-path check.
//!
//! Both endpoints of a band are relaxed on their own before the band is
//! built, using the potential directly with no spring forces. A global
//! fixed-atom set on the configuration is respected.
//!
//! Afterwards [`check_similarity`] compares the two relaxed endpoints. When
//! either their energy difference or their largest minimum-image atomic
//! displacement is below its threshold, one endpoint has probably fallen into
//! the other's basin and the path would be degenerate. This is advisory: a
//! warning is logged and the caller decides.

use crate::geometry::Configuration;
use crate::io;
use crate::optimizer::{run_optimizer, Objective, OptimizerKind, StepInfo};
use crate::potential::{Potential, PotentialError};
use log::{info, warn};
use nalgebra::DVector;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Result of relaxing a single configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndpointReport {
    /// Whether fmax reached the threshold
    pub converged: bool,
    /// Energy before the first step (eV)
    pub energy_before: f64,
    /// Energy at the end (eV)
    pub energy_after: f64,
    /// Optimizer steps taken
    pub steps: usize,
    /// Final fmax (eV/Å)
    pub fmax: f64,
}

struct SingleImage<'a> {
    config: &'a mut Configuration,
    potential: &'a dyn Potential,
}

impl Objective for SingleImage<'_> {
    fn positions(&self) -> DVector<f64> {
        self.config.coords.clone()
    }

    fn set_positions(&mut self, positions: &DVector<f64>) {
        self.config.set_positions(positions);
    }

    fn evaluate(&mut self) -> Result<(f64, DVector<f64>), PotentialError> {
        let mut eval = self.potential.evaluate(&*self.config)?;
        self.config.zero_fixed(&mut eval.forces);
        Ok((eval.energy, eval.forces))
    }
}

/// Relaxes `config` in place, calling `on_step` after every evaluation.
pub fn optimize_endpoint_with<F>(
    config: &mut Configuration,
    potential: &dyn Potential,
    optimizer: OptimizerKind,
    fmax: f64,
    max_steps: usize,
    mut on_step: F,
) -> Result<EndpointReport, PotentialError>
where
    F: FnMut(&Configuration, &StepInfo) -> Result<(), PotentialError>,
{
    let mut stepper = optimizer.build();
    let mut energy_before = None;
    let mut objective = SingleImage { config, potential };
    let outcome = run_optimizer(&mut objective, stepper.as_mut(), fmax, max_steps, |image, step| {
        energy_before.get_or_insert(step.energy);
        on_step(&*image.config, step)
    })?;

    let report = EndpointReport {
        converged: outcome.converged,
        energy_before: energy_before.unwrap_or(outcome.energy),
        energy_after: outcome.energy,
        steps: outcome.steps,
        fmax: outcome.fmax,
    };
    if report.converged {
        info!(
            "relaxed in {} steps: {:.6} -> {:.6} eV",
            report.steps, report.energy_before, report.energy_after
        );
    } else {
        warn!(
            "relaxation stopped after {} steps with fmax {:.4} > {:.4}",
            report.steps, report.fmax, fmax
        );
    }
    Ok(report)
}

/// Relaxes `config` in place.
pub fn optimize_endpoint(
    config: &mut Configuration,
    potential: &dyn Potential,
    optimizer: OptimizerKind,
    fmax: f64,
    max_steps: usize,
) -> Result<EndpointReport, PotentialError> {
    optimize_endpoint_with(config, potential, optimizer, fmax, max_steps, |_, _| Ok(()))
}

/// Relaxes `config` and writes `opt_trajectory.xyz`, `opt_convergence.csv`,
/// `opt_final.xyz` and `opt_params.txt` into `dir`.
pub fn optimize_in_directory(
    dir: &Path,
    config: &mut Configuration,
    potential: &dyn Potential,
    optimizer: OptimizerKind,
    fmax: f64,
    max_steps: usize,
) -> Result<EndpointReport, PotentialError> {
    fs::create_dir_all(dir)?;
    let trajectory = dir.join("opt_trajectory.xyz");
    if trajectory.exists() {
        fs::remove_file(&trajectory)?;
    }
    let mut csv = File::create(dir.join("opt_convergence.csv"))?;
    writeln!(csv, "step,energy,fmax")?;

    let report = optimize_endpoint_with(config, potential, optimizer, fmax, max_steps, |image, step| {
        io::append_frames(&trajectory, &[(image, Some(step.energy))])?;
        writeln!(csv, "{},{},{}", step.step, step.energy, step.fmax)?;
        Ok(())
    })?;

    io::write_extxyz(&dir.join("opt_final.xyz"), config, Some(report.energy_after))?;
    fs::write(
        dir.join("opt_params.txt"),
        format!(
            "model: {}\noptimizer: {}\nfmax: {}\nmax_steps: {}\nconverged: {}\nsteps: {}\nenergy_before: {}\nenergy_after: {}\n",
            potential.name(),
            optimizer,
            fmax,
            max_steps,
            report.converged,
            report.steps,
            report.energy_before,
            report.energy_after
        ),
    )?;
    Ok(report)
}

/// Thresholds below which two endpoints count as the same state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityThresholds {
    /// Energy difference threshold (eV)
    pub energy: f64,
    /// Largest atomic displacement threshold (Å)
    pub displacement: f64,
}

impl Default for SimilarityThresholds {
    fn default() -> Self {
        Self {
            energy: 0.02,
            displacement: 0.5,
        }
    }
}

/// Outcome of comparing two endpoints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityReport {
    /// |E_a - E_b| (eV)
    pub energy_difference: f64,
    /// Largest per-atom minimum-image displacement (Å)
    pub max_displacement: f64,
    /// Either measure fell below its threshold
    pub degenerate: bool,
}

/// Compares two endpoints and warns when the path between them is likely
/// degenerate.
pub fn check_similarity(
    a: &Configuration,
    energy_a: f64,
    b: &Configuration,
    energy_b: f64,
    thresholds: &SimilarityThresholds,
) -> SimilarityReport {
    let energy_difference = (energy_a - energy_b).abs();
    let max_displacement = a.max_displacement(b);
    let degenerate = energy_difference < thresholds.energy || max_displacement < thresholds.displacement;
    if degenerate {
        warn!(
            "endpoints look alike (dE = {:.4} eV, max displacement = {:.4} A); \
             one may have relaxed into the other's basin",
            energy_difference, max_displacement
        );
    } else {
        info!(
            "endpoints differ by {:.4} eV and {:.4} A at most",
            energy_difference, max_displacement
        );
    }
    SimilarityReport {
        energy_difference,
        max_displacement,
        degenerate,
    }
}
