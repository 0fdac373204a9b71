//! Constant-energy molecular dynamics.
//!
//! Velocities are drawn from a Maxwell-Boltzmann distribution at the
//! requested temperature and the system is propagated with velocity Verlet
//! under a [`Potential`]. Fixed atoms get zero velocity and zero force.
//!
//! Units follow the rest of the crate: Angstrom, eV, femtoseconds and atomic
//! mass units. A force of 1 eV/Angstrom on 1 amu gives an acceleration of
//! [`ACCELERATION_UNIT`] Angstrom/fs².
//!
//! [`run_in_directory`] writes:
//!
//! | File | Content |
//! |------|---------|
//! | `md.log` | `Time[ps] Etot[eV] Epot[eV] Ekin[eV] T[K]` every `interval` steps |
//! | `md_trajectory.xyz` | a frame every `interval` steps |
//! | `md_final.xyz` | the last configuration |

use crate::geometry::Configuration;
use crate::io;
use crate::potential::{Potential, PotentialError};
use lazy_static::lazy_static;
use log::{debug, info};
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Boltzmann constant (eV/K)
pub const BOLTZMANN: f64 = 8.617333262e-5;

/// Acceleration in Angstrom/fs² for 1 eV/Angstrom acting on 1 amu
pub const ACCELERATION_UNIT: f64 = 9.648533212e-3;

/// Errors raised during a dynamics run.
#[derive(Error, Debug)]
pub enum MdError {
    /// I/O error writing the log or trajectory
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Force evaluation failed
    #[error("potential error: {0}")]
    Potential(#[from] PotentialError),
    /// No mass known for this element
    #[error("no atomic mass for element '{0}'")]
    UnknownElement(String),
}

/// Result type for dynamics runs
pub type Result<T> = std::result::Result<T, MdError>;

lazy_static! {
    static ref ATOMIC_MASSES: HashMap<&'static str, f64> = [
        ("H", 1.008), ("He", 4.0026), ("Li", 6.94), ("Be", 9.0122), ("B", 10.81),
        ("C", 12.011), ("N", 14.007), ("O", 15.999), ("F", 18.998), ("Ne", 20.180),
        ("Na", 22.990), ("Mg", 24.305), ("Al", 26.982), ("Si", 28.085), ("P", 30.974),
        ("S", 32.06), ("Cl", 35.45), ("Ar", 39.948), ("K", 39.098), ("Ca", 40.078),
        ("Sc", 44.956), ("Ti", 47.867), ("V", 50.942), ("Cr", 51.996), ("Mn", 54.938),
        ("Fe", 55.845), ("Co", 58.933), ("Ni", 58.693), ("Cu", 63.546), ("Zn", 65.38),
        ("Ga", 69.723), ("Ge", 72.630), ("As", 74.922), ("Se", 78.971), ("Br", 79.904),
        ("Kr", 83.798), ("Rb", 85.468), ("Sr", 87.62), ("Y", 88.906), ("Zr", 91.224),
        ("Nb", 92.906), ("Mo", 95.95), ("Ru", 101.07), ("Rh", 102.91), ("Pd", 106.42),
        ("Ag", 107.87), ("Cd", 112.41), ("In", 114.82), ("Sn", 118.71), ("Sb", 121.76),
        ("Te", 127.60), ("I", 126.90), ("Xe", 131.29), ("Cs", 132.91), ("Ba", 137.33),
        ("La", 138.91), ("Hf", 178.49), ("Ta", 180.95), ("W", 183.84), ("Re", 186.21),
        ("Os", 190.23), ("Ir", 192.22), ("Pt", 195.08), ("Au", 196.97), ("Hg", 200.59),
        ("Pb", 207.2), ("Bi", 208.98),
    ]
    .into_iter()
    .collect();
}

/// Standard atomic mass of `symbol` in amu.
pub fn atomic_mass(symbol: &str) -> Option<f64> {
    ATOMIC_MASSES.get(symbol).copied()
}

/// Per-atom masses of a configuration.
pub fn masses(config: &Configuration) -> Result<Vec<f64>> {
    config
        .elements
        .iter()
        .map(|el| atomic_mass(el).ok_or_else(|| MdError::UnknownElement(el.clone())))
        .collect()
}

/// Parameters of a dynamics run.
#[derive(Debug, Clone, PartialEq)]
pub struct MdSettings {
    /// Initial temperature (K)
    pub temperature_k: f64,
    /// Time step (fs)
    pub timestep_fs: f64,
    /// Number of steps
    pub steps: usize,
    /// Log and trajectory interval in steps
    pub interval: usize,
    /// Random seed for the initial velocities; entropy when unset
    pub seed: Option<u64>,
}

impl Default for MdSettings {
    fn default() -> Self {
        Self {
            temperature_k: 300.0,
            timestep_fs: 2.0,
            steps: 1000,
            interval: 5,
            seed: None,
        }
    }
}

/// Snapshot handed to the observer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MdStep {
    /// Steps completed
    pub step: usize,
    /// Simulated time (fs)
    pub time_fs: f64,
    /// Potential energy (eV)
    pub potential_energy: f64,
    /// Kinetic energy (eV)
    pub kinetic_energy: f64,
    /// Instantaneous temperature (K)
    pub temperature_k: f64,
}

impl MdStep {
    /// Potential plus kinetic energy.
    pub fn total_energy(&self) -> f64 {
        self.potential_energy + self.kinetic_energy
    }
}

fn gaussian<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Draws velocities (Angstrom/fs) from the Maxwell-Boltzmann distribution.
pub fn maxwell_boltzmann<R: Rng>(config: &Configuration, masses: &[f64], temperature_k: f64, rng: &mut R) -> DVector<f64> {
    let mut v = DVector::zeros(config.coords.len());
    for (atom, &mass) in masses.iter().enumerate() {
        if config.is_fixed(atom) {
            continue;
        }
        let sigma = (BOLTZMANN * temperature_k * ACCELERATION_UNIT / mass).sqrt();
        for k in 0..3 {
            v[3 * atom + k] = sigma * gaussian(rng);
        }
    }
    v
}

/// Kinetic energy (eV) of `velocities`.
pub fn kinetic_energy(masses: &[f64], velocities: &DVector<f64>) -> f64 {
    masses
        .iter()
        .zip(velocities.as_slice().chunks_exact(3))
        .map(|(m, v)| 0.5 * m * (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]))
        .sum::<f64>()
        / ACCELERATION_UNIT
}

fn temperature(config: &Configuration, kinetic: f64) -> f64 {
    let dof = 3 * (config.num_atoms - config.fixed().len());
    if dof == 0 {
        0.0
    } else {
        2.0 * kinetic / (dof as f64 * BOLTZMANN)
    }
}

fn accelerations(config: &Configuration, masses: &[f64], potential: &dyn Potential) -> Result<(f64, DVector<f64>)> {
    let mut eval = potential.evaluate(config)?;
    config.zero_fixed(&mut eval.forces);
    for (atom, mass) in masses.iter().enumerate() {
        for k in 0..3 {
            eval.forces[3 * atom + k] *= ACCELERATION_UNIT / mass;
        }
    }
    Ok((eval.energy, eval.forces))
}

/// Runs velocity-Verlet dynamics on `config`, calling `observer` at step 0
/// and every `interval` steps after it.
pub fn run_md<F>(
    config: &mut Configuration,
    potential: &dyn Potential,
    settings: &MdSettings,
    mut observer: F,
) -> Result<MdStep>
where
    F: FnMut(&Configuration, &MdStep) -> Result<()>,
{
    let masses = masses(config)?;
    let mut rng = match settings.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut velocities = maxwell_boltzmann(config, &masses, settings.temperature_k, &mut rng);
    let dt = settings.timestep_fs;
    let interval = settings.interval.max(1);

    let (mut energy, mut acc) = accelerations(config, &masses, potential)?;
    let snapshot = |config: &Configuration, step: usize, energy: f64, velocities: &DVector<f64>| {
        let kinetic = kinetic_energy(&masses, velocities);
        MdStep {
            step,
            time_fs: step as f64 * dt,
            potential_energy: energy,
            kinetic_energy: kinetic,
            temperature_k: temperature(config, kinetic),
        }
    };

    let mut current = snapshot(config, 0, energy, &velocities);
    info!(
        "MD start: {} steps of {} fs, T = {:.1} K",
        settings.steps, dt, current.temperature_k
    );
    observer(&*config, &current)?;

    for step in 1..=settings.steps {
        velocities += &acc * (0.5 * dt);
        let next = &config.coords + &velocities * dt;
        config.set_positions(&next);
        (energy, acc) = accelerations(config, &masses, potential)?;
        velocities += &acc * (0.5 * dt);

        current = snapshot(config, step, energy, &velocities);
        debug!("md step {}: Etot = {:.6}", step, current.total_energy());
        if step % interval == 0 {
            observer(&*config, &current)?;
        }
    }
    info!(
        "MD finished: Etot = {:.6} eV, T = {:.1} K",
        current.total_energy(),
        current.temperature_k
    );
    Ok(current)
}

/// Runs dynamics and writes `md.log`, `md_trajectory.xyz` and
/// `md_final.xyz` into `dir`.
pub fn run_in_directory(
    dir: &Path,
    config: &mut Configuration,
    potential: &dyn Potential,
    settings: &MdSettings,
) -> Result<MdStep> {
    fs::create_dir_all(dir)?;
    let trajectory = dir.join("md_trajectory.xyz");
    if trajectory.exists() {
        fs::remove_file(&trajectory)?;
    }
    let mut log = File::create(dir.join("md.log"))?;
    writeln!(
        log,
        "{:<10} {:>12} {:>12} {:>12} {:>8}",
        "Time[ps]", "Etot[eV]", "Epot[eV]", "Ekin[eV]", "T[K]"
    )?;

    let last = run_md(config, potential, settings, |image, step| {
        writeln!(
            log,
            "{:<10.4} {:>12.4} {:>12.4} {:>12.4} {:>8.1}",
            step.time_fs / 1000.0,
            step.total_energy(),
            step.potential_energy,
            step.kinetic_energy,
            step.temperature_k
        )?;
        io::append_frames(&trajectory, &[(image, Some(step.potential_energy))])?;
        Ok(())
    })?;
    io::write_extxyz(&dir.join("md_final.xyz"), config, Some(last.potential_energy))?;
    Ok(last)
}
