//! Potential-energy oracles and the backend registry.
//!
//! Every stage of a path search that needs energies and forces talks to a
//! [`Potential`]. The relaxation code never inspects which backend it holds;
//! a backend is chosen once, by name, through a [`PotentialRegistry`] built at
//! process start and injected into the runners.
//!
//! # Built-in backends
//!
//! | Name | Spec | Parameters |
//! |------|------|------------|
//! | Lennard-Jones | `lj[:eps,sigma,cutoff]` | defaults 1.0, 1.0, 3·sigma |
//! | Morse | `morse[:D,alpha,r0,cutoff]` | defaults 1.0, 1.0, 1.0, 6.0 |
//! | External program | `external:<command ...>` | command line |
//!
//! Pair potentials use the minimum-image convention, so the cutoff must stay
//! below half the shortest cell length for periodic systems.
//!
//! # External programs
//!
//! The `external` backend writes the configuration as extended XYZ into a
//! scratch directory, runs the command with the file path appended and reads
//! stdout:
//!
//! ```text
//! energy: -12.345
//! 0.01 -0.02 0.00
//! ...one force line per atom (eV/Angstrom)
//! ```
//!
//! This is how machine-learned interatomic potentials living in another
//! runtime are plugged in.

use crate::geometry::Configuration;
use crate::io;
use lazy_static::lazy_static;
use log::debug;
use nalgebra::DVector;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by potential backends.
#[derive(Error, Debug)]
pub enum PotentialError {
    /// I/O error talking to an external program
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The backend ran but reported failure
    #[error("potential evaluation failed: {0}")]
    Calculation(String),
    /// Backend output could not be interpreted
    #[error("parse error: {0}")]
    Parse(String),
    /// No backend registered under this name
    #[error("unknown model '{name}', available: {available}")]
    UnknownModel {
        /// Requested name
        name: String,
        /// Comma-separated registered names
        available: String,
    },
    /// Backend parameters could not be parsed
    #[error("invalid parameters for '{model}': {message}")]
    InvalidArgument {
        /// Backend name
        model: String,
        /// Details
        message: String,
    },
}

/// Result type for potential evaluations
pub type Result<T> = std::result::Result<T, PotentialError>;

/// Energy and forces for one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Potential energy in eV
    pub energy: f64,
    /// Flat forces (eV/Angstrom), same layout as the coordinates
    pub forces: DVector<f64>,
}

impl Evaluation {
    /// Largest per-atom force norm, ignoring the atoms in `fixed`.
    pub fn fmax(&self, fixed: &[usize]) -> f64 {
        self.forces
            .as_slice()
            .chunks_exact(3)
            .enumerate()
            .filter(|(atom, _)| !fixed.contains(atom))
            .map(|(_, f)| (f[0] * f[0] + f[1] * f[1] + f[2] * f[2]).sqrt())
            .fold(0.0, f64::max)
    }
}

/// Capability interface for energy/force backends.
///
/// Implementations must be deterministic for a fixed configuration. Calls are
/// synchronous; callers never issue the next chain-wide operation before the
/// current call has returned.
pub trait Potential {
    /// Name used in logs and run parameters.
    fn name(&self) -> &str;

    /// Energy and forces for `config`.
    fn evaluate(&self, config: &Configuration) -> Result<Evaluation>;
}

/// Sums a radial pair term over all atom pairs inside `cutoff`.
///
/// `term(r)` returns the pair energy and its radial derivative dE/dr.
fn pair_sum<F>(config: &Configuration, cutoff: f64, term: F) -> Evaluation
where
    F: Fn(f64) -> (f64, f64),
{
    let mut energy = 0.0;
    let mut forces = DVector::zeros(config.coords.len());
    for i in 0..config.num_atoms {
        let ri = config.atom_position(i);
        for j in (i + 1)..config.num_atoms {
            let d = config.minimum_image(config.atom_position(j) - ri);
            let r = d.norm();
            if r >= cutoff || r < 1e-12 {
                continue;
            }
            let (e, de_dr) = term(r);
            energy += e;
            let f = d * (de_dr / r);
            for k in 0..3 {
                forces[3 * i + k] += f[k];
                forces[3 * j + k] -= f[k];
            }
        }
    }
    Evaluation { energy, forces }
}

/// Truncated and shifted 12-6 Lennard-Jones potential.
#[derive(Debug, Clone)]
pub struct LennardJones {
    /// Well depth (eV)
    pub epsilon: f64,
    /// Zero-crossing distance (Angstrom)
    pub sigma: f64,
    /// Cutoff radius (Angstrom)
    pub cutoff: f64,
}

impl LennardJones {
    /// Creates the potential with an explicit cutoff.
    pub fn new(epsilon: f64, sigma: f64, cutoff: f64) -> Self {
        Self {
            epsilon,
            sigma,
            cutoff,
        }
    }

    fn raw(&self, r: f64) -> f64 {
        let sr6 = (self.sigma / r).powi(6);
        4.0 * self.epsilon * (sr6 * sr6 - sr6)
    }
}

impl Default for LennardJones {
    fn default() -> Self {
        Self::new(1.0, 1.0, 3.0)
    }
}

impl Potential for LennardJones {
    fn name(&self) -> &str {
        "lj"
    }

    fn evaluate(&self, config: &Configuration) -> Result<Evaluation> {
        let shift = self.raw(self.cutoff);
        Ok(pair_sum(config, self.cutoff, |r| {
            let sr6 = (self.sigma / r).powi(6);
            let de_dr = 4.0 * self.epsilon * (-12.0 * sr6 * sr6 + 6.0 * sr6) / r;
            (self.raw(r) - shift, de_dr)
        }))
    }
}

/// Morse pair potential.
#[derive(Debug, Clone)]
pub struct Morse {
    /// Dissociation energy D (eV)
    pub depth: f64,
    /// Width parameter alpha (1/Angstrom)
    pub alpha: f64,
    /// Equilibrium distance (Angstrom)
    pub r0: f64,
    /// Cutoff radius (Angstrom)
    pub cutoff: f64,
}

impl Default for Morse {
    fn default() -> Self {
        Self {
            depth: 1.0,
            alpha: 1.0,
            r0: 1.0,
            cutoff: 6.0,
        }
    }
}

impl Potential for Morse {
    fn name(&self) -> &str {
        "morse"
    }

    fn evaluate(&self, config: &Configuration) -> Result<Evaluation> {
        Ok(pair_sum(config, self.cutoff, |r| {
            let x = (-self.alpha * (r - self.r0)).exp();
            let e = self.depth * ((1.0 - x) * (1.0 - x) - 1.0);
            let de_dr = 2.0 * self.depth * self.alpha * x * (1.0 - x);
            (e, de_dr)
        }))
    }
}

lazy_static! {
    static ref ENERGY_RE: Regex =
        Regex::new(r"(?i)^\s*energy\s*[:=]\s*([-+]?(?:\d+\.\d*|\.\d+|\d+)(?:[eE][-+]?\d+)?)")
            .expect("valid energy regex");
    static ref FORCE_RE: Regex = Regex::new(
        r"^\s*([-+]?(?:\d+\.\d*|\.\d+|\d+)(?:[eE][-+]?\d+)?)\s+([-+]?(?:\d+\.\d*|\.\d+|\d+)(?:[eE][-+]?\d+)?)\s+([-+]?(?:\d+\.\d*|\.\d+|\d+)(?:[eE][-+]?\d+)?)\s*$"
    )
    .expect("valid force regex");
}

/// Backend that delegates to an external program.
pub struct ExternalCommandPotential {
    program: String,
    args: Vec<String>,
    scratch: PathBuf,
    calls: AtomicUsize,
}

impl ExternalCommandPotential {
    /// Creates the backend from a whitespace-separated command line.
    pub fn new(command_line: &str, scratch: PathBuf) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| PotentialError::InvalidArgument {
            model: "external".to_string(),
            message: "empty command".to_string(),
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
            scratch,
            calls: AtomicUsize::new(0),
        })
    }

    /// Number of completed program invocations.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Parses the program's stdout into an evaluation for `num_atoms` atoms.
    pub fn parse_output(stdout: &str, num_atoms: usize) -> Result<Evaluation> {
        let mut energy = None;
        let mut forces = Vec::with_capacity(num_atoms * 3);
        for line in stdout.lines() {
            if let Some(caps) = ENERGY_RE.captures(line) {
                energy = Some(caps[1].parse::<f64>().map_err(|e| PotentialError::Parse(e.to_string()))?);
            } else if let Some(caps) = FORCE_RE.captures(line) {
                for k in 1..=3 {
                    forces.push(caps[k].parse::<f64>().map_err(|e| PotentialError::Parse(e.to_string()))?);
                }
            }
        }
        let energy = energy.ok_or_else(|| PotentialError::Parse("no energy line in output".to_string()))?;
        if forces.len() != num_atoms * 3 {
            return Err(PotentialError::Parse(format!(
                "expected {} force lines, found {}",
                num_atoms,
                forces.len() / 3
            )));
        }
        Ok(Evaluation {
            energy,
            forces: DVector::from_vec(forces),
        })
    }
}

impl Potential for ExternalCommandPotential {
    fn name(&self) -> &str {
        "external"
    }

    fn evaluate(&self, config: &Configuration) -> Result<Evaluation> {
        std::fs::create_dir_all(&self.scratch)?;
        let input = self.scratch.join("openneb_eval.xyz");
        io::write_extxyz(&input, config, None)?;

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&input)
            .output()?;
        if !output.status.success() {
            return Err(PotentialError::Calculation(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("external potential call {} finished", n);
        Self::parse_output(&String::from_utf8_lossy(&output.stdout), config.num_atoms)
    }
}

type Factory = Box<dyn Fn(Option<&str>) -> Result<Arc<dyn Potential>>>;

/// Name-to-backend table, built once and passed to the runners.
///
/// # Examples
///
/// ```
/// use openneb::potential::PotentialRegistry;
///
/// let registry = PotentialRegistry::with_builtin();
/// let lj = registry.create("lj:0.5,1.2,4.0").unwrap();
/// assert_eq!(lj.name(), "lj");
/// assert!(registry.create("nonexistent").is_err());
/// ```
pub struct PotentialRegistry {
    factories: BTreeMap<String, Factory>,
}

impl Default for PotentialRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl PotentialRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry holding the `lj`, `morse` and `external` backends.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("lj", |arg| {
            let p = parse_params("lj", arg, 3)?;
            let epsilon = p.first().copied().unwrap_or(1.0);
            let sigma = p.get(1).copied().unwrap_or(1.0);
            let cutoff = p.get(2).copied().unwrap_or(3.0 * sigma);
            Ok(Arc::new(LennardJones::new(epsilon, sigma, cutoff)) as Arc<dyn Potential>)
        });
        registry.register("morse", |arg| {
            let p = parse_params("morse", arg, 4)?;
            let d = Morse::default();
            Ok(Arc::new(Morse {
                depth: p.first().copied().unwrap_or(d.depth),
                alpha: p.get(1).copied().unwrap_or(d.alpha),
                r0: p.get(2).copied().unwrap_or(d.r0),
                cutoff: p.get(3).copied().unwrap_or(d.cutoff),
            }) as Arc<dyn Potential>)
        });
        registry.register("external", |arg| {
            let command = arg.ok_or_else(|| PotentialError::InvalidArgument {
                model: "external".to_string(),
                message: "use external:<command>".to_string(),
            })?;
            let scratch = std::env::temp_dir().join(format!("openneb_{}", std::process::id()));
            Ok(Arc::new(ExternalCommandPotential::new(command, scratch)?) as Arc<dyn Potential>)
        });
        registry
    }

    /// Adds or replaces a backend.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(Option<&str>) -> Result<Arc<dyn Potential>> + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Builds a backend from a `name[:arguments]` spec.
    pub fn create(&self, spec: &str) -> Result<Arc<dyn Potential>> {
        let (name, arg) = match spec.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (spec.trim(), None),
        };
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PotentialError::UnknownModel {
                name: name.to_string(),
                available: self.names().join(", "),
            })?;
        factory(arg.filter(|a| !a.is_empty()))
    }
}

fn parse_params(model: &str, arg: Option<&str>, max: usize) -> Result<Vec<f64>> {
    let Some(arg) = arg else {
        return Ok(Vec::new());
    };
    let values: Vec<f64> = arg
        .split(',')
        .map(|v| {
            v.trim().parse::<f64>().map_err(|_| PotentialError::InvalidArgument {
                model: model.to_string(),
                message: format!("'{}' is not a number", v),
            })
        })
        .collect::<Result<_>>()?;
    if values.len() > max {
        return Err(PotentialError::InvalidArgument {
            model: model.to_string(),
            message: format!("at most {} parameters, got {}", max, values.len()),
        });
    }
    Ok(values)
}
