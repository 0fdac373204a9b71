//! Geometry optimizers and the shared relaxation loop.
//!
//! Optimizers work on flat position vectors and flat forces, so the same
//! stepper drives a single configuration (endpoint relaxation) or a whole band
//! (all interior images concatenated). What is being relaxed is hidden behind
//! the [`Objective`] trait; [`run_optimizer`] owns the step/evaluate cycle and
//! the fmax convergence test.
//!
//! | Kind | Parameters |
//! |------|------------|
//! | FIRE | dt 0.1, dtmax 1.0, maxstep 0.2, Nmin 5, finc 1.1, fdec 0.5, astart 0.1, fa 0.99 |
//! | BFGS | H0 = 70 I, maxstep 0.2 |
//! | L-BFGS | memory 100, H0 = 1/70, maxstep 0.2 |
//! | MDMin | dt 0.2, maxstep 0.2 |

use crate::geometry::max_atom_norm;
use crate::potential::PotentialError;
use log::debug;
use nalgebra::{DMatrix, DVector};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// A quantity that can be relaxed: positions in, energy and forces out.
pub trait Objective {
    /// Current flat position vector.
    fn positions(&self) -> DVector<f64>;

    /// Moves to `positions`. Fixed atoms may ignore the request.
    fn set_positions(&mut self, positions: &DVector<f64>);

    /// Energy and the forces the optimizer should follow.
    fn evaluate(&mut self) -> Result<(f64, DVector<f64>), PotentialError>;

    /// Convergence measure for `forces`.
    fn fmax(&self, forces: &DVector<f64>) -> f64 {
        max_atom_norm(forces)
    }
}

/// Single optimizer step: new positions from current positions and forces.
pub trait Optimizer {
    /// Short lowercase name.
    fn name(&self) -> &'static str;

    /// Proposes the next position vector.
    fn step(&mut self, positions: &DVector<f64>, forces: &DVector<f64>, energy: f64) -> DVector<f64>;
}

/// What [`run_optimizer`] reports to its observer after every evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInfo {
    /// Number of completed steps (0 for the initial evaluation)
    pub step: usize,
    /// Energy at this step
    pub energy: f64,
    /// fmax at this step
    pub fmax: f64,
}

/// Result of a relaxation run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunOutcome {
    /// Whether fmax dropped to the threshold
    pub converged: bool,
    /// Number of optimizer steps taken
    pub steps: usize,
    /// Energy at the last evaluation
    pub energy: f64,
    /// fmax at the last evaluation
    pub fmax: f64,
}

/// Runs `optimizer` on `objective` until fmax ≤ `fmax` or `max_steps` steps.
///
/// The objective is evaluated once before the first step and once after each
/// step; `observer` sees every evaluation, so a run of `n` steps produces
/// `n + 1` observations numbered `0..=n`. Running out of steps is not an
/// error: the outcome simply reports `converged: false`.
pub fn run_optimizer<O, E, F>(
    objective: &mut O,
    optimizer: &mut dyn Optimizer,
    fmax: f64,
    max_steps: usize,
    mut observer: F,
) -> Result<RunOutcome, E>
where
    O: Objective + ?Sized,
    E: From<PotentialError>,
    F: FnMut(&O, &StepInfo) -> Result<(), E>,
{
    let mut steps = 0;
    loop {
        let (energy, forces) = objective.evaluate()?;
        let info = StepInfo {
            step: steps,
            energy,
            fmax: objective.fmax(&forces),
        };
        debug!("{} step {}: E = {:.6}, fmax = {:.6}", optimizer.name(), steps, energy, info.fmax);
        observer(&*objective, &info)?;

        let converged = info.fmax <= fmax;
        if converged || steps >= max_steps {
            return Ok(RunOutcome {
                converged,
                steps,
                energy,
                fmax: info.fmax,
            });
        }

        let x = objective.positions();
        let next = optimizer.step(&x, &forces, energy);
        objective.set_positions(&next);
        steps += 1;
    }
}

/// Scales `dr` so that no atom moves further than `maxstep`.
fn limit_per_atom(dr: &mut DVector<f64>, maxstep: f64) {
    let longest = max_atom_norm(dr);
    if longest > maxstep {
        *dr *= maxstep / longest;
    }
}

/// Fast inertial relaxation engine.
#[derive(Debug, Clone)]
pub struct Fire {
    dt: f64,
    dtmax: f64,
    maxstep: f64,
    n_min: usize,
    finc: f64,
    fdec: f64,
    astart: f64,
    fa: f64,
    a: f64,
    n_positive: usize,
    velocity: Option<DVector<f64>>,
}

impl Default for Fire {
    fn default() -> Self {
        Self {
            dt: 0.1,
            dtmax: 1.0,
            maxstep: 0.2,
            n_min: 5,
            finc: 1.1,
            fdec: 0.5,
            astart: 0.1,
            fa: 0.99,
            a: 0.1,
            n_positive: 0,
            velocity: None,
        }
    }
}

impl Optimizer for Fire {
    fn name(&self) -> &'static str {
        "fire"
    }

    fn step(&mut self, positions: &DVector<f64>, forces: &DVector<f64>, _energy: f64) -> DVector<f64> {
        let mut v = match self.velocity.take() {
            None => DVector::zeros(positions.len()),
            Some(v) => {
                let vf = v.dot(forces);
                if vf > 0.0 {
                    let fnorm = forces.norm();
                    let mixed = if fnorm > 0.0 {
                        &v * (1.0 - self.a) + forces * (self.a * v.norm() / fnorm)
                    } else {
                        v
                    };
                    if self.n_positive > self.n_min {
                        self.dt = (self.dt * self.finc).min(self.dtmax);
                        self.a *= self.fa;
                    }
                    self.n_positive += 1;
                    mixed
                } else {
                    self.a = self.astart;
                    self.dt *= self.fdec;
                    self.n_positive = 0;
                    DVector::zeros(positions.len())
                }
            }
        };
        v += forces * self.dt;
        let mut dr = &v * self.dt;
        let norm = dr.norm();
        if norm > self.maxstep {
            dr *= self.maxstep / norm;
        }
        self.velocity = Some(v);
        positions + dr
    }
}

/// Quasi-Newton optimizer with a dense BFGS Hessian.
#[derive(Debug, Clone)]
pub struct Bfgs {
    alpha: f64,
    maxstep: f64,
    hessian: Option<DMatrix<f64>>,
    previous: Option<(DVector<f64>, DVector<f64>)>,
}

impl Default for Bfgs {
    fn default() -> Self {
        Self {
            alpha: 70.0,
            maxstep: 0.2,
            hessian: None,
            previous: None,
        }
    }
}

impl Bfgs {
    fn update(&mut self, x: &DVector<f64>, forces: &DVector<f64>) {
        let Some(h) = self.hessian.as_mut() else {
            self.hessian = Some(DMatrix::identity(x.len(), x.len()) * self.alpha);
            return;
        };
        let Some((x0, f0)) = &self.previous else {
            return;
        };
        let dr = x - x0;
        if dr.amax() < 1e-7 {
            return;
        }
        let df = forces - f0;
        let a = dr.dot(&df);
        let dg = &*h * &dr;
        let b = dr.dot(&dg);
        if a.abs() < 1e-12 || b.abs() < 1e-12 {
            return;
        }
        *h -= (&df * df.transpose()) / a + (&dg * dg.transpose()) / b;
    }
}

impl Optimizer for Bfgs {
    fn name(&self) -> &'static str {
        "bfgs"
    }

    fn step(&mut self, positions: &DVector<f64>, forces: &DVector<f64>, _energy: f64) -> DVector<f64> {
        self.update(positions, forces);
        let dr = match &self.hessian {
            Some(h) => {
                let eigen = h.clone().symmetric_eigen();
                let projected = eigen.eigenvectors.transpose() * forces;
                let scaled = DVector::from_iterator(
                    projected.len(),
                    projected
                        .iter()
                        .zip(eigen.eigenvalues.iter())
                        .map(|(p, w)| p / w.abs().max(1e-10)),
                );
                eigen.eigenvectors * scaled
            }
            None => forces / self.alpha,
        };
        let mut dr = dr;
        limit_per_atom(&mut dr, self.maxstep);
        self.previous = Some((positions.clone(), forces.clone()));
        positions + dr
    }
}

/// Limited-memory BFGS.
#[derive(Debug, Clone)]
pub struct Lbfgs {
    memory: usize,
    h0: f64,
    maxstep: f64,
    s: VecDeque<DVector<f64>>,
    y: VecDeque<DVector<f64>>,
    rho: VecDeque<f64>,
    previous: Option<(DVector<f64>, DVector<f64>)>,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Self {
            memory: 100,
            h0: 1.0 / 70.0,
            maxstep: 0.2,
            s: VecDeque::new(),
            y: VecDeque::new(),
            rho: VecDeque::new(),
            previous: None,
        }
    }
}

impl Optimizer for Lbfgs {
    fn name(&self) -> &'static str {
        "lbfgs"
    }

    fn step(&mut self, positions: &DVector<f64>, forces: &DVector<f64>, _energy: f64) -> DVector<f64> {
        if let Some((x0, f0)) = self.previous.take() {
            let s0 = positions - x0;
            let y0 = f0 - forces;
            let sy = y0.dot(&s0);
            if sy.abs() > 1e-12 {
                self.s.push_back(s0);
                self.y.push_back(y0);
                self.rho.push_back(1.0 / sy);
                if self.s.len() > self.memory {
                    self.s.pop_front();
                    self.y.pop_front();
                    self.rho.pop_front();
                }
            }
        }

        let n = self.s.len();
        let mut a = vec![0.0; n];
        let mut q = -forces;
        for i in (0..n).rev() {
            a[i] = self.rho[i] * self.s[i].dot(&q);
            q -= &self.y[i] * a[i];
        }
        let mut z = q * self.h0;
        for i in 0..n {
            let b = self.rho[i] * self.y[i].dot(&z);
            z += &self.s[i] * (a[i] - b);
        }
        let mut dr = -z;
        limit_per_atom(&mut dr, self.maxstep);
        self.previous = Some((positions.clone(), forces.clone()));
        positions + dr
    }
}

/// Velocity-projected molecular-dynamics minimizer.
#[derive(Debug, Clone)]
pub struct MdMin {
    dt: f64,
    maxstep: f64,
    velocity: Option<DVector<f64>>,
    previous_forces: Option<DVector<f64>>,
}

impl Default for MdMin {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl MdMin {
    /// MDMin with time step `dt` and the default 0.2 Å step cap.
    pub fn new(dt: f64) -> Self {
        Self {
            dt,
            maxstep: 0.2,
            velocity: None,
            previous_forces: None,
        }
    }
}

impl Optimizer for MdMin {
    fn name(&self) -> &'static str {
        "mdmin"
    }

    fn step(&mut self, positions: &DVector<f64>, forces: &DVector<f64>, _energy: f64) -> DVector<f64> {
        let mut v = match (self.velocity.take(), &self.previous_forces) {
            (Some(v), Some(f0)) => {
                let v = v + (forces + f0) * (0.5 * self.dt);
                let vf = v.dot(forces);
                let ff = forces.dot(forces);
                if vf < 0.0 || ff == 0.0 {
                    DVector::zeros(positions.len())
                } else {
                    forces * (vf / ff)
                }
            }
            _ => DVector::zeros(positions.len()),
        };
        v += forces * (0.5 * self.dt);
        let mut dr = &v * self.dt;
        for atom in dr.as_mut_slice().chunks_exact_mut(3) {
            let norm = (atom[0] * atom[0] + atom[1] * atom[1] + atom[2] * atom[2]).sqrt();
            if norm > self.maxstep {
                let scale = self.maxstep / norm;
                atom.iter_mut().for_each(|c| *c *= scale);
            }
        }
        self.velocity = Some(v);
        self.previous_forces = Some(forces.clone());
        positions + dr
    }
}

/// Optimizer selection as it appears in run parameters and on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizerKind {
    /// [`Fire`]
    Fire,
    /// [`Bfgs`]
    #[default]
    Bfgs,
    /// [`Lbfgs`]
    Lbfgs,
    /// [`MdMin`]
    MdMin,
}

impl OptimizerKind {
    /// Fresh optimizer of this kind.
    pub fn build(self) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::Fire => Box::new(Fire::default()),
            OptimizerKind::Bfgs => Box::new(Bfgs::default()),
            OptimizerKind::Lbfgs => Box::new(Lbfgs::default()),
            OptimizerKind::MdMin => Box::new(MdMin::default()),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerKind::Fire => "fire",
            OptimizerKind::Bfgs => "bfgs",
            OptimizerKind::Lbfgs => "lbfgs",
            OptimizerKind::MdMin => "mdmin",
        };
        f.write_str(name)
    }
}

impl FromStr for OptimizerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fire" => Ok(OptimizerKind::Fire),
            "bfgs" => Ok(OptimizerKind::Bfgs),
            "lbfgs" | "l-bfgs" => Ok(OptimizerKind::Lbfgs),
            "mdmin" => Ok(OptimizerKind::MdMin),
            other => Err(format!("unknown optimizer '{}' (fire, bfgs, lbfgs, mdmin)", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Anisotropic harmonic well centred on `center`.
    struct Well {
        x: DVector<f64>,
        center: DVector<f64>,
        k: DVector<f64>,
        evaluations: usize,
    }

    impl Well {
        fn new() -> Self {
            Self {
                x: DVector::from_vec(vec![0.3, -0.2, 0.1, 1.0, 0.5, -0.4]),
                center: DVector::from_vec(vec![0.0, 0.0, 0.0, 1.2, 0.3, -0.1]),
                k: DVector::from_vec(vec![1.0, 2.0, 3.0, 1.5, 2.5, 4.0]),
                evaluations: 0,
            }
        }
    }

    impl Objective for Well {
        fn positions(&self) -> DVector<f64> {
            self.x.clone()
        }

        fn set_positions(&mut self, positions: &DVector<f64>) {
            self.x.copy_from(positions);
        }

        fn evaluate(&mut self) -> Result<(f64, DVector<f64>), PotentialError> {
            self.evaluations += 1;
            let d = &self.x - &self.center;
            let forces = -d.component_mul(&self.k);
            let energy = 0.5 * d.component_mul(&d).dot(&self.k);
            Ok((energy, forces))
        }
    }

    #[test]
    fn test_every_optimizer_reaches_the_minimum() {
        for kind in [
            OptimizerKind::Fire,
            OptimizerKind::Bfgs,
            OptimizerKind::Lbfgs,
            OptimizerKind::MdMin,
        ] {
            let mut well = Well::new();
            let mut optimizer = kind.build();
            let outcome = run_optimizer::<_, PotentialError, _>(
                &mut well,
                optimizer.as_mut(),
                1e-3,
                2000,
                |_, _| Ok(()),
            )
            .unwrap();
            assert!(outcome.converged, "{} did not converge", kind);
            assert!((&well.x - &well.center).amax() < 1e-2, "{} ended off-centre", kind);
        }
    }

    #[test]
    fn test_observer_sees_one_row_per_evaluation() {
        let mut well = Well::new();
        let mut optimizer = Fire::default();
        let mut seen = Vec::new();
        let outcome = run_optimizer::<_, PotentialError, _>(&mut well, &mut optimizer, 1e-12, 7, |_, info| {
            seen.push(info.step);
            Ok(())
        })
        .unwrap();
        assert!(!outcome.converged);
        assert_eq!(outcome.steps, 7);
        assert_eq!(seen, (0..=7).collect::<Vec<_>>());
        assert_eq!(well.evaluations, 8);
    }

    #[test]
    fn test_already_converged_takes_no_step() {
        let mut well = Well::new();
        well.x = well.center.clone();
        let mut optimizer = Bfgs::default();
        let outcome =
            run_optimizer::<_, PotentialError, _>(&mut well, &mut optimizer, 0.05, 100, |_, _| Ok(())).unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.steps, 0);
    }

    #[test]
    fn test_step_is_capped_per_atom() {
        let mut optimizer = Bfgs::default();
        let x = DVector::zeros(6);
        let forces = DVector::from_vec(vec![1000.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        let next = optimizer.step(&x, &forces, 0.0);
        assert!((max_atom_norm(&next) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_kind_parses_case_insensitively() {
        assert_eq!("FIRE".parse::<OptimizerKind>().unwrap(), OptimizerKind::Fire);
        assert_eq!("MDMin".parse::<OptimizerKind>().unwrap(), OptimizerKind::MdMin);
        assert_eq!(OptimizerKind::Lbfgs.to_string(), "lbfgs");
        assert!("newton".parse::<OptimizerKind>().is_err());
    }
}
