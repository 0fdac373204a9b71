//! Adaptive band growth (AutoNEB).
//!
//! Starting from the two endpoints alone, the band is grown one image at a
//! time until it holds `n_target` images, endpoints included:
//!
//! 1. relax the current band (no climbing) for at most `max_steps_per_relax`
//! 2. score every gap between neighbours as
//!    `ratio * geo / max(geo) + (1 - ratio) * dE / max(dE)`
//! 3. insert a new image, linear or IDPP interpolated, into the best gap
//!
//! A final relaxation with the climbing image (if requested) finishes the run.
//!
//! All files live in the run directory handle passed in, with names distinct
//! from plain NEB runs:
//!
//! | File | Content |
//! |------|---------|
//! | `autoneb_parameters.txt` | run parameters |
//! | `<prefix>NNN.xyz` | latest geometry and energy of image NNN |
//! | `AutoNEB_iter/iterNNN.xyz` | whole band after insertion NNN |
//! | `autoneb_state.json` | iteration counter and energies, for resuming |
//! | `<prefix>_energy_profile.csv` | final energy profile |
//!
//! Combining AutoNEB with a relax subset is allowed but logged as a warning;
//! the subset is applied to every inserted image.
//!
//! [`AutoNeb::resume`] takes every parameter from `autoneb_parameters.txt`.
//! Only the target may be raised, which grows a finished band further.

use crate::checkpoint::{format_indices, CheckpointError, Interpolation, RunDirectory, Snapshot};
use crate::geometry::Configuration;
use crate::interpolation::{self, interpolate_idpp};
use crate::io::{self, StructureError};
use crate::neb::{self, NebError, RelaxSettings};
use crate::optimizer::OptimizerKind;
use crate::path::{self, ImageChain, PathError};
use crate::potential::{Potential, PotentialError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised during adaptive growth.
#[derive(Error, Debug)]
pub enum AutoNebError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Band relaxation failed
    #[error("relaxation failed: {0}")]
    Neb(#[from] NebError),
    /// Chain construction failed
    #[error("path error: {0}")]
    Path(#[from] PathError),
    /// The potential failed
    #[error("potential error: {0}")]
    Potential(#[from] PotentialError),
    /// Image file unreadable
    #[error("structure error: {0}")]
    Structure(#[from] StructureError),
    /// State file unreadable
    #[error("state file error: {0}")]
    State(#[from] serde_json::Error),
    /// Parameter file missing a key or holding a bad value
    #[error("parameter file error: {0}")]
    Parameters(#[from] CheckpointError),
    /// Target smaller than the two endpoints
    #[error("target of {0} images is below the two endpoints")]
    InvalidTarget(usize),
    /// Resume target below the images already in the band
    #[error("cannot shrink the band from {images} to {target} images")]
    ShrinkingTarget {
        /// Requested target
        target: usize,
        /// Images already present
        images: usize,
    },
    /// State file lists fewer than two images
    #[error("state file lists {0} images, need at least the two endpoints")]
    MissingImages(usize),
}

/// Result type for adaptive growth
pub type Result<T> = std::result::Result<T, AutoNebError>;

const PARAMETERS_FILE: &str = "autoneb_parameters.txt";
const STATE_FILE: &str = "autoneb_state.json";

/// Parameters of an adaptive run.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoNebParameters {
    /// Start structure file
    pub initial_structure: PathBuf,
    /// End structure file
    pub final_structure: PathBuf,
    /// Total images wanted, endpoints included
    pub n_target: usize,
    /// Images that may relax at the same time; a scheduling hint only
    pub n_simultaneous: usize,
    /// Convergence threshold (eV/Å)
    pub fmax: f64,
    /// Climbing image on the final relaxation
    pub climb: bool,
    /// Spring constant (eV/Å²)
    pub spring_constant: f64,
    /// 1.0 ranks gaps purely by distance, 0.0 purely by energy
    pub space_energy_ratio: f64,
    /// How inserted images are placed
    pub interpolation: Interpolation,
    /// Step budget per relaxation
    pub max_steps_per_relax: usize,
    /// Band fmax at which climbing switches on in the final relaxation
    pub climb_activation_fmax: f64,
    /// Optimizer for every relaxation
    pub optimizer: OptimizerKind,
    /// Per-image file prefix
    pub prefix: String,
    /// Potential spec
    pub model: String,
    /// Atoms allowed to move on inserted images
    pub relax_atoms: Option<Vec<usize>>,
}

impl Default for AutoNebParameters {
    fn default() -> Self {
        Self {
            initial_structure: PathBuf::from("initial.xyz"),
            final_structure: PathBuf::from("final.xyz"),
            n_target: 9,
            n_simultaneous: 4,
            fmax: 0.05,
            climb: true,
            spring_constant: 0.1,
            space_energy_ratio: 0.5,
            interpolation: Interpolation::Idpp,
            max_steps_per_relax: 10000,
            climb_activation_fmax: 0.5,
            optimizer: OptimizerKind::Fire,
            prefix: "autoneb".to_string(),
            model: "lj".to_string(),
            relax_atoms: None,
        }
    }
}

impl AutoNebParameters {
    /// Renders the `key: value` parameter file.
    pub fn to_text(&self) -> String {
        format!(
            "initial: {}\nfinal: {}\nn_target: {}\nn_simultaneous: {}\nfmax: {}\nclimb: {}\n\
             spring_constant: {}\nspace_energy_ratio: {}\ninterpolation: {}\nmax_steps_per_relax: {}\n\
             climb_activation_fmax: {}\noptimizer: {}\nprefix: {}\nmodel: {}\nrelax_atoms: {}\n",
            self.initial_structure.display(),
            self.final_structure.display(),
            self.n_target,
            self.n_simultaneous,
            self.fmax,
            self.climb,
            self.spring_constant,
            self.space_energy_ratio,
            self.interpolation,
            self.max_steps_per_relax,
            self.climb_activation_fmax,
            self.optimizer,
            self.prefix,
            self.model,
            format_indices(&self.relax_atoms)
        )
    }

    /// Parses the parameter file. Unknown keys are ignored; every known key
    /// is required.
    pub fn from_text(text: &str) -> std::result::Result<Self, CheckpointError> {
        let snap = Snapshot::parse(text);
        Ok(Self {
            initial_structure: PathBuf::from(snap.raw("initial")?),
            final_structure: PathBuf::from(snap.raw("final")?),
            n_target: snap.get("n_target")?,
            n_simultaneous: snap.get("n_simultaneous")?,
            fmax: snap.get("fmax")?,
            climb: snap.get("climb")?,
            spring_constant: snap.get("spring_constant")?,
            space_energy_ratio: snap.get("space_energy_ratio")?,
            interpolation: snap.get("interpolation")?,
            max_steps_per_relax: snap.get("max_steps_per_relax")?,
            climb_activation_fmax: snap.get("climb_activation_fmax")?,
            optimizer: snap.get("optimizer")?,
            prefix: snap.raw("prefix")?.to_string(),
            model: snap.raw("model")?.to_string(),
            relax_atoms: snap.indices("relax_atoms")?,
        })
    }

    /// Reads `autoneb_parameters.txt` from a run directory.
    pub fn load(dir: &RunDirectory) -> Result<Self> {
        let text = fs::read_to_string(dir.join(PARAMETERS_FILE))?;
        Ok(Self::from_text(&text)?)
    }

    fn relax_settings(&self, climb: bool) -> RelaxSettings {
        RelaxSettings {
            spring_constant: self.spring_constant,
            climb,
            climb_activation_fmax: self.climb_activation_fmax,
            optimizer: self.optimizer,
            fmax: self.fmax,
            max_steps: self.max_steps_per_relax,
        }
    }
}

/// Progress record written after every insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoNebState {
    /// Insertions done so far
    pub iteration: usize,
    /// Images currently in the band
    pub n_images: usize,
    /// Target image count
    pub n_target: usize,
    /// Energy per image, `null` where unknown
    pub energies: Vec<Option<f64>>,
    /// Gap that received the last image
    pub last_gap: Option<usize>,
    /// Set once the final relaxation has finished
    pub finished: bool,
    /// Whether that final relaxation converged
    #[serde(default)]
    pub converged: bool,
}

/// Result of an adaptive run.
#[derive(Debug, Clone)]
pub struct AutoNebOutcome {
    /// The final band
    pub chain: ImageChain,
    /// Whether the final relaxation converged
    pub converged: bool,
    /// Insertions performed in this call
    pub insertions: usize,
}

/// Scores each gap between neighbouring images.
///
/// `ratio` weighs the normalized geometric gap against the normalized energy
/// gap. Unknown energies count as a zero energy gap.
pub fn gap_scores(chain: &ImageChain, ratio: f64) -> Vec<f64> {
    let gaps = chain.len() - 1;
    let geo: Vec<f64> = (0..gaps)
        .map(|i| chain.image(i).mic_displacement(chain.image(i + 1)).norm())
        .collect();
    let de: Vec<f64> = (0..gaps)
        .map(|i| match (chain.energy(i), chain.energy(i + 1)) {
            (Some(a), Some(b)) => (b - a).abs(),
            _ => 0.0,
        })
        .collect();
    let max_geo = geo.iter().copied().fold(0.0, f64::max);
    let max_de = de.iter().copied().fold(0.0, f64::max);
    let normalized = |v: f64, max: f64| if max > 0.0 { v / max } else { 0.0 };
    geo.iter()
        .zip(&de)
        .map(|(&g, &e)| ratio * normalized(g, max_geo) + (1.0 - ratio) * normalized(e, max_de))
        .collect()
}

/// Gap with the highest score; ties go to the lowest index.
pub fn best_gap(scores: &[f64]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &s)| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((i, s)),
        })
        .map(|(i, _)| i)
}

/// Adaptive band growth scoped to one run directory.
pub struct AutoNeb {
    dir: RunDirectory,
    potential: Arc<dyn Potential>,
    params: AutoNebParameters,
}

impl AutoNeb {
    /// Creates the runner. Nothing is written until [`AutoNeb::grow`] or
    /// [`AutoNeb::resume`] is called.
    pub fn new(dir: RunDirectory, potential: Arc<dyn Potential>, params: AutoNebParameters) -> Self {
        Self { dir, potential, params }
    }

    fn parameters_path(&self) -> PathBuf {
        self.dir.join(PARAMETERS_FILE)
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn iteration_dir(&self) -> PathBuf {
        self.dir.join("AutoNEB_iter")
    }

    fn image_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}{:03}.xyz", self.params.prefix, index))
    }

    fn fixed_for_inserted(&self, start: &Configuration) -> Vec<usize> {
        let mut fixed = start.fixed().to_vec();
        if let Some(subset) = &self.params.relax_atoms {
            fixed.extend((0..start.num_atoms).filter(|i| !subset.contains(i)));
        }
        fixed
    }

    /// Grows a band between `start` and `end` to the target size.
    ///
    /// The end is rescaled onto the start cell and wrapped to the periodic
    /// image nearest the start; both endpoint energies are evaluated before
    /// anything else.
    pub fn grow(&self, start: Configuration, end: Configuration) -> Result<AutoNebOutcome> {
        if self.params.n_target < 2 {
            return Err(AutoNebError::InvalidTarget(self.params.n_target));
        }
        path::check_shape(&start, &end)?;
        path::check_relax_subset(self.params.relax_atoms.as_deref(), start.num_atoms)?;
        if self.params.relax_atoms.is_some() {
            warn!("relax subset combined with AutoNEB: inserted images get the subset constraint, results may be poor");
        }
        if self.params.n_simultaneous > 1 {
            debug!(
                "n_simultaneous = {} requested; images are relaxed sequentially",
                self.params.n_simultaneous
            );
        }

        let mut end = end;
        if end.cell != start.cell && end.cell.determinant().abs() > 1e-12 && start.cell.determinant().abs() > 1e-12 {
            end.set_cell_scaled(start.cell);
        }
        end.wrap_against(&start);

        let mut chain = ImageChain::from_parts(Arc::new(start), Arc::new(end), Vec::new())?;
        chain.set_relax_subset(self.params.relax_atoms.clone());
        let e0 = self.potential.evaluate(chain.start())?.energy;
        let e1 = self.potential.evaluate(chain.end())?.energy;
        chain.set_energy(0, e0);
        chain.set_energy(1, e1);
        info!("endpoint energies {:.6} eV and {:.6} eV", e0, e1);

        fs::create_dir_all(self.dir.root())?;
        fs::write(self.parameters_path(), self.params.to_text())?;
        fs::create_dir_all(self.iteration_dir())?;
        self.write_images(&chain)?;
        self.continue_growth(chain, 0)
    }

    /// Continues a run from the files in `dir`.
    ///
    /// Every parameter comes from the saved parameter file. `target` may
    /// raise the image count; the file is rewritten to match. A finished run
    /// with no new target returns its band without relaxing again.
    pub fn resume(dir: RunDirectory, potential: Arc<dyn Potential>, target: Option<usize>) -> Result<AutoNebOutcome> {
        let mut params = AutoNebParameters::load(&dir)?;
        let state: AutoNebState = serde_json::from_str(&fs::read_to_string(dir.join(STATE_FILE))?)?;
        if state.n_images < 2 {
            return Err(AutoNebError::MissingImages(state.n_images));
        }

        if let Some(target) = target {
            if target < state.n_images {
                return Err(AutoNebError::ShrinkingTarget {
                    target,
                    images: state.n_images,
                });
            }
            if target != params.n_target {
                info!("AutoNEB target changed from {} to {} images", params.n_target, target);
                params.n_target = target;
                fs::write(dir.join(PARAMETERS_FILE), params.to_text())?;
            }
        }
        let runner = AutoNeb::new(dir, potential, params);
        let chain = runner.load_band(&state)?;

        if state.finished && chain.len() >= runner.params.n_target {
            info!("AutoNEB run already finished with {} images", chain.len());
            return Ok(AutoNebOutcome {
                chain,
                converged: state.converged,
                insertions: 0,
            });
        }
        info!(
            "resuming AutoNEB at iteration {} with {} of {} images",
            state.iteration, state.n_images, runner.params.n_target
        );
        fs::create_dir_all(runner.iteration_dir())?;
        runner.continue_growth(chain, state.iteration)
    }

    fn load_band(&self, state: &AutoNebState) -> Result<ImageChain> {
        let mut images = Vec::with_capacity(state.n_images);
        for index in 0..state.n_images {
            images.push(io::read_extxyz(&self.image_path(index))?.config);
        }
        let end = images.pop().ok_or(AutoNebError::MissingImages(state.n_images))?;
        let mut configs = images.into_iter();
        let start = configs.next().ok_or(AutoNebError::MissingImages(state.n_images))?;

        let mut chain = ImageChain::from_parts(Arc::new(start), Arc::new(end), configs.collect())?;
        chain.set_relax_subset(self.params.relax_atoms.clone());
        for (i, energy) in state.energies.iter().enumerate() {
            if let Some(e) = energy {
                chain.set_energy(i, *e);
            }
        }
        Ok(chain)
    }

    fn continue_growth(&self, mut chain: ImageChain, mut iteration: usize) -> Result<AutoNebOutcome> {
        let mut insertions = 0;
        while chain.len() < self.params.n_target {
            if chain.num_intermediate() > 0 {
                neb::relax(&mut chain, Arc::clone(&self.potential), &self.params.relax_settings(false))?;
            }

            let scores = gap_scores(&chain, self.params.space_energy_ratio);
            let Some(gap) = best_gap(&scores) else {
                break;
            };
            let image = self.new_image(&chain, gap)?;
            chain = chain.with_inserted(gap, image)?;
            let energy = self.potential.evaluate(chain.image(gap + 1))?.energy;
            chain.set_energy(gap + 1, energy);

            iteration += 1;
            insertions += 1;
            info!(
                "iteration {}: inserted image between {} and {} (score {:.3}), {} of {} images",
                iteration,
                gap,
                gap + 1,
                scores[gap],
                chain.len(),
                self.params.n_target
            );
            self.checkpoint(&chain, iteration, Some(gap), None)?;
        }

        let outcome = neb::relax(
            &mut chain,
            Arc::clone(&self.potential),
            &self.params.relax_settings(self.params.climb),
        )?;
        self.checkpoint(&chain, iteration, None, Some(outcome.converged))?;
        if let Some((forward, reverse)) = io::write_energy_profile(
            &self.dir.join(format!("{}_energy_profile.csv", self.params.prefix)),
            &chain,
        )? {
            info!("forward barrier {:.4} eV, reverse barrier {:.4} eV", forward, reverse);
        }
        Ok(AutoNebOutcome {
            chain,
            converged: outcome.converged,
            insertions,
        })
    }

    fn new_image(&self, chain: &ImageChain, gap: usize) -> Result<Configuration> {
        let left = chain.image(gap);
        let right = chain.image(gap + 1);
        let mut image = interpolation::midpoint(left, right, 0.5);
        image.clear_constraints();

        if self.params.interpolation == Interpolation::Idpp && self.params.relax_atoms.is_none() {
            let mut local = ImageChain::from_parts(
                Arc::new(left.clone()),
                Arc::new(right.clone()),
                vec![image],
            )?;
            interpolate_idpp(&mut local, 0.1, 100)?;
            image = local.interior()[0].clone();
        }
        image.fix_atoms(&self.fixed_for_inserted(chain.start())).map_err(PathError::from)?;
        Ok(image)
    }

    fn write_images(&self, chain: &ImageChain) -> Result<()> {
        for (i, image) in chain.images().enumerate() {
            io::write_extxyz(&self.image_path(i), image, chain.energy(i))?;
        }
        Ok(())
    }

    /// Writes images, the iteration band and the state; `converged` is set
    /// only by the final relaxation.
    fn checkpoint(
        &self,
        chain: &ImageChain,
        iteration: usize,
        last_gap: Option<usize>,
        converged: Option<bool>,
    ) -> Result<()> {
        self.write_images(chain)?;
        let frames: Vec<(&Configuration, Option<f64>)> =
            chain.images().enumerate().map(|(i, c)| (c, chain.energy(i))).collect();
        let iter_path = self.iteration_dir().join(format!("iter{:03}.xyz", iteration));
        if iter_path.exists() {
            fs::remove_file(&iter_path)?;
        }
        io::append_frames(&iter_path, &frames)?;

        let state = AutoNebState {
            iteration,
            n_images: chain.len(),
            n_target: self.params.n_target,
            energies: chain.energies().to_vec(),
            last_gap,
            finished: converged.is_some(),
            converged: converged.unwrap_or(false),
        };
        fs::write(self.state_path(), serde_json::to_string_pretty(&state)?)?;
        Ok(())
    }
}
