//! Run parameters, restart and artifact backup for NEB runs.
//!
//! A run directory holds a parameter snapshot plus the artifacts a run
//! produces:
//!
//! | File | Content |
//! |------|---------|
//! | `neb_parameters.txt` | run parameters, one `key: value` per line |
//! | `neb_full.xyz` | every image after every evaluation |
//! | `neb_final.xyz` | the final images only |
//! | `neb.log` | running human-readable convergence log |
//! | `neb_convergence.csv` | `step,max_band_force,barrier_height` |
//! | `neb_energy_profile.csv` | final `image,energy,rel_energy` |
//! | `images/` | one `NN.xyz` per final image |
//!
//! The snapshot is the restart contract. On restart every field is read back
//! verbatim; only the spring constant, climbing flag, optimizer, step budget
//! and model may be overridden. Endpoints, image count and relax subset
//! define the chain and cannot change, so an override of any of them is
//! rejected with [`CheckpointError::InvalidOverride`] before anything on disk
//! is touched.
//!
//! The chain is rebuilt from the last complete block of `n_intermediate + 2`
//! frames in the full trajectory. Frames left over after that block (an
//! interrupted write) are reported with a warning and a grace period during
//! which the operator can abort.
//!
//! Before a resumed run writes anything, the old artifacts are moved into
//! `backup_YYYYMMDD_HHMMSS/`. The snapshot stays in place.

use crate::io::{self, StructureError};
use crate::neb::RelaxSettings;
use crate::optimizer::OptimizerKind;
use crate::path::{ImageChain, PathError};
use chrono::Local;
use log::{info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while saving, loading or restarting a run.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Trajectory could not be read
    #[error("structure error: {0}")]
    Structure(#[from] StructureError),
    /// Frames could not be assembled into a chain
    #[error("path error: {0}")]
    Path(#[from] PathError),
    /// A required snapshot key is absent
    #[error("restart parameter '{0}' missing from snapshot")]
    MissingRestartParameter(String),
    /// A snapshot value could not be parsed
    #[error("invalid value '{value}' for '{key}': {message}")]
    InvalidParameter {
        /// Snapshot key
        key: String,
        /// Raw value
        value: String,
        /// Details
        message: String,
    },
    /// Attempt to change a field that defines the chain
    #[error("cannot change '{field}' on restart (snapshot: {snapshot}, requested: {requested})")]
    InvalidOverride {
        /// Field name
        field: String,
        /// Value in the snapshot
        snapshot: String,
        /// Value requested by the caller
        requested: String,
    },
    /// The full trajectory does not contain one complete band
    #[error("trajectory {path} holds {frames} complete frames, need at least {images}")]
    IncompleteTrajectory {
        /// Trajectory file
        path: PathBuf,
        /// Complete frames found
        frames: usize,
        /// Images per band
        images: usize,
    },
}

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// How the initial path guess is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    /// Linear under the minimum-image convention
    Linear,
    /// Linear followed by IDPP refinement
    #[default]
    Idpp,
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Interpolation::Linear => "linear",
            Interpolation::Idpp => "idpp",
        })
    }
}

impl FromStr for Interpolation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(Interpolation::Linear),
            "idpp" => Ok(Interpolation::Idpp),
            other => Err(format!("unknown interpolation '{}' (linear, idpp)", other)),
        }
    }
}

/// Everything needed to build and relax a band; the restart contract.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParameters {
    /// Start structure file
    pub initial_structure: PathBuf,
    /// End structure file
    pub final_structure: PathBuf,
    /// Interior images (chain length is this plus two)
    pub n_intermediate: usize,
    /// IDPP convergence threshold
    pub interp_fmax: f64,
    /// IDPP step budget
    pub interp_steps: usize,
    /// Initial path method
    pub interpolation: Interpolation,
    /// Spring constant (eV/Å²)
    pub spring_constant: f64,
    /// Climbing image
    pub climb: bool,
    /// Band fmax at which climbing switches on
    pub climb_activation_fmax: f64,
    /// Band optimizer
    pub optimizer: OptimizerKind,
    /// Band convergence threshold (eV/Å)
    pub fmax: f64,
    /// Band step budget
    pub max_steps: usize,
    /// Atoms allowed to move; all others fixed on interior images
    pub relax_atoms: Option<Vec<usize>>,
    /// Potential spec as understood by the registry
    pub model: String,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            initial_structure: PathBuf::from("initial.xyz"),
            final_structure: PathBuf::from("final.xyz"),
            n_intermediate: 5,
            interp_fmax: 0.1,
            interp_steps: 1000,
            interpolation: Interpolation::Idpp,
            spring_constant: 0.1,
            climb: false,
            climb_activation_fmax: 0.5,
            optimizer: OptimizerKind::Bfgs,
            fmax: 0.05,
            max_steps: 1000,
            relax_atoms: None,
            model: "lj".to_string(),
        }
    }
}

pub(crate) fn format_indices(indices: &Option<Vec<usize>>) -> String {
    match indices {
        None => "none".to_string(),
        Some(v) => v.iter().map(usize::to_string).collect::<Vec<_>>().join(","),
    }
}

/// Inverse of [`format_indices`]; an empty value is the empty subset.
pub(crate) fn parse_indices(value: &str) -> std::result::Result<Option<Vec<usize>>, String> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    if value.is_empty() {
        return Ok(Some(Vec::new()));
    }
    value
        .split(',')
        .map(|s| s.trim().parse::<usize>().map_err(|e| e.to_string()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(Some)
}

/// Flat `key: value` reader shared by the NEB and AutoNEB parameter files.
pub(crate) struct Snapshot<'a> {
    values: BTreeMap<&'a str, &'a str>,
}

impl<'a> Snapshot<'a> {
    pub(crate) fn parse(text: &'a str) -> Self {
        let values = text
            .lines()
            .filter(|l| !l.trim_start().starts_with('#'))
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();
        Self { values }
    }

    pub(crate) fn raw(&self, key: &str) -> Result<&'a str> {
        self.values
            .get(key)
            .copied()
            .ok_or_else(|| CheckpointError::MissingRestartParameter(key.to_string()))
    }

    pub(crate) fn indices(&self, key: &str) -> Result<Option<Vec<usize>>> {
        let value = self.raw(key)?;
        parse_indices(value).map_err(|message| CheckpointError::InvalidParameter {
            key: key.to_string(),
            value: value.to_string(),
            message,
        })
    }

    pub(crate) fn get<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let value = self.raw(key)?;
        value.parse::<T>().map_err(|e| CheckpointError::InvalidParameter {
            key: key.to_string(),
            value: value.to_string(),
            message: e.to_string(),
        })
    }
}

impl RunParameters {
    /// Renders the snapshot text.
    pub fn to_snapshot(&self) -> String {
        let mut out = String::new();
        let mut line = |key: &str, value: String| {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(&value);
            out.push('\n');
        };
        line("initial", self.initial_structure.display().to_string());
        line("final", self.final_structure.display().to_string());
        line("n_intermediate", self.n_intermediate.to_string());
        line("interp_fmax", self.interp_fmax.to_string());
        line("interp_steps", self.interp_steps.to_string());
        line("interpolation", self.interpolation.to_string());
        line("spring_constant", self.spring_constant.to_string());
        line("climb", self.climb.to_string());
        line("climb_activation_fmax", self.climb_activation_fmax.to_string());
        line("optimizer", self.optimizer.to_string());
        line("fmax", self.fmax.to_string());
        line("max_steps", self.max_steps.to_string());
        line("relax_atoms", format_indices(&self.relax_atoms));
        line("model", self.model.clone());
        out
    }

    /// Parses snapshot text. Unknown keys are ignored; every known key is
    /// required.
    pub fn from_snapshot(text: &str) -> Result<Self> {
        let snap = Snapshot::parse(text);
        Ok(Self {
            initial_structure: PathBuf::from(snap.raw("initial")?),
            final_structure: PathBuf::from(snap.raw("final")?),
            n_intermediate: snap.get("n_intermediate")?,
            interp_fmax: snap.get("interp_fmax")?,
            interp_steps: snap.get("interp_steps")?,
            interpolation: snap.get("interpolation")?,
            spring_constant: snap.get("spring_constant")?,
            climb: snap.get("climb")?,
            climb_activation_fmax: snap.get("climb_activation_fmax")?,
            optimizer: snap.get("optimizer")?,
            fmax: snap.get("fmax")?,
            max_steps: snap.get("max_steps")?,
            relax_atoms: snap.indices("relax_atoms")?,
            model: snap.raw("model")?.to_string(),
        })
    }

    /// Total images in the chain, endpoints included.
    pub fn total_images(&self) -> usize {
        self.n_intermediate + 2
    }

    /// Band relaxation settings drawn from these parameters.
    pub fn relax_settings(&self) -> RelaxSettings {
        RelaxSettings {
            spring_constant: self.spring_constant,
            climb: self.climb,
            climb_activation_fmax: self.climb_activation_fmax,
            optimizer: self.optimizer,
            fmax: self.fmax,
            max_steps: self.max_steps,
        }
    }

    /// Applies restart overrides, rejecting any change to the chain identity.
    pub fn apply_overrides(&self, overrides: &RestartOverrides) -> Result<Self> {
        fn forbid<T: PartialEq + fmt::Debug>(field: &str, snapshot: &T, requested: &Option<T>) -> Result<()> {
            match requested {
                Some(value) if value != snapshot => Err(CheckpointError::InvalidOverride {
                    field: field.to_string(),
                    snapshot: format!("{:?}", snapshot),
                    requested: format!("{:?}", value),
                }),
                _ => Ok(()),
            }
        }
        forbid("initial", &self.initial_structure, &overrides.initial_structure)?;
        forbid("final", &self.final_structure, &overrides.final_structure)?;
        forbid("n_intermediate", &self.n_intermediate, &overrides.n_intermediate)?;
        forbid("relax_atoms", &self.relax_atoms, &overrides.relax_atoms)?;

        let mut params = self.clone();
        if let Some(k) = overrides.spring_constant {
            params.spring_constant = k;
        }
        if let Some(climb) = overrides.climb {
            params.climb = climb;
        }
        if let Some(optimizer) = overrides.optimizer {
            params.optimizer = optimizer;
        }
        if let Some(max_steps) = overrides.max_steps {
            params.max_steps = max_steps;
        }
        if let Some(model) = &overrides.model {
            params.model = model.clone();
        }
        Ok(params)
    }
}

/// Caller-requested changes for a resumed run.
///
/// The first group may change freely; the second group may only repeat the
/// snapshot value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestartOverrides {
    /// New spring constant
    pub spring_constant: Option<f64>,
    /// New climbing flag
    pub climb: Option<bool>,
    /// New optimizer
    pub optimizer: Option<OptimizerKind>,
    /// New step budget
    pub max_steps: Option<usize>,
    /// New potential spec
    pub model: Option<String>,
    /// Must match the snapshot
    pub initial_structure: Option<PathBuf>,
    /// Must match the snapshot
    pub final_structure: Option<PathBuf>,
    /// Must match the snapshot
    pub n_intermediate: Option<usize>,
    /// Must match the snapshot
    pub relax_atoms: Option<Option<Vec<usize>>>,
}

/// Handle on a run's working directory. All artifact paths derive from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectory {
    root: PathBuf,
}

impl RunDirectory {
    /// Wraps `root`; nothing is created until something is written.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `name` inside the directory.
    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.root.join(name)
    }

    /// Parameter snapshot.
    pub fn parameters_path(&self) -> PathBuf {
        self.join("neb_parameters.txt")
    }

    /// Full trajectory, every evaluation.
    pub fn full_trajectory_path(&self) -> PathBuf {
        self.join("neb_full.xyz")
    }

    /// Compact trajectory, final images.
    pub fn final_trajectory_path(&self) -> PathBuf {
        self.join("neb_final.xyz")
    }

    /// Running log.
    pub fn log_path(&self) -> PathBuf {
        self.join("neb.log")
    }

    /// Convergence table.
    pub fn convergence_path(&self) -> PathBuf {
        self.join("neb_convergence.csv")
    }

    /// Final energy profile.
    pub fn energy_profile_path(&self) -> PathBuf {
        self.join("neb_energy_profile.csv")
    }

    /// Per-image export folder.
    pub fn images_dir(&self) -> PathBuf {
        self.join("images")
    }

    /// Run artifacts currently present, snapshot excluded.
    pub fn existing_artifacts(&self) -> Vec<PathBuf> {
        [
            self.full_trajectory_path(),
            self.final_trajectory_path(),
            self.log_path(),
            self.convergence_path(),
            self.energy_profile_path(),
            self.images_dir(),
        ]
        .into_iter()
        .filter(|p| p.exists())
        .collect()
    }
}

/// A chain rebuilt from disk together with the parameters to resume with.
#[derive(Debug, Clone)]
pub struct LoadedRun {
    /// Chain from the last complete band in the full trajectory
    pub chain: ImageChain,
    /// Effective parameters (snapshot plus overrides)
    pub params: RunParameters,
    /// Complete frames found in the trajectory
    pub frames_read: usize,
    /// Frames after the last complete band, including a cut-off tail frame
    pub dangling_frames: usize,
}

/// Saves, loads and backs up the artifacts of one run directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: RunDirectory,
    grace_period: Duration,
}

impl CheckpointManager {
    /// Manager for `dir` with the default 10 s grace period.
    pub fn new(dir: RunDirectory) -> Self {
        Self {
            dir,
            grace_period: Duration::from_secs(10),
        }
    }

    /// Sets how long to wait after warning about an interrupted trajectory.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// The managed directory.
    pub fn dir(&self) -> &RunDirectory {
        &self.dir
    }

    /// Writes the parameter snapshot, replacing any previous one atomically.
    pub fn save(&self, params: &RunParameters) -> Result<()> {
        fs::create_dir_all(self.dir.root())?;
        let target = self.dir.parameters_path();
        let tmp = target.with_extension("txt.tmp");
        fs::write(&tmp, params.to_snapshot())?;
        fs::rename(&tmp, &target)?;
        info!("run parameters saved to {}", target.display());
        Ok(())
    }

    /// Reads the parameter snapshot.
    pub fn load_parameters(&self) -> Result<RunParameters> {
        let text = fs::read_to_string(self.dir.parameters_path())?;
        RunParameters::from_snapshot(&text)
    }

    /// Rebuilds the chain from the snapshot and the full trajectory.
    pub fn load(&self) -> Result<LoadedRun> {
        let params = self.load_parameters()?;
        self.load_with(params)
    }

    fn load_with(&self, params: RunParameters) -> Result<LoadedRun> {
        let path = self.dir.full_trajectory_path();
        let read = io::read_extxyz_frames(&path)?;
        let images = params.total_images();
        let frames_read = read.frames.len();
        if frames_read < images {
            return Err(CheckpointError::IncompleteTrajectory {
                path,
                frames: frames_read,
                images,
            });
        }

        let leftover = frames_read % images;
        let dangling_frames = leftover + usize::from(read.partial_tail);
        if dangling_frames > 0 {
            warn!(
                "{} holds {} frames, not a multiple of {} images: the last write was interrupted",
                path.display(),
                frames_read + usize::from(read.partial_tail),
                images
            );
            warn!(
                "continuing from the last complete band in {} s, interrupt now to abort",
                self.grace_period.as_secs()
            );
            std::thread::sleep(self.grace_period);
        }

        let end_of_block = frames_read - leftover;
        let block = &read.frames[end_of_block - images..end_of_block];
        let start = Arc::new(block[0].config.clone());
        let end = Arc::new(block[images - 1].config.clone());
        let interior = block[1..images - 1].iter().map(|f| f.config.clone()).collect();
        let mut chain = ImageChain::from_parts(start, end, interior)?;
        for (i, frame) in block.iter().enumerate() {
            if let Some(energy) = frame.energy {
                chain.set_energy(i, energy);
            }
        }
        chain.set_relax_subset(params.relax_atoms.clone());
        info!(
            "restored {} images from band {} of {}",
            images,
            end_of_block / images,
            path.display()
        );

        Ok(LoadedRun {
            chain,
            params,
            frames_read,
            dangling_frames,
        })
    }

    /// Moves every existing run artifact into a fresh timestamped directory.
    ///
    /// Returns `None` when there was nothing to move. Either every artifact
    /// is moved or, on failure, the ones already moved are put back and the
    /// error is returned.
    pub fn backup(&self) -> Result<Option<PathBuf>> {
        let artifacts = self.dir.existing_artifacts();
        if artifacts.is_empty() {
            return Ok(None);
        }

        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut backup_dir = self.dir.join(format!("backup_{}", stamp));
        let mut suffix = 1;
        while backup_dir.exists() {
            backup_dir = self.dir.join(format!("backup_{}_{}", stamp, suffix));
            suffix += 1;
        }
        fs::create_dir(&backup_dir)?;

        let mut moved: Vec<(PathBuf, PathBuf)> = Vec::new();
        for source in artifacts {
            let Some(name) = source.file_name() else {
                continue;
            };
            let target = backup_dir.join(name);
            if let Err(e) = fs::rename(&source, &target) {
                for (from, to) in moved.iter().rev() {
                    if let Err(undo) = fs::rename(to, from) {
                        warn!("could not restore {}: {}", from.display(), undo);
                    }
                }
                let _ = fs::remove_dir(&backup_dir);
                return Err(e.into());
            }
            moved.push((source, target));
        }
        info!("moved {} artifacts to {}", moved.len(), backup_dir.display());
        Ok(Some(backup_dir))
    }

    /// Prepares a resumed run.
    ///
    /// Overrides are validated and the chain is loaded before anything is
    /// moved; only then are old artifacts backed up. The snapshot file is left
    /// unchanged.
    pub fn restart(&self, overrides: &RestartOverrides) -> Result<LoadedRun> {
        let params = self.load_parameters()?.apply_overrides(overrides)?;
        let loaded = self.load_with(params)?;
        self.backup()?;
        Ok(loaded)
    }

    /// Prepares a fresh run: backs up leftovers, then writes the snapshot.
    pub fn start_fresh(&self, params: &RunParameters) -> Result<Option<PathBuf>> {
        fs::create_dir_all(self.dir.root())?;
        let backup = self.backup()?;
        self.save(params)?;
        Ok(backup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params() -> RunParameters {
        RunParameters {
            initial_structure: PathBuf::from("a/initial.xyz"),
            final_structure: PathBuf::from("b/final.xyz"),
            n_intermediate: 3,
            interp_fmax: 0.1,
            interp_steps: 250,
            interpolation: Interpolation::Linear,
            spring_constant: 1.0 / 3.0,
            climb: true,
            climb_activation_fmax: 0.45,
            optimizer: OptimizerKind::Fire,
            fmax: 0.025,
            max_steps: 77,
            relax_atoms: Some(vec![4, 1, 9]),
            model: "morse:0.5,1.2".to_string(),
        }
    }

    #[test]
    fn test_snapshot_round_trip_is_exact() {
        let p = params();
        assert_eq!(RunParameters::from_snapshot(&p.to_snapshot()).unwrap(), p);
        let none = RunParameters::default();
        assert_eq!(RunParameters::from_snapshot(&none.to_snapshot()).unwrap(), none);
        let empty = RunParameters {
            relax_atoms: Some(Vec::new()),
            ..params()
        };
        assert_eq!(RunParameters::from_snapshot(&empty.to_snapshot()).unwrap(), empty);
    }

    #[test]
    fn test_unknown_keys_ignored_missing_keys_fail() {
        let text = format!("{}future_option: 42\n", params().to_snapshot());
        assert_eq!(RunParameters::from_snapshot(&text).unwrap(), params());

        let without: String = params()
            .to_snapshot()
            .lines()
            .filter(|l| !l.starts_with("spring_constant"))
            .map(|l| format!("{}\n", l))
            .collect();
        match RunParameters::from_snapshot(&without) {
            Err(CheckpointError::MissingRestartParameter(key)) => assert_eq!(key, "spring_constant"),
            other => panic!("expected MissingRestartParameter, got {:?}", other),
        }
    }

    #[test]
    fn test_overrides_allowed_and_forbidden() {
        let p = params();
        let allowed = RestartOverrides {
            spring_constant: Some(0.5),
            max_steps: Some(10),
            n_intermediate: Some(3),
            ..Default::default()
        };
        let q = p.apply_overrides(&allowed).unwrap();
        assert_eq!(q.spring_constant, 0.5);
        assert_eq!(q.max_steps, 10);
        assert_eq!(q.fmax, p.fmax);

        let forbidden = RestartOverrides {
            relax_atoms: Some(None),
            ..Default::default()
        };
        assert!(matches!(
            p.apply_overrides(&forbidden),
            Err(CheckpointError::InvalidOverride { field, .. }) if field == "relax_atoms"
        ));
    }

    #[test]
    fn test_backup_moves_artifacts_but_keeps_snapshot() {
        let tmp = TempDir::new().unwrap();
        let dir = RunDirectory::new(tmp.path());
        let manager = CheckpointManager::new(dir.clone());
        assert_eq!(manager.backup().unwrap(), None);

        manager.save(&params()).unwrap();
        fs::write(dir.log_path(), "log").unwrap();
        fs::create_dir(dir.images_dir()).unwrap();
        fs::write(dir.images_dir().join("00.xyz"), "x").unwrap();

        let backup = manager.backup().unwrap().unwrap();
        assert!(backup.file_name().unwrap().to_string_lossy().starts_with("backup_"));
        assert!(backup.join("neb.log").exists());
        assert!(backup.join("images").join("00.xyz").exists());
        assert!(!dir.log_path().exists());
        assert!(dir.parameters_path().exists());
    }
}
