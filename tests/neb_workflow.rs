mod common;

use common::{particle, CurvedDoubleWell};
use nalgebra::Vector3;
use openneb::checkpoint::{
    CheckpointError, CheckpointManager, Interpolation, RestartOverrides, RunDirectory, RunParameters,
};
use openneb::endpoint::{check_similarity, SimilarityThresholds};
use openneb::interpolation::interpolate_idpp;
use openneb::io;
use openneb::neb::run_in_directory;
use openneb::optimizer::OptimizerKind;
use openneb::{Configuration, ImageChain, PathBuilder};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn params(max_steps: usize, climb: bool) -> RunParameters {
    RunParameters {
        initial_structure: PathBuf::from("initial.xyz"),
        final_structure: PathBuf::from("final.xyz"),
        n_intermediate: 3,
        interpolation: Interpolation::Linear,
        spring_constant: 0.5,
        climb,
        optimizer: OptimizerKind::Fire,
        fmax: 0.01,
        max_steps,
        model: "curved-double-well".to_string(),
        ..RunParameters::default()
    }
}

fn run_fresh(dir: &RunDirectory, params: &RunParameters) -> ImageChain {
    CheckpointManager::new(dir.clone()).start_fresh(params).unwrap();
    let mut chain = PathBuilder::new()
        .build(
            Arc::new(particle(-1.0, 0.0)),
            Arc::new(particle(1.0, 0.0)),
            params.n_intermediate,
        )
        .unwrap();
    run_in_directory(dir, &mut chain, Arc::new(CurvedDoubleWell), &params.relax_settings()).unwrap();
    chain
}

fn read_tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.insert(path.clone(), fs::read(&path).unwrap());
            }
        }
    }
    files
}

#[test]
fn test_three_atom_relax_subset_example() {
    let h = || vec!["H".to_string(), "H".to_string(), "H".to_string()];
    let start = Configuration::new(h(), vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0, 2.0, 2.0]);
    let end = Configuration::new(h(), vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 3.0, 3.0, 3.0]);

    let mut chain = PathBuilder::new()
        .with_relax_subset(Some(vec![1]))
        .build(Arc::new(start), Arc::new(end), 1)
        .unwrap();
    assert_eq!(chain.len(), 3);

    let image = &chain.interior()[0];
    assert_eq!(image.atom_position(0), Vector3::new(0.5, 0.5, 0.5));
    assert_eq!(image.atom_position(2), Vector3::new(2.5, 2.5, 2.5));
    assert_eq!(image.fixed(), &[0, 2]);
    assert!(!image.is_fixed(1));

    let before = chain.interior().to_vec();
    let outcome = interpolate_idpp(&mut chain, 0.1, 100).unwrap();
    assert!(outcome.skipped);
    assert_eq!(chain.interior(), &before[..]);
}

#[test]
fn test_climbing_band_finds_curved_saddle() {
    let tmp = TempDir::new().unwrap();
    let dir = RunDirectory::new(tmp.path());
    let p = params(3000, true);
    let chain = run_fresh(&dir, &p);

    let saddle = chain.image(2).atom_position(0);
    assert!(saddle.x.abs() < 1e-2, "saddle x = {}", saddle.x);
    assert!((saddle.y - 0.3).abs() < 1e-2, "saddle y = {}", saddle.y);
    let (forward, reverse) = chain.barriers().unwrap();
    assert!((forward - 1.0).abs() < 1e-3);
    assert!((reverse - 1.0).abs() < 1e-3);

    let csv = fs::read_to_string(dir.convergence_path()).unwrap();
    let steps: Vec<usize> = csv
        .lines()
        .skip(1)
        .map(|l| l.split(',').next().unwrap().parse().unwrap())
        .collect();
    assert_eq!(steps, (0..steps.len()).collect::<Vec<_>>());

    let full = io::read_extxyz_frames(&dir.full_trajectory_path()).unwrap();
    assert_eq!(full.frames.len(), steps.len() * chain.len());
    let compact = io::read_extxyz_frames(&dir.final_trajectory_path()).unwrap();
    assert_eq!(compact.frames.len(), chain.len());
    assert!(dir.images_dir().join("04.xyz").exists());
    assert!(dir.energy_profile_path().exists());
}

#[test]
fn test_restart_resumes_from_last_band() {
    let tmp = TempDir::new().unwrap();
    let dir = RunDirectory::new(tmp.path());
    let p = params(5, false);
    let first = run_fresh(&dir, &p);
    let snapshot_text = fs::read_to_string(dir.parameters_path()).unwrap();

    let manager = CheckpointManager::new(dir.clone()).with_grace_period(Duration::ZERO);
    assert_eq!(manager.load_parameters().unwrap(), p);

    let overrides = RestartOverrides {
        climb: Some(true),
        max_steps: Some(3000),
        n_intermediate: Some(3),
        ..RestartOverrides::default()
    };
    let mut loaded = manager.restart(&overrides).unwrap();
    assert_eq!(loaded.dangling_frames, 0);
    assert_eq!(loaded.frames_read, 6 * 5);
    assert_eq!(loaded.chain.interior(), first.interior());
    assert!(loaded.params.climb);
    assert_eq!(loaded.params.max_steps, 3000);
    assert_eq!(loaded.params.spring_constant, p.spring_constant);
    assert_eq!(loaded.params.optimizer, p.optimizer);

    // old artifacts moved aside, snapshot untouched
    assert!(!dir.full_trajectory_path().exists());
    assert_eq!(fs::read_to_string(dir.parameters_path()).unwrap(), snapshot_text);
    let backups: Vec<PathBuf> = fs::read_dir(tmp.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("backup_"))
        .collect();
    assert_eq!(backups.len(), 1);
    assert!(backups[0].join("neb_full.xyz").exists());
    assert!(backups[0].join("images").is_dir());

    let outcome = run_in_directory(
        &dir,
        &mut loaded.chain,
        Arc::new(CurvedDoubleWell),
        &loaded.params.relax_settings(),
    )
    .unwrap();
    assert!(outcome.converged);
    assert_eq!(outcome.climbing_image, Some(2));
}

#[test]
fn test_forbidden_override_leaves_directory_untouched() {
    let tmp = TempDir::new().unwrap();
    let dir = RunDirectory::new(tmp.path());
    run_fresh(&dir, &params(3, false));
    let before = read_tree(tmp.path());

    let manager = CheckpointManager::new(dir).with_grace_period(Duration::ZERO);
    let overrides = RestartOverrides {
        n_intermediate: Some(4),
        spring_constant: Some(2.0),
        ..RestartOverrides::default()
    };
    let err = manager.restart(&overrides).unwrap_err();
    assert!(matches!(err, CheckpointError::InvalidOverride { ref field, .. } if field == "n_intermediate"));

    let relax = RestartOverrides {
        relax_atoms: Some(Some(vec![0])),
        ..RestartOverrides::default()
    };
    assert!(matches!(
        manager.restart(&relax),
        Err(CheckpointError::InvalidOverride { .. })
    ));

    assert_eq!(read_tree(tmp.path()), before);
}

#[test]
fn test_interrupted_trajectory_resumes_from_last_complete_band() {
    let tmp = TempDir::new().unwrap();
    let dir = RunDirectory::new(tmp.path());
    let chain = run_fresh(&dir, &params(2, false));

    let stray = particle(5.0, 5.0);
    io::append_frames(&dir.full_trajectory_path(), &[(&stray, Some(9.0)), (&stray, None)]).unwrap();

    let manager = CheckpointManager::new(dir).with_grace_period(Duration::ZERO);
    let loaded = manager.load().unwrap();
    assert_eq!(loaded.dangling_frames, 2);
    assert_eq!(loaded.frames_read, 3 * 5 + 2);
    assert_eq!(loaded.chain.interior(), chain.interior());
    assert_eq!(loaded.chain.energies(), chain.energies());
}

#[test]
fn test_trajectory_cut_inside_a_number_is_detected() {
    let tmp = TempDir::new().unwrap();
    let dir = RunDirectory::new(tmp.path());
    let chain = run_fresh(&dir, &params(2, false));

    let full = fs::read(dir.full_trajectory_path()).unwrap();
    fs::write(dir.full_trajectory_path(), &full[..full.len() - 4]).unwrap();

    let manager = CheckpointManager::new(dir).with_grace_period(Duration::ZERO);
    let loaded = manager.load().unwrap();
    assert_eq!(loaded.frames_read, 3 * 5 - 1);
    assert_eq!(loaded.dangling_frames, 5);
    assert_eq!(loaded.chain.end(), chain.end());
    assert_eq!(loaded.chain.len(), 5);
}

#[test]
fn test_missing_snapshot_key_fails_restart() {
    let tmp = TempDir::new().unwrap();
    let dir = RunDirectory::new(tmp.path());
    run_fresh(&dir, &params(1, false));
    let text = fs::read_to_string(dir.parameters_path()).unwrap();
    let trimmed: String = text
        .lines()
        .filter(|l| !l.starts_with("spring_constant"))
        .map(|l| format!("{}\n", l))
        .collect();
    fs::write(dir.parameters_path(), trimmed).unwrap();

    let manager = CheckpointManager::new(dir.clone()).with_grace_period(Duration::ZERO);
    assert!(matches!(
        manager.restart(&RestartOverrides::default()),
        Err(CheckpointError::MissingRestartParameter(ref key)) if key == "spring_constant"
    ));
    assert!(dir.full_trajectory_path().exists());
}

#[test]
fn test_endpoint_similarity_flags_degenerate_paths() {
    let thresholds = SimilarityThresholds::default();
    let near = check_similarity(&particle(0.0, 0.0), -2.0, &particle(0.2, 0.1), -2.005, &thresholds);
    assert!(near.degenerate);
    let far = check_similarity(&particle(0.0, 0.0), -2.0, &particle(2.0, 0.0), -1.5, &thresholds);
    assert!(!far.degenerate);
}
