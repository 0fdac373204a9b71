mod common;

use common::{particle, CurvedDoubleWell};
use openneb::autoneb::{AutoNeb, AutoNebError, AutoNebParameters, AutoNebState};
use openneb::checkpoint::{Interpolation, RunDirectory};
use openneb::io;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn params(n_target: usize) -> AutoNebParameters {
    AutoNebParameters {
        n_target,
        spring_constant: 0.5,
        interpolation: Interpolation::Linear,
        max_steps_per_relax: 200,
        fmax: 0.01,
        model: "curved-double-well".to_string(),
        ..AutoNebParameters::default()
    }
}

fn read_state(dir: &RunDirectory) -> AutoNebState {
    serde_json::from_str(&fs::read_to_string(dir.join("autoneb_state.json")).unwrap()).unwrap()
}

#[test]
fn test_band_grows_to_target_and_climbs() {
    let tmp = TempDir::new().unwrap();
    let dir = RunDirectory::new(tmp.path());
    let runner = AutoNeb::new(dir.clone(), Arc::new(CurvedDoubleWell), params(5));
    let outcome = runner.grow(particle(-1.0, 0.0), particle(1.0, 0.0)).unwrap();

    assert_eq!(outcome.chain.len(), 5);
    assert_eq!(outcome.insertions, 3);
    assert!(outcome.chain.energies().iter().all(Option::is_some));

    // endpoints never move
    assert_eq!(outcome.chain.start(), &particle(-1.0, 0.0));
    assert_eq!(outcome.chain.end(), &particle(1.0, 0.0));

    // images stay ordered along x
    let xs: Vec<f64> = outcome.chain.images().map(|c| c.atom_position(0).x).collect();
    assert!(xs.windows(2).all(|w| w[0] < w[1]), "{:?}", xs);

    if outcome.converged {
        let (forward, _) = outcome.chain.barriers().unwrap();
        assert!((forward - 1.0).abs() < 1e-2);
    }

    for i in 0..5 {
        let frame = io::read_extxyz(&dir.join(format!("autoneb{:03}.xyz", i))).unwrap();
        assert_eq!(frame.config, *outcome.chain.image(i));
    }
    for iteration in 1..=3 {
        let path = dir.join("AutoNEB_iter").join(format!("iter{:03}.xyz", iteration));
        let frames = io::read_extxyz_frames(&path).unwrap();
        assert_eq!(frames.frames.len(), 2 + iteration);
    }
    assert!(dir.join("autoneb_parameters.txt").exists());
    assert!(dir.join("autoneb_energy_profile.csv").exists());

    let state = read_state(&dir);
    assert!(state.finished);
    assert_eq!(state.iteration, 3);
    assert_eq!(state.n_images, 5);
    for (saved, current) in state.energies.iter().zip(outcome.chain.energies()) {
        assert!((saved.unwrap() - current.unwrap()).abs() < 1e-12);
    }
}

#[test]
fn test_resume_reads_saved_parameters() {
    let tmp = TempDir::new().unwrap();
    let dir = RunDirectory::new(tmp.path());
    let first = AutoNebParameters {
        prefix: "band".to_string(),
        ..params(4)
    };
    AutoNeb::new(dir.clone(), Arc::new(CurvedDoubleWell), first.clone())
        .grow(particle(-1.0, 0.0), particle(1.0, 0.0))
        .unwrap();
    assert_eq!(read_state(&dir).n_images, 4);

    // raising the target is the only change a resume accepts
    let outcome = AutoNeb::resume(dir.clone(), Arc::new(CurvedDoubleWell), Some(6)).unwrap();
    assert_eq!(outcome.chain.len(), 6);
    assert_eq!(outcome.insertions, 2);
    assert!(dir.join("band005.xyz").exists());
    assert!(!dir.join("autoneb000.xyz").exists());

    let saved = AutoNebParameters::load(&dir).unwrap();
    assert_eq!(saved, AutoNebParameters { n_target: 6, ..first });

    let state = read_state(&dir);
    assert_eq!(state.iteration, 4);
    assert_eq!(state.n_images, 6);
    assert!(state.finished);
    assert!(dir.join("AutoNEB_iter").join("iter004.xyz").exists());
}

#[test]
fn test_resume_of_finished_run_does_not_relax_again() {
    let tmp = TempDir::new().unwrap();
    let dir = RunDirectory::new(tmp.path());
    let grown = AutoNeb::new(dir.clone(), Arc::new(CurvedDoubleWell), params(4))
        .grow(particle(-1.0, 0.0), particle(1.0, 0.0))
        .unwrap();
    let state_before = fs::read_to_string(dir.join("autoneb_state.json")).unwrap();

    let outcome = AutoNeb::resume(dir.clone(), Arc::new(CurvedDoubleWell), None).unwrap();
    assert_eq!(outcome.insertions, 0);
    assert_eq!(outcome.converged, grown.converged);
    assert_eq!(outcome.chain.len(), 4);
    assert_eq!(fs::read_to_string(dir.join("autoneb_state.json")).unwrap(), state_before);

    assert!(matches!(
        AutoNeb::resume(dir, Arc::new(CurvedDoubleWell), Some(3)),
        Err(AutoNebError::ShrinkingTarget { target: 3, images: 4 })
    ));
}

#[test]
fn test_relax_subset_is_applied_to_inserted_images() {
    let tmp = TempDir::new().unwrap();
    let dir = RunDirectory::new(tmp.path());
    let h = || vec!["H".to_string(), "H".to_string()];
    let start = openneb::Configuration::new(h(), vec![0.0, 0.0, 0.0, 3.0, 0.0, 0.0]);
    let end = openneb::Configuration::new(h(), vec![0.0, 0.0, 0.0, 4.0, 0.0, 0.0]);
    let p = AutoNebParameters {
        n_target: 3,
        relax_atoms: Some(vec![1]),
        climb: false,
        max_steps_per_relax: 20,
        ..AutoNebParameters::default()
    };
    let outcome = AutoNeb::new(dir, Arc::new(openneb::potential::LennardJones::default()), p)
        .grow(start, end)
        .unwrap();
    let inserted = outcome.chain.image(1);
    assert_eq!(inserted.fixed(), &[0]);
    assert_eq!(inserted.atom_position(0), nalgebra::Vector3::zeros());
}
