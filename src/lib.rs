#![warn(missing_docs)]

//! OpenNEB - Reaction-path searches with the Nudged Elastic Band method
//!
//! OpenNEB finds minimum-energy paths and transition states between two
//! atomic configurations. A chain of intermediate images is built between
//! the start and end states and relaxed under spring-coupled band forces,
//! optionally with a climbing image that converges onto the saddle point.
//!
//! # Overview
//!
//! A run goes through these stages:
//!
//! 1. **Endpoint relaxation** (optional): both endpoints are relaxed on their
//!    own and compared; nearly identical endpoints are reported as a likely
//!    degenerate path.
//! 2. **Path construction**: the end cell is rescaled onto the start cell,
//!    interior images are placed by linear interpolation under the
//!    minimum-image convention, then optionally refined with IDPP.
//! 3. **Band relaxation**: interior images move under the band force until
//!    the largest per-atom band force drops below `fmax` or the step budget
//!    runs out.
//! 4. **Checkpointing**: every step is appended to a full trajectory so an
//!    interrupted run can be resumed from its last complete band.
//!
//! AutoNEB replaces stage 2: it starts from the two endpoints alone and
//! inserts images one at a time into the widest gap.
//!
//! # Band force
//!
//! For an interior image `i` with tangent `τ` (upwinded towards the higher
//! energy neighbour):
//!
//! ```text
//! F_band = F - (F · τ) τ + k (|R_{i+1} - R_i| - |R_i - R_{i-1}|) τ
//! ```
//!
//! The climbing image instead uses `F - 2 (F · τ) τ` and has no spring term.
//!
//! # Quick Start
//!
//! ```no_run
//! use openneb::checkpoint::RunDirectory;
//! use openneb::io::read_extxyz;
//! use openneb::neb::{run_in_directory, RelaxSettings};
//! use openneb::path::PathBuilder;
//! use openneb::potential::PotentialRegistry;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let start = read_extxyz(Path::new("initial.xyz"))?.config;
//!     let end = read_extxyz(Path::new("final.xyz"))?.config;
//!     let potential = PotentialRegistry::with_builtin().create("lj")?;
//!
//!     let mut chain = PathBuilder::new().build(Arc::new(start), Arc::new(end), 5)?;
//!     let dir = RunDirectory::new("neb_run");
//!     let outcome = run_in_directory(&dir, &mut chain, potential, &RelaxSettings::default())?;
//!     println!("converged: {}", outcome.converged);
//!     Ok(())
//! }
//! ```
//!
//! # Potentials
//!
//! | Name | Description |
//! |------|-------------|
//! | `lj[:eps,sigma,cutoff]` | Shifted Lennard-Jones pair potential |
//! | `morse[:D,alpha,r0,cutoff]` | Shifted Morse pair potential |
//! | `external:<command>` | Any program printing `energy:` and force lines |
//!
//! # Optimizers
//!
//! - **FIRE**: velocity-based, robust far from convergence; AutoNEB default
//! - **BFGS**: dense quasi-Newton with per-atom step limit; NEB default
//! - **L-BFGS**: limited-memory quasi-Newton
//! - **MDMin**: damped molecular dynamics; used for IDPP refinement
//!
//! # Modules
//!
//! - [`geometry`] - Atomic configurations, cells and fixed atoms
//! - [`io`] - Extended XYZ files, convergence logs and energy profiles
//! - [`potential`] - Energy and force backends and their registry
//! - [`path`] - Image chains and the path builder
//! - [`interpolation`] - Linear and IDPP interpolation
//! - [`optimizer`] - FIRE, BFGS, L-BFGS and MDMin steppers
//! - [`neb`] - Band forces and band relaxation
//! - [`checkpoint`] - Run parameters, restart and backups
//! - [`endpoint`] - Endpoint relaxation and similarity check
//! - [`autoneb`] - Adaptive band growth
//! - [`md`] - Velocity-Verlet molecular dynamics
//! - [`settings`] - Configuration files
//!
//! # References
//!
//! - Henkelman, G.; Jónsson, H. *J. Chem. Phys.* **2000**, 113, 9978.
//! - Henkelman, G.; Uberuaga, B. P.; Jónsson, H. *J. Chem. Phys.* **2000**, 113, 9901.
//! - Smidstrup, S. et al. *J. Chem. Phys.* **2014**, 140, 214106.
//! - Kolsbjerg, E. L.; Groves, M. N.; Hammer, B. *J. Chem. Phys.* **2016**, 145, 094107.

/// Adaptive band growth
pub mod autoneb;
/// Run parameters, restart and backups
pub mod checkpoint;
pub mod endpoint;
pub mod geometry;
pub mod interpolation;
pub mod io;
pub mod md;
pub mod neb;
pub mod optimizer;
pub mod path;
pub mod potential;
/// Configuration management system
pub mod settings;

pub use geometry::Configuration;
pub use path::{ImageChain, PathBuilder};
pub use potential::{Potential, PotentialRegistry};
