//! Atomic configurations and periodic-cell helpers.
//!
//! This module provides the fundamental data type shared by every stage of a
//! path search:
//!
//! - [`Configuration`]: species, Cartesian coordinates, periodic cell,
//!   boundary-condition flags and the FixAtoms-equivalent constraint set
//!
//! Coordinates are stored flat (`[x1, y1, z1, x2, y2, z2, ...]`) in a
//! `DVector<f64>` so that whole images can be fed straight into the
//! optimizers. Units are Angstrom throughout.
//!
//! # Minimum-image convention
//!
//! Displacements between two configurations are folded back into the cell
//! through fractional coordinates:
//!
//! ```text
//! s = (Hᵀ)⁻¹ · d        (H rows are lattice vectors)
//! s_k -= round(s_k)     for every periodic direction k
//! d' = Hᵀ · s
//! ```
//!
//! For orthorhombic cells this is the exact minimum image; for strongly
//! skewed triclinic cells it is the usual first-shell approximation.

use nalgebra::{DVector, Matrix3, Vector3};
use thiserror::Error;

/// Errors raised while building or editing a configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    /// Coordinate vector length disagrees with the element list
    #[error("coordinate vector has {found} entries, expected {expected}")]
    CoordinateLength {
        /// Entries required (3 x atoms)
        expected: usize,
        /// Entries supplied
        found: usize,
    },
    /// Atom index outside `0..num_atoms`
    #[error("atom index {index} out of range for {num_atoms} atoms")]
    AtomIndex {
        /// Offending index
        index: usize,
        /// Number of atoms in the configuration
        num_atoms: usize,
    },
}

/// Result type for geometry operations
pub type Result<T> = std::result::Result<T, GeometryError>;

/// An atomic structure: species, positions, cell and fixed-atom set.
///
/// The species sequence and atom count never change once a configuration has
/// been placed in an image chain; only positions are rewritten.
///
/// # Examples
///
/// ```
/// use openneb::geometry::Configuration;
/// use nalgebra::Matrix3;
///
/// let config = Configuration::new(
///     vec!["H".to_string(), "H".to_string()],
///     vec![0.0, 0.0, 0.0, 0.74, 0.0, 0.0],
/// )
/// .with_cell(Matrix3::from_diagonal_element(10.0), [true, true, true]);
///
/// assert_eq!(config.num_atoms, 2);
/// assert!(config.is_periodic());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    /// Chemical element symbols for each atom in order
    pub elements: Vec<String>,
    /// Flattened Cartesian coordinates [x1, y1, z1, x2, ...] in Angstrom
    pub coords: DVector<f64>,
    /// Number of atoms
    pub num_atoms: usize,
    /// Cell matrix, one lattice vector per row
    pub cell: Matrix3<f64>,
    /// Periodic boundary flags along the three lattice vectors
    pub pbc: [bool; 3],
    fixed: Vec<usize>,
}

impl Configuration {
    /// Creates a non-periodic configuration.
    ///
    /// # Panics
    ///
    /// Panics if `coords.len() != elements.len() * 3`. Use
    /// [`Configuration::try_new`] when the input comes from a file.
    pub fn new(elements: Vec<String>, coords: Vec<f64>) -> Self {
        let num_atoms = elements.len();
        assert_eq!(coords.len(), num_atoms * 3);
        Self {
            elements,
            coords: DVector::from_vec(coords),
            num_atoms,
            cell: Matrix3::zeros(),
            pbc: [false; 3],
            fixed: Vec::new(),
        }
    }

    /// Fallible variant of [`Configuration::new`].
    pub fn try_new(elements: Vec<String>, coords: Vec<f64>) -> Result<Self> {
        if coords.len() != elements.len() * 3 {
            return Err(GeometryError::CoordinateLength {
                expected: elements.len() * 3,
                found: coords.len(),
            });
        }
        Ok(Self::new(elements, coords))
    }

    /// Attaches a cell and boundary flags.
    pub fn with_cell(mut self, cell: Matrix3<f64>, pbc: [bool; 3]) -> Self {
        self.cell = cell;
        self.pbc = pbc;
        self
    }

    /// True when at least one direction is periodic and the cell has volume.
    pub fn is_periodic(&self) -> bool {
        self.pbc.iter().any(|&p| p) && self.cell.determinant().abs() > 1e-12
    }

    /// Position of one atom.
    pub fn atom_position(&self, atom_idx: usize) -> Vector3<f64> {
        let i = atom_idx * 3;
        Vector3::new(self.coords[i], self.coords[i + 1], self.coords[i + 2])
    }

    /// Overwrites one atom's position regardless of constraints.
    pub fn set_atom_position(&mut self, atom_idx: usize, position: Vector3<f64>) {
        let i = atom_idx * 3;
        self.coords[i] = position.x;
        self.coords[i + 1] = position.y;
        self.coords[i + 2] = position.z;
    }

    /// Sorted indices of atoms held fixed.
    pub fn fixed(&self) -> &[usize] {
        &self.fixed
    }

    /// Whether atom `atom_idx` is held fixed.
    pub fn is_fixed(&self, atom_idx: usize) -> bool {
        self.fixed.binary_search(&atom_idx).is_ok()
    }

    /// Replaces the fixed-atom set.
    ///
    /// Indices are validated, sorted and deduplicated.
    pub fn fix_atoms(&mut self, indices: &[usize]) -> Result<()> {
        if let Some(&index) = indices.iter().find(|&&i| i >= self.num_atoms) {
            return Err(GeometryError::AtomIndex {
                index,
                num_atoms: self.num_atoms,
            });
        }
        let mut fixed = indices.to_vec();
        fixed.sort_unstable();
        fixed.dedup();
        self.fixed = fixed;
        Ok(())
    }

    /// Removes every constraint and returns the indices that were fixed.
    pub fn clear_constraints(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.fixed)
    }

    /// Sets all positions, leaving fixed atoms where they are.
    ///
    /// This is the only path used by relaxation steps.
    pub fn set_positions(&mut self, coords: &DVector<f64>) {
        debug_assert_eq!(coords.len(), self.coords.len());
        for atom in 0..self.num_atoms {
            if self.is_fixed(atom) {
                continue;
            }
            let i = atom * 3;
            self.coords[i] = coords[i];
            self.coords[i + 1] = coords[i + 1];
            self.coords[i + 2] = coords[i + 2];
        }
    }

    /// Sets all positions including fixed atoms. Used by interpolation only.
    pub fn set_positions_unconstrained(&mut self, coords: &DVector<f64>) {
        debug_assert_eq!(coords.len(), self.coords.len());
        self.coords.copy_from(coords);
    }

    /// Zeroes the force components of fixed atoms.
    pub fn zero_fixed(&self, forces: &mut DVector<f64>) {
        for &atom in &self.fixed {
            let i = atom * 3;
            forces[i] = 0.0;
            forces[i + 1] = 0.0;
            forces[i + 2] = 0.0;
        }
    }

    /// Same atom count and species ordering.
    pub fn same_shape(&self, other: &Configuration) -> bool {
        self.num_atoms == other.num_atoms && self.elements == other.elements
    }

    /// Replaces the cell, moving atoms so their fractional coordinates are kept
    /// (`scale_atoms` semantics).
    pub fn set_cell_scaled(&mut self, new_cell: Matrix3<f64>) {
        if let Some(to_fractional) = self.cell.transpose().try_inverse() {
            let to_cartesian = new_cell.transpose();
            for atom in 0..self.num_atoms {
                let scaled = to_cartesian * (to_fractional * self.atom_position(atom));
                self.set_atom_position(atom, scaled);
            }
        }
        self.cell = new_cell;
    }

    /// Folds a displacement vector into the minimum image of this cell.
    pub fn minimum_image(&self, delta: Vector3<f64>) -> Vector3<f64> {
        if !self.is_periodic() {
            return delta;
        }
        let to_cartesian = self.cell.transpose();
        let Some(to_fractional) = to_cartesian.try_inverse() else {
            return delta;
        };
        let mut frac = to_fractional * delta;
        for k in 0..3 {
            if self.pbc[k] {
                frac[k] -= frac[k].round();
            }
        }
        to_cartesian * frac
    }

    /// Per-atom displacement `other - self` under the minimum-image convention.
    pub fn mic_displacement(&self, other: &Configuration) -> DVector<f64> {
        let mut out = DVector::zeros(self.coords.len());
        for atom in 0..self.num_atoms {
            let d = self.minimum_image(other.atom_position(atom) - self.atom_position(atom));
            let i = atom * 3;
            out[i] = d.x;
            out[i + 1] = d.y;
            out[i + 2] = d.z;
        }
        out
    }

    /// Moves every atom to the periodic image closest to the same atom in
    /// `reference`.
    pub fn wrap_against(&mut self, reference: &Configuration) {
        let shifted = &reference.coords + reference.mic_displacement(self);
        self.coords = shifted;
    }

    /// Largest per-atom distance to `other` under the minimum-image convention.
    pub fn max_displacement(&self, other: &Configuration) -> f64 {
        max_atom_norm(&self.mic_displacement(other))
    }
}

/// Largest per-atom Euclidean norm of a flat 3N vector.
///
/// This is the `fmax` measure when applied to forces.
pub fn max_atom_norm(v: &DVector<f64>) -> f64 {
    v.as_slice()
        .chunks_exact(3)
        .map(|c| (c[0] * c[0] + c[1] * c[1] + c[2] * c[2]).sqrt())
        .fold(0.0, f64::max)
}
