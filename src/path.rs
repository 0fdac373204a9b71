//! The image chain and its construction.
//!
//! An [`ImageChain`] is the band: the two endpoints plus an ordered run of
//! interior images. The endpoints are held behind [`Arc`] and the chain never
//! hands out mutable access to them, so relaxation can only ever move interior
//! atoms. Interior images are owned outright.
//!
//! [`PathBuilder`] produces a chain from two endpoints:
//!
//! 1. validate atom count and species ordering (`ShapeMismatch`)
//! 2. rescale the end cell onto the start cell, keeping fractional positions
//! 3. copy the start into every interior slot
//! 4. lift the global fixed set, interpolate linearly under the minimum-image
//!    convention, restore the fixed set
//! 5. in relax-subset mode, fix every atom outside the subset
//!
//! IDPP refinement is a separate step ([`crate::interpolation::interpolate_idpp`])
//! because it needs a relaxation loop.

use crate::geometry::{Configuration, GeometryError};
use crate::interpolation;
use log::{debug, info};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while building or editing an image chain.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PathError {
    /// Endpoints disagree on atom count or species ordering
    #[error("start and end differ: {0}")]
    ShapeMismatch(String),
    /// A relax-subset index is outside the configuration
    #[error("relax index {index} out of range for {num_atoms} atoms")]
    InvalidRelaxIndex {
        /// Offending index
        index: usize,
        /// Atom count of the endpoints
        num_atoms: usize,
    },
    /// Insertion position outside the chain
    #[error("gap {gap} does not exist in a chain of {len} images")]
    InvalidGap {
        /// Requested gap (between images `gap` and `gap + 1`)
        gap: usize,
        /// Current chain length
        len: usize,
    },
    /// Geometry-level failure
    #[error("geometry error: {0}")]
    Geometry(#[from] GeometryError),
}

/// Result type for chain operations
pub type Result<T> = std::result::Result<T, PathError>;

/// Rejects relax-subset indices outside `0..num_atoms`.
pub fn check_relax_subset(subset: Option<&[usize]>, num_atoms: usize) -> Result<()> {
    match subset.and_then(|s| s.iter().find(|&&i| i >= num_atoms)) {
        Some(&index) => Err(PathError::InvalidRelaxIndex { index, num_atoms }),
        None => Ok(()),
    }
}

pub(crate) fn check_shape(reference: &Configuration, other: &Configuration) -> Result<()> {
    if reference.num_atoms != other.num_atoms {
        return Err(PathError::ShapeMismatch(format!(
            "{} atoms vs {} atoms",
            reference.num_atoms, other.num_atoms
        )));
    }
    if let Some(i) = (0..reference.num_atoms).find(|&i| reference.elements[i] != other.elements[i]) {
        return Err(PathError::ShapeMismatch(format!(
            "atom {} is {} in one and {} in the other",
            i, reference.elements[i], other.elements[i]
        )));
    }
    Ok(())
}

/// Ordered band of images between two shared, read-only endpoints.
#[derive(Debug, Clone)]
pub struct ImageChain {
    start: Arc<Configuration>,
    end: Arc<Configuration>,
    interior: Vec<Configuration>,
    energies: Vec<Option<f64>>,
    relax_subset: Option<Vec<usize>>,
}

#[allow(clippy::len_without_is_empty)]
impl ImageChain {
    /// Assembles a chain from parts, checking that every image has the
    /// endpoints' shape.
    pub fn from_parts(
        start: Arc<Configuration>,
        end: Arc<Configuration>,
        interior: Vec<Configuration>,
    ) -> Result<Self> {
        check_shape(&start, &end)?;
        for image in &interior {
            check_shape(&start, image)?;
        }
        let energies = vec![None; interior.len() + 2];
        Ok(Self {
            start,
            end,
            interior,
            energies,
            relax_subset: None,
        })
    }

    /// Total number of images including both endpoints.
    pub fn len(&self) -> usize {
        self.interior.len() + 2
    }

    /// Number of interior images.
    pub fn num_intermediate(&self) -> usize {
        self.interior.len()
    }

    /// The start endpoint.
    pub fn start(&self) -> &Configuration {
        &self.start
    }

    /// The end endpoint.
    pub fn end(&self) -> &Configuration {
        &self.end
    }

    /// Shared handle to the start endpoint.
    pub fn start_shared(&self) -> Arc<Configuration> {
        Arc::clone(&self.start)
    }

    /// Shared handle to the end endpoint.
    pub fn end_shared(&self) -> Arc<Configuration> {
        Arc::clone(&self.end)
    }

    /// Image `index`, counting the start as 0.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn image(&self, index: usize) -> &Configuration {
        let last = self.len() - 1;
        match index {
            0 => &self.start,
            i if i == last => &self.end,
            i if i < last => &self.interior[i - 1],
            _ => panic!("image index {} out of range for {} images", index, self.len()),
        }
    }

    /// All images in band order.
    pub fn images(&self) -> impl Iterator<Item = &Configuration> + '_ {
        std::iter::once(self.start.as_ref())
            .chain(self.interior.iter())
            .chain(std::iter::once(self.end.as_ref()))
    }

    /// Interior images.
    pub fn interior(&self) -> &[Configuration] {
        &self.interior
    }

    /// Mutable interior images. Endpoints are never reachable mutably.
    pub fn interior_mut(&mut self) -> &mut [Configuration] {
        &mut self.interior
    }

    /// Last known energy of image `index`.
    pub fn energy(&self, index: usize) -> Option<f64> {
        self.energies.get(index).copied().flatten()
    }

    /// Records the energy of image `index`.
    pub fn set_energy(&mut self, index: usize, energy: f64) {
        self.energies[index] = Some(energy);
    }

    /// Energies of all images, `None` where not yet evaluated.
    pub fn energies(&self) -> &[Option<f64>] {
        &self.energies
    }

    /// Forgets every stored energy.
    pub fn clear_energies(&mut self) {
        self.energies.iter_mut().for_each(|e| *e = None);
    }

    /// Atoms allowed to move when the chain was built in relax-subset mode.
    pub fn relax_subset(&self) -> Option<&[usize]> {
        self.relax_subset.as_deref()
    }

    /// Marks the chain as built in relax-subset mode.
    pub fn set_relax_subset(&mut self, subset: Option<Vec<usize>>) {
        self.relax_subset = subset;
    }

    /// Index of the highest-energy image among those evaluated.
    ///
    /// Ties resolve to the lowest index.
    pub fn max_energy_index(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, e) in self.energies.iter().enumerate() {
            if let Some(e) = *e {
                if best.map_or(true, |(_, b)| e > b) {
                    best = Some((i, e));
                }
            }
        }
        best.map(|(i, _)| i)
    }

    /// Highest image energy minus the start energy.
    pub fn barrier_height(&self) -> Option<f64> {
        let top = self.energy(self.max_energy_index()?)?;
        Some(top - self.energy(0)?)
    }

    /// Forward and reverse barriers, available once every image has an energy.
    pub fn barriers(&self) -> Option<(f64, f64)> {
        if self.energies.iter().any(Option::is_none) {
            return None;
        }
        let top = self.energy(self.max_energy_index()?)?;
        Some((top - self.energy(0)?, top - self.energy(self.len() - 1)?))
    }

    /// Returns a chain one image longer, with `image` placed between images
    /// `gap` and `gap + 1`.
    ///
    /// Known energies move with their images; the new image starts unevaluated.
    pub fn with_inserted(mut self, gap: usize, image: Configuration) -> Result<Self> {
        if gap + 1 >= self.len() {
            return Err(PathError::InvalidGap { gap, len: self.len() });
        }
        check_shape(&self.start, &image)?;
        self.interior.insert(gap, image);
        self.energies.insert(gap + 1, None);
        Ok(self)
    }
}

/// Builds image chains from two endpoints.
#[derive(Debug, Clone, Default)]
pub struct PathBuilder {
    relax_subset: Option<Vec<usize>>,
}

impl PathBuilder {
    /// Builder for a fully mobile band.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts relaxation to `indices`; all other atoms are fixed on every
    /// interior image.
    pub fn with_relax_subset(mut self, indices: Option<Vec<usize>>) -> Self {
        self.relax_subset = indices;
        self
    }

    /// The relax subset, if any.
    pub fn relax_subset(&self) -> Option<&[usize]> {
        self.relax_subset.as_deref()
    }

    /// Builds a chain with `n_intermediate` linearly interpolated interior
    /// images.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when the endpoints disagree on atoms, and
    /// `InvalidRelaxIndex` for an out-of-range relax-subset index. Both are
    /// raised before any interpolation.
    pub fn build(
        &self,
        start: Arc<Configuration>,
        end: Arc<Configuration>,
        n_intermediate: usize,
    ) -> Result<ImageChain> {
        check_shape(&start, &end)?;
        check_relax_subset(self.relax_subset(), start.num_atoms)?;

        let end = if end.cell != start.cell {
            let mut rescaled = (*end).clone();
            if rescaled.cell.determinant().abs() > 1e-12 && start.cell.determinant().abs() > 1e-12 {
                rescaled.set_cell_scaled(start.cell);
            } else {
                rescaled.cell = start.cell;
            }
            debug!("end cell reset to the start cell");
            Arc::new(rescaled)
        } else {
            end
        };

        let global_fixed = start.fixed().to_vec();
        let interior = (0..n_intermediate)
            .map(|_| {
                let mut image = (*start).clone();
                image.clear_constraints();
                image
            })
            .collect();
        let mut chain = ImageChain::from_parts(start, end, interior)?;

        interpolation::interpolate_linear(&mut chain, true);

        let fixed = match &self.relax_subset {
            Some(subset) => {
                let mut fixed: Vec<usize> = (0..chain.start().num_atoms)
                    .filter(|i| !subset.contains(i))
                    .collect();
                fixed.extend_from_slice(&global_fixed);
                fixed
            }
            None => global_fixed,
        };
        for image in chain.interior_mut() {
            image.fix_atoms(&fixed)?;
        }
        chain.set_relax_subset(self.relax_subset.clone());
        if let (Some(subset), Some(image)) = (&self.relax_subset, chain.interior().first()) {
            info!(
                "relax subset of {} atoms, {} atoms fixed on interior images",
                subset.len(),
                image.fixed().len()
            );
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};

    fn config(coords: Vec<f64>) -> Configuration {
        let elements = vec!["Cu".to_string(); coords.len() / 3];
        Configuration::new(elements, coords)
    }

    fn energies(chain: &mut ImageChain, values: &[f64]) {
        for (i, &e) in values.iter().enumerate() {
            chain.set_energy(i, e);
        }
    }

    #[test]
    fn test_build_rejects_species_mismatch() {
        let start = Arc::new(config(vec![0.0; 6]));
        let mut end = config(vec![1.0; 6]);
        end.elements[1] = "O".to_string();
        let err = PathBuilder::new().build(start, Arc::new(end), 3).unwrap_err();
        assert!(matches!(err, PathError::ShapeMismatch(_)));
    }

    #[test]
    fn test_build_rejects_bad_relax_index() {
        let start = Arc::new(config(vec![0.0; 6]));
        let end = Arc::new(config(vec![1.0; 6]));
        let err = PathBuilder::new()
            .with_relax_subset(Some(vec![0, 2]))
            .build(start, end, 1)
            .unwrap_err();
        assert_eq!(err, PathError::InvalidRelaxIndex { index: 2, num_atoms: 2 });
    }

    #[test]
    fn test_chain_shares_endpoints() {
        let start = Arc::new(config(vec![0.0, 0.0, 0.0]));
        let end = Arc::new(config(vec![3.0, 0.0, 0.0]));
        let chain = PathBuilder::new().build(Arc::clone(&start), Arc::clone(&end), 2).unwrap();
        assert_eq!(chain.len(), 4);
        assert!(Arc::ptr_eq(&chain.start_shared(), &start));
        assert!(Arc::ptr_eq(&chain.end_shared(), &end));
        assert!((chain.image(1).atom_position(0) - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-12);
        assert!((chain.image(2).atom_position(0) - Vector3::new(2.0, 0.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_end_cell_rescaled_to_start() {
        let start = Arc::new(
            config(vec![0.0, 0.0, 0.0]).with_cell(Matrix3::from_diagonal_element(10.0), [true; 3]),
        );
        let end = Arc::new(
            config(vec![5.5, 0.0, 0.0]).with_cell(Matrix3::from_diagonal_element(11.0), [true; 3]),
        );
        let chain = PathBuilder::new().build(start, end, 1).unwrap();
        assert_eq!(chain.end().cell, chain.start().cell);
        assert!((chain.end().atom_position(0).x - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_global_fixed_atoms_are_interpolated_then_fixed() {
        let mut start = config(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        start.fix_atoms(&[0]).unwrap();
        let end = config(vec![2.0, 0.0, 0.0, 3.0, 0.0, 0.0]);
        let chain = PathBuilder::new().build(Arc::new(start), Arc::new(end), 1).unwrap();
        let mid = chain.image(1);
        assert_eq!(mid.fixed(), &[0]);
        assert!((mid.atom_position(0).x - 1.0).abs() < 1e-12);
        assert!((mid.atom_position(1).x - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_with_inserted_keeps_energies_with_images() {
        let start = Arc::new(config(vec![0.0, 0.0, 0.0]));
        let end = Arc::new(config(vec![2.0, 0.0, 0.0]));
        let mut chain = ImageChain::from_parts(start, end, Vec::new()).unwrap();
        energies(&mut chain, &[0.0, 0.2]);

        let chain = chain.with_inserted(0, config(vec![1.0, 0.0, 0.0])).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.energies(), &[Some(0.0), None, Some(0.2)]);
        assert_eq!(chain.barriers(), None);

        let err = chain.clone().with_inserted(2, config(vec![0.0; 3])).unwrap_err();
        assert_eq!(err, PathError::InvalidGap { gap: 2, len: 3 });
    }

    #[test]
    fn test_barriers_for_asymmetric_path() {
        let start = Arc::new(config(vec![0.0, 0.0, 0.0]));
        let end = Arc::new(config(vec![3.0, 0.0, 0.0]));
        let mut chain = PathBuilder::new().build(start, end, 2).unwrap();
        energies(&mut chain, &[-1.0, 0.5, 0.25, -1.5]);
        assert_eq!(chain.max_energy_index(), Some(1));
        assert_eq!(chain.barrier_height(), Some(1.5));
        assert_eq!(chain.barriers(), Some((1.5, 2.0)));
    }
}
