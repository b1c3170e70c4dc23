//! Memory layer: gradient projection subspaces.
//!
//! [`SubspaceMemory`] owns one orthonormal basis per captured layer. Bases
//! are built from representation matrices at task boundaries (see
//! [`RepresentationMatrixBuilder`](crate::representation::RepresentationMatrixBuilder))
//! and can be used to strip the protected component out of a layer's weight
//! gradient with [`SubspaceMemory::project_gradient`].

pub mod subspace;

pub use subspace::{BasisSnapshot, LayerUpdate, SubspaceMemory, SubspaceSnapshot};
