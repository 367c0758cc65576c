//! Streamed SIMP topology optimization on regular voxel grids.
//!
//! Goal regions picked on an input mesh become grid boundary conditions,
//! the optimizer streams a frame per iteration, and any frame's density
//! field can be turned back into a smoothed surface mesh.

pub mod analyzer;
pub mod boundary;
pub mod controller;
pub mod datatypes;
pub mod error;
pub mod filter;
pub mod input;
pub mod isosurface;
pub mod model;
pub mod params;
pub mod post_processor;
pub mod smoothing;
pub mod solver;

pub use boundary::{extract_goal_markers, BoundaryConditions, Goal, GoalKind, GoalMarkers};
pub use controller::{Controller, RunRequest, RunState, SolverEvent};
pub use datatypes::{Bounds, DensityField, Mesh, RenderMesh, SolverFrame};
pub use error::{Result, TopoError};
pub use isosurface::{generate_geometry_from_voxels, ReconstructOptions, VoxelGeometry};
pub use model::FeModel;
pub use params::SimpParams;
pub use smoothing::{smooth_mesh, SmoothingMethod};
pub use solver::SimpSolver;
