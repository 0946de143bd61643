//! Assembly driver for mixed-basis, locally refined spline finite element
//! models.
//!
//! A [`patch::MixedPatch`] couples several independently refined spline
//! bases over one shared parametric domain: one basis per unknown field,
//! one designated geometry basis, and projection/refinement roles that may
//! alias a field basis or live as distinct bases. The crate performs
//! numerically correct element integration (interior, boundary and
//! non-conforming interface terms), schedules race-free parallel assembly
//! through element coloring, supports adaptive local refinement with
//! solution transfer between mesh generations, and evaluates solution
//! fields at arbitrary parametric points.
//!
//! The spline kernel itself, the physical integrand, the global assembly
//! target and the interface checker are external collaborators consumed
//! through the traits in [`basis`] and [`assembly`].

use nalgebra::RealField;

pub mod assembly;
pub mod basis;
pub mod coloring;
pub mod correspond;
pub mod fields;
pub mod io;
pub mod mapping;
pub mod patch;
pub mod policy;
pub mod quadrature;
pub mod refine;

pub extern crate nalgebra;

/// Trait alias for scalar types accepted by the assembly routines.
///
/// The `Send + Sync` requirement comes from the element-parallel interior
/// assembly loop, which shares basis data across worker threads.
pub trait Real: RealField + Copy + Send + Sync {}

impl<T> Real for T where T: RealField + Copy + Send + Sync {}
