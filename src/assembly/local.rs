//! Contracts between the assembly driver and its collaborators: the
//! physical integrand, the global-assembly target and the interface
//! checker, plus the element-local data they exchange.

use crate::basis::Edge;
use crate::Real;
use eyre::bail;
use nalgebra::{DMatrix, DVector, Matrix2, Point2, Vector2};
use std::any::Any;

/// Capability flags reported by an integrand, steering which quantities
/// the element integrator computes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrandCaps {
    /// Physical second derivatives of every basis are required.
    pub second_derivatives: bool,
    /// Physical element corners and the characteristic element size are
    /// required.
    pub element_corners: bool,
    /// The stabilization metric (G matrix) is required.
    pub g_matrix: bool,
    /// The integrand produces interface (jump/average) terms.
    pub interface_terms: bool,
}

/// Element-local contribution storage produced by the integrand, filled by
/// the integration loop and consumed exactly once by the global-assembly
/// collaborator. Dropping the box releases the storage on every exit path.
pub trait LocalIntegral<T: Real>: Send {
    /// Element-level solution vectors carried alongside the contribution
    /// (e.g. previous-iteration values gathered at `init_element`). For
    /// interface integration the driver appends the neighbor element's
    /// vectors behind the host's.
    fn solution_vectors(&self) -> &[DVector<T>];

    fn solution_vectors_mut(&mut self) -> &mut Vec<DVector<T>>;

    /// Downcasting hook for global assemblers that know the concrete type.
    fn as_any(&self) -> &dyn Any;
}

/// Stock dense element matrices/vectors, sized by the concatenated
/// per-basis DOF counts.
#[derive(Debug, Clone, Default)]
pub struct ElementMatrices<T: Real> {
    pub matrices: Vec<DMatrix<T>>,
    pub vectors: Vec<DVector<T>>,
    pub solutions: Vec<DVector<T>>,
}

impl<T: Real> LocalIntegral<T> for ElementMatrices<T> {
    fn solution_vectors(&self) -> &[DVector<T>] {
        &self.solutions
    }

    fn solution_vectors_mut(&mut self) -> &mut Vec<DVector<T>> {
        &mut self.solutions
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Shape function data of all coupled bases at one quadrature point,
/// handed to the integrand.
///
/// Basis slots follow the patch's basis order; interface integration
/// doubles the slots, with the neighbor element's bases behind the host's.
#[derive(Debug, Clone)]
pub struct MixedElementValues<T: Real> {
    /// Model-global id of the (host) geometry element.
    pub element: usize,
    /// Parameter values of the point.
    pub u: T,
    pub v: T,
    /// Local element coordinates of the point in `[-1, 1]`.
    pub xi: T,
    pub eta: T,
    /// Jacobian determinant (or edge measure) times the quadrature weight.
    pub det_jxw: T,
    /// Running integration point number.
    pub quad_point: usize,
    /// Characteristic element size; only set with the element-corners
    /// capability (interface integration sets it unconditionally).
    pub h: T,
    /// Values per basis slot.
    pub basis: Vec<DVector<T>>,
    /// Physical gradients per basis slot (rows: functions, columns: x/y).
    pub grad: Vec<DMatrix<T>>,
    /// Physical second derivatives per basis slot; empty unless requested.
    pub hess: Vec<Vec<Matrix2<T>>>,
    /// Physical element corners; empty unless requested.
    pub corners: Vec<Point2<T>>,
    /// Stabilization metric; only with the G-matrix capability.
    pub g_mat: Option<Matrix2<T>>,
}

impl<T: Real> MixedElementValues<T> {
    /// Fresh element data with one zeroed slot per entry of `sizes`.
    pub fn with_sizes(sizes: &[usize]) -> Self {
        MixedElementValues {
            element: 0,
            u: T::zero(),
            v: T::zero(),
            xi: T::zero(),
            eta: T::zero(),
            det_jxw: T::zero(),
            quad_point: 0,
            h: T::zero(),
            basis: sizes.iter().map(|&n| DVector::zeros(n)).collect(),
            grad: sizes.iter().map(|&n| DMatrix::zeros(n, 2)).collect(),
            hess: sizes.iter().map(|_| Vec::new()).collect(),
            corners: Vec::new(),
            g_mat: None,
        }
    }

    /// Number of basis slots (twice the basis count during interface
    /// integration).
    pub fn num_slots(&self) -> usize {
        self.basis.len()
    }
}

/// The physical integrand evaluated per quadrature point.
///
/// `init_element`/`eval_*`/`finalize_element` mirror the lifecycle of one
/// element: acquire local storage, accumulate point contributions,
/// finalize, hand off to global assembly.
pub trait Integrand<T: Real> {
    fn capabilities(&self) -> IntegrandCaps;

    /// Gauss point count for boundary/interface integration; defaults to
    /// the interior rule order.
    fn boundary_quadrature_order(&self, n_gauss: usize) -> usize {
        n_gauss
    }

    /// Acquire local contribution storage for an element, sized by the
    /// per-basis support sizes.
    fn local_integral(
        &self,
        element_sizes: &[usize],
        global_element: usize,
        boundary: bool,
    ) -> Box<dyn LocalIntegral<T>>;

    /// Initialize element quantities. `element_nodes` holds the
    /// patch-local node ids concatenated across bases, `element_sizes` the
    /// per-basis support sizes and `basis_sizes` the per-basis function
    /// totals.
    fn init_element(
        &self,
        element_nodes: &[usize],
        element_sizes: &[usize],
        basis_sizes: &[usize],
        local: &mut dyn LocalIntegral<T>,
    ) -> eyre::Result<()>;

    /// Initialize element quantities for a boundary pass; defaults to the
    /// interior initialization.
    fn init_element_boundary(
        &self,
        element_nodes: &[usize],
        element_sizes: &[usize],
        basis_sizes: &[usize],
        local: &mut dyn LocalIntegral<T>,
    ) -> eyre::Result<()> {
        self.init_element(element_nodes, element_sizes, basis_sizes, local)
    }

    /// Accumulate the contribution of one interior quadrature point.
    fn eval_interior(
        &self,
        local: &mut dyn LocalIntegral<T>,
        fe: &MixedElementValues<T>,
        x: &Point2<T>,
    ) -> eyre::Result<()>;

    /// Accumulate the contribution of one boundary quadrature point.
    fn eval_boundary(
        &self,
        _local: &mut dyn LocalIntegral<T>,
        _fe: &MixedElementValues<T>,
        _x: &Point2<T>,
        _normal: &Vector2<T>,
    ) -> eyre::Result<()> {
        bail!("integrand has no boundary terms");
    }

    /// Accumulate the contribution of one interface quadrature point; the
    /// element data covers both sides of the interface.
    fn eval_interface(
        &self,
        _local: &mut dyn LocalIntegral<T>,
        _fe: &MixedElementValues<T>,
        _x: &Point2<T>,
        _normal: &Vector2<T>,
    ) -> eyre::Result<()> {
        bail!("integrand has no interface terms");
    }

    fn finalize_element(
        &self,
        _local: &mut dyn LocalIntegral<T>,
        _first_point: usize,
    ) -> eyre::Result<()> {
        Ok(())
    }

    fn finalize_element_boundary(
        &self,
        _local: &mut dyn LocalIntegral<T>,
        _fe: &MixedElementValues<T>,
    ) -> eyre::Result<()> {
        Ok(())
    }

    /// Recover a derived (secondary) solution quantity at a point; used by
    /// the field evaluator.
    fn eval_solution(
        &self,
        _fe: &MixedElementValues<T>,
        _x: &Point2<T>,
        _element_nodes: &[usize],
        _element_sizes: &[usize],
        _basis_sizes: &[usize],
    ) -> eyre::Result<DVector<T>> {
        bail!("integrand has no secondary solution");
    }
}

/// The external global-assembly collaborator receiving finished local
/// contributions.
///
/// When `thread_safe` returns `false` the driver falls back to a single
/// sequential pass over all elements; otherwise `assemble` must tolerate
/// concurrent calls from the element tasks of one color group.
pub trait GlobalAssembler<T: Real> {
    fn thread_safe(&self) -> bool;

    fn assemble(&self, local: &dyn LocalIntegral<T>, global_element: usize) -> eyre::Result<()>;
}

/// Describes where non-conforming neighbor meshes cut the edges of the
/// first basis's elements.
///
/// `intersections` returns the ordered subdivision points along an edge,
/// including the far edge corner, so consecutive values bound one
/// sub-segment each. The driver locates the neighbor of a sub-segment by
/// offsetting its start point across the edge by a fixed small parametric
/// epsilon; for extremely small or highly anisotropic elements this
/// heuristic can select the wrong element, and no fallback is defined.
pub trait InterfaceChecker {
    /// Bitmask over the four logical edges ([`Edge::bit`]) carrying
    /// interface contributions; zero for elements without any.
    fn contribution_mask(&self, element: usize) -> u8;

    fn intersections(&self, element: usize, edge: Edge) -> Vec<f64>;
}
