//! Contract for the external spline/geometry kernel.
//!
//! The assembly core never manipulates spline representations itself; it
//! consumes a locally refined basis through [`SplineBasis`]. All bases of a
//! patch share the same parametric domain but are refined and numbered
//! independently, so element ids and function ids are never comparable
//! across bases — correspondence goes through parametric point containment
//! (see [`crate::correspond`]).

use crate::Real;
use nalgebra::{DMatrix, DVector, Matrix2, Point2};
use serde::{Deserialize, Serialize};

/// How many derivative orders an evaluation should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Derivs {
    Values,
    First,
    Second,
}

/// Basis function values and parametric derivatives at a single point,
/// ordered like the element's support list.
#[derive(Debug, Clone)]
pub struct BasisEval<T: Real> {
    /// Function values.
    pub values: DVector<T>,
    /// First parametric derivatives, one row per function, one column per
    /// parametric direction. Empty unless at least [`Derivs::First`] was
    /// requested.
    pub derivs: DMatrix<T>,
    /// Second parametric derivatives, one symmetric `2x2` matrix per
    /// function. Empty unless [`Derivs::Second`] was requested.
    pub second: Vec<Matrix2<T>>,
}

impl<T: Real> BasisEval<T> {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.len() == 0
    }
}

/// Parametric extents of a single element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamRange<T> {
    pub umin: T,
    pub umax: T,
    pub vmin: T,
    pub vmax: T,
}

impl<T: Real> ParamRange<T> {
    pub fn midpoint(&self) -> (T, T) {
        let two = T::one() + T::one();
        ((self.umin + self.umax) / two, (self.vmin + self.vmax) / two)
    }

    pub fn area(&self) -> T {
        (self.umax - self.umin) * (self.vmax - self.vmin)
    }

    /// Extent along the given parametric direction (0 or 1).
    pub fn length(&self, direction: usize) -> T {
        match direction {
            0 => self.umax - self.umin,
            _ => self.vmax - self.vmin,
        }
    }

    /// The four parametric corners in counter-clockwise order starting at
    /// `(umin, vmin)`.
    pub fn corners(&self) -> [(T, T); 4] {
        [
            (self.umin, self.vmin),
            (self.umax, self.vmin),
            (self.umax, self.vmax),
            (self.umin, self.vmax),
        ]
    }
}

/// One of the four logical edges of a rectangular parameter element, with
/// the direction-code and bitmask conventions used by boundary and
/// interface integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Edge {
    UMin,
    UMax,
    VMin,
    VMax,
}

impl Edge {
    pub const ALL: [Edge; 4] = [Edge::UMin, Edge::UMax, Edge::VMin, Edge::VMax];

    /// Signed direction code: `{-1, +1}` for the first parametric
    /// direction, `{-2, +2}` for the second.
    pub fn direction_code(self) -> i32 {
        match self {
            Edge::UMin => -1,
            Edge::UMax => 1,
            Edge::VMin => -2,
            Edge::VMax => 2,
        }
    }

    /// Logical edge number 1..=4.
    pub fn index(self) -> usize {
        match self {
            Edge::UMin => 1,
            Edge::UMax => 2,
            Edge::VMin => 3,
            Edge::VMax => 4,
        }
    }

    /// Bit of this edge in an interface-contribution mask.
    pub fn bit(self) -> u8 {
        1 << (self.index() - 1)
    }

    /// Parametric direction normal to the edge (0 or 1).
    pub fn normal_direction(self) -> usize {
        match self {
            Edge::UMin | Edge::UMax => 0,
            Edge::VMin | Edge::VMax => 1,
        }
    }

    /// Parametric direction running along the edge (0 or 1).
    pub fn tangent_direction(self) -> usize {
        1 - self.normal_direction()
    }
}

/// Orientation of a mesh line in the parametric domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineDirection {
    /// A line of constant first parameter, running in the second direction.
    ConstU,
    /// A line of constant second parameter, running in the first direction.
    ConstV,
}

/// A (possibly partial) mesh line of a locally refined basis, as reported
/// by [`SplineBasis::mesh_lines`] and consumed by
/// [`SplineBasis::insert_mesh_line`] when refinement is propagated across
/// bases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshLine<T> {
    pub direction: LineDirection,
    /// The constant parameter value of the line.
    pub value: T,
    /// Start of the line in the running direction.
    pub start: T,
    /// End of the line in the running direction.
    pub stop: T,
    pub multiplicity: usize,
}

/// Which elements (or error indicators) an adaptive step should refine.
///
/// Produced externally by an error estimator and consumed exactly once by
/// [`crate::refine::refine`]. An empty record is a no-op.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefinementRecord {
    /// Elements of the refinement basis to refine.
    pub elements: Vec<usize>,
    /// Per-element error indicators on the refinement basis; consulted by
    /// the kernel when `elements` is empty.
    pub errors: Vec<f64>,
}

impl RefinementRecord {
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.errors.is_empty()
    }
}

/// A locally refined spline basis over a two-dimensional parametric domain.
///
/// Implementations are provided by the spline kernel; the assembly core
/// only requires evaluation, element enumeration, containment queries and
/// the refinement primitives below. Every basis function carries a control
/// point, which for the geometry basis defines the coordinate mapping.
pub trait SplineBasis<T: Real> {
    fn num_basis_functions(&self) -> usize;

    fn num_elements(&self) -> usize;

    /// Polynomial order (degree + 1) in the given parametric direction.
    fn order(&self, direction: usize) -> usize;

    fn start_param(&self, direction: usize) -> T;

    fn end_param(&self, direction: usize) -> T;

    fn element_domain(&self, element: usize) -> ParamRange<T>;

    /// Ids of the basis functions supported on the element, in the order
    /// used by [`SplineBasis::evaluate`].
    fn element_support(&self, element: usize) -> Vec<usize>;

    /// The element whose parametric extent contains the point, or `None`
    /// if the point lies outside the domain.
    fn element_containing(&self, u: T, v: T) -> Option<usize>;

    /// Evaluate all functions supported on `element` at `(u, v)`.
    fn evaluate(&self, u: T, v: T, element: usize, derivs: Derivs) -> BasisEval<T>;

    fn control_point(&self, function: usize) -> Point2<T>;

    /// All mesh lines of the basis, including lines inserted by earlier
    /// refinement steps.
    fn mesh_lines(&self) -> Vec<MeshLine<T>>;

    /// Insert a mesh line with (at least) the given multiplicity. A line
    /// already present at equal or higher multiplicity is a no-op.
    fn insert_mesh_line(&mut self, line: &MeshLine<T>, multiplicity: usize) -> eyre::Result<()>;

    /// Locally refine according to the record.
    fn refine(&mut self, record: &RefinementRecord) -> eyre::Result<()>;

    /// Refine the support of every basis function, producing a uniformly
    /// refined basis (the subgrid construction).
    fn refine_all_functions(&mut self) -> eyre::Result<()>;

    /// A copy of this basis with the order raised by `diff_u`/`diff_v` per
    /// direction, optionally with reduced inter-element continuity.
    fn raise_order(&self, diff_u: usize, diff_v: usize, reduced_continuity: bool) -> Self
    where
        Self: Sized;

    /// Attach a block of per-function coefficients (`components` values per
    /// function) so that subsequent refinement carries the block along.
    /// Blocks stack in attach order.
    fn attach_coefficients(&mut self, coefs: &[T], components: usize);

    /// Extract attached block `block` in the current (possibly refined)
    /// function numbering. A block that was never attached yields zeros of
    /// the appropriate length.
    fn extract_coefficients(&self, block: usize, components: usize) -> Vec<T>;

    fn clear_attached(&mut self);
}
