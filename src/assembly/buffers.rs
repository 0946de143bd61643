//! Per-thread evaluation scratch reused across elements.

use crate::basis::{BasisEval, SplineBasis};
use crate::Real;
use nalgebra::DMatrix;

/// Scratch data for one element: nodal coordinates of the geometry element
/// and the per-basis evaluations at the current quadrature point. One
/// instance lives per worker thread during parallel assembly.
#[derive(Debug)]
pub struct ElementScratch<T: Real> {
    pub evals: Vec<BasisEval<T>>,
    pub xnod: DMatrix<T>,
}

impl<T: Real> Default for ElementScratch<T> {
    fn default() -> Self {
        ElementScratch {
            evals: Vec::new(),
            xnod: DMatrix::zeros(2, 0),
        }
    }
}

impl<T: Real> ElementScratch<T> {
    /// Gather the control point coordinates of an element's support into
    /// the 2 x n coordinate matrix.
    pub fn populate_element_coordinates<B>(&mut self, basis: &B, element: usize)
    where
        B: SplineBasis<T>,
    {
        self.xnod = element_coordinates(basis, element);
    }
}

/// Control point coordinates of an element's supporting functions, one
/// column per function in support order.
pub fn element_coordinates<T, B>(basis: &B, element: usize) -> DMatrix<T>
where
    T: Real,
    B: SplineBasis<T>,
{
    let support = basis.element_support(element);
    let mut xnod = DMatrix::zeros(2, support.len());
    for (f, &id) in support.iter().enumerate() {
        let cp = basis.control_point(id);
        xnod[(0, f)] = cp.x;
        xnod[(1, f)] = cp.y;
    }
    xnod
}
