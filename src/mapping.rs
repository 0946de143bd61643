//! Jacobian and Hessian mathematics for the parametric-to-physical
//! coordinate mapping.
//!
//! The geometry basis defines the mapping `x(u) = X N(u)`, where `X` holds
//! the nodal (control point) coordinates column-wise and `N` the basis
//! values. Interior integration needs the Jacobian determinant and the
//! physical gradients of every basis; boundary integration additionally
//! needs the edge measure and outward normal; second-derivative integrands
//! need the mapping Hessian propagated through the chain rule.
//!
//! Physical gradients are obtained by right-multiplying parametric
//! gradients with the precomputed inverse Jacobian; a singular Jacobian is
//! reported through a zero determinant and handled by the caller (skipped
//! quadrature point), never as an error.

use crate::basis::Edge;
use crate::Real;
use eyre::bail;
use nalgebra::{DMatrix, Matrix2, Vector2};
use numeric_literals::replace_float_literals;

/// Determinant and inverse of the coordinate-mapping Jacobian at one
/// quadrature point. For boundary points, `det` is the edge measure (the
/// norm of the tangent along the edge) rather than the area determinant.
#[derive(Debug, Clone, Copy)]
pub struct JacobianData<T: Real> {
    pub det: T,
    pub inverse: Matrix2<T>,
}

impl<T: Real> JacobianData<T> {
    fn singular() -> Self {
        JacobianData {
            det: T::zero(),
            inverse: Matrix2::zeros(),
        }
    }

    pub fn is_singular(&self) -> bool {
        self.det == T::zero()
    }
}

/// The Jacobian matrix `J_{kd} = dx_k / du_d` from nodal coordinates
/// (2 x n) and parametric gradients (n x 2).
fn jacobian_matrix<T: Real>(xnod: &DMatrix<T>, dndu: &DMatrix<T>) -> Matrix2<T> {
    let n = dndu.nrows();
    let mut jac = Matrix2::zeros();
    for f in 0..n {
        for k in 0..2 {
            for d in 0..2 {
                jac[(k, d)] += xnod[(k, f)] * dndu[(f, d)];
            }
        }
    }
    jac
}

/// Interior Jacobian: determinant, inverse, and the geometry basis's
/// physical gradients written into `dndx`. A singular mapping yields a
/// zero determinant and leaves `dndx` zeroed.
pub fn jacobian<T: Real>(
    xnod: &DMatrix<T>,
    dndu: &DMatrix<T>,
    dndx: &mut DMatrix<T>,
) -> JacobianData<T> {
    let jac = jacobian_matrix(xnod, dndu);
    let det = jac.determinant();
    dndx.resize_mut(dndu.nrows(), 2, T::zero());
    let inverse = match jac.try_inverse() {
        Some(inv) if det != T::zero() => inv,
        _ => {
            dndx.fill(T::zero());
            return JacobianData::singular();
        }
    };
    apply_inverse_jacobian_into(dndu, &inverse, dndx);
    JacobianData { det, inverse }
}

/// Physical gradients of a non-geometry basis: `dN/dx = dN/du * J^{-1}`.
pub fn apply_inverse_jacobian<T: Real>(dndu: &DMatrix<T>, inverse: &Matrix2<T>) -> DMatrix<T> {
    let mut dndx = DMatrix::zeros(dndu.nrows(), 2);
    apply_inverse_jacobian_into(dndu, inverse, &mut dndx);
    dndx
}

fn apply_inverse_jacobian_into<T: Real>(
    dndu: &DMatrix<T>,
    inverse: &Matrix2<T>,
    dndx: &mut DMatrix<T>,
) {
    for f in 0..dndu.nrows() {
        for k in 0..2 {
            let mut sum = T::zero();
            for d in 0..2 {
                sum += dndu[(f, d)] * inverse[(d, k)];
            }
            dndx[(f, k)] = sum;
        }
    }
}

/// Boundary Jacobian: the full mapping inverse for gradient computation,
/// the edge measure as `det`, and the unit normal of the edge.
///
/// The normal follows the orientation convention of the edge direction
/// codes: the returned normal points outward for positive-code edges and
/// must be flipped by the caller for negative codes.
pub fn edge_jacobian<T: Real>(
    xnod: &DMatrix<T>,
    dndu: &DMatrix<T>,
    dndx: &mut DMatrix<T>,
    edge: Edge,
) -> (JacobianData<T>, Vector2<T>) {
    let jac = jacobian_matrix(xnod, dndu);
    let det = jac.determinant();
    dndx.resize_mut(dndu.nrows(), 2, T::zero());
    let inverse = match jac.try_inverse() {
        Some(inv) if det != T::zero() => inv,
        _ => {
            dndx.fill(T::zero());
            return (JacobianData::singular(), Vector2::zeros());
        }
    };
    apply_inverse_jacobian_into(dndu, &inverse, dndx);

    // Tangent along the edge and the in-plane perpendicular, with the sign
    // of the (t1, t2) permutation.
    let t2 = edge.tangent_direction();
    let tangent = Vector2::new(jac[(0, t2)], jac[(1, t2)]);
    let measure = tangent.norm();
    if measure == T::zero() {
        return (JacobianData::singular(), Vector2::zeros());
    }
    let normal = if edge.normal_direction() == 0 {
        Vector2::new(tangent[1] / measure, -tangent[0] / measure)
    } else {
        Vector2::new(-tangent[1] / measure, tangent[0] / measure)
    };

    (
        JacobianData {
            det: measure,
            inverse,
        },
        normal,
    )
}

/// Second derivatives of the coordinate mapping: one symmetric `2x2`
/// parametric Hessian per physical component.
#[derive(Debug, Clone)]
pub struct MappingHessian<T: Real> {
    pub components: [Matrix2<T>; 2],
}

/// Hessian of the coordinate mapping from the geometry basis's second
/// parametric derivatives: `H_k = sum_f X_{kf} d2N_f/du2`.
pub fn geometry_hessian<T: Real>(
    xnod: &DMatrix<T>,
    d2ndu2: &[Matrix2<T>],
) -> eyre::Result<MappingHessian<T>> {
    if d2ndu2.len() != xnod.ncols() {
        bail!(
            "second-derivative count {} does not match {} geometry nodes",
            d2ndu2.len(),
            xnod.ncols()
        );
    }
    let mut components = [Matrix2::zeros(), Matrix2::zeros()];
    for (f, d2n) in d2ndu2.iter().enumerate() {
        for k in 0..2 {
            components[k] += d2n * xnod[(k, f)];
        }
    }
    Ok(MappingHessian { components })
}

/// Physical second derivatives of one basis through the chain rule:
/// `d2N/dx2 = J^{-T} (d2N/du2 - sum_k dN/dx_k H_k) J^{-1}`.
///
/// Fails when the parametric second derivatives do not match the gradient
/// table; the caller decides whether the failure is fatal (geometry basis)
/// or tolerated (any other basis).
pub fn physical_hessian<T: Real>(
    mapping: &MappingHessian<T>,
    inverse: &Matrix2<T>,
    dndx: &DMatrix<T>,
    d2ndu2: &[Matrix2<T>],
) -> eyre::Result<Vec<Matrix2<T>>> {
    if d2ndu2.len() != dndx.nrows() {
        bail!(
            "second-derivative count {} does not match {} basis functions",
            d2ndu2.len(),
            dndx.nrows()
        );
    }
    let inv_t = inverse.transpose();
    let mut result = Vec::with_capacity(d2ndu2.len());
    for (f, d2n) in d2ndu2.iter().enumerate() {
        let mut curved = *d2n;
        for k in 0..2 {
            curved -= mapping.components[k] * dndx[(f, k)];
        }
        result.push(inv_t * curved * *inverse);
    }
    Ok(result)
}

/// Stabilization metric `G_{ij} = sum_d s_d^2 J^{-1}_{di} J^{-1}_{dj}` with
/// `s_d = 2 / h_d`, where `h_d` is the parametric element extent per
/// direction.
#[replace_float_literals(T::from_f64(literal).unwrap())]
pub fn g_matrix<T: Real>(inverse: &Matrix2<T>, extents: &[T; 2]) -> Matrix2<T> {
    let mut g = Matrix2::zeros();
    for d in 0..2 {
        let s = 2.0 / extents[d];
        for i in 0..2 {
            for j in 0..2 {
                g[(i, j)] += inverse[(d, i)] * inverse[(d, j)] * s * s;
            }
        }
    }
    g
}
