//! Evaluation of primary and secondary solution fields at arbitrary
//! parametric points.
//!
//! Evaluation points are located independently per basis through the same
//! point-containment contract the topology mapper uses; nothing is cached
//! between points. Primary fields are pure nodal interpolation (no
//! Jacobian); secondary fields run the full coordinate-mapping machinery
//! before handing solution recovery to the integrand.

use crate::assembly::buffers::element_coordinates;
use crate::assembly::local::{Integrand, MixedElementValues};
use crate::basis::{Derivs, SplineBasis};
use crate::mapping;
use crate::patch::MixedPatch;
use crate::Real;
use eyre::{bail, eyre};
use itertools::izip;
use nalgebra::{DMatrix, DVector, Point2};

/// Evaluate the primary solution fields at the given parametric points.
///
/// Each result column holds the concatenated per-basis field values at one
/// point. With `components_override` set, only that many components of the
/// first basis are evaluated (the solution vector is then expected to be
/// packed accordingly).
pub fn eval_primary<T, B>(
    patch: &MixedPatch<T, B>,
    solution: &DVector<T>,
    points: &[(T, T)],
    components_override: Option<usize>,
) -> eyre::Result<DMatrix<T>>
where
    T: Real,
    B: SplineBasis<T>,
{
    let components = field_components(patch, components_override);
    let rows: usize = components.iter().sum();
    let mut field = DMatrix::zeros(rows, points.len());

    for (col, &(u, v)) in points.iter().enumerate() {
        let mut row = 0;
        let mut offset = 0;
        for (b, &nc) in components.iter().enumerate() {
            if nc == 0 {
                continue;
            }
            let basis = patch.basis(b);
            let element = basis
                .element_containing(u, v)
                .ok_or_else(|| eyre!("point ({:?}) outside the domain of basis {}", col, b))?;
            let eval = basis.evaluate(u, v, element, Derivs::Values);
            let support = basis.element_support(element);

            // Gather the nodal values on the support and interpolate.
            let mut nodal = DMatrix::zeros(nc, support.len());
            for (k, &f) in support.iter().enumerate() {
                for c in 0..nc {
                    nodal[(c, k)] = solution[offset + f * nc + c];
                }
            }
            let values = &nodal * &eval.values;
            for c in 0..nc {
                field[(row + c, col)] = values[c];
            }
            row += nc;
            offset += basis.num_basis_functions() * nc;
        }
    }
    Ok(field)
}

/// Evaluate physical gradients of the primary solution fields; each
/// column stacks the x- and y-derivatives of every component at one
/// point.
pub fn eval_primary_gradient<T, B>(
    patch: &MixedPatch<T, B>,
    solution: &DVector<T>,
    points: &[(T, T)],
) -> eyre::Result<DMatrix<T>>
where
    T: Real,
    B: SplineBasis<T>,
{
    let components = field_components(patch, None);
    let rows: usize = components.iter().map(|nc| 2 * nc).sum();
    let mut field = DMatrix::zeros(rows, points.len());
    let geo = patch.geo_basis();

    for (col, &(u, v)) in points.iter().enumerate() {
        let geo_el = patch
            .basis(geo)
            .element_containing(u, v)
            .ok_or_else(|| eyre!("point outside the geometry basis domain"))?;
        let xnod = element_coordinates(patch.basis(geo), geo_el);
        let geo_eval = patch.basis(geo).evaluate(u, v, geo_el, Derivs::First);
        let mut geo_dndx = DMatrix::zeros(geo_eval.len(), 2);
        let jac = mapping::jacobian(&xnod, &geo_eval.derivs, &mut geo_dndx);
        if jac.is_singular() {
            bail!("singular geometry mapping at evaluation point");
        }

        let mut row = 0;
        let mut offset = 0;
        for (b, &nc) in components.iter().enumerate() {
            let basis = patch.basis(b);
            let element = basis
                .element_containing(u, v)
                .ok_or_else(|| eyre!("point outside the domain of basis {}", b))?;
            let support = basis.element_support(element);
            let dndx = if b == geo && element == geo_el {
                geo_dndx.clone()
            } else {
                let eval = basis.evaluate(u, v, element, Derivs::First);
                mapping::apply_inverse_jacobian(&eval.derivs, &jac.inverse)
            };

            let mut nodal = DMatrix::zeros(nc, support.len());
            for (k, &f) in support.iter().enumerate() {
                for c in 0..nc {
                    nodal[(c, k)] = solution[offset + f * nc + c];
                }
            }
            let gradient = &nodal * &dndx;
            for c in 0..nc {
                for d in 0..2 {
                    field[(row + 2 * c + d, col)] = gradient[(c, d)];
                }
            }
            row += 2 * nc;
            offset += basis.num_basis_functions() * nc;
        }
    }
    Ok(field)
}

/// Evaluate a derived (secondary) solution field through the integrand's
/// solution recovery at the given parametric points.
pub fn eval_secondary<T, B, I>(
    patch: &MixedPatch<T, B>,
    integrand: &I,
    points: &[(T, T)],
) -> eyre::Result<DMatrix<T>>
where
    T: Real,
    B: SplineBasis<T>,
    I: Integrand<T>,
{
    patch.require_numbering()?;
    let caps = integrand.capabilities();
    let derivs = if caps.second_derivatives {
        Derivs::Second
    } else {
        Derivs::First
    };
    let geo = patch.geo_basis();
    let mut field = DMatrix::zeros(0, 0);

    for (col, &(u, v)) in points.iter().enumerate() {
        // Locate the containing element independently for every basis.
        let mut elements = Vec::with_capacity(patch.num_bases());
        let mut sizes = Vec::with_capacity(patch.num_bases());
        for b in 0..patch.num_bases() {
            let element = patch
                .basis(b)
                .element_containing(u, v)
                .ok_or_else(|| eyre!("point outside the domain of basis {}", b))?;
            sizes.push(patch.basis(b).element_support(element).len());
            elements.push(element);
        }

        let mut fe = MixedElementValues::with_sizes(&sizes);
        fe.element = patch.global_element_id(elements[geo]);
        fe.u = u;
        fe.v = v;

        let mut evals = Vec::with_capacity(patch.num_bases());
        for b in 0..patch.num_bases() {
            evals.push(patch.basis(b).evaluate(u, v, elements[b], derivs));
        }
        for (slot, eval) in fe.basis.iter_mut().zip(&evals) {
            slot.copy_from(&eval.values);
        }

        let xnod = element_coordinates(patch.basis(geo), elements[geo]);
        let jac = mapping::jacobian(&xnod, &evals[geo].derivs, &mut fe.grad[geo]);
        if jac.is_singular() {
            bail!("singular geometry mapping at evaluation point");
        }
        for b in 0..patch.num_bases() {
            if b != geo {
                fe.grad[b] = mapping::apply_inverse_jacobian(&evals[b].derivs, &jac.inverse);
            }
        }
        if caps.second_derivatives {
            let hessian = mapping::geometry_hessian(&xnod, &evals[geo].second)?;
            fe.hess[geo] =
                mapping::physical_hessian(&hessian, &jac.inverse, &fe.grad[geo], &evals[geo].second)?;
            for b in 0..patch.num_bases() {
                if b == geo {
                    continue;
                }
                match mapping::physical_hessian(&hessian, &jac.inverse, &fe.grad[b], &evals[b].second)
                {
                    Ok(hess) => fe.hess[b] = hess,
                    Err(err) => log::debug!(
                        "second derivatives unavailable for basis {} at evaluation point: {}",
                        b,
                        err
                    ),
                }
            }
        }

        let mut x = Point2::origin();
        let support = patch.basis(geo).element_support(elements[geo]);
        for (&value, &f) in izip!(fe.basis[geo].iter(), &support) {
            let cp = patch.basis(geo).control_point(f);
            x.x += cp.x * value;
            x.y += cp.y * value;
        }

        let point_values = integrand.eval_solution(
            &fe,
            &x,
            patch.element_nodes(elements[geo]),
            &sizes,
            patch.basis_sizes(),
        )?;

        if field.nrows() == 0 {
            field = DMatrix::zeros(point_values.len(), points.len());
        } else if field.nrows() != point_values.len() {
            bail!("inconsistent secondary solution size across points");
        }
        for r in 0..point_values.len() {
            field[(r, col)] = point_values[r];
        }
    }
    Ok(field)
}

/// Gather the primary solution at an explicit list of patch-local nodes;
/// one column per node, padded with zeros up to the largest per-basis
/// field count.
pub fn solution_at_nodes<T, B>(
    patch: &MixedPatch<T, B>,
    solution: &DVector<T>,
    nodes: &[usize],
) -> eyre::Result<DMatrix<T>>
where
    T: Real,
    B: SplineBasis<T>,
{
    let rows = (0..patch.num_bases())
        .map(|b| patch.basis_fields(b))
        .max()
        .unwrap_or(0);
    let mut field = DMatrix::zeros(rows, nodes.len());
    for (col, &node) in nodes.iter().enumerate() {
        let (basis, local) = patch
            .node_owner(node)
            .ok_or_else(|| eyre!("node {} carries no primary solution", node))?;
        let components = patch.basis_fields(basis);
        let offset = patch.dof_offset(basis);
        for c in 0..components {
            field[(c, col)] = solution[offset + local * components + c];
        }
    }
    Ok(field)
}

fn field_components<T, B>(patch: &MixedPatch<T, B>, components_override: Option<usize>) -> Vec<usize>
where
    T: Real,
    B: SplineBasis<T>,
{
    match components_override {
        Some(nf) => {
            let mut components = vec![0; patch.num_bases()];
            components[0] = nf;
            components
        }
        None => (0..patch.num_bases()).map(|b| patch.basis_fields(b)).collect(),
    }
}
