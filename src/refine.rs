//! Adaptive refinement with solution transfer between mesh generations.
//!
//! Refinement is driven by the patch's refinement basis; mesh-line
//! insertions then propagate to every other basis with multiplicities
//! chosen by the mixed-formulation policy. Solution vectors ride along as
//! coefficient blocks attached to each basis before refinement and are
//! re-extracted into the new global numbering afterwards.
//!
//! Refinement invalidates all generated numbering, element correspondence
//! and thread-group partitions; callers regenerate numbering and thread
//! groups before the next integration pass, and must externally serialize
//! refinement against in-flight integration or field evaluation.

use crate::basis::{RefinementRecord, SplineBasis};
use crate::patch::MixedPatch;
use crate::policy::RoleRef;
use crate::Real;
use eyre::{bail, WrapErr};
use nalgebra::DVector;

/// Refine the patch according to the record and transfer every solution
/// generation to the new bases.
///
/// A patch sharing finite element data with another patch, or an empty
/// record, is a successful no-op. Only a failing refinement primitive is
/// fatal; there is no cross-basis rollback — a failure while propagating
/// to a later basis leaves the patch partially refined and the error is
/// surfaced to the caller.
pub fn refine<T, B>(
    patch: &mut MixedPatch<T, B>,
    record: &RefinementRecord,
    solutions: &mut [DVector<T>],
) -> eyre::Result<()>
where
    T: Real,
    B: SplineBasis<T> + Clone,
{
    if patch.shares_fe() || record.is_empty() {
        return Ok(());
    }

    // Attach one coefficient block per solution generation to each basis
    // so the refinement primitives carry the data forward.
    for solution in solutions.iter() {
        for b in 0..patch.num_bases() {
            let block = patch.extract_field_vec(solution, b);
            let components = patch.basis_fields(b);
            patch.basis_mut(b).attach_coefficients(block.as_slice(), components);
        }
    }

    patch
        .refinement_basis_mut()
        .refine(record)
        .wrap_err("mesh refinement primitive failed")?;

    // Propagate the refinement basis's mesh lines into every other basis.
    // A line's own multiplicity wins when above one; otherwise the policy
    // decides per basis.
    let lines = patch.refinement_basis().mesh_lines();
    let ref_role = patch.refinement_role();
    for b in 0..patch.num_bases() {
        if ref_role == RoleRef::Field(b) {
            continue;
        }
        let default_multiplicity = patch.policy().refinement_multiplicity(b);
        for line in &lines {
            let multiplicity = if line.multiplicity > 1 {
                line.multiplicity
            } else {
                default_multiplicity
            };
            patch
                .basis_mut(b)
                .insert_mesh_line(line, multiplicity)
                .wrap_err_with(|| format!("propagating refinement into basis {} failed", b))?;
        }
    }

    // The subgrid formulation rebuilds the first basis from scratch as a
    // uniformly refined copy of the refinement basis.
    if patch.policy().uses_subgrid_rebuild() {
        let mut subgrid = patch.refinement_basis().clone();
        subgrid.refine_all_functions()?;
        patch.replace_basis(0, subgrid);
        patch.set_projection_role(RoleRef::Field(0));
    }

    patch.invalidate_after_refinement();
    let new_length = patch.total_dofs();

    // Re-extract each generation into the new numbering, every generation
    // with its own offset accumulator.
    for (generation, solution) in solutions.iter_mut().enumerate() {
        let mut transferred = DVector::zeros(new_length);
        let mut offset = 0;
        for b in 0..patch.num_bases() {
            let components = patch.basis_fields(b);
            let coefficients = patch.basis(b).extract_coefficients(generation, components);
            for (i, &c) in coefficients.iter().enumerate() {
                transferred[offset + i] = c;
            }
            offset += patch.basis_nodes(b) * components;
        }
        *solution = transferred;
    }
    for b in 0..patch.num_bases() {
        patch.basis_mut(b).clear_attached();
    }

    log::debug!(
        "refined patch: {} elements, {} nodes, {} dofs",
        patch.num_geo_elements(),
        patch.num_nodes(),
        new_length
    );
    Ok(())
}

/// Accumulate geometry-element error indicators onto the refinement
/// basis, either per element or per supporting basis function.
pub fn remap_errors<T, B>(
    patch: &MixedPatch<T, B>,
    source: &[T],
    element_errors: bool,
) -> eyre::Result<Vec<T>>
where
    T: Real,
    B: SplineBasis<T>,
{
    let geo = patch.basis(patch.geo_basis());
    if source.len() != geo.num_elements() {
        bail!(
            "expected one error indicator per geometry element, got {}",
            source.len()
        );
    }
    let refinement = patch.refinement_basis();
    let mut remapped = if element_errors {
        vec![T::zero(); refinement.num_elements()]
    } else {
        vec![T::zero(); refinement.num_basis_functions()]
    };
    for element in 0..geo.num_elements() {
        let (mu, mv) = geo.element_domain(element).midpoint();
        let target = refinement.element_containing(mu, mv).ok_or_else(|| {
            eyre::eyre!("element {} midpoint not contained in the refinement basis", element)
        })?;
        if element_errors {
            remapped[target] += source[element];
        } else {
            for f in refinement.element_support(target) {
                remapped[f] += source[element];
            }
        }
    }
    Ok(remapped)
}

/// Function count of the refinement basis (the space refinement
/// indicators live on).
pub fn num_refinement_nodes<T, B>(patch: &MixedPatch<T, B>) -> usize
where
    T: Real,
    B: SplineBasis<T>,
{
    patch.refinement_basis().num_basis_functions()
}

/// Element count of the refinement basis.
pub fn num_refinement_elements<T, B>(patch: &MixedPatch<T, B>) -> usize
where
    T: Real,
    B: SplineBasis<T>,
{
    patch.refinement_basis().num_elements()
}
