use super::mock::TensorBasis;
use lrfem::basis::{LineDirection, RefinementRecord, SplineBasis};
use lrfem::coloring::generate_thread_groups;
use lrfem::fields::eval_primary;
use lrfem::patch::{MixedPatch, NumberingContext};
use lrfem::policy::{MixedPolicy, RoleRef};
use lrfem::refine::{num_refinement_elements, num_refinement_nodes, refine, remap_errors};
use matrixcompare::assert_scalar_eq;
use nalgebra::DVector;

/// Full-continuity raise-basis-1 patch: two linear single-element bases,
/// the first doubling as refinement basis, the second carrying the
/// geometry.
fn raise_basis1_patch() -> MixedPatch<f64, TensorBasis> {
    let first = TensorBasis::unit_square(2, 1);
    let second = TensorBasis::unit_square(2, 1);
    let mut patch = MixedPatch::from_bases(
        vec![first, second],
        vec![1, 1],
        MixedPolicy::FullContRaiseBasis1,
        None,
    )
    .unwrap();
    let mut ctx = NumberingContext::new();
    patch.generate_numbering(&mut ctx).unwrap();
    patch
}

/// Nodal coefficients of `f(x, y) = 2x + 3y` on a basis; exact for any
/// basis with Greville control points, since knot insertion preserves the
/// represented function.
fn linear_field_coefficients(basis: &TensorBasis) -> Vec<f64> {
    (0..basis.num_basis_functions())
        .map(|f| {
            let cp = basis.control_point(f);
            2.0 * cp.x + 3.0 * cp.y
        })
        .collect()
}

fn patch_solution(patch: &MixedPatch<f64, TensorBasis>) -> DVector<f64> {
    let mut values = Vec::new();
    for b in 0..patch.num_bases() {
        values.extend(linear_field_coefficients(patch.basis(b)));
    }
    DVector::from_vec(values)
}

// Scenario D: refining one element under the full-continuity
// raise-basis-1 policy. Basis 1 is the refinement basis and tracks it
// exactly (new lines at multiplicity one); basis 2 receives the new lines
// at multiplicity two.
#[test]
fn refinement_propagates_with_policy_multiplicities() {
    let mut patch = raise_basis1_patch();
    assert_eq!(patch.refinement_role(), RoleRef::Field(0));

    let mut solutions = [patch_solution(&patch)];
    let record = RefinementRecord {
        elements: vec![0],
        errors: Vec::new(),
    };
    refine(&mut patch, &record, &mut solutions).unwrap();

    // Basis 1 bisected once per direction at multiplicity one.
    assert_eq!(patch.basis(0).knot_multiplicity(0, 0.5), 1);
    assert_eq!(patch.basis(0).knot_multiplicity(1, 0.5), 1);
    assert_eq!(patch.basis(0).num_basis_functions(), 9);

    // Basis 2 received the same lines doubled.
    assert_eq!(patch.basis(1).knot_multiplicity(0, 0.5), 2);
    assert_eq!(patch.basis(1).knot_multiplicity(1, 0.5), 2);
    assert_eq!(patch.basis(1).num_basis_functions(), 16);
    let doubled = patch
        .basis(1)
        .mesh_lines()
        .into_iter()
        .find(|line| line.direction == LineDirection::ConstU && (line.value - 0.5).abs() < 1e-12)
        .unwrap();
    assert_eq!(doubled.multiplicity, 2);

    // P5: the transferred vector matches the new cumulative DOF count.
    assert_eq!(patch.total_dofs(), 9 + 16);
    assert_eq!(solutions[0].len(), patch.total_dofs());
}

#[test]
fn solution_transfer_preserves_the_represented_field() {
    let mut patch = raise_basis1_patch();
    let mut solutions = [patch_solution(&patch)];
    let record = RefinementRecord {
        elements: vec![0],
        errors: Vec::new(),
    };
    refine(&mut patch, &record, &mut solutions).unwrap();

    let mut ctx = NumberingContext::new();
    patch.generate_numbering(&mut ctx).unwrap();

    // Both fields still represent f(x, y) = 2x + 3y exactly.
    let values = eval_primary(&patch, &solutions[0], &[(0.3, 0.7)], None).unwrap();
    assert_eq!(values.nrows(), 2);
    assert_scalar_eq!(values[(0, 0)], 2.7, comp = abs, tol = 1e-12);
    assert_scalar_eq!(values[(1, 0)], 2.7, comp = abs, tol = 1e-12);
}

#[test]
fn every_generation_is_transferred_independently() {
    let mut patch = raise_basis1_patch();
    let linear = patch_solution(&patch);
    let constant = DVector::from_element(patch.total_dofs(), 1.0);
    let mut solutions = [linear, constant];

    let record = RefinementRecord {
        elements: vec![0],
        errors: Vec::new(),
    };
    refine(&mut patch, &record, &mut solutions).unwrap();

    let new_length = patch.total_dofs();
    assert_eq!(solutions[0].len(), new_length);
    assert_eq!(solutions[1].len(), new_length);
    // The constant generation stays a partition-of-unity combination:
    // every refined coefficient is exactly one.
    for &value in solutions[1].iter() {
        assert_scalar_eq!(value, 1.0, comp = abs, tol = 1e-13);
    }
}

#[test]
fn empty_records_and_shared_patches_are_noops() {
    let mut patch = raise_basis1_patch();
    let before = patch.basis(0).num_basis_functions();
    let mut solutions = [patch_solution(&patch)];

    refine(&mut patch, &RefinementRecord::default(), &mut solutions).unwrap();
    assert_eq!(patch.basis(0).num_basis_functions(), before);

    patch.set_shares_fe(true);
    let record = RefinementRecord {
        elements: vec![0],
        errors: Vec::new(),
    };
    refine(&mut patch, &record, &mut solutions).unwrap();
    assert_eq!(patch.basis(0).num_basis_functions(), before);
}

#[test]
fn refinement_invalidates_numbering_and_thread_groups() {
    let mut patch = raise_basis1_patch();
    let groups = generate_thread_groups(&patch);
    assert!(groups.is_current(&patch));

    let mut solutions = [patch_solution(&patch)];
    let record = RefinementRecord {
        elements: vec![0],
        errors: Vec::new(),
    };
    refine(&mut patch, &record, &mut solutions).unwrap();

    assert!(!patch.has_numbering());
    assert!(!groups.is_current(&patch));
}

#[test]
fn subgrid_refinement_rebuilds_the_first_basis() {
    let primal = TensorBasis::unit_square(2, 1);
    let refinement = primal.raise_order(1, 1, false);
    let mut subgrid = refinement.clone();
    subgrid.refine_all_functions().unwrap();
    let mut patch = MixedPatch::from_bases(
        vec![subgrid, primal],
        vec![1, 1],
        MixedPolicy::Subgrid,
        Some(refinement),
    )
    .unwrap();
    let mut ctx = NumberingContext::new();
    patch.generate_numbering(&mut ctx).unwrap();

    let mut solutions = [DVector::from_element(patch.total_dofs(), 1.0)];
    let record = RefinementRecord {
        elements: vec![0],
        errors: Vec::new(),
    };
    refine(&mut patch, &record, &mut solutions).unwrap();

    // The refinement basis was bisected into 2x2 elements; basis 1 is its
    // uniformly refined copy.
    assert_eq!(num_refinement_elements(&patch), 4);
    assert_eq!(patch.basis(0).num_elements(), 16);
    assert_eq!(patch.projection_role(), RoleRef::Field(0));
    assert_eq!(solutions[0].len(), patch.total_dofs());
}

#[test]
fn errors_remap_onto_the_refinement_basis() {
    // A 2x2 geometry against a single-element refinement basis: all four
    // element indicators accumulate on the one refinement element.
    let first = TensorBasis::unit_square(3, 2);
    let second = TensorBasis::unit_square(2, 2);
    let aux = TensorBasis::unit_square(3, 1);
    let patch = MixedPatch::from_bases(
        vec![first, second],
        vec![1, 1],
        MixedPolicy::ReducedContRaiseBasis1,
        Some(aux),
    )
    .unwrap();

    let element_errors = remap_errors(&patch, &[1.0, 2.0, 3.0, 4.0], true).unwrap();
    assert_eq!(element_errors.len(), 1);
    assert_scalar_eq!(element_errors[0], 10.0, comp = abs, tol = 1e-14);

    let nodal_errors = remap_errors(&patch, &[1.0, 2.0, 3.0, 4.0], false).unwrap();
    assert_eq!(nodal_errors.len(), num_refinement_nodes(&patch));
    // Every function of the single element supports all of it.
    for &value in &nodal_errors {
        assert_scalar_eq!(value, 10.0, comp = abs, tol = 1e-14);
    }
}
