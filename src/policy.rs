//! Mixed-formulation policies.
//!
//! A policy decides, once at patch construction, how the coupled bases are
//! derived from a single primal basis, which basis carries the geometry,
//! how the projection and refinement roles are assigned, which bases
//! constrain the element coloring, and how mesh-line insertions propagate
//! under adaptive refinement. Everything a policy decides is tabulated
//! here; nothing else in the crate branches on the policy.

use crate::basis::SplineBasis;
use crate::Real;
use serde::{Deserialize, Serialize};

/// The supported mixed-formulation constructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MixedPolicy {
    /// Raise the order of the primal basis and use it as the first basis,
    /// keeping full continuity.
    FullContRaiseBasis1,
    /// As [`MixedPolicy::FullContRaiseBasis1`], but with reduced
    /// inter-element continuity for the raised basis.
    ReducedContRaiseBasis1,
    /// Raise the order of the primal basis and use it as the second basis.
    FullContRaiseBasis2,
    /// As [`MixedPolicy::FullContRaiseBasis2`], with reduced continuity.
    ReducedContRaiseBasis2,
    /// Divergence-compatible triple: per-direction order-raised field
    /// bases plus a dedicated geometry basis raised in both directions.
    DivCompatible,
    /// The second basis is the primal one; the first lives on a uniformly
    /// refined subgrid of the refinement basis.
    Subgrid,
}

/// How a patch role (projection or refinement basis) is backed: either an
/// alias of a field basis, or the distinct auxiliary basis owned by the
/// patch. Aliasing is a queryable fact, not incidental pointer equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleRef {
    Field(usize),
    Distinct,
}

/// The bases and role assignments produced by a policy from one primal
/// basis.
#[derive(Debug)]
pub struct DerivedBases<B> {
    pub bases: Vec<B>,
    /// The distinct auxiliary basis backing `RoleRef::Distinct` roles, if
    /// any. Both roles share it when both are distinct.
    pub aux: Option<B>,
    pub projection: RoleRef,
    pub refinement: RoleRef,
}

impl MixedPolicy {
    /// Number of field bases the policy constructs.
    pub fn num_bases(self) -> usize {
        match self {
            MixedPolicy::DivCompatible => 3,
            _ => 2,
        }
    }

    /// Index of the basis that carries the geometry mapping: the basis
    /// holding the unraised primal spline.
    pub fn geo_basis(self) -> usize {
        match self {
            MixedPolicy::FullContRaiseBasis1
            | MixedPolicy::ReducedContRaiseBasis1
            | MixedPolicy::Subgrid => 1,
            MixedPolicy::FullContRaiseBasis2 | MixedPolicy::ReducedContRaiseBasis2 => 0,
            MixedPolicy::DivCompatible => 2,
        }
    }

    /// Field bases that contribute adjacency constraints to the element
    /// coloring in addition to the scheduling basis.
    pub fn secondary_constraints(self) -> &'static [usize] {
        match self {
            MixedPolicy::Subgrid | MixedPolicy::ReducedContRaiseBasis1 => &[1],
            MixedPolicy::ReducedContRaiseBasis2 => &[0],
            MixedPolicy::DivCompatible => &[0, 1],
            _ => &[],
        }
    }

    /// Fixed scheduling basis, if the policy dictates one; otherwise the
    /// scheduler picks the highest-order field basis.
    pub fn scheduling_basis_override(self) -> Option<usize> {
        match self {
            MixedPolicy::DivCompatible => Some(2),
            _ => None,
        }
    }

    /// Default multiplicity for mesh lines propagated from the refinement
    /// basis into the given field basis. Lines recorded with multiplicity
    /// greater than one on the refinement basis override this.
    ///
    /// Bases designated to retain one order less of continuity take new
    /// lines at multiplicity one; all other non-refinement bases take them
    /// doubled.
    pub fn refinement_multiplicity(self, basis: usize) -> usize {
        match self {
            MixedPolicy::ReducedContRaiseBasis1 if basis == 0 => 1,
            MixedPolicy::ReducedContRaiseBasis2 if basis == 1 => 1,
            MixedPolicy::DivCompatible if basis < 2 => 1,
            _ => 2,
        }
    }

    /// Whether refinement rebuilds the first basis from scratch as a
    /// uniformly refined copy of the refinement basis.
    pub fn uses_subgrid_rebuild(self) -> bool {
        matches!(self, MixedPolicy::Subgrid)
    }

    /// Build the coupled bases and role assignments from a primal basis.
    pub fn derive<T, B>(self, primal: &B) -> eyre::Result<DerivedBases<B>>
    where
        T: Real,
        B: SplineBasis<T> + Clone,
    {
        let derived = match self {
            MixedPolicy::FullContRaiseBasis1 => DerivedBases {
                bases: vec![primal.raise_order(1, 1, false), primal.clone()],
                aux: None,
                projection: RoleRef::Field(0),
                refinement: RoleRef::Field(0),
            },
            MixedPolicy::ReducedContRaiseBasis1 => DerivedBases {
                bases: vec![primal.raise_order(1, 1, true), primal.clone()],
                aux: Some(primal.raise_order(1, 1, false)),
                projection: RoleRef::Distinct,
                refinement: RoleRef::Distinct,
            },
            MixedPolicy::FullContRaiseBasis2 => DerivedBases {
                bases: vec![primal.clone(), primal.raise_order(1, 1, false)],
                aux: None,
                projection: RoleRef::Field(0),
                refinement: RoleRef::Field(0),
            },
            MixedPolicy::ReducedContRaiseBasis2 => DerivedBases {
                bases: vec![primal.clone(), primal.raise_order(1, 1, true)],
                aux: Some(primal.raise_order(1, 1, false)),
                projection: RoleRef::Distinct,
                refinement: RoleRef::Distinct,
            },
            MixedPolicy::DivCompatible => DerivedBases {
                bases: vec![
                    primal.raise_order(1, 0, true),
                    primal.raise_order(0, 1, true),
                    primal.raise_order(1, 1, false),
                ],
                aux: Some(primal.raise_order(1, 1, false)),
                projection: RoleRef::Distinct,
                refinement: RoleRef::Distinct,
            },
            MixedPolicy::Subgrid => {
                let refinement = primal.raise_order(1, 1, false);
                let mut subgrid = refinement.clone();
                subgrid.refine_all_functions()?;
                DerivedBases {
                    bases: vec![subgrid, primal.clone()],
                    aux: Some(refinement),
                    projection: RoleRef::Field(0),
                    refinement: RoleRef::Distinct,
                }
            }
        };
        Ok(derived)
    }
}
