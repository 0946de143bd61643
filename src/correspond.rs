//! Element correspondence between independently refined bases.
//!
//! Bases of a patch share one parametric domain but own unrelated element
//! lists, so an element of one basis is matched to the overlapping element
//! of every other basis purely by locating its parametric midpoint. The
//! query is answered fresh on every call; no correspondence is cached, so
//! interior, boundary and interface integration see identical answers for
//! the same source element as long as no basis is refined in between.

use crate::basis::SplineBasis;
use crate::patch::MixedPatch;
use crate::Real;
use eyre::eyre;

/// Per-basis element ids and support sizes matched to one source element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementCorrespondence {
    /// For every basis, the local id of the element containing the source
    /// element's midpoint.
    pub elements: Vec<usize>,
    /// Support size of each matched element.
    pub support_sizes: Vec<usize>,
}

impl ElementCorrespondence {
    /// Total number of supported functions across all bases.
    pub fn total_support(&self) -> usize {
        self.support_sizes.iter().sum()
    }
}

/// Match an element of `source_basis` against every basis of the patch.
///
/// The source basis maps to the element itself; every other basis is
/// queried by midpoint containment, with no structural nesting assumption
/// between the element lists.
pub fn correspond_from<T, B>(
    patch: &MixedPatch<T, B>,
    source_basis: usize,
    element: usize,
) -> eyre::Result<ElementCorrespondence>
where
    T: Real,
    B: SplineBasis<T>,
{
    let (mu, mv) = patch
        .basis(source_basis)
        .element_domain(element)
        .midpoint();

    let mut elements = Vec::with_capacity(patch.num_bases());
    let mut support_sizes = Vec::with_capacity(patch.num_bases());
    for j in 0..patch.num_bases() {
        let basis = patch.basis(j);
        let elj = if j == source_basis {
            element
        } else {
            basis.element_containing(mu, mv).ok_or_else(|| {
                eyre!(
                    "midpoint of element {} of basis {} is not contained in basis {}",
                    element,
                    source_basis,
                    j
                )
            })?
        };
        elements.push(elj);
        support_sizes.push(basis.element_support(elj).len());
    }
    Ok(ElementCorrespondence {
        elements,
        support_sizes,
    })
}

/// Match a geometry element against every basis of the patch.
pub fn correspond<T, B>(
    patch: &MixedPatch<T, B>,
    geo_element: usize,
) -> eyre::Result<ElementCorrespondence>
where
    T: Real,
    B: SplineBasis<T>,
{
    correspond_from(patch, patch.geo_basis(), geo_element)
}
