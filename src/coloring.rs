//! Element coloring for race-free parallel assembly.
//!
//! Elements of the scheduling basis are partitioned into color groups such
//! that no two elements of a group share a basis function — neither on the
//! scheduling basis itself nor on any secondary-constraint basis dictated
//! by the mixed-formulation policy. Groups are processed sequentially and
//! their elements in parallel, so scatter-add assembly inside a group can
//! never race.

use crate::basis::SplineBasis;
use crate::correspond::correspond_from;
use crate::patch::MixedPatch;
use crate::Real;
use rustc_hash::FxHashSet;

/// A partition of scheduling-basis elements into conflict-free groups,
/// stamped with the patch generation it was computed for.
#[derive(Debug, Clone)]
pub struct ThreadGroups {
    colors: Vec<Vec<usize>>,
    scheduling_basis: usize,
    generation: u64,
}

impl ThreadGroups {
    pub fn colors(&self) -> &[Vec<usize>] {
        &self.colors
    }

    pub fn num_colors(&self) -> usize {
        self.colors.len()
    }

    /// Index of the basis whose elements the groups partition.
    pub fn scheduling_basis(&self) -> usize {
        self.scheduling_basis
    }

    /// Whether the partition still matches the patch (no refinement since
    /// it was computed).
    pub fn is_current<T, B>(&self, patch: &MixedPatch<T, B>) -> bool
    where
        T: Real,
        B: SplineBasis<T>,
    {
        self.generation == patch.generation()
    }
}

/// The basis that drives element scheduling: the policy override if any,
/// otherwise the field basis with the highest order in the first direction
/// (ties resolved to the first encountered).
pub fn scheduling_basis<T, B>(patch: &MixedPatch<T, B>) -> usize
where
    T: Real,
    B: SplineBasis<T>,
{
    if let Some(basis) = patch.policy().scheduling_basis_override() {
        return basis;
    }
    let mut best = 0;
    let mut best_order = 0;
    for b in 0..patch.num_bases() {
        let order = patch.basis(b).order(0);
        if order > best_order {
            best = b;
            best_order = order;
        }
    }
    best
}

/// Partition the scheduling basis's elements into conflict-free groups by
/// greedy first-fit coloring.
///
/// Adjacency is "shares at least one basis function", taken as the union
/// over the scheduling basis and the policy's secondary-constraint bases;
/// constraint supports are matched per element through midpoint
/// containment. An element subset on the patch restricts the partition.
/// A degenerate partition (fewer than two groups) carries no parallel
/// benefit and is reported through the log, not as an error.
pub fn generate_thread_groups<T, B>(patch: &MixedPatch<T, B>) -> ThreadGroups
where
    T: Real,
    B: SplineBasis<T>,
{
    let scheduling = scheduling_basis(patch);
    let secondary = patch.policy().secondary_constraints();

    let elements: Vec<usize> = match patch.element_subset() {
        Some(subset) => subset.to_vec(),
        None => (0..patch.basis(scheduling).num_elements()).collect(),
    };

    let mut colors: Vec<Vec<usize>> = Vec::new();
    let mut color_supports: Vec<FxHashSet<(usize, usize)>> = Vec::new();
    let mut conflict = FxHashSet::default();

    'element_loop: for &element in &elements {
        conflict.clear();
        for f in patch.basis(scheduling).element_support(element) {
            conflict.insert((scheduling, f));
        }
        // Constraint bases may be refined differently; match their
        // overlapping elements by midpoint containment.
        let corr = if secondary.is_empty() {
            None
        } else {
            correspond_from(patch, scheduling, element).ok()
        };
        if let Some(corr) = &corr {
            for &sec in secondary {
                for f in patch.basis(sec).element_support(corr.elements[sec]) {
                    conflict.insert((sec, f));
                }
            }
        }

        for (color, supports) in colors.iter_mut().zip(&mut color_supports) {
            if supports.is_disjoint(&conflict) {
                color.push(element);
                supports.extend(conflict.iter().copied());
                continue 'element_loop;
            }
        }

        colors.push(vec![element]);
        color_supports.push(conflict.clone());
    }

    analyze_groups(&colors);

    ThreadGroups {
        colors,
        scheduling_basis: scheduling,
        generation: patch.generation(),
    }
}

fn analyze_groups(colors: &[Vec<usize>]) {
    if colors.len() < 2 {
        log::info!("element coloring produced a single group; assembly will not run in parallel");
        return;
    }
    log::info!("multiple threads are utilized during element assembly");
    for (i, color) in colors.iter().enumerate() {
        log::debug!("color {}: {} elements", i + 1, color.len());
    }
}
