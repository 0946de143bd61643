//! The basis registry: a patch owning one basis per unknown field plus the
//! geometry/projection/refinement role assignments, and the offset-based
//! global numbering across bases.

use crate::basis::{Edge, SplineBasis};
use crate::policy::{MixedPolicy, RoleRef};
use crate::Real;
use eyre::{bail, eyre};
use nalgebra::{DVector, Point2};
use rustc_hash::FxHashMap;
use std::marker::PhantomData;

/// Running element and node counters for whole-model numbering.
///
/// One context is shared by all patches of a model so that global element
/// and node ids are unique across patches. Ids are one-based, matching the
/// convention of the surrounding simulation drivers.
#[derive(Debug, Default)]
pub struct NumberingContext {
    elements: usize,
    nodes: usize,
}

impl NumberingContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_element(&mut self) -> usize {
        self.elements += 1;
        self.elements
    }

    fn next_node(&mut self) -> usize {
        self.nodes += 1;
        self.nodes
    }
}

/// Classification of a patch node for downstream DOF bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Owned by the first basis.
    Primary,
    /// Owned by basis `b > 0`.
    Secondary(usize),
    /// A Lagrange multiplier node appended after all basis blocks.
    Lagrange,
}

impl NodeType {
    /// Single-character tag: 'D' for the first basis, 'O' + b for basis
    /// `b > 0` ('P', 'Q', ...), 'L' for Lagrange multiplier nodes.
    pub fn tag(self) -> char {
        match self {
            NodeType::Primary => 'D',
            NodeType::Secondary(b) => (b'O' + b as u8) as char,
            NodeType::Lagrange => 'L',
        }
    }
}

/// A patch of coupled, independently refined spline bases over one shared
/// parametric domain.
///
/// Element and node numbering is generated on demand through
/// [`MixedPatch::generate_numbering`] and invalidated by refinement; the
/// `generation` stamp lets cached schedules (thread groups) detect
/// staleness.
pub struct MixedPatch<T: Real, B: SplineBasis<T>> {
    bases: Vec<B>,
    aux: Option<B>,
    projection: RoleRef,
    refinement: RoleRef,
    policy: MixedPolicy,
    geo: usize,
    fields: Vec<usize>,
    nb: Vec<usize>,
    num_lagrange: usize,
    lagrange_dofs: usize,

    // Generated FE topology.
    mlge: Vec<usize>,
    mlgn: Vec<usize>,
    mnpc: Vec<Vec<usize>>,

    first_ip: usize,
    first_bp: FxHashMap<Edge, usize>,
    element_subset: Option<Vec<usize>>,
    shares_fe: bool,
    generation: u64,
    marker: PhantomData<T>,
}

impl<T: Real, B: SplineBasis<T>> MixedPatch<T, B> {
    /// Build a patch from explicitly constructed bases. The auxiliary basis
    /// must be supplied whenever the policy assigns a distinct
    /// projection/refinement basis.
    pub fn from_bases(
        bases: Vec<B>,
        fields: Vec<usize>,
        policy: MixedPolicy,
        aux: Option<B>,
    ) -> eyre::Result<Self> {
        if bases.len() != policy.num_bases() {
            bail!(
                "policy {:?} requires {} bases, got {}",
                policy,
                policy.num_bases(),
                bases.len()
            );
        }
        if fields.len() != bases.len() {
            bail!("one field count per basis required");
        }
        let (projection, refinement) = match policy {
            MixedPolicy::FullContRaiseBasis1 | MixedPolicy::FullContRaiseBasis2 => {
                (RoleRef::Field(0), RoleRef::Field(0))
            }
            MixedPolicy::ReducedContRaiseBasis1
            | MixedPolicy::ReducedContRaiseBasis2
            | MixedPolicy::DivCompatible => (RoleRef::Distinct, RoleRef::Distinct),
            MixedPolicy::Subgrid => (RoleRef::Field(0), RoleRef::Distinct),
        };
        if matches!(projection, RoleRef::Distinct) || matches!(refinement, RoleRef::Distinct) {
            if aux.is_none() {
                bail!("policy {:?} requires a distinct projection/refinement basis", policy);
            }
        }
        Ok(Self {
            geo: policy.geo_basis(),
            nb: bases.iter().map(|b| b.num_basis_functions()).collect(),
            bases,
            aux,
            projection,
            refinement,
            policy,
            fields,
            num_lagrange: 0,
            lagrange_dofs: 1,
            mlge: Vec::new(),
            mlgn: Vec::new(),
            mnpc: Vec::new(),
            first_ip: 0,
            first_bp: FxHashMap::default(),
            element_subset: None,
            shares_fe: false,
            generation: 0,
            marker: PhantomData,
        })
    }

    /// Derive the coupled bases from a single primal basis according to the
    /// policy, then build the patch.
    pub fn from_single_basis(primal: &B, fields: Vec<usize>, policy: MixedPolicy) -> eyre::Result<Self>
    where
        B: Clone,
    {
        let derived = policy.derive::<T, B>(primal)?;
        let mut patch = Self::from_bases(derived.bases, fields, policy, derived.aux)?;
        patch.projection = derived.projection;
        patch.refinement = derived.refinement;
        Ok(patch)
    }

    pub fn num_bases(&self) -> usize {
        self.bases.len()
    }

    pub fn basis(&self, basis: usize) -> &B {
        &self.bases[basis]
    }

    pub fn basis_mut(&mut self, basis: usize) -> &mut B {
        &mut self.bases[basis]
    }

    pub fn policy(&self) -> MixedPolicy {
        self.policy
    }

    /// Index of the geometry basis.
    pub fn geo_basis(&self) -> usize {
        self.geo
    }

    pub fn projection_role(&self) -> RoleRef {
        self.projection
    }

    pub fn refinement_role(&self) -> RoleRef {
        self.refinement
    }

    pub fn projection_basis(&self) -> &B {
        self.role_basis(self.projection)
    }

    pub fn refinement_basis(&self) -> &B {
        self.role_basis(self.refinement)
    }

    pub(crate) fn refinement_basis_mut(&mut self) -> &mut B {
        match self.refinement {
            RoleRef::Field(b) => &mut self.bases[b],
            RoleRef::Distinct => self.aux.as_mut().expect("distinct role requires aux basis"),
        }
    }

    fn role_basis(&self, role: RoleRef) -> &B {
        match role {
            RoleRef::Field(b) => &self.bases[b],
            RoleRef::Distinct => self.aux.as_ref().expect("distinct role requires aux basis"),
        }
    }

    /// Re-point the projection role at a field basis (subgrid rebuild).
    pub(crate) fn set_projection_role(&mut self, role: RoleRef) {
        self.projection = role;
    }

    pub(crate) fn replace_basis(&mut self, basis: usize, new: B) {
        self.nb[basis] = new.num_basis_functions();
        self.bases[basis] = new;
    }

    /// Function count of one basis.
    pub fn basis_nodes(&self, basis: usize) -> usize {
        self.nb[basis]
    }

    /// Total node count across all bases, including Lagrange nodes.
    pub fn num_nodes(&self) -> usize {
        self.nb.iter().sum::<usize>() + self.num_lagrange
    }

    /// Field count of one basis.
    pub fn basis_fields(&self, basis: usize) -> usize {
        self.fields[basis]
    }

    /// Total field count across all bases.
    pub fn num_fields(&self) -> usize {
        self.fields.iter().sum()
    }

    /// Per-basis function counts, in basis order.
    pub fn basis_sizes(&self) -> &[usize] {
        &self.nb
    }

    /// First patch-local node id of the given basis block.
    pub fn node_offset(&self, basis: usize) -> usize {
        self.nb[..basis].iter().sum()
    }

    /// First global DOF of the given basis block.
    pub fn dof_offset(&self, basis: usize) -> usize {
        self.nb[..basis]
            .iter()
            .zip(&self.fields)
            .map(|(nb, nf)| nb * nf)
            .sum()
    }

    /// Cumulative DOF count over all bases.
    pub fn total_dofs(&self) -> usize {
        self.nb
            .iter()
            .zip(&self.fields)
            .map(|(nb, nf)| nb * nf)
            .sum()
    }

    pub fn set_lagrange_nodes(&mut self, nodes: usize, dofs_per_node: usize) {
        self.num_lagrange = nodes;
        self.lagrange_dofs = dofs_per_node;
    }

    /// The basis owning a patch-local node, with the node's basis-local id.
    /// `None` for Lagrange multiplier nodes.
    pub fn node_owner(&self, node: usize) -> Option<(usize, usize)> {
        let mut offset = 0;
        for (b, &nb) in self.nb.iter().enumerate() {
            if node < offset + nb {
                return Some((b, node - offset));
            }
            offset += nb;
        }
        None
    }

    pub fn node_type(&self, node: usize) -> NodeType {
        assert!(node < self.num_nodes(), "node {} out of range", node);
        match self.node_owner(node) {
            Some((0, _)) => NodeType::Primary,
            Some((b, _)) => NodeType::Secondary(b),
            None => NodeType::Lagrange,
        }
    }

    /// DOF count carried by a patch-local node.
    pub fn node_dofs(&self, node: usize) -> usize {
        match self.node_type(node) {
            NodeType::Primary => self.fields[0],
            NodeType::Secondary(b) => self.fields[b],
            NodeType::Lagrange => self.lagrange_dofs,
        }
    }

    /// Physical coordinates of a basis node (its control point).
    pub fn node_coordinates(&self, node: usize) -> eyre::Result<Point2<T>> {
        let (basis, local) = self
            .node_owner(node)
            .ok_or_else(|| eyre!("node {} carries no coordinates", node))?;
        Ok(self.bases[basis].control_point(local))
    }

    /// Extract the sub-vector of a global solution vector belonging to one
    /// basis. The copy is exact; see [`MixedPatch::inject_field_vec`] for
    /// the inverse.
    pub fn extract_field_vec(&self, global: &DVector<T>, basis: usize) -> DVector<T> {
        let offset = self.dof_offset(basis);
        let len = self.nb[basis] * self.fields[basis];
        DVector::from_fn(len, |i, _| global[offset + i])
    }

    /// Write a per-basis nodal vector back into a global solution vector at
    /// the basis's offset.
    pub fn inject_field_vec(&self, node_vec: &DVector<T>, global: &mut DVector<T>, basis: usize) {
        let offset = self.dof_offset(basis);
        for i in 0..node_vec.len() {
            global[offset + i] = node_vec[i];
        }
    }

    /// Generate local and global numbering: per-basis ids first, then
    /// global ids by offset accumulation, plus the element-to-node tables
    /// used by integration. Idempotent until refinement invalidates it.
    pub fn generate_numbering(&mut self, ctx: &mut NumberingContext) -> eyre::Result<()> {
        if self.has_numbering() {
            return Ok(());
        }
        for (j, basis) in self.bases.iter().enumerate() {
            if basis.num_basis_functions() == 0 {
                bail!("basis {} is empty", j);
            }
        }
        self.nb = self.bases.iter().map(|b| b.num_basis_functions()).collect();
        if self.shares_fe {
            return Ok(());
        }

        let geo = &self.bases[self.geo];
        let nel = geo.num_elements();
        let mut mnpc = Vec::with_capacity(nel);
        for el in 0..nel {
            let (mu, mv) = geo.element_domain(el).midpoint();
            let mut nodes = Vec::new();
            let mut offset = 0;
            for (j, basis) in self.bases.iter().enumerate() {
                let elj = if j == self.geo {
                    el
                } else {
                    basis.element_containing(mu, mv).ok_or_else(|| {
                        eyre!("element {} midpoint not contained in basis {}", el, j)
                    })?
                };
                for f in basis.element_support(elj) {
                    nodes.push(f + offset);
                }
                offset += basis.num_basis_functions();
            }
            mnpc.push(nodes);
        }

        self.mnpc = mnpc;
        self.mlge = (0..nel).map(|_| ctx.next_element()).collect();
        self.mlgn = (0..self.num_nodes()).map(|_| ctx.next_node()).collect();
        Ok(())
    }

    pub fn has_numbering(&self) -> bool {
        !self.mnpc.is_empty()
    }

    /// Element count of the geometry basis.
    pub fn num_geo_elements(&self) -> usize {
        self.bases[self.geo].num_elements()
    }

    /// Patch-local node ids supported on a geometry element, concatenated
    /// across bases in basis order.
    pub fn element_nodes(&self, geo_element: usize) -> &[usize] {
        &self.mnpc[geo_element]
    }

    /// Model-global id of a geometry element.
    pub fn global_element_id(&self, geo_element: usize) -> usize {
        self.mlge[geo_element]
    }

    /// Model-global id of a patch-local node.
    pub fn global_node_id(&self, node: usize) -> usize {
        self.mlgn[node]
    }

    pub fn set_first_integration_point(&mut self, first: usize) {
        self.first_ip = first;
    }

    pub fn first_integration_point(&self) -> usize {
        self.first_ip
    }

    pub fn set_boundary_point_offset(&mut self, edge: Edge, first: usize) {
        self.first_bp.insert(edge, first);
    }

    pub fn boundary_point_offset(&self, edge: Edge) -> usize {
        self.first_bp.get(&edge).copied().unwrap_or(0)
    }

    /// Restrict boundary/interface integration and coloring to a subset of
    /// elements (partitioned execution).
    pub fn set_element_subset(&mut self, subset: Option<Vec<usize>>) {
        self.element_subset = subset;
    }

    pub fn element_subset(&self) -> Option<&[usize]> {
        self.element_subset.as_deref()
    }

    /// Mark the patch as sharing finite element data with another patch;
    /// numbering and refinement become no-ops beyond count bookkeeping.
    pub fn set_shares_fe(&mut self, shares: bool) {
        self.shares_fe = shares;
    }

    pub fn shares_fe(&self) -> bool {
        self.shares_fe
    }

    /// Monotone stamp bumped by every refinement; schedules computed for an
    /// older stamp are stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drop all generated numbering after a refinement and refresh the
    /// per-basis function counts.
    pub(crate) fn invalidate_after_refinement(&mut self) {
        self.nb = self.bases.iter().map(|b| b.num_basis_functions()).collect();
        self.mnpc.clear();
        self.mlge.clear();
        self.mlgn.clear();
        self.generation += 1;
    }

    pub(crate) fn require_numbering(&self) -> eyre::Result<()> {
        if !self.has_numbering() {
            bail!("numbering has not been generated for this patch");
        }
        Ok(())
    }
}
