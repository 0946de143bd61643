//! The assembly driver: interior, boundary and interface integration
//! loops over a mixed patch.
//!
//! Interior assembly runs color group by color group, elements of a group
//! in parallel, when the global-assembly collaborator declares itself
//! thread safe; otherwise everything runs in one sequential pass. A failed
//! element raises a shared abort flag that stops further scheduling
//! cooperatively — already dispatched element tasks run to completion and
//! their results are discarded with the first error winning.

use crate::assembly::buffers::{element_coordinates, ElementScratch};
use crate::assembly::local::{GlobalAssembler, Integrand, InterfaceChecker, MixedElementValues};
use crate::basis::{Derivs, Edge, SplineBasis};
use crate::coloring::{self, ThreadGroups};
use crate::correspond::{correspond, correspond_from};
use crate::mapping;
use crate::patch::MixedPatch;
use crate::quadrature;
use crate::Real;
use eyre::{bail, eyre, WrapErr};
use itertools::izip;
use nalgebra::{DMatrix, DVector, Point2, Vector2};
use ordered_float::NotNan;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use thread_local::ThreadLocal;

/// Parametric offset used to step across an edge when locating the
/// neighbor element of an interface sub-segment.
const INTERFACE_EPSILON: f64 = 1e-8;

/// Drives element integration over a patch and forwards finished local
/// contributions to the global-assembly collaborator.
pub struct MixedAssembler<T: Real> {
    n_gauss: usize,
    scratch: ThreadLocal<RefCell<ElementScratch<T>>>,
}

impl<T: Real> MixedAssembler<T> {
    /// A driver using a tensor-product Gauss rule with `n_gauss` points
    /// per parametric direction for interior integration.
    pub fn new(n_gauss: usize) -> Self {
        assert!(n_gauss > 0);
        MixedAssembler {
            n_gauss,
            scratch: ThreadLocal::new(),
        }
    }

    pub fn quadrature_order(&self) -> usize {
        self.n_gauss
    }

    /// Interior assembly over all elements of the patch.
    pub fn assemble_interior<B, I, G>(
        &self,
        patch: &MixedPatch<T, B>,
        integrand: &I,
        global_assembler: &G,
        groups: &ThreadGroups,
    ) -> eyre::Result<()>
    where
        B: SplineBasis<T> + Sync,
        I: Integrand<T> + Sync,
        G: GlobalAssembler<T> + Sync,
    {
        if patch.num_bases() == 0 {
            return Ok(());
        }
        patch.require_numbering()?;
        let (wg, xg) = quadrature::gauss::<T>(self.n_gauss);

        if !global_assembler.thread_safe() {
            // The collaborator cannot take concurrent calls: one
            // sequential group covering all elements.
            let scheduling = coloring::scheduling_basis(patch);
            let elements: Vec<usize> = match patch.element_subset() {
                Some(subset) => subset.to_vec(),
                None => (0..patch.basis(scheduling).num_elements()).collect(),
            };
            for element in elements {
                self.integrate_element(
                    patch,
                    integrand,
                    global_assembler,
                    scheduling,
                    element,
                    &wg,
                    &xg,
                )?;
            }
            return Ok(());
        }

        if !groups.is_current(patch) {
            bail!("thread groups are stale; rebuild them after refinement");
        }
        let scheduling = groups.scheduling_basis();
        let abort = AtomicBool::new(false);
        let first_error: Mutex<Option<eyre::Report>> = Mutex::new(None);

        for color in groups.colors() {
            if abort.load(Ordering::Relaxed) {
                break;
            }
            color.par_iter().for_each(|&element| {
                if abort.load(Ordering::Relaxed) {
                    return;
                }
                let result = self.integrate_element(
                    patch,
                    integrand,
                    global_assembler,
                    scheduling,
                    element,
                    &wg,
                    &xg,
                );
                if let Err(err) = result {
                    abort.store(true, Ordering::Relaxed);
                    let mut slot = first_error.lock();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
            });
        }

        match first_error.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// One element of the interior pass, from correspondence lookup to the
    /// global-assembly handoff.
    fn integrate_element<B, I, G>(
        &self,
        patch: &MixedPatch<T, B>,
        integrand: &I,
        global_assembler: &G,
        scheduling: usize,
        element: usize,
        wg: &[T],
        xg: &[T],
    ) -> eyre::Result<()>
    where
        B: SplineBasis<T>,
        I: Integrand<T>,
        G: GlobalAssembler<T>,
    {
        let caps = integrand.capabilities();
        let corr = correspond_from(patch, scheduling, element)?;
        let geo = patch.geo_basis();
        let geo_el = corr.elements[geo];

        let domain = patch.basis(geo).element_domain(geo_el);
        let d_a = domain.area();
        if d_a <= T::zero() {
            bail!("element {} has non-positive parametric area", geo_el);
        }

        let scratch_cell = self.scratch.get_or_default();
        let mut scratch = scratch_cell.borrow_mut();
        scratch.populate_element_coordinates(patch.basis(geo), geo_el);

        let mut fe = MixedElementValues::with_sizes(&corr.support_sizes);
        fe.element = patch.global_element_id(geo_el);
        if caps.element_corners {
            let (corners, h) = physical_corners(patch.basis(geo), geo_el);
            fe.corners = corners;
            fe.h = h;
        }
        let extents = [domain.length(0), domain.length(1)];
        let gpar = [
            quadrature::element_gauss_parameters(&domain, 0, xg),
            quadrature::element_gauss_parameters(&domain, 1, xg),
        ];

        let mut local = integrand.local_integral(&corr.support_sizes, fe.element, false);
        integrand.init_element(
            patch.element_nodes(geo_el),
            &corr.support_sizes,
            patch.basis_sizes(),
            local.as_mut(),
        )?;

        let derivs = if caps.second_derivatives {
            Derivs::Second
        } else {
            Derivs::First
        };
        let n = self.n_gauss;
        let ip_base = patch.first_integration_point() + element * n * n;
        let quarter = T::from_f64(0.25).unwrap();

        for j in 0..n {
            for i in 0..n {
                fe.xi = xg[i];
                fe.eta = xg[j];
                fe.u = gpar[0][i];
                fe.v = gpar[1][j];
                fe.quad_point = ip_base + j * n + i;

                scratch.evals.clear();
                for b in 0..patch.num_bases() {
                    scratch
                        .evals
                        .push(patch.basis(b).evaluate(fe.u, fe.v, corr.elements[b], derivs));
                }
                for (slot, eval) in fe.basis.iter_mut().zip(&scratch.evals) {
                    slot.copy_from(&eval.values);
                }

                let jac = mapping::jacobian(&scratch.xnod, &scratch.evals[geo].derivs, &mut fe.grad[geo]);
                if jac.is_singular() {
                    continue; // skip singular points
                }
                for b in 0..patch.num_bases() {
                    if b != geo {
                        fe.grad[b] =
                            mapping::apply_inverse_jacobian(&scratch.evals[b].derivs, &jac.inverse);
                    }
                }

                if caps.second_derivatives {
                    let hessian = mapping::geometry_hessian(&scratch.xnod, &scratch.evals[geo].second)
                        .wrap_err_with(|| {
                            format!("coordinate-mapping Hessian failed on element {}", geo_el)
                        })?;
                    fe.hess[geo] = mapping::physical_hessian(
                        &hessian,
                        &jac.inverse,
                        &fe.grad[geo],
                        &scratch.evals[geo].second,
                    )
                    .wrap_err_with(|| {
                        format!("geometry second derivatives failed on element {}", geo_el)
                    })?;
                    for b in 0..patch.num_bases() {
                        if b == geo {
                            continue;
                        }
                        match mapping::physical_hessian(
                            &hessian,
                            &jac.inverse,
                            &fe.grad[b],
                            &scratch.evals[b].second,
                        ) {
                            Ok(hess) => fe.hess[b] = hess,
                            Err(err) => log::debug!(
                                "second derivatives unavailable for basis {} on element {}: {}",
                                b,
                                geo_el,
                                err
                            ),
                        }
                    }
                }

                if caps.g_matrix {
                    fe.g_mat = Some(mapping::g_matrix(&jac.inverse, &extents));
                }

                let x = physical_point(&scratch.xnod, &fe.basis[geo]);
                fe.det_jxw = jac.det * quarter * d_a * wg[i] * wg[j];
                integrand.eval_interior(local.as_mut(), &fe, &x)?;
            }
        }

        integrand.finalize_element(local.as_mut(), ip_base)?;
        global_assembler.assemble(local.as_ref(), fe.element)?;
        Ok(())
    }

    /// Boundary (Neumann) assembly over the elements touching one patch
    /// edge. Per-element failures short-circuit the edge loop.
    pub fn assemble_boundary<B, I, G>(
        &self,
        patch: &MixedPatch<T, B>,
        integrand: &I,
        global_assembler: &G,
        edge: Edge,
    ) -> eyre::Result<()>
    where
        B: SplineBasis<T>,
        I: Integrand<T>,
        G: GlobalAssembler<T>,
    {
        if patch.num_bases() == 0 {
            return Ok(());
        }
        patch.require_numbering()?;
        let caps = integrand.capabilities();
        let n_gp = integrand.boundary_quadrature_order(self.n_gauss);
        let (wg, xg) = quadrature::gauss::<T>(n_gp);
        let geo = patch.geo_basis();
        let code = edge.direction_code();
        let t1 = edge.normal_direction();
        let t2 = edge.tangent_direction();
        let half = T::from_f64(0.5).unwrap();
        let mut first_point = patch.boundary_point_offset(edge);

        for element in 0..patch.basis(geo).num_elements() {
            let geo_basis = patch.basis(geo);
            let domain = geo_basis.element_domain(element);
            let on_edge = match edge {
                Edge::UMin => domain.umin == geo_basis.start_param(0),
                Edge::UMax => domain.umax == geo_basis.end_param(0),
                Edge::VMin => domain.vmin == geo_basis.start_param(1),
                Edge::VMax => domain.vmax == geo_basis.end_param(1),
            };
            if !on_edge {
                continue;
            }
            if let Some(subset) = patch.element_subset() {
                if !global_assembler.thread_safe() && !subset.contains(&element) {
                    continue;
                }
            }

            let corr = correspond(patch, element)?;
            let d_s = domain.length(t2) * half;
            if d_s < T::zero() {
                bail!("element {} has negative parametric edge length", element);
            }

            let scratch_cell = self.scratch.get_or_default();
            let mut scratch = scratch_cell.borrow_mut();
            scratch.populate_element_coordinates(geo_basis, element);

            let mut fe = MixedElementValues::with_sizes(&corr.support_sizes);
            fe.element = patch.global_element_id(element);
            let end = if code < 0 { -T::one() } else { T::one() };
            fe.xi = end;
            fe.eta = end;
            if caps.element_corners {
                let (corners, h) = physical_corners(geo_basis, element);
                fe.corners = corners;
                fe.h = h;
            }

            let mut local = integrand.local_integral(&corr.support_sizes, fe.element, true);
            integrand.init_element_boundary(
                patch.element_nodes(element),
                &corr.support_sizes,
                patch.basis_sizes(),
                local.as_mut(),
            )?;

            let fixed = match edge {
                Edge::UMin => geo_basis.start_param(0),
                Edge::UMax => geo_basis.end_param(0),
                Edge::VMin => geo_basis.start_param(1),
                Edge::VMax => geo_basis.end_param(1),
            };
            let gpar_t = quadrature::element_gauss_parameters(&domain, t2, &xg);

            for (i, (&w, &xi, &p)) in izip!(&wg, &xg, &gpar_t).enumerate() {
                if t1 == 1 {
                    fe.xi = xi;
                } else {
                    fe.eta = xi;
                }
                let (u, v) = if t1 == 0 { (fixed, p) } else { (p, fixed) };
                fe.u = u;
                fe.v = v;
                fe.quad_point = first_point + i;

                scratch.evals.clear();
                for b in 0..patch.num_bases() {
                    scratch
                        .evals
                        .push(patch.basis(b).evaluate(u, v, corr.elements[b], Derivs::First));
                }
                for (slot, eval) in fe.basis.iter_mut().zip(&scratch.evals) {
                    slot.copy_from(&eval.values);
                }

                let (jac, mut normal) = mapping::edge_jacobian(
                    &scratch.xnod,
                    &scratch.evals[geo].derivs,
                    &mut fe.grad[geo],
                    edge,
                );
                if jac.is_singular() {
                    continue; // skip singular points
                }
                for b in 0..patch.num_bases() {
                    if b != geo {
                        fe.grad[b] =
                            mapping::apply_inverse_jacobian(&scratch.evals[b].derivs, &jac.inverse);
                    }
                }
                if code < 0 {
                    normal = -normal;
                }

                let x = physical_point(&scratch.xnod, &fe.basis[geo]);
                fe.det_jxw = jac.det * d_s * w;
                integrand.eval_boundary(local.as_mut(), &fe, &x, &normal)?;
            }

            integrand.finalize_element_boundary(local.as_mut(), &fe)?;
            global_assembler.assemble(local.as_ref(), fe.element)?;
            first_point += n_gp;
        }
        Ok(())
    }

    /// Interface (discontinuous-Galerkin style) assembly across the
    /// non-conforming edges reported by the checker.
    pub fn assemble_interface<B, I, G, C>(
        &self,
        patch: &MixedPatch<T, B>,
        integrand: &I,
        global_assembler: &G,
        checker: &C,
    ) -> eyre::Result<()>
    where
        B: SplineBasis<T>,
        I: Integrand<T>,
        G: GlobalAssembler<T>,
        C: InterfaceChecker,
    {
        if patch.num_bases() == 0 {
            return Ok(());
        }
        if !integrand.capabilities().interface_terms {
            return Ok(());
        }
        patch.require_numbering()?;
        let n_gp = integrand.boundary_quadrature_order(self.n_gauss);
        let (wg, xg) = quadrature::gauss::<T>(n_gp);
        let geo = patch.geo_basis();
        let num_bases = patch.num_bases();
        let eps = T::from_f64(INTERFACE_EPSILON).unwrap();
        let half = T::from_f64(0.5).unwrap();

        for element in 0..patch.basis(0).num_elements() {
            let mask = checker.contribution_mask(element);
            if mask == 0 {
                continue;
            }
            if let Some(subset) = patch.element_subset() {
                if !global_assembler.thread_safe() && !subset.contains(&element) {
                    continue;
                }
            }

            let corr = correspond_from(patch, 0, element)?;
            let geo_el = corr.elements[geo];
            let global_element = patch.global_element_id(geo_el);
            let xnod = element_coordinates(patch.basis(geo), geo_el);

            let mut local = integrand.local_integral(&corr.support_sizes, global_element, false);
            integrand.init_element(
                patch.element_nodes(geo_el),
                &corr.support_sizes,
                patch.basis_sizes(),
                local.as_mut(),
            )?;
            let host_solutions = local.solution_vectors().len();

            for edge in [Edge::VMax, Edge::VMin, Edge::UMax, Edge::UMin] {
                if mask & edge.bit() == 0 {
                    continue;
                }
                let code = edge.direction_code();
                let domain = patch.basis(0).element_domain(element);
                let mut u1 = if edge == Edge::UMax { domain.umax } else { domain.umin };
                let mut v1 = if edge == Edge::VMax { domain.vmax } else { domain.vmin };
                let (eps_u, eps_v) = match edge {
                    Edge::UMin => (eps, T::zero()),
                    Edge::UMax => (-eps, T::zero()),
                    Edge::VMin => (T::zero(), eps),
                    Edge::VMax => (T::zero(), -eps),
                };

                let mut cuts = checker
                    .intersections(element, edge)
                    .into_iter()
                    .map(NotNan::new)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| eyre!("NaN intersection parameter on element {}", element))?;
                cuts.sort();
                cuts.dedup();

                for cut in cuts {
                    let cut = T::from_f64(cut.into_inner()).unwrap();
                    let (u2, v2) = if edge.normal_direction() == 0 {
                        (u1, cut)
                    } else {
                        (cut, v1)
                    };

                    // Step across the edge to find the neighbor of this
                    // sub-segment.
                    let neighbor = patch
                        .basis(0)
                        .element_containing(u1 - eps_u, v1 - eps_v)
                        .ok_or_else(|| {
                            eyre!("no neighbor element across edge {:?} of element {}", edge, element)
                        })?;
                    let corr2 = correspond_from(patch, 0, neighbor)?;
                    let geo_el2 = corr2.elements[geo];

                    let mut local2 = integrand.local_integral(
                        &corr2.support_sizes,
                        patch.global_element_id(geo_el2),
                        false,
                    );
                    integrand.init_element(
                        patch.element_nodes(geo_el2),
                        &corr2.support_sizes,
                        patch.basis_sizes(),
                        local2.as_mut(),
                    )?;

                    let mut sizes = corr.support_sizes.clone();
                    sizes.extend_from_slice(&corr2.support_sizes);
                    let mut fe = MixedElementValues::with_sizes(&sizes);
                    fe.element = global_element;
                    let (corners, h) = physical_corners(patch.basis(geo), geo_el2);
                    fe.corners = corners;
                    fe.h = h;

                    // Carry the neighbor's element solution vectors behind
                    // the host's on the combined contribution.
                    {
                        let solutions = local.solution_vectors_mut();
                        solutions.truncate(host_solutions);
                        solutions.extend(local2.solution_vectors().iter().cloned());
                    }
                    drop(local2);

                    let d_s = if edge.normal_direction() == 0 {
                        v2 - v1
                    } else {
                        u2 - u1
                    };
                    let segment: Vec<T> = xg
                        .iter()
                        .map(|&xi| {
                            if edge.normal_direction() == 0 {
                                half * ((v2 - v1) * xi + v2 + v1)
                            } else {
                                half * ((u2 - u1) * xi + u2 + u1)
                            }
                        })
                        .collect();
                    let xnod2 = element_coordinates(patch.basis(geo), geo_el2);

                    for (g, (&w, &xi)) in izip!(&wg, &xg).enumerate() {
                        fe.xi = xi;
                        fe.eta = xi;
                        if edge.normal_direction() == 0 {
                            fe.u = u1;
                            fe.v = segment[g];
                        } else {
                            fe.u = segment[g];
                            fe.v = v1;
                        }
                        fe.quad_point = g;

                        // Host side at point + eps, neighbor side at
                        // point - eps.
                        let mut host_evals = Vec::with_capacity(num_bases);
                        let mut neigh_evals = Vec::with_capacity(num_bases);
                        for b in 0..num_bases {
                            host_evals.push(patch.basis(b).evaluate(
                                fe.u + eps_u,
                                fe.v + eps_v,
                                corr.elements[b],
                                Derivs::First,
                            ));
                            neigh_evals.push(patch.basis(b).evaluate(
                                fe.u - eps_u,
                                fe.v - eps_v,
                                corr2.elements[b],
                                Derivs::First,
                            ));
                        }
                        for b in 0..num_bases {
                            fe.basis[b].copy_from(&host_evals[b].values);
                            fe.basis[b + num_bases].copy_from(&neigh_evals[b].values);
                        }

                        let (jac2, _) = mapping::edge_jacobian(
                            &xnod2,
                            &neigh_evals[geo].derivs,
                            &mut fe.grad[geo + num_bases],
                            edge,
                        );
                        let (jac, mut normal) = mapping::edge_jacobian(
                            &xnod,
                            &host_evals[geo].derivs,
                            &mut fe.grad[geo],
                            edge,
                        );
                        if jac.is_singular() {
                            continue; // skip singular points
                        }
                        for b in 0..num_bases {
                            if b != geo {
                                fe.grad[b] = mapping::apply_inverse_jacobian(
                                    &host_evals[b].derivs,
                                    &jac.inverse,
                                );
                                fe.grad[b + num_bases] = mapping::apply_inverse_jacobian(
                                    &neigh_evals[b].derivs,
                                    &jac2.inverse,
                                );
                            }
                        }
                        if code < 0 {
                            normal = -normal;
                        }

                        let x = physical_point(&xnod, &fe.basis[geo]);
                        fe.det_jxw = jac.det * half * d_s * w;
                        integrand.eval_interface(local.as_mut(), &fe, &x, &normal)?;
                    }

                    if edge.normal_direction() == 0 {
                        v1 = v2;
                    } else {
                        u1 = u2;
                    }
                }
            }

            integrand.finalize_element(local.as_mut(), 0)?;
            global_assembler.assemble(local.as_ref(), global_element)?;
        }
        Ok(())
    }
}

/// Physical coordinates of a parametric point through the geometry
/// mapping.
fn physical_point<T: Real>(xnod: &DMatrix<T>, values: &DVector<T>) -> Point2<T> {
    let mut x = Vector2::zeros();
    for f in 0..values.len() {
        for k in 0..2 {
            x[k] += xnod[(k, f)] * values[f];
        }
    }
    Point2::from(x)
}

/// Physical corners of an element and its characteristic size (largest
/// corner-to-corner distance).
fn physical_corners<T, B>(basis: &B, element: usize) -> (Vec<Point2<T>>, T)
where
    T: Real,
    B: SplineBasis<T>,
{
    let support = basis.element_support(element);
    let domain = basis.element_domain(element);
    let mut corners = Vec::with_capacity(4);
    for (u, v) in domain.corners() {
        let eval = basis.evaluate(u, v, element, Derivs::Values);
        let mut x = Vector2::zeros();
        for (f, &id) in support.iter().enumerate() {
            x += basis.control_point(id).coords * eval.values[f];
        }
        corners.push(Point2::from(x));
    }
    let mut h = T::zero();
    for a in &corners {
        for b in &corners {
            h = h.max((a - b).norm());
        }
    }
    (corners, h)
}
