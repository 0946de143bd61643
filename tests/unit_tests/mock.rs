//! A tensor-product B-spline surface standing in for the external spline
//! kernel in tests.
//!
//! Supports open knot vectors of arbitrary order with Cox-de Boor
//! evaluation (values, first and second parametric derivatives), Boehm
//! knot insertion carrying control points and attached coefficient blocks,
//! Bezier degree elevation for single-span directions, and Greville
//! control points (so a fresh basis maps the parametric domain onto itself
//! identically, and knot insertion preserves that mapping exactly).
//!
//! Mesh lines of a tensor basis always span the full domain, so partial
//! (truly local) lines are inserted as full-span lines here; the tests
//! only rely on line values and multiplicities.

use lrfem::basis::{
    BasisEval, Derivs, LineDirection, MeshLine, ParamRange, RefinementRecord, SplineBasis,
};
use nalgebra::{DMatrix, DVector, Matrix2, Point2};

#[derive(Debug, Clone)]
struct AttachedBlock {
    components: usize,
    coefs: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct TensorBasis {
    order_u: usize,
    order_v: usize,
    knots_u: Vec<f64>,
    knots_v: Vec<f64>,
    /// One control point per function, function id = fv * nu + fu.
    control_points: Vec<[f64; 2]>,
    attached: Vec<AttachedBlock>,
}

impl TensorBasis {
    /// A basis over `[0, 1]^2` with uniform knots, `elems_u` x `elems_v`
    /// elements and Greville control points.
    pub fn rectangle(order_u: usize, order_v: usize, elems_u: usize, elems_v: usize) -> Self {
        let knots_u = open_uniform_knots(order_u, elems_u);
        let knots_v = open_uniform_knots(order_v, elems_v);
        let mut basis = TensorBasis {
            order_u,
            order_v,
            knots_u,
            knots_v,
            control_points: Vec::new(),
            attached: Vec::new(),
        };
        basis.control_points = basis.greville_points();
        basis
    }

    /// Square mesh shorthand.
    pub fn unit_square(order: usize, elements_per_dir: usize) -> Self {
        Self::rectangle(order, order, elements_per_dir, elements_per_dir)
    }

    fn nu(&self) -> usize {
        self.knots_u.len() - self.order_u
    }

    fn nv(&self) -> usize {
        self.knots_v.len() - self.order_v
    }

    fn spans_u(&self) -> Vec<usize> {
        nonzero_spans(&self.knots_u)
    }

    fn spans_v(&self) -> Vec<usize> {
        nonzero_spans(&self.knots_v)
    }

    fn greville_points(&self) -> Vec<[f64; 2]> {
        let gu = greville(&self.knots_u, self.order_u);
        let gv = greville(&self.knots_v, self.order_v);
        let mut points = Vec::with_capacity(gu.len() * gv.len());
        for &y in &gv {
            for &x in &gu {
                points.push([x, y]);
            }
        }
        points
    }

    /// Multiplicity of a knot value in one direction.
    pub fn knot_multiplicity(&self, direction: usize, value: f64) -> usize {
        let knots = if direction == 0 { &self.knots_u } else { &self.knots_v };
        knots.iter().filter(|&&k| (k - value).abs() < 1e-12).count()
    }

    fn insert_knot(&mut self, direction: usize, value: f64) {
        let (order, knots) = if direction == 0 {
            (self.order_u, self.knots_u.clone())
        } else {
            (self.order_v, self.knots_v.clone())
        };
        let p = order - 1;
        let span = insertion_span(&knots, value, order);
        let n_old = knots.len() - order;

        // Boehm coefficients for the new functions.
        let alphas: Vec<f64> = (0..=n_old)
            .map(|i| {
                let i_ = i as isize;
                let k_ = span as isize;
                let p_ = p as isize;
                if i_ <= k_ - p_ {
                    1.0
                } else if i_ >= k_ + 1 {
                    0.0
                } else {
                    (value - knots[i]) / (knots[i + p] - knots[i])
                }
            })
            .collect();

        let combine = |old: &[Vec<f64>]| -> Vec<Vec<f64>> {
            (0..=n_old)
                .map(|i| {
                    let a = alphas[i];
                    if a == 1.0 {
                        old[i].clone()
                    } else if a == 0.0 {
                        old[i - 1].clone()
                    } else {
                        old[i]
                            .iter()
                            .zip(&old[i - 1])
                            .map(|(&c, &cm)| a * c + (1.0 - a) * cm)
                            .collect()
                    }
                })
                .collect()
        };

        let nu = self.nu();
        let nv = self.nv();
        let transform = |values: &[f64], components: usize| -> Vec<f64> {
            // Reorganize into per-direction rows, combine, flatten back.
            let mut result = Vec::new();
            if direction == 0 {
                let mut rows = vec![Vec::new(); nv];
                for fv in 0..nv {
                    let old: Vec<Vec<f64>> = (0..nu)
                        .map(|fu| {
                            let f = fv * nu + fu;
                            values[f * components..(f + 1) * components].to_vec()
                        })
                        .collect();
                    rows[fv] = combine(&old).concat();
                }
                for row in rows {
                    result.extend(row);
                }
            } else {
                let mut columns = vec![Vec::new(); nu];
                for fu in 0..nu {
                    let old: Vec<Vec<f64>> = (0..nv)
                        .map(|fv| {
                            let f = fv * nu + fu;
                            values[f * components..(f + 1) * components].to_vec()
                        })
                        .collect();
                    columns[fu] = combine(&old).concat();
                }
                // Flatten back in function-major (fv outer) order.
                for fv in 0..=nv {
                    for fu in 0..nu {
                        let slice = &columns[fu][fv * components..(fv + 1) * components];
                        result.extend_from_slice(slice);
                    }
                }
            }
            result
        };

        let flat_cps: Vec<f64> = self.control_points.iter().flatten().copied().collect();
        let new_cps = transform(&flat_cps, 2);
        self.control_points = new_cps.chunks(2).map(|c| [c[0], c[1]]).collect();
        for block in &mut self.attached {
            block.coefs = transform(&block.coefs, block.components);
        }

        if direction == 0 {
            self.knots_u.insert(span + 1, value);
        } else {
            self.knots_v.insert(span + 1, value);
        }
    }

    fn elevate_direction(&mut self, direction: usize) {
        assert!(
            self.attached.is_empty(),
            "mock basis cannot elevate with attached coefficients"
        );
        let (order, knots) = if direction == 0 {
            (self.order_u, &self.knots_u)
        } else {
            (self.order_v, &self.knots_v)
        };
        assert_eq!(
            nonzero_spans(knots).len(),
            1,
            "mock basis only elevates single-span directions"
        );
        let p = order - 1;
        let start = knots[0];
        let end = knots[knots.len() - 1];

        let nu = self.nu();
        let nv = self.nv();
        let elevate_row = |row: &[[f64; 2]]| -> Vec<[f64; 2]> {
            let mut out = Vec::with_capacity(p + 2);
            out.push(row[0]);
            for i in 1..=p {
                let a = i as f64 / (p + 1) as f64;
                out.push([
                    a * row[i - 1][0] + (1.0 - a) * row[i][0],
                    a * row[i - 1][1] + (1.0 - a) * row[i][1],
                ]);
            }
            out.push(row[p]);
            out
        };

        let mut new_points = Vec::new();
        if direction == 0 {
            for fv in 0..nv {
                let row: Vec<[f64; 2]> = (0..nu).map(|fu| self.control_points[fv * nu + fu]).collect();
                new_points.extend(elevate_row(&row));
            }
            self.order_u += 1;
            self.knots_u = vec![start; self.order_u]
                .into_iter()
                .chain(vec![end; self.order_u])
                .collect();
        } else {
            let mut columns: Vec<Vec<[f64; 2]>> = Vec::with_capacity(nu);
            for fu in 0..nu {
                let column: Vec<[f64; 2]> =
                    (0..nv).map(|fv| self.control_points[fv * nu + fu]).collect();
                columns.push(elevate_row(&column));
            }
            for fv in 0..=nv {
                for fu in 0..nu {
                    new_points.push(columns[fu][fv]);
                }
            }
            self.order_v += 1;
            self.knots_v = vec![start; self.order_v]
                .into_iter()
                .chain(vec![end; self.order_v])
                .collect();
        }
        self.control_points = new_points;
    }

    fn direction_values(&self, direction: usize, t: f64, derivs: Derivs) -> DirectionValues {
        let (knots, order) = if direction == 0 {
            (&self.knots_u, self.order_u)
        } else {
            (&self.knots_v, self.order_v)
        };
        let p = order - 1;
        let end = knots[knots.len() - 1];
        let n = knots.len() - order;
        let mut values = vec![0.0; n];
        let mut first = vec![0.0; n];
        let mut second = vec![0.0; n];
        for i in 0..n {
            values[i] = bspline_value(knots, i, p, t, end);
            if derivs >= Derivs::First {
                first[i] = bspline_derivative(knots, i, p, t, end);
            }
            if derivs >= Derivs::Second {
                second[i] = bspline_second_derivative(knots, i, p, t, end);
            }
        }
        DirectionValues {
            values,
            first,
            second,
        }
    }
}

struct DirectionValues {
    values: Vec<f64>,
    first: Vec<f64>,
    second: Vec<f64>,
}

impl SplineBasis<f64> for TensorBasis {
    fn num_basis_functions(&self) -> usize {
        self.nu() * self.nv()
    }

    fn num_elements(&self) -> usize {
        self.spans_u().len() * self.spans_v().len()
    }

    fn order(&self, direction: usize) -> usize {
        if direction == 0 {
            self.order_u
        } else {
            self.order_v
        }
    }

    fn start_param(&self, direction: usize) -> f64 {
        if direction == 0 {
            self.knots_u[0]
        } else {
            self.knots_v[0]
        }
    }

    fn end_param(&self, direction: usize) -> f64 {
        if direction == 0 {
            self.knots_u[self.knots_u.len() - 1]
        } else {
            self.knots_v[self.knots_v.len() - 1]
        }
    }

    fn element_domain(&self, element: usize) -> ParamRange<f64> {
        let spans_u = self.spans_u();
        let spans_v = self.spans_v();
        let su = spans_u[element % spans_u.len()];
        let sv = spans_v[element / spans_u.len()];
        ParamRange {
            umin: self.knots_u[su],
            umax: self.knots_u[su + 1],
            vmin: self.knots_v[sv],
            vmax: self.knots_v[sv + 1],
        }
    }

    fn element_support(&self, element: usize) -> Vec<usize> {
        let spans_u = self.spans_u();
        let spans_v = self.spans_v();
        let ku = spans_u[element % spans_u.len()];
        let kv = spans_v[element / spans_u.len()];
        let pu = self.order_u - 1;
        let pv = self.order_v - 1;
        let nu = self.nu();
        let mut support = Vec::with_capacity(self.order_u * self.order_v);
        for fv in (kv - pv)..=kv {
            for fu in (ku - pu)..=ku {
                support.push(fv * nu + fu);
            }
        }
        support
    }

    fn element_containing(&self, u: f64, v: f64) -> Option<usize> {
        let spans_u = self.spans_u();
        let su = containing_span(&self.knots_u, &spans_u, u)?;
        let sv = containing_span(&self.knots_v, &self.spans_v(), v)?;
        Some(sv * spans_u.len() + su)
    }

    fn evaluate(&self, u: f64, v: f64, element: usize, derivs: Derivs) -> BasisEval<f64> {
        let du = self.direction_values(0, u, derivs);
        let dv = self.direction_values(1, v, derivs);
        let support = self.element_support(element);
        let nu = self.nu();

        let n = support.len();
        let mut values = DVector::zeros(n);
        let mut deriv_matrix = if derivs >= Derivs::First {
            DMatrix::zeros(n, 2)
        } else {
            DMatrix::zeros(0, 0)
        };
        let mut second = Vec::new();
        for (k, &f) in support.iter().enumerate() {
            let fu = f % nu;
            let fv = f / nu;
            values[k] = du.values[fu] * dv.values[fv];
            if derivs >= Derivs::First {
                deriv_matrix[(k, 0)] = du.first[fu] * dv.values[fv];
                deriv_matrix[(k, 1)] = du.values[fu] * dv.first[fv];
            }
            if derivs >= Derivs::Second {
                let uu = du.second[fu] * dv.values[fv];
                let uv = du.first[fu] * dv.first[fv];
                let vv = du.values[fu] * dv.second[fv];
                second.push(Matrix2::new(uu, uv, uv, vv));
            }
        }
        BasisEval {
            values,
            derivs: deriv_matrix,
            second,
        }
    }

    fn control_point(&self, function: usize) -> Point2<f64> {
        let cp = self.control_points[function];
        Point2::new(cp[0], cp[1])
    }

    fn mesh_lines(&self) -> Vec<MeshLine<f64>> {
        let mut lines = Vec::new();
        collect_interior_lines(
            &self.knots_u,
            self.order_u,
            LineDirection::ConstU,
            self.knots_v[0],
            *self.knots_v.last().unwrap(),
            &mut lines,
        );
        collect_interior_lines(
            &self.knots_v,
            self.order_v,
            LineDirection::ConstV,
            self.knots_u[0],
            *self.knots_u.last().unwrap(),
            &mut lines,
        );
        lines
    }

    fn insert_mesh_line(&mut self, line: &MeshLine<f64>, multiplicity: usize) -> eyre::Result<()> {
        let direction = match line.direction {
            LineDirection::ConstU => 0,
            LineDirection::ConstV => 1,
        };
        let existing = self.knot_multiplicity(direction, line.value);
        for _ in existing..multiplicity {
            self.insert_knot(direction, line.value);
        }
        Ok(())
    }

    fn refine(&mut self, record: &RefinementRecord) -> eyre::Result<()> {
        let elements = if !record.elements.is_empty() {
            record.elements.clone()
        } else {
            // Error-driven: refine elements above the mean indicator.
            let mean = record.errors.iter().sum::<f64>() / record.errors.len() as f64;
            record
                .errors
                .iter()
                .enumerate()
                .filter(|(_, &e)| e >= mean)
                .map(|(i, _)| i)
                .collect()
        };
        let mut cuts_u = Vec::new();
        let mut cuts_v = Vec::new();
        for &element in &elements {
            let domain = self.element_domain(element);
            cuts_u.push(0.5 * (domain.umin + domain.umax));
            cuts_v.push(0.5 * (domain.vmin + domain.vmax));
        }
        for cut in dedup_values(cuts_u) {
            self.insert_knot(0, cut);
        }
        for cut in dedup_values(cuts_v) {
            self.insert_knot(1, cut);
        }
        Ok(())
    }

    fn refine_all_functions(&mut self) -> eyre::Result<()> {
        let record = RefinementRecord {
            elements: (0..self.num_elements()).collect(),
            errors: Vec::new(),
        };
        self.refine(&record)
    }

    fn raise_order(&self, diff_u: usize, diff_v: usize, _reduced_continuity: bool) -> Self {
        let mut raised = self.clone();
        for _ in 0..diff_u {
            raised.elevate_direction(0);
        }
        for _ in 0..diff_v {
            raised.elevate_direction(1);
        }
        raised.attached.clear();
        raised
    }

    fn attach_coefficients(&mut self, coefs: &[f64], components: usize) {
        assert_eq!(coefs.len(), self.num_basis_functions() * components);
        self.attached.push(AttachedBlock {
            components,
            coefs: coefs.to_vec(),
        });
    }

    fn extract_coefficients(&self, block: usize, components: usize) -> Vec<f64> {
        match self.attached.get(block) {
            Some(attached) => {
                assert_eq!(attached.components, components);
                attached.coefs.clone()
            }
            None => vec![0.0; self.num_basis_functions() * components],
        }
    }

    fn clear_attached(&mut self) {
        self.attached.clear();
    }
}

fn open_uniform_knots(order: usize, elements: usize) -> Vec<f64> {
    assert!(order >= 1 && elements >= 1);
    let mut knots = vec![0.0; order];
    for i in 1..elements {
        knots.push(i as f64 / elements as f64);
    }
    knots.extend(vec![1.0; order]);
    knots
}

fn greville(knots: &[f64], order: usize) -> Vec<f64> {
    let p = order - 1;
    let n = knots.len() - order;
    (0..n)
        .map(|i| {
            if p == 0 {
                0.5 * (knots[i] + knots[i + 1])
            } else {
                knots[i + 1..i + 1 + p].iter().sum::<f64>() / p as f64
            }
        })
        .collect()
}

fn nonzero_spans(knots: &[f64]) -> Vec<usize> {
    (0..knots.len() - 1).filter(|&k| knots[k] < knots[k + 1]).collect()
}

fn containing_span(knots: &[f64], spans: &[usize], t: f64) -> Option<usize> {
    for (idx, &k) in spans.iter().enumerate() {
        let last = idx + 1 == spans.len();
        if knots[k] <= t && (t < knots[k + 1] || (last && t <= knots[k + 1])) {
            return Some(idx);
        }
    }
    None
}

/// Span index for knot insertion: the last span whose lower knot does not
/// exceed the value.
fn insertion_span(knots: &[f64], value: f64, order: usize) -> usize {
    let mut span = order - 1;
    for k in nonzero_spans(knots) {
        if knots[k] <= value {
            span = k;
        }
    }
    span
}

fn collect_interior_lines(
    knots: &[f64],
    order: usize,
    direction: LineDirection,
    start: f64,
    stop: f64,
    lines: &mut Vec<MeshLine<f64>>,
) {
    let mut i = order;
    while i < knots.len() - order {
        let value = knots[i];
        let mut multiplicity = 1;
        while i + 1 < knots.len() - order && knots[i + 1] == value {
            multiplicity += 1;
            i += 1;
        }
        lines.push(MeshLine {
            direction,
            value,
            start,
            stop,
            multiplicity,
        });
        i += 1;
    }
}

fn dedup_values(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    values.dedup();
    values
}

/// Piecewise-constant indicator with the last nonzero span closed on the
/// right.
fn span_indicator(knots: &[f64], i: usize, t: f64, end: f64) -> f64 {
    let lo = knots[i];
    let hi = knots[i + 1];
    if lo == hi {
        return 0.0;
    }
    if t >= lo && (t < hi || (hi == end && t <= hi)) {
        1.0
    } else {
        0.0
    }
}

fn bspline_value(knots: &[f64], i: usize, p: usize, t: f64, end: f64) -> f64 {
    if p == 0 {
        return span_indicator(knots, i, t, end);
    }
    let mut value = 0.0;
    let d1 = knots[i + p] - knots[i];
    if d1 > 0.0 {
        value += (t - knots[i]) / d1 * bspline_value(knots, i, p - 1, t, end);
    }
    let d2 = knots[i + p + 1] - knots[i + 1];
    if d2 > 0.0 {
        value += (knots[i + p + 1] - t) / d2 * bspline_value(knots, i + 1, p - 1, t, end);
    }
    value
}

fn bspline_derivative(knots: &[f64], i: usize, p: usize, t: f64, end: f64) -> f64 {
    if p == 0 {
        return 0.0;
    }
    let mut value = 0.0;
    let d1 = knots[i + p] - knots[i];
    if d1 > 0.0 {
        value += p as f64 / d1 * bspline_value(knots, i, p - 1, t, end);
    }
    let d2 = knots[i + p + 1] - knots[i + 1];
    if d2 > 0.0 {
        value -= p as f64 / d2 * bspline_value(knots, i + 1, p - 1, t, end);
    }
    value
}

fn bspline_second_derivative(knots: &[f64], i: usize, p: usize, t: f64, end: f64) -> f64 {
    if p == 0 {
        return 0.0;
    }
    let mut value = 0.0;
    let d1 = knots[i + p] - knots[i];
    if d1 > 0.0 {
        value += p as f64 / d1 * bspline_derivative(knots, i, p - 1, t, end);
    }
    let d2 = knots[i + p + 1] - knots[i + 1];
    if d2 > 0.0 {
        value -= p as f64 / d2 * bspline_derivative(knots, i + 1, p - 1, t, end);
    }
    value
}

mod sanity {
    use super::*;

    #[test]
    fn linear_basis_is_identity_map() {
        let basis = TensorBasis::unit_square(2, 1);
        assert_eq!(basis.num_basis_functions(), 4);
        assert_eq!(basis.num_elements(), 1);
        let eval = basis.evaluate(0.3, 0.8, 0, Derivs::First);
        let total: f64 = eval.values.iter().sum();
        assert!((total - 1.0).abs() < 1e-14);
        // Greville control points reproduce the parametric coordinates.
        let mut x = 0.0;
        let mut y = 0.0;
        for (k, &f) in basis.element_support(0).iter().enumerate() {
            let cp = basis.control_point(f);
            x += cp.x * eval.values[k];
            y += cp.y * eval.values[k];
        }
        assert!((x - 0.3).abs() < 1e-14);
        assert!((y - 0.8).abs() < 1e-14);
    }

    #[test]
    fn knot_insertion_preserves_geometry() {
        let mut basis = TensorBasis::unit_square(3, 2);
        basis.insert_knot(0, 0.3);
        basis.insert_knot(1, 0.7);
        let element = basis.element_containing(0.55, 0.55).unwrap();
        let eval = basis.evaluate(0.55, 0.55, element, Derivs::Values);
        let mut x = 0.0;
        for (k, &f) in basis.element_support(element).iter().enumerate() {
            x += basis.control_point(f).x * eval.values[k];
        }
        assert!((x - 0.55).abs() < 1e-12);
    }

    #[test]
    fn elevation_keeps_partition_of_unity() {
        let basis = TensorBasis::unit_square(2, 1).raise_order(1, 1, false);
        assert_eq!(basis.order(0), 3);
        assert_eq!(basis.num_basis_functions(), 9);
        let eval = basis.evaluate(0.4, 0.9, 0, Derivs::Values);
        let total: f64 = eval.values.iter().sum();
        assert!((total - 1.0).abs() < 1e-14);
    }
}
