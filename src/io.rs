//! Diagnostic mesh output.
//!
//! Dumps the parametric and physical meshes of every basis of a patch to
//! simple Postscript files, one file per selected representation and
//! basis tag (`basis1`, `basis2`, ..., plus `proj` and `ref`).

use crate::basis::{Derivs, SplineBasis};
use crate::patch::MixedPatch;
use crate::Real;
use eyre::WrapErr;
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Which mesh representations to emit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshDumpOptions {
    /// The parametric mesh ("param" file stem).
    pub parametric: bool,
    /// The physical element outlines ("physical").
    pub physical: bool,
    /// The parametric mesh with element midpoints marked ("param_dot").
    pub parametric_nodes: bool,
    /// The physical elements with control points marked ("physical_dot").
    pub physical_nodes: bool,
}

impl MeshDumpOptions {
    /// Decode the four representation bits, lowest bit first.
    pub fn from_bits(bits: u32) -> Self {
        MeshDumpOptions {
            parametric: bits & 1 != 0,
            physical: bits & 2 != 0,
            parametric_nodes: bits & 4 != 0,
            physical_nodes: bits & 8 != 0,
        }
    }

    pub fn any(&self) -> bool {
        self.parametric || self.physical || self.parametric_nodes || self.physical_nodes
    }
}

/// Write the selected mesh representations of every basis of the patch
/// into `directory`, with file names `<stem>_patch_<tag>_<name>.eps`.
pub fn store_mesh<T, B>(
    patch: &MixedPatch<T, B>,
    name: &str,
    options: MeshDumpOptions,
    directory: &Path,
) -> eyre::Result<()>
where
    T: Real,
    B: SplineBasis<T>,
{
    if !options.any() {
        return Ok(());
    }
    for b in 0..patch.num_bases() {
        let tag = format!("basis{}", b + 1);
        write_basis_representations(patch.basis(b), &tag, name, options, directory)?;
    }
    write_basis_representations(patch.projection_basis(), "proj", name, options, directory)?;
    write_basis_representations(patch.refinement_basis(), "ref", name, options, directory)?;
    log::debug!("wrote mesh diagnostics for '{}' to {}", name, directory.display());
    Ok(())
}

fn write_basis_representations<T, B>(
    basis: &B,
    tag: &str,
    name: &str,
    options: MeshDumpOptions,
    directory: &Path,
) -> eyre::Result<()>
where
    T: Real,
    B: SplineBasis<T>,
{
    let open = |stem: &str| -> eyre::Result<BufWriter<File>> {
        let path = directory.join(format!("{}_patch_{}_{}.eps", stem, tag, name));
        let file = File::create(&path)
            .wrap_err_with(|| format!("cannot create mesh dump {}", path.display()))?;
        Ok(BufWriter::new(file))
    };

    if options.parametric {
        write_parametric_mesh(basis, &mut open("param")?, false)?;
    }
    if options.physical {
        write_physical_elements(basis, &mut open("physical")?, false)?;
    }
    if options.parametric_nodes {
        write_parametric_mesh(basis, &mut open("param_dot")?, true)?;
    }
    if options.physical_nodes {
        write_physical_elements(basis, &mut open("physical_dot")?, true)?;
    }
    Ok(())
}

/// Draw the parametric element rectangles, optionally with element
/// midpoints marked.
pub fn write_parametric_mesh<T, B, W>(basis: &B, out: &mut W, with_dots: bool) -> eyre::Result<()>
where
    T: Real,
    B: SplineBasis<T>,
    W: Write,
{
    let scale = |u: T, v: T| -> (f64, f64) {
        let span_u = basis.end_param(0) - basis.start_param(0);
        let span_v = basis.end_param(1) - basis.start_param(1);
        let x = (u - basis.start_param(0)) / span_u;
        let y = (v - basis.start_param(1)) / span_v;
        (to_f64(x) * 500.0, to_f64(y) * 500.0)
    };

    write_header(out)?;
    for element in 0..basis.num_elements() {
        let domain = basis.element_domain(element);
        let corners = domain.corners();
        write_polygon(
            out,
            &corners.map(|(u, v)| scale(u, v)),
        )?;
        if with_dots {
            let (mu, mv) = domain.midpoint();
            let (x, y) = scale(mu, mv);
            writeln!(out, "{:.3} {:.3} 2 0 360 arc fill", x, y)?;
        }
    }
    writeln!(out, "showpage")?;
    Ok(())
}

/// Draw the physical element outlines (mapped element corners),
/// optionally with the control points marked.
pub fn write_physical_elements<T, B, W>(basis: &B, out: &mut W, with_dots: bool) -> eyre::Result<()>
where
    T: Real,
    B: SplineBasis<T>,
    W: Write,
{
    // Collect mapped corners first to find the bounding box.
    let mut polygons = Vec::with_capacity(basis.num_elements());
    for element in 0..basis.num_elements() {
        let support = basis.element_support(element);
        let domain = basis.element_domain(element);
        let mut polygon = [(0.0, 0.0); 4];
        for (k, (u, v)) in domain.corners().into_iter().enumerate() {
            let eval = basis.evaluate(u, v, element, Derivs::Values);
            let mut x = Vector2::zeros();
            for (f, &id) in support.iter().enumerate() {
                x += basis.control_point(id).coords * eval.values[f];
            }
            polygon[k] = (to_f64(x[0]), to_f64(x[1]));
        }
        polygons.push(polygon);
    }
    let mut dots = Vec::new();
    if with_dots {
        for f in 0..basis.num_basis_functions() {
            let cp: Point2<T> = basis.control_point(f);
            dots.push((to_f64(cp.x), to_f64(cp.y)));
        }
    }

    let all = polygons
        .iter()
        .flatten()
        .chain(dots.iter())
        .copied()
        .collect::<Vec<_>>();
    let (min_x, max_x) = bounds(all.iter().map(|p| p.0));
    let (min_y, max_y) = bounds(all.iter().map(|p| p.1));
    let span = (max_x - min_x).max(max_y - min_y).max(f64::EPSILON);
    let scale = move |(x, y): (f64, f64)| ((x - min_x) / span * 500.0, (y - min_y) / span * 500.0);

    write_header(out)?;
    for polygon in &polygons {
        write_polygon(out, &polygon.map(&scale))?;
    }
    for &dot in &dots {
        let (x, y) = scale(dot);
        writeln!(out, "{:.3} {:.3} 2 0 360 arc fill", x, y)?;
    }
    writeln!(out, "showpage")?;
    Ok(())
}

fn write_header<W: Write>(out: &mut W) -> eyre::Result<()> {
    writeln!(out, "%!PS-Adobe-3.0 EPSF-3.0")?;
    writeln!(out, "%%BoundingBox: 0 0 500 500")?;
    writeln!(out, "0.5 setlinewidth")?;
    Ok(())
}

fn write_polygon<W: Write>(out: &mut W, corners: &[(f64, f64); 4]) -> eyre::Result<()> {
    writeln!(out, "newpath")?;
    writeln!(out, "{:.3} {:.3} moveto", corners[0].0, corners[0].1)?;
    for corner in &corners[1..] {
        writeln!(out, "{:.3} {:.3} lineto", corner.0, corner.1)?;
    }
    writeln!(out, "closepath stroke")?;
    Ok(())
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

fn to_f64<T: Real>(value: T) -> f64 {
    nalgebra::try_convert(value).unwrap_or(0.0)
}
