// transform.rs — Least-squares affine transform between two matched sets.
//
// Direction: the fit maps set-A coordinates onto set-B coordinates,
//
//     [x_b]   [a  b  tx]   [x_a]
//     [y_b] = [c  d  ty] · [y_a]
//                          [ 1 ]
//
// Each match contributes two rows to a 2N×6 design matrix X:
//     even row  [x_a, y_a, 1, 0,   0,   0]  →  x_b
//     odd row   [0,   0,   0, x_a, y_a, 1]  →  y_b
// and the 6×6 normal equations (XᵀX) s = Xᵀy are solved for
// s = [a, b, tx, c, d, ty].
//
// CONDITIONING
// ────────────
// Raw pixel coordinates put values of order 10⁶ next to 1 in XᵀX. Following
// Hartley normalisation, A-coordinates are shifted to their centroid and
// scaled to mean distance √2 before accumulation; the solution is mapped
// back afterwards. Singularity is judged on the conditioned system:
// smallest / largest singular value of XᵀX below `SINGULAR_RCOND`.
//
// Plain least squares over every match, no outlier rejection.

use nalgebra::{Matrix2, Matrix6, Vector2, Vector6};

use crate::error::{Error, Result};
use crate::keypoint::MatchPair;

/// Relative singular-value cutoff below which XᵀX counts as singular.
const SINGULAR_RCOND: f64 = 1e-10;

/// A 2×3 affine map `[[a, b, tx], [c, d, ty]]` from set-A to set-B coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    pub m: [[f64; 3]; 2],
}

impl AffineTransform {
    pub fn identity() -> Self {
        AffineTransform { m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]] }
    }

    /// Build from the solution vector order `[a, b, tx, c, d, ty]`.
    pub fn from_coefficients(s: [f64; 6]) -> Self {
        AffineTransform { m: [[s[0], s[1], s[2]], [s[3], s[4], s[5]]] }
    }

    /// Coefficients in solution-vector order `[a, b, tx, c, d, ty]`.
    pub fn coefficients(&self) -> [f64; 6] {
        let [r0, r1] = self.m;
        [r0[0], r0[1], r0[2], r1[0], r1[1], r1[2]]
    }

    /// Map a set-A point into set-B coordinates.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let [r0, r1] = self.m;
        (r0[0] * x + r0[1] * y + r0[2], r1[0] * x + r1[1] * y + r1[2])
    }

    /// Euclidean residual |T(a) − b| per match.
    pub fn residuals(&self, matches: &[MatchPair]) -> Vec<f64> {
        matches
            .iter()
            .map(|m| {
                let (px, py) = self.apply(m.a.x as f64, m.a.y as f64);
                ((px - m.b.x as f64).powi(2) + (py - m.b.y as f64).powi(2)).sqrt()
            })
            .collect()
    }

    /// Mean squared residual over all matches (0 for an empty slice).
    pub fn mean_squared_error(&self, matches: &[MatchPair]) -> f64 {
        if matches.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.residuals(matches).iter().map(|r| r * r).sum();
        sum / matches.len() as f64
    }
}

/// Fit the affine transform mapping each `a` keypoint onto its `b` partner.
///
/// # Errors
/// `SingularSystem` if fewer than 3 matches are given or the A-points are
/// degenerate (coincident or collinear).
pub fn estimate_affine(matches: &[MatchPair]) -> Result<AffineTransform> {
    let src: Vec<(f64, f64)> = matches.iter().map(|m| (m.a.x as f64, m.a.y as f64)).collect();
    let dst: Vec<(f64, f64)> = matches.iter().map(|m| (m.b.x as f64, m.b.y as f64)).collect();
    estimate_affine_points(&src, &dst)
}

/// Point-pair form of [`estimate_affine`]: fits `dst ≈ T(src)`.
///
/// # Errors
/// `InvalidArgument` if `src` and `dst` differ in length, `SingularSystem`
/// if the points do not determine a unique transform.
pub fn estimate_affine_points(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Result<AffineTransform> {
    if src.len() != dst.len() {
        return Err(Error::InvalidArgument(format!(
            "{} source points but {} destination points",
            src.len(),
            dst.len()
        )));
    }
    let n = src.len();
    if n < 3 {
        return Err(Error::SingularSystem { matches: n });
    }

    let norm = Normalization::of(src).ok_or(Error::SingularSystem { matches: n })?;

    let mut xtx = Matrix6::<f64>::zeros();
    let mut xty = Vector6::<f64>::zeros();
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
        let (u, v) = norm.apply(sx, sy);
        let even = Vector6::new(u, v, 1.0, 0.0, 0.0, 0.0);
        let odd = Vector6::new(0.0, 0.0, 0.0, u, v, 1.0);
        xtx += even * even.transpose() + odd * odd.transpose();
        xty += even * dx + odd * dy;
    }

    let svd = xtx.svd(true, true);
    let s_max = svd.singular_values.max();
    let s_min = svd.singular_values.min();
    if !(s_max > 0.0) || s_min <= s_max * SINGULAR_RCOND {
        return Err(Error::SingularSystem { matches: n });
    }
    let sol = svd
        .solve(&xty, 0.0)
        .map_err(|_| Error::SingularSystem { matches: n })?;

    // Undo normalisation: with u = s·(p − c),
    //   dst = L'·u + t' = (s·L')·p + (t' − s·L'·c)
    let lin_n = Matrix2::new(sol[0], sol[1], sol[3], sol[4]);
    let t_n = Vector2::new(sol[2], sol[5]);
    let lin = lin_n * norm.scale;
    let t = t_n - lin * Vector2::new(norm.cx, norm.cy);

    Ok(AffineTransform { m: [[lin[(0, 0)], lin[(0, 1)], t[0]], [lin[(1, 0)], lin[(1, 1)], t[1]]] })
}

/// Centroid + isotropic scale so points have mean distance √2 from the origin.
struct Normalization {
    cx: f64,
    cy: f64,
    scale: f64,
}

impl Normalization {
    /// None when all points coincide.
    fn of(points: &[(f64, f64)]) -> Option<Self> {
        let n = points.len() as f64;
        let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
        let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
        let mean_dist = points
            .iter()
            .map(|p| ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt())
            .sum::<f64>()
            / n;
        if !(mean_dist > 1e-12) || !mean_dist.is_finite() {
            return None;
        }
        Some(Normalization { cx, cy, scale: std::f64::consts::SQRT_2 / mean_dist })
    }

    #[inline]
    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (self.scale * (x - self.cx), self.scale * (y - self.cy))
    }
}
