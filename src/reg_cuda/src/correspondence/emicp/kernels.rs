//! CubeCL kernels for the EM-ICP expectation step.

use cubecl::prelude::*;

/// Values written per source point: inlier mass, then Σⱼ pᵢⱼ·xⱼ.
pub const OUTPUT_STRIDE: u32 = 4;

/// Collapsed posterior row for every transformed source point.
///
/// One thread per source point. Two passes over the targets: the first finds
/// the smallest exponent (outlier included), the second accumulates the
/// shifted weights, so `exp` never sees a positive argument.
#[cube(launch_unchecked)]
pub fn emicp_expectation_kernel<F: Float>(
    // Transformed source points [N * 3]
    source: &Array<F>,
    // Target points [M * 3]
    target: &Array<F>,
    // 1 / (2σ²)
    inv_two_sigma2: F,
    // Outlier exponent e₀ (ignored when has_outlier == 0)
    outlier_exponent: F,
    has_outlier: u32,
    num_source: u32,
    num_target: u32,
    // Output: [mass, sx, sy, sz] per source point [N * 4]
    rows: &mut Array<F>,
) {
    let idx = ABSOLUTE_POS;

    if idx >= num_source {
        terminate!();
    }

    let base = idx * 3;
    let px = source[base];
    let py = source[base + 1];
    let pz = source[base + 2];

    // Pass 1: smallest exponent
    let mut shift = F::new(1.0e30);
    if has_outlier != 0u32 {
        shift = outlier_exponent;
    }
    for j in 0..num_target {
        let tbase = j * 3;
        let dx = target[tbase] - px;
        let dy = target[tbase + 1] - py;
        let dz = target[tbase + 2] - pz;
        let e = (dx * dx + dy * dy + dz * dz) * inv_two_sigma2;
        if e < shift {
            shift = e;
        }
    }

    // Pass 2: shifted weights
    let mut mass = F::new(0.0);
    let mut sx = F::new(0.0);
    let mut sy = F::new(0.0);
    let mut sz = F::new(0.0);
    for j in 0..num_target {
        let tbase = j * 3;
        let tx = target[tbase];
        let ty = target[tbase + 1];
        let tz = target[tbase + 2];
        let dx = tx - px;
        let dy = ty - py;
        let dz = tz - pz;
        let e = (dx * dx + dy * dy + dz * dz) * inv_two_sigma2;
        let w = F::exp(shift - e);
        mass += w;
        sx += w * tx;
        sy += w * ty;
        sz += w * tz;
    }

    let mut z = mass;
    if has_outlier != 0u32 {
        z += F::exp(shift - outlier_exponent);
    }

    let out = idx * 4;
    rows[out] = mass / z;
    rows[out + 1] = sx / z;
    rows[out + 2] = sy / z;
    rows[out + 3] = sz / z;
}
