use burn::prelude::*;

/// Soften extreme energies with a three-region map.
///
/// Energies below `high` pass through unchanged. Between `high` and `max`
/// the excess is compressed logarithmically, `high + ln(e - high + 1)`,
/// which matches the identity region in both value and slope at `e = high`.
/// At or above `max` the output is the constant `high + ln(max - high + 1)`
/// with zero gradient, so unphysical decoded structures (including infinite
/// energies) contribute a bounded, gradient-free penalty.
///
/// NaN energies must be rejected before this point; see
/// [`crate::oracle::reject_nan`].
pub fn regularize_energy<B: Backend>(energies: Tensor<B, 1>, high: f64, max: f64) -> Tensor<B, 1> {
    let below = energies.clone().lower_elem(high);
    let above = energies.clone().greater_equal_elem(max);

    let compressed = energies
        .clone()
        .clamp(high, max)
        .sub_scalar(high)
        .add_scalar(1.0)
        .log()
        .add_scalar(high);
    let cap = high + (max - high + 1.0).ln();

    // mask_fill with a scalar detaches the capped elements from the graph.
    compressed.mask_where(below, energies).mask_fill(above, cap)
}
