//! Cost computation.

/// Round up to the next micro-dollar.
fn ceil_micro(value: f64) -> f64 {
    (value * 1e6).ceil() / 1e6
}

/// Compute the USD cost of a request from per-token rates.
///
/// Each axis is rounded up to micro-dollar precision independently before
/// summing, so the charge never undershoots the rate on either axis.
#[must_use]
pub fn compute_cost(
    input_rate: f64,
    output_rate: f64,
    prompt_tokens: u32,
    completion_tokens: u32,
) -> f64 {
    ceil_micro(input_rate * f64::from(prompt_tokens))
        + ceil_micro(output_rate * f64::from(completion_tokens))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_is_per_axis_ceiling() {
        // 0.0000015 ceils to 0.000002 per axis
        let cost = compute_cost(1.5e-6, 1.5e-6, 1, 1);
        assert!((cost - 4e-6).abs() < 1e-12);
    }

    #[test]
    fn zero_tokens_cost_nothing() {
        assert_eq!(compute_cost(1e-6, 2e-6, 0, 0), 0.0);
    }

    #[test]
    fn exact_micro_amounts_unchanged() {
        let cost = compute_cost(1e-6, 2e-6, 1_000, 500);
        assert!((cost - 0.002).abs() < 1e-9);
    }

    #[test]
    fn free_models_cost_zero() {
        assert_eq!(compute_cost(0.0, 0.0, 10_000, 10_000), 0.0);
    }
}
