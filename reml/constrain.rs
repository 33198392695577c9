use ndarray::Array1;

/// Relative floor applied to every variance component.
pub const CONSTRAIN_FACTOR: f64 = 1e-6;

/// What [`constrain`] did to a proposed variance vector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConstrainOutcome {
    pub constrained: usize,
    /// Every component fell below the floor.
    pub all_constrained: bool,
}

impl ConstrainOutcome {
    /// More than half of the components were clamped.
    pub fn should_warn(&self, n_components: usize) -> bool {
        2 * self.constrained > n_components
    }
}

/// Clamps components below `var_y · 1e-6` to that floor and takes the
/// mass added by clamping back out of the unclamped components, skipping any
/// that would themselves drop below the floor.
pub fn constrain(sigma: &mut Array1<f64>, var_y: f64) -> ConstrainOutcome {
    let limit = var_y * CONSTRAIN_FACTOR;
    let c = sigma.len();
    let mut clamped = vec![false; c];
    let mut added = 0.0;

    for (value, flag) in sigma.iter_mut().zip(clamped.iter_mut()) {
        if *value < limit || !value.is_finite() {
            if value.is_finite() {
                added += limit - *value;
            }
            *value = limit;
            *flag = true;
        }
    }

    let constrained = clamped.iter().filter(|&&f| f).count();
    if constrained == 0 {
        return ConstrainOutcome::default();
    }
    if constrained == c {
        sigma.fill(limit);
        return ConstrainOutcome {
            constrained,
            all_constrained: true,
        };
    }

    let delta = added / (c - constrained) as f64;
    for (value, &flag) in sigma.iter_mut().zip(&clamped) {
        if !flag && *value - delta >= limit {
            *value -= delta;
        }
    }

    ConstrainOutcome {
        constrained,
        all_constrained: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn clamps_negatives_and_redistributes() {
        let mut sigma = array![-0.5, 20.0, -0.3, 40.0, 50.0];
        let before: f64 = sigma.sum();
        let outcome = constrain(&mut sigma, 100.0);

        assert_eq!(outcome.constrained, 2);
        assert!(!outcome.all_constrained);
        assert!(!outcome.should_warn(5));
        assert!(sigma.iter().all(|&s| s >= 1e-4));
        assert_eq!(sigma[0], 1e-4);
        assert_eq!(sigma[2], 1e-4);
        assert_abs_diff_eq!(sigma.sum(), before, epsilon = 1e-9);
    }

    #[test]
    fn feasible_vector_is_untouched() {
        let mut sigma = array![1.0, 2.0, 3.0];
        let outcome = constrain(&mut sigma, 10.0);
        assert_eq!(outcome, ConstrainOutcome::default());
        assert_eq!(sigma, array![1.0, 2.0, 3.0]);
    }

    #[test]
    fn constraining_twice_changes_nothing() {
        let mut sigma = array![-2.0, 5.0, 0.1];
        constrain(&mut sigma, 4.0);
        let once = sigma.clone();
        let outcome = constrain(&mut sigma, 4.0);
        assert_eq!(outcome.constrained, 0);
        assert_eq!(sigma, once);
    }

    #[test]
    fn all_negative_fills_floor() {
        let mut sigma = array![-1.0, -2.0];
        let outcome = constrain(&mut sigma, 3.0);
        assert!(outcome.all_constrained);
        assert!(outcome.should_warn(2));
        assert_eq!(sigma, array![3e-6, 3e-6]);
    }

    #[test]
    fn components_near_floor_are_not_pushed_below_it() {
        let limit = 1e-6;
        let mut sigma = array![-1.0, 1.5e-6, 10.0];
        constrain(&mut sigma, 1.0);
        assert!(sigma.iter().all(|&s| s >= limit));
        assert_eq!(sigma[1], 1.5e-6);
    }
}
