//! Testing utilities for the rten-ragged crates.

use std::fmt::Debug;
use std::panic::{RefUnwindSafe, UnwindSafe};

/// Utility for creating parametrized (aka. table-driven) tests.
///
/// Create a `Debug` struct, conventionally named `Case`, describing one test
/// case, build a collection of cases and call `cases.test_each` with the test
/// body. All cases are run even if some panic. If any case fails, `test_each`
/// panics with the number of failures and their debug representations.
///
/// ```
/// use rten_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///     a: i32,
///     b: i32,
///     expected: i32,
/// }
///
/// let cases = [Case { a: 3, b: 5, expected: 15 }];
/// cases.test_each(|&Case { a, b, expected }| {
///     assert_eq!(a * b, expected);
/// });
/// ```
///
/// Test cases and values captured by the test closure must be
/// [unwind safe](std::panic::UnwindSafe). Values which are not, such as
/// containers holding trait objects, should be created inside the closure.
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Call `test` with a reference to each case, catching any panics.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Variant of [`test_each`](TestCases::test_each) which passes cases by
    /// value. Each case is formatted before the test runs so it can be
    /// reported on failure.
    fn test_each_value(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe;
}

fn report_failures<F: Debug>(failures: &[F]) {
    assert_eq!(
        failures.len(),
        0,
        "{} test cases failed: {:?}",
        failures.len(),
        failures
    );
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        let failures: Vec<_> = self
            .into_iter()
            .filter(|case| std::panic::catch_unwind(|| test(case)).is_err())
            .collect();
        report_failures(&failures);
    }

    fn test_each_value(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe,
    {
        let mut failures = Vec::new();
        for case in self {
            let test = &test;
            let case_str = format!("{:?}", case);
            if std::panic::catch_unwind(move || test(case)).is_err() {
                failures.push(case_str);
            }
        }
        report_failures(&failures);
    }
}

/// Trait that tests whether two values are approximately equal.
///
/// Values are close if `(self - other).abs() <= atol + rtol * other.abs()`,
/// matching NumPy's `np.allclose`. NaN is considered equal to NaN, so that
/// the mean of an empty slice can be compared.
pub trait ApproxEq: Sized {
    fn default_abs_tolerance() -> Self;
    fn default_rel_tolerance() -> Self;
    fn approx_eq_with_atol_rtol(&self, other: &Self, atol: Self, rtol: Self) -> bool;

    fn approx_eq(&self, other: &Self) -> bool {
        self.approx_eq_with_atol_rtol(
            other,
            Self::default_abs_tolerance(),
            Self::default_rel_tolerance(),
        )
    }
}

impl ApproxEq for f32 {
    fn default_abs_tolerance() -> f32 {
        1e-6
    }

    fn default_rel_tolerance() -> f32 {
        1e-5
    }

    fn approx_eq_with_atol_rtol(&self, other: &f32, atol: f32, rtol: f32) -> bool {
        if self.is_nan() || other.is_nan() {
            return self.is_nan() && other.is_nan();
        }
        (self - other).abs() <= atol + rtol * other.abs()
    }
}

impl ApproxEq for i32 {
    fn default_abs_tolerance() -> i32 {
        0
    }

    fn default_rel_tolerance() -> i32 {
        0
    }

    fn approx_eq_with_atol_rtol(&self, other: &i32, atol: i32, rtol: i32) -> bool {
        (self - other).abs() <= atol + rtol * other.abs()
    }
}

/// Assert that two slices have the same length and approximately equal
/// elements, reporting the first mismatched index on failure.
#[track_caller]
pub fn expect_approx_eq<T: ApproxEq + Debug>(actual: &[T], expected: &[T]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "lengths differ: {:?} vs {:?}",
        actual,
        expected
    );
    if let Some(i) = (0..actual.len()).find(|&i| !actual[i].approx_eq(&expected[i])) {
        panic!(
            "values differ at index {}: {:?} vs {:?} (actual {:?}, expected {:?})",
            i, actual[i], expected[i], actual, expected
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{expect_approx_eq, ApproxEq, TestCases};

    #[test]
    fn test_test_cases_success() {
        #[derive(Clone, Debug)]
        struct Case {
            x: i32,
        }

        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.clone().test_each(|case| _ = case.x);
        cases.test_each_value(|case| _ = case.x);
    }

    #[test]
    #[should_panic(expected = "2 test cases failed")]
    fn test_test_each_failure() {
        #[derive(Debug)]
        struct Case {
            x: i32,
        }

        let cases = [Case { x: 1 }, Case { x: 2 }];
        cases.test_each(|case| {
            _ = case.x;
            panic!("oh no");
        })
    }

    #[test]
    fn test_approx_eq() {
        assert!(1.0f32.approx_eq(&1.000001));
        assert!(!1.0f32.approx_eq(&1.1));
        assert!(f32::NAN.approx_eq(&f32::NAN));
        assert!(!f32::NAN.approx_eq(&0.));
        assert!(3i32.approx_eq(&3));
    }

    #[test]
    #[should_panic(expected = "values differ at index 1")]
    fn test_expect_approx_eq_failure() {
        expect_approx_eq(&[1.0f32, 2.0], &[1.0, 2.5]);
    }
}
