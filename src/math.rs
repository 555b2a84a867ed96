use itertools::izip;
use multiversion::multiversion;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// Return `((a + b) . x, (a + b) . y)`.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn scalar_prods2(
    positive1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(positive2.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, positive2, x, y).fold((0f64, 0f64), |(s1, s2), (a, b, x, y)| {
        (s1 + x * (a + b), s2 + y * (a + b))
    })
}

/// Return `((a - b + c) . x, (a - b + c) . y)`.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn scalar_prods3(
    positive1: &[f64],
    negative1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(positive2.len() == n);
    assert!(negative1.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, negative1, positive2, x, y).fold(
        (0f64, 0f64),
        |(s1, s2), (a, b, c, x, y)| (s1 + x * (a - b + c), s2 + y * (a - b + c)),
    )
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());

    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn multiply(x: &[f64], y: &[f64], out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(out.iter_mut(), x, y).for_each(|(out, &x, &y)| *out = x * y);
}

/// `y += a * x`
#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    let n = x.len();
    assert!(y.len() == n);

    y.iter_mut().zip(x).for_each(|(y, &x)| *y = x.mul_add(a, *y));
}

/// `out = y + a * x`
#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(out.iter_mut(), x, y).for_each(|(out, &x, &y)| *out = x.mul_add(a, y));
}

/// Arithmetic mean, `NaN` for an empty slice.
pub(crate) fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Unbiased sample variance, `NaN` for fewer than two values.
pub(crate) fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

/// Median of unsorted values.
pub(crate) fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    quantile_sorted(&sorted, 0.5)
}

/// Linear interpolation between closest ranks (numpy's default).
pub(crate) fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0., 1.) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}
