/// Compute `ln(exp(a) + exp(b))` without overflow.
///
/// This is the accumulation step behind the running free energies of the
/// windowed hybrid and spiral kernels, which sum Boltzmann weights as
/// `free = -logaddexp(-free, -energy)`.
#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + std::f64::consts::LN_2;
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

/// Squared euclidean norm.
#[inline]
pub(crate) fn sum_squares(x: &[f64]) -> f64 {
    x.iter().map(|v| v * v).sum()
}

#[inline]
pub(crate) fn dot(x: &[f64], y: &[f64]) -> f64 {
    assert!(x.len() == y.len());
    x.iter().zip(y).map(|(a, b)| a * b).sum()
}

#[inline]
pub(crate) fn negate(x: &mut [f64]) {
    x.iter_mut().for_each(|v| *v = -*v);
}

#[inline]
pub(crate) fn scale(x: &mut [f64], factor: f64) {
    x.iter_mut().for_each(|v| *v *= factor);
}
