use gf256::gf256;
use rand::Rng;
use std::collections::BTreeMap;

use crate::constants::MAX_SHARDS;
use crate::error::{Result, ShardError};

/// Represents a polynomial over the Galois field GF(2^8).
///
/// Each polynomial is represented by its coefficients, stored in a vector.
/// Coefficients are elements of the GF(2^8) field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polynomial {
    /// The coefficients of the polynomial, lowest degree first.
    pub coefficients: Vec<gf256>,
}

impl Polynomial {
    /// Constructs a new polynomial of a given degree with random coefficients,
    /// where the constant term is the provided secret.
    ///
    /// # Arguments
    ///
    /// * `degree` - The degree of the polynomial.
    /// * `secret` - The secret (constant term) of the polynomial.
    pub fn new(degree: usize, secret: gf256) -> Self {
        Self::with_rng(&mut rand::thread_rng(), degree, secret)
    }

    /// Same as [`Polynomial::new`] but draws coefficients from the supplied generator.
    pub fn with_rng<R: Rng>(rng: &mut R, degree: usize, secret: gf256) -> Self {
        let mut coefficients = vec![secret; degree + 1];

        for coeff in coefficients.iter_mut().skip(1) {
            *coeff = gf256::new(rng.gen());
        }

        Polynomial { coefficients }
    }

    /// Evaluates the polynomial at a given point using Horner's rule.
    pub fn evaluate(&self, x: gf256) -> gf256 {
        let mut result = gf256::new(0);

        for &coeff in self.coefficients.iter().rev() {
            result = result * x + coeff;
        }

        result
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }
}

/// Checks a `(threshold, shares)` pair before any share is produced.
pub fn validate_parameters(threshold: usize, shares: usize) -> Result<()> {
    if shares == 0 {
        return Err(ShardError::InvalidConfiguration(
            "share count must be at least 1".to_string(),
        ));
    }
    if shares > MAX_SHARDS {
        return Err(ShardError::InvalidConfiguration(format!(
            "share count {shares} exceeds the GF(256) limit of {MAX_SHARDS}"
        )));
    }
    if threshold == 0 {
        return Err(ShardError::InvalidConfiguration(
            "threshold must be at least 1".to_string(),
        ));
    }
    if threshold > shares {
        return Err(ShardError::InvalidConfiguration(format!(
            "threshold {threshold} exceeds share count {shares}"
        )));
    }
    Ok(())
}

/// Splits a secret into a specified number of shares using Shamir's Secret Sharing Scheme.
///
/// Each byte of the secret becomes the constant term of a fresh random polynomial of degree
/// `threshold - 1`, which is evaluated at `x = 1..=shares`. The returned map is keyed by the
/// evaluation point.
///
/// # Errors
/// Returns `InvalidConfiguration` if `shares` is zero or larger than 255, or if `threshold` is
/// zero or larger than `shares`.
///
/// # Examples
/// ```rust
/// use docshard::sss::split_secret;
///
/// let shares = split_secret(b"hello world", 3, 5).unwrap();
/// assert_eq!(shares.len(), 5);
/// ```
pub fn split_secret(
    secret: &[u8],
    threshold: usize,
    shares: usize,
) -> Result<BTreeMap<u8, Vec<u8>>> {
    split_secret_with_rng(&mut rand::thread_rng(), secret, threshold, shares)
}

pub fn split_secret_with_rng<R: Rng>(
    rng: &mut R,
    secret: &[u8],
    threshold: usize,
    shares: usize,
) -> Result<BTreeMap<u8, Vec<u8>>> {
    validate_parameters(threshold, shares)?;

    // shares <= 255, so every point fits in a u8
    let mut shares_map: BTreeMap<u8, Vec<u8>> = (1..=shares as u8)
        .map(|x| (x, Vec::with_capacity(secret.len())))
        .collect();

    for &byte in secret {
        let poly = Polynomial::with_rng(rng, threshold - 1, gf256::new(byte));

        for (&x, share) in shares_map.iter_mut() {
            share.push(poly.evaluate(gf256::new(x)).into());
        }
    }

    Ok(shares_map)
}

/// Combines shares to reconstruct a secret.
///
/// Every share in the map takes part in the interpolation, so the caller decides how many
/// points to pass. Fewer points than the threshold used at split time yield unrelated bytes.
///
/// Returns `None` if the map is empty, contains the point `0`, or the shares disagree on length.
pub fn combine_shares(shares_map: &BTreeMap<u8, Vec<u8>>) -> Option<Vec<u8>> {
    let secret_length = shares_map.values().next()?.len();
    if shares_map.contains_key(&0) || shares_map.values().any(|v| v.len() != secret_length) {
        return None;
    }

    let mut secret = vec![0; secret_length];
    let mut points = Vec::with_capacity(shares_map.len());

    for (i, byte) in secret.iter_mut().enumerate() {
        points.clear();
        for (&k, v) in shares_map {
            points.push((gf256::new(k), gf256::new(v[i])));
        }
        *byte = interpolate(&points, gf256::new(0)).into();
    }

    Some(secret)
}

/// Performs Lagrange interpolation on a set of points to find the value of the polynomial at
/// `x`. The x coordinates must be distinct.
fn interpolate(points: &[(gf256, gf256)], x: gf256) -> gf256 {
    let mut value = gf256::new(0);

    for (i, &(a_x, a_y)) in points.iter().enumerate() {
        let mut weight = gf256::new(1);

        for (j, &(b_x, _)) in points.iter().enumerate() {
            if i != j {
                // subtraction is addition in characteristic 2
                let top = x + b_x;
                let bottom = a_x + b_x;
                weight *= top / bottom;
            }
        }

        value += weight * a_y;
    }

    value
}
