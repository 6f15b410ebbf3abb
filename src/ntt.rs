/// Number Theoretic Transform (NTT) layer arithmetic
///
/// This module provides the transform math that the tile scheduler slices
/// into tesserae: parameter generation, the per-layer root table, single
/// butterflies, and the direct (uninterrupted) forward and inverse
/// transforms used as the reference result.
///
/// Mathematical Foundation:
/// The transform is the cyclic NTT over Z_q of length n, with ω a primitive
/// n-th root of unity mod q:
///     NTT(a)[k] = Σ_{j=0}^{n-1} a[j] · ω^{jk}  (mod q)
/// so pointwise products in the NTT domain correspond to multiplication in
/// Z_q[X]/(X^n - 1).
///
/// Layer Structure:
/// - Forward: Cooley-Tukey decimation-in-time. The input is bit-reversed,
///   then layer l combines blocks of length 2^{l+1}.
/// - Inverse: Gentleman-Sande decimation-in-frequency with ω^{-1}. Layer l
///   splits blocks of length n / 2^l; the output is bit-reversed and scaled
///   by n^{-1}.
/// Every layer consists of exactly n/2 independent butterflies, each of
/// which touches a disjoint coefficient pair. Any slice of a layer can
/// therefore be applied on its own without disturbing the rest.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::modular_arithmetic::{
    find_primitive_root, is_prime, is_primitive_root, mod_add, mod_inverse, mod_mul, mod_pow,
    mod_sub,
};
use crate::polynomial::{check_range, Polynomial};

/// Ring dimension used by the reference device (Kyber-sized)
pub const DEFAULT_DIMENSION: usize = 256;

/// Modulus used by the reference device
pub const DEFAULT_MODULUS: u32 = 3329;

/// Primitive 256-th root of unity mod 3329 used by the reference device
pub const DEFAULT_ROOT: u32 = 3061;

/// Largest supported transform length
pub const MAX_DIMENSION: usize = 1 << 16;

/// Direction of a transform
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Coefficient domain to evaluation domain (Cooley-Tukey DIT)
    Forward,
    /// Evaluation domain back to coefficients (Gentleman-Sande DIF)
    Inverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Inverse => write!(f, "inverse"),
        }
    }
}

/// NTT parameters containing the root of unity and precomputed tables
///
/// Mathematical Properties:
/// - q is prime and n | q - 1, so Z*_q contains a cyclic subgroup of order n
/// - ω has multiplicative order exactly n
/// - Root power tables hold ω^i and ω^{-i} for i ∈ [0, n/2), which covers
///   every twiddle factor any layer can request
#[derive(Clone, Debug)]
pub struct NttParams {
    /// Transform length n (power of two)
    dimension: usize,

    /// log2(n), which is also the number of butterfly layers
    log_dimension: u32,

    /// Prime modulus q
    modulus: u32,

    /// Primitive n-th root of unity ω
    root: u32,

    /// ω^{-1} mod q
    root_inv: u32,

    /// n^{-1} mod q, applied once at the end of the inverse transform
    dimension_inv: u32,

    /// [ω^0, ω^1, ..., ω^{n/2-1}]
    root_powers: Vec<u32>,

    /// [ω^0, ω^{-1}, ..., ω^{-(n/2-1)}]
    inverse_root_powers: Vec<u32>,

    /// Maps index i to bit_reverse(i, log2(n))
    bit_reversal_table: Vec<usize>,
}

impl NttParams {
    /// Creates NTT parameters for the given dimension and modulus
    ///
    /// # Arguments
    /// * `dimension` - Transform length n (power of two, 2 ≤ n ≤ 2^16)
    /// * `modulus` - Prime q with n | q - 1
    ///
    /// # Returns
    /// * `Result<Self>` - Parameters or error if (n, q) admits no NTT
    ///
    /// The reference pair (256, 3329) uses the device's fixed root 3061;
    /// any other pair searches for a primitive root.
    pub fn new(dimension: usize, modulus: u32) -> Result<Self> {
        Self::validate_shape(dimension, modulus)?;

        let root = if dimension == DEFAULT_DIMENSION && modulus == DEFAULT_MODULUS {
            DEFAULT_ROOT
        } else {
            find_primitive_root(modulus, dimension as u64)?
        };

        Self::with_root(dimension, modulus, root)
    }

    /// Creates NTT parameters with an explicitly chosen root of unity
    pub fn with_root(dimension: usize, modulus: u32, root: u32) -> Result<Self> {
        Self::validate_shape(dimension, modulus)?;

        if !is_primitive_root(root, dimension as u64, modulus) {
            return Err(TesseraError::InvalidParameters(format!(
                "{} is not a primitive {}-th root of unity mod {}",
                root, dimension, modulus
            )));
        }

        let log_dimension = dimension.trailing_zeros();
        let root_inv = mod_inverse(root, modulus)?;
        let dimension_inv = mod_inverse((dimension as u64 % modulus as u64) as u32, modulus)?;

        let half = dimension / 2;
        let root_powers = Self::powers(root, half, modulus);
        let inverse_root_powers = Self::powers(root_inv, half, modulus);
        let bit_reversal_table = (0..dimension)
            .map(|i| bit_reverse(i, log_dimension))
            .collect();

        Ok(Self {
            dimension,
            log_dimension,
            modulus,
            root,
            root_inv,
            dimension_inv,
            root_powers,
            inverse_root_powers,
            bit_reversal_table,
        })
    }

    fn validate_shape(dimension: usize, modulus: u32) -> Result<()> {
        if !dimension.is_power_of_two() || dimension < 2 || dimension > MAX_DIMENSION {
            return Err(TesseraError::InvalidDimension {
                expected: dimension.next_power_of_two().clamp(2, MAX_DIMENSION),
                got: dimension,
            });
        }

        if !is_prime(modulus) {
            return Err(TesseraError::InvalidModulus {
                modulus: modulus as u64,
            });
        }

        if (modulus as u64 - 1) % dimension as u64 != 0 {
            return Err(TesseraError::InvalidParameters(format!(
                "Dimension {} does not divide q-1 = {}",
                dimension,
                modulus - 1
            )));
        }

        Ok(())
    }

    fn powers(base: u32, count: usize, modulus: u32) -> Vec<u32> {
        let mut powers = Vec::with_capacity(count);
        let mut current = 1u32;
        for _ in 0..count {
            powers.push(current);
            current = mod_mul(current, base, modulus);
        }
        powers
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn modulus(&self) -> u32 {
        self.modulus
    }

    /// Number of butterfly layers, log2(n)
    pub fn layers(&self) -> u32 {
        self.log_dimension
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    pub fn root_inv(&self) -> u32 {
        self.root_inv
    }

    pub fn dimension_inv(&self) -> u32 {
        self.dimension_inv
    }

    /// Number of butterflies in one layer (always n/2)
    pub fn butterflies_per_layer(&self) -> usize {
        self.dimension / 2
    }

    /// Block length combined (forward) or split (inverse) by `layer`
    pub fn block_length(&self, direction: Direction, layer: u32) -> usize {
        match direction {
            Direction::Forward => 2usize << layer,
            Direction::Inverse => self.dimension >> layer,
        }
    }

    /// Root table indexed by layer
    ///
    /// Entry l is the primitive (block length)-th root ω^{n/L} (or its
    /// inverse) whose powers are the twiddle factors of layer l.
    pub fn layer_roots(&self, direction: Direction) -> Vec<u32> {
        (0..self.log_dimension)
            .map(|layer| {
                let stride = self.dimension / self.block_length(direction, layer);
                let base = match direction {
                    Direction::Forward => self.root,
                    Direction::Inverse => self.root_inv,
                };
                mod_pow(base, stride as u64, self.modulus)
            })
            .collect()
    }

    /// Applies butterflies `range` of `layer` in place
    ///
    /// Butterfly k of a layer with block length L and half-length h = L/2
    /// acts on the pair (i, i + h) where i = (k / h)·L + k mod h, with
    /// twiddle ω^{(n/L)·(k mod h)}.
    pub fn apply_butterflies(
        &self,
        direction: Direction,
        layer: u32,
        range: std::ops::Range<usize>,
        coefficients: &mut [u32],
    ) {
        let q = self.modulus;
        let length = self.block_length(direction, layer);
        let half = length / 2;
        let stride = self.dimension / length;

        for k in range {
            let j = k % half;
            let i = (k / half) * length + j;

            match direction {
                Direction::Forward => {
                    let w = self.root_powers[stride * j];
                    let u = coefficients[i];
                    let v = mod_mul(coefficients[i + half], w, q);
                    coefficients[i] = mod_add(u, v, q);
                    coefficients[i + half] = mod_sub(u, v, q);
                }
                Direction::Inverse => {
                    let w = self.inverse_root_powers[stride * j];
                    let u = coefficients[i];
                    let v = coefficients[i + half];
                    coefficients[i] = mod_add(u, v, q);
                    coefficients[i + half] = mod_mul(mod_sub(u, v, q), w, q);
                }
            }
        }
    }

    /// Applies one full butterfly layer in place
    pub fn apply_layer(&self, direction: Direction, layer: u32, coefficients: &mut [u32]) {
        self.apply_butterflies(direction, layer, 0..self.butterflies_per_layer(), coefficients);
    }

    /// Turns the transform input into the working state of tessera 0
    ///
    /// The forward transform bit-reverses its input; the inverse starts from
    /// the input as is.
    pub fn prepare(&self, direction: Direction, input: &[u32]) -> Vec<u32> {
        match direction {
            Direction::Forward => self.bit_reverse_copy(input),
            Direction::Inverse => input.to_vec(),
        }
    }

    /// Turns the working state after the last layer into the transform output
    ///
    /// The inverse transform bit-reverses and scales by n^{-1}; the forward
    /// output is the working state itself.
    pub fn finish(&self, direction: Direction, working: &[u32]) -> Vec<u32> {
        match direction {
            Direction::Forward => working.to_vec(),
            Direction::Inverse => self
                .bit_reverse_copy(working)
                .into_iter()
                .map(|c| mod_mul(c, self.dimension_inv, self.modulus))
                .collect(),
        }
    }

    /// Bit-reversal permuted copy of `a`
    pub fn bit_reverse_copy(&self, a: &[u32]) -> Vec<u32> {
        let mut result = vec![0u32; a.len()];
        for (i, &value) in a.iter().enumerate() {
            result[self.bit_reversal_table[i]] = value;
        }
        result
    }

    /// Direct, uninterrupted transform in the given direction
    pub fn transform(&self, input: &Polynomial, direction: Direction) -> Result<Polynomial> {
        self.check_polynomial(input)?;

        let mut working = self.prepare(direction, input.coefficients());
        for layer in 0..self.log_dimension {
            self.apply_layer(direction, layer, &mut working);
        }

        Polynomial::new(self.finish(direction, &working), self.modulus)
    }

    pub fn forward(&self, input: &Polynomial) -> Result<Polynomial> {
        self.transform(input, Direction::Forward)
    }

    pub fn inverse(&self, input: &Polynomial) -> Result<Polynomial> {
        self.transform(input, Direction::Inverse)
    }

    /// Pointwise product of two NTT-domain polynomials
    pub fn pointwise_mul(&self, a: &Polynomial, b: &Polynomial) -> Result<Polynomial> {
        self.check_polynomial(a)?;
        self.check_polynomial(b)?;

        let coefficients = a
            .coefficients()
            .iter()
            .zip(b.coefficients())
            .map(|(&x, &y)| mod_mul(x, y, self.modulus))
            .collect();
        Polynomial::new(coefficients, self.modulus)
    }

    /// Multiplies two polynomials in Z_q[X]/(X^n - 1) through the NTT domain
    pub fn multiply(&self, a: &Polynomial, b: &Polynomial) -> Result<Polynomial> {
        let product = self.pointwise_mul(&self.forward(a)?, &self.forward(b)?)?;
        self.inverse(&product)
    }

    /// Checks that `poly` has length n and lives in Z_q
    pub fn check_polynomial(&self, poly: &Polynomial) -> Result<()> {
        if poly.len() != self.dimension {
            return Err(TesseraError::InvalidDimension {
                expected: self.dimension,
                got: poly.len(),
            });
        }
        if poly.modulus() != self.modulus {
            return Err(TesseraError::InvalidParameters(format!(
                "Polynomial modulus {} does not match NTT modulus {}",
                poly.modulus(),
                self.modulus
            )));
        }
        check_range(poly.coefficients(), self.modulus, None)
    }
}

/// Reverses the low `bits` bits of x
pub fn bit_reverse(x: usize, bits: u32) -> usize {
    if bits == 0 {
        return 0;
    }
    x.reverse_bits() >> (usize::BITS - bits)
}

/// A transform that may be computed directly or on the intermittent device
///
/// This is the seam the KEM is written against: it only ever sees the
/// eventual output, never interruptions or checkpoints.
pub trait Transform {
    fn params(&self) -> &NttParams;

    fn transform(&mut self, input: &Polynomial, direction: Direction) -> Result<Polynomial>;
}

/// Uninterrupted in-memory transform
#[derive(Clone, Debug)]
pub struct DirectTransform {
    params: NttParams,
}

impl DirectTransform {
    pub fn new(params: NttParams) -> Self {
        Self { params }
    }
}

impl Transform for DirectTransform {
    fn params(&self) -> &NttParams {
        &self.params
    }

    fn transform(&mut self, input: &Polynomial, direction: Direction) -> Result<Polynomial> {
        self.params.transform(input, direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn default_params() -> NttParams {
        NttParams::new(DEFAULT_DIMENSION, DEFAULT_MODULUS).unwrap()
    }

    /// Naive O(n^2) evaluation of NTT(a)[k] = Σ a[j] ω^{jk}
    fn naive_ntt(params: &NttParams, a: &[u32]) -> Vec<u32> {
        let n = params.dimension();
        let q = params.modulus();
        (0..n)
            .map(|k| {
                a.iter().enumerate().fold(0u32, |acc, (j, &aj)| {
                    let w = mod_pow(params.root(), (j * k) as u64, q);
                    mod_add(acc, mod_mul(aj, w, q), q)
                })
            })
            .collect()
    }

    #[test]
    fn test_bit_reverse_known_order() {
        let params = NttParams::new(8, 17).unwrap();
        let a: Vec<u32> = (0..8).collect();
        assert_eq!(params.bit_reverse_copy(&a), vec![0, 4, 2, 6, 1, 5, 3, 7]);

        let twice = params.bit_reverse_copy(&params.bit_reverse_copy(&a));
        assert_eq!(twice, a);
        assert_eq!(bit_reverse(1, 0), 0);
    }

    #[test]
    fn test_parameter_validation() {
        assert!(matches!(
            NttParams::new(100, 3329),
            Err(TesseraError::InvalidDimension { got: 100, .. })
        ));
        assert!(matches!(
            NttParams::new(256, 3328),
            Err(TesseraError::InvalidModulus { .. })
        ));
        // 512 does not divide 3328
        assert!(NttParams::new(512, 3329).is_err());
        // 17 is not primitive of order 256 when squared
        assert!(NttParams::with_root(256, 3329, mod_mul(17, 17, 3329)).is_err());
    }

    #[test]
    fn test_default_params() {
        let params = default_params();
        assert_eq!(params.layers(), 8);
        assert_eq!(params.root(), DEFAULT_ROOT);
        assert_eq!(mod_mul(params.root(), params.root_inv(), 3329), 1);
        assert_eq!(mod_mul(params.dimension_inv(), 256, 3329), 1);

        let roots = params.layer_roots(Direction::Forward);
        assert_eq!(roots.len(), 8);
        // Layer 0 combines pairs with ω^{n/2} = -1
        assert_eq!(roots[0], 3328);
        // Last forward layer uses ω itself
        assert_eq!(roots[7], DEFAULT_ROOT);

        let inverse_roots = params.layer_roots(Direction::Inverse);
        assert_eq!(inverse_roots[0], params.root_inv());
        assert_eq!(inverse_roots[7], 3328);
    }

    #[test]
    fn test_forward_matches_naive_definition() {
        for (n, q) in [(8usize, 17u32), (16, 97), (256, 3329)] {
            let params = NttParams::new(n, q).unwrap();
            let mut rng = ChaCha20Rng::seed_from_u64(n as u64);
            let p = Polynomial::random(n, q, &mut rng).unwrap();
            let fast = params.forward(&p).unwrap();
            assert_eq!(fast.coefficients(), naive_ntt(&params, p.coefficients()).as_slice());
        }
    }

    #[test]
    fn test_round_trip() {
        let params = default_params();
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        for _ in 0..20 {
            let p = Polynomial::random(256, 3329, &mut rng).unwrap();
            let recovered = params.inverse(&params.forward(&p).unwrap()).unwrap();
            assert_eq!(recovered, p);
        }
    }

    #[test]
    fn test_zero_and_ones() {
        let params = default_params();
        let zero = Polynomial::zero(256, 3329).unwrap();
        assert_eq!(params.forward(&zero).unwrap(), zero);

        // Σ ω^{jk} vanishes for k ≠ 0, so NTT(1,...,1) = (n, 0, ..., 0)
        let ones = params.forward(&Polynomial::ones(256, 3329).unwrap()).unwrap();
        assert_eq!(ones.coefficients()[0], 256);
        assert!(ones.coefficients()[1..].iter().all(|&c| c == 0));
    }

    #[test]
    fn test_cyclic_multiplication() {
        let params = NttParams::new(8, 17).unwrap();
        // X^7 · X = X^8 = 1 in Z_q[X]/(X^8 - 1)
        let mut a = vec![0u32; 8];
        a[7] = 1;
        let mut b = vec![0u32; 8];
        b[1] = 1;
        let product = params
            .multiply(
                &Polynomial::new(a, 17).unwrap(),
                &Polynomial::new(b, 17).unwrap(),
            )
            .unwrap();
        let mut expected = vec![0u32; 8];
        expected[0] = 1;
        assert_eq!(product.coefficients(), expected.as_slice());
    }

    #[test]
    fn test_sliced_layer_equals_full_layer() {
        let params = default_params();
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let input = Polynomial::random(256, 3329, &mut rng).unwrap();

        for direction in [Direction::Forward, Direction::Inverse] {
            for layer in 0..params.layers() {
                let mut full = input.coefficients().to_vec();
                params.apply_layer(direction, layer, &mut full);

                // Apply the four quarters of the layer out of order
                let mut sliced = input.coefficients().to_vec();
                for quarter in [2usize, 0, 3, 1] {
                    params.apply_butterflies(direction, layer, quarter * 32..(quarter + 1) * 32, &mut sliced);
                }
                assert_eq!(full, sliced, "{direction} layer {layer}");
            }
        }
    }

    #[test]
    fn test_rejects_foreign_polynomials() {
        let params = default_params();
        assert!(params.forward(&Polynomial::ones(128, 3329).unwrap()).is_err());
        assert!(params.forward(&Polynomial::ones(256, 7681).unwrap()).is_err());
    }
}
