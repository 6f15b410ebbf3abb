/// Polynomials with coefficients in Z_q
///
/// A `Polynomial` is the unit of state that flows between the scheduler,
/// the checkpoint records and the KEM. Its constructor enforces that every
/// coefficient is already reduced into [0, q); anything else is rejected
/// with `ArithmeticRangeError` rather than silently reduced.

use rand::Rng;

use crate::error::{Result, TesseraError};
use crate::modular_arithmetic::{check_modulus, mod_add, mod_reduce_signed, mod_sub};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Polynomial {
    coefficients: Vec<u32>,
    modulus: u32,
}

impl Polynomial {
    /// Creates a polynomial from already-reduced coefficients
    ///
    /// # Arguments
    /// * `coefficients` - Coefficient vector, index i holds the X^i coefficient
    /// * `modulus` - Prime modulus q
    ///
    /// # Returns
    /// * `Result<Self>` - The polynomial, or `ArithmeticRangeError` naming the
    ///   first coefficient outside [0, q)
    pub fn new(coefficients: Vec<u32>, modulus: u32) -> Result<Self> {
        check_modulus(modulus)?;
        check_range(&coefficients, modulus, None)?;
        Ok(Self {
            coefficients,
            modulus,
        })
    }

    /// Creates a polynomial by reducing arbitrary signed values mod q
    pub fn from_signed(values: &[i64], modulus: u32) -> Result<Self> {
        check_modulus(modulus)?;
        let coefficients = values
            .iter()
            .map(|&v| mod_reduce_signed(v, modulus))
            .collect();
        Self::new(coefficients, modulus)
    }

    pub fn zero(n: usize, modulus: u32) -> Result<Self> {
        check_modulus(modulus)?;
        Ok(Self {
            coefficients: vec![0; n],
            modulus,
        })
    }

    /// The all-ones polynomial 1 + X + ... + X^{n-1}
    pub fn ones(n: usize, modulus: u32) -> Result<Self> {
        check_modulus(modulus)?;
        Ok(Self {
            coefficients: vec![1; n],
            modulus,
        })
    }

    /// Uniformly random polynomial in Z_q^n
    pub fn random<R: Rng + ?Sized>(n: usize, modulus: u32, rng: &mut R) -> Result<Self> {
        check_modulus(modulus)?;
        let coefficients = (0..n).map(|_| rng.gen_range(0..modulus)).collect();
        Ok(Self {
            coefficients,
            modulus,
        })
    }

    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    pub fn modulus(&self) -> u32 {
        self.modulus
    }

    pub fn coefficients(&self) -> &[u32] {
        &self.coefficients
    }

    pub fn into_coefficients(self) -> Vec<u32> {
        self.coefficients
    }

    /// Coefficient-wise addition mod q
    pub fn add(&self, other: &Self) -> Result<Self> {
        self.check_compatible(other)?;
        let coefficients = self
            .coefficients
            .iter()
            .zip(&other.coefficients)
            .map(|(&a, &b)| mod_add(a, b, self.modulus))
            .collect();
        Ok(Self {
            coefficients,
            modulus: self.modulus,
        })
    }

    /// Coefficient-wise subtraction mod q
    pub fn sub(&self, other: &Self) -> Result<Self> {
        self.check_compatible(other)?;
        let coefficients = self
            .coefficients
            .iter()
            .zip(&other.coefficients)
            .map(|(&a, &b)| mod_sub(a, b, self.modulus))
            .collect();
        Ok(Self {
            coefficients,
            modulus: self.modulus,
        })
    }

    fn check_compatible(&self, other: &Self) -> Result<()> {
        if self.len() != other.len() {
            return Err(TesseraError::InvalidDimension {
                expected: self.len(),
                got: other.len(),
            });
        }
        if self.modulus != other.modulus {
            return Err(TesseraError::InvalidParameters(format!(
                "Moduli do not match: {} != {}",
                self.modulus, other.modulus
            )));
        }
        Ok(())
    }
}

/// Verifies every coefficient lies in [0, q)
///
/// `tessera` is the index to blame in the resulting error, if any.
pub fn check_range(coefficients: &[u32], modulus: u32, tessera: Option<u32>) -> Result<()> {
    match coefficients.iter().position(|&c| c >= modulus) {
        Some(position) => Err(TesseraError::ArithmeticRangeError {
            coefficient: coefficients[position] as u64,
            modulus,
            position,
            tessera,
        }),
        None => Ok(()),
    }
}
