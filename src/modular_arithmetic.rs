/// Modular arithmetic primitives over a word-sized prime modulus
///
/// These are the pure helper functions every tessera uses to compute its
/// butterflies. All inputs are expected to be reduced into [0, q) except for
/// `mod_reduce`, which accepts any 64-bit value. Intermediate products are
/// carried in 64-bit integers, so any modulus below 2^32 is safe.
///
/// Mathematical Foundation:
/// For a prime q the multiplicative group Z*_q is cyclic of order q - 1, so a
/// primitive n-th root of unity exists exactly when n | (q - 1). The NTT
/// parameters are derived from these helpers.

use crate::error::{Result, TesseraError};

/// Rejects moduli below 2
///
/// The infallible helpers in this module assume a nonzero modulus; every
/// fallible entry point runs this check before reducing anything.
pub fn check_modulus(q: u32) -> Result<()> {
    if q < 2 {
        return Err(TesseraError::InvalidModulus { modulus: q as u64 });
    }
    Ok(())
}

/// Reduces an arbitrary 64-bit value into [0, q); q must be nonzero
#[inline]
pub fn mod_reduce(a: u64, q: u32) -> u32 {
    (a % q as u64) as u32
}

/// Reduces a signed value into [0, q); q must be nonzero
#[inline]
pub fn mod_reduce_signed(a: i64, q: u32) -> u32 {
    a.rem_euclid(q as i64) as u32
}

/// Computes (a + b) mod q for reduced operands
#[inline]
pub fn mod_add(a: u32, b: u32, q: u32) -> u32 {
    let sum = a as u64 + b as u64;
    if sum >= q as u64 {
        (sum - q as u64) as u32
    } else {
        sum as u32
    }
}

/// Computes (a - b) mod q for reduced operands
#[inline]
pub fn mod_sub(a: u32, b: u32, q: u32) -> u32 {
    if a >= b {
        a - b
    } else {
        // a < b <= q - 1, so the result lands in (0, q)
        (a as u64 + q as u64 - b as u64) as u32
    }
}

/// Computes (a * b) mod q using a 64-bit intermediate product
#[inline]
pub fn mod_mul(a: u32, b: u32, q: u32) -> u32 {
    ((a as u64 * b as u64) % q as u64) as u32
}

/// Computes base^exp mod q by binary exponentiation
pub fn mod_pow(base: u32, exp: u64, q: u32) -> u32 {
    if q == 1 {
        return 0;
    }

    let mut result = 1u32;
    let mut base = base % q;
    let mut exp = exp;

    while exp > 0 {
        if exp & 1 == 1 {
            result = mod_mul(result, base, q);
        }
        exp >>= 1;
        base = mod_mul(base, base, q);
    }

    result
}

/// Computes the modular inverse a^{-1} mod q
///
/// # Arguments
/// * `a` - Value to invert
/// * `q` - Modulus
///
/// # Returns
/// * `Result<u32>` - x in [0, q) with a·x ≡ 1 (mod q)
///
/// # Algorithm
/// Extended Euclidean algorithm on signed 64-bit integers.
pub fn mod_inverse(a: u32, q: u32) -> Result<u32> {
    check_modulus(q)?;
    let modulus = q as i64;
    let mut old_r = modulus;
    let mut r = (a % q) as i64;
    let mut old_s = 0i64;
    let mut s = 1i64;

    while r != 0 {
        let quotient = old_r / r;

        let temp_r = r;
        r = old_r - quotient * r;
        old_r = temp_r;

        let temp_s = s;
        s = old_s - quotient * s;
        old_s = temp_s;
    }

    if old_r != 1 {
        return Err(TesseraError::InvalidParameters(format!(
            "No modular inverse exists for {} mod {}",
            a, q
        )));
    }

    Ok(mod_reduce_signed(old_s, q))
}

/// Deterministic Miller-Rabin primality test for 32-bit integers
///
/// The witness set {2, 7, 61} is exact for every n < 4_759_123_141.
pub fn is_prime(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    if n == 2 || n == 3 {
        return true;
    }
    if n % 2 == 0 {
        return false;
    }

    // Write n - 1 as d * 2^r with d odd
    let mut d = (n - 1) as u64;
    let mut r = 0u32;
    while d % 2 == 0 {
        d /= 2;
        r += 1;
    }

    'witness: for &a in &[2u32, 7, 61] {
        if a >= n {
            continue;
        }

        let mut x = mod_pow(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }

        for _ in 1..r {
            x = mod_mul(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }

        return false;
    }

    true
}

/// Distinct prime factors of n by trial division
pub fn prime_factors(mut n: u64) -> Vec<u64> {
    let mut factors = Vec::new();

    if n % 2 == 0 {
        factors.push(2);
        while n % 2 == 0 {
            n /= 2;
        }
    }

    let mut d = 3u64;
    while d * d <= n {
        if n % d == 0 {
            factors.push(d);
            while n % d == 0 {
                n /= d;
            }
        }
        d += 2;
    }

    if n > 1 {
        factors.push(n);
    }

    factors
}

/// Finds the smallest generator of Z*_q for a prime q
pub fn find_generator(q: u32) -> Result<u32> {
    check_modulus(q)?;
    let phi = (q - 1) as u64;
    let factors = prime_factors(phi);

    for candidate in 2..q {
        if factors
            .iter()
            .all(|&p| mod_pow(candidate, phi / p, q) != 1)
        {
            return Ok(candidate);
        }
    }

    Err(TesseraError::InvalidParameters(format!(
        "No generator found for modulus {}",
        q
    )))
}

/// Finds a primitive `order`-th root of unity modulo the prime q
///
/// # Arguments
/// * `q` - Prime modulus
/// * `order` - Required multiplicative order (must divide q - 1)
///
/// # Returns
/// * `Result<u32>` - ω with ω^order ≡ 1 and ω^(order/p) ≢ 1 for every prime p | order
pub fn find_primitive_root(q: u32, order: u64) -> Result<u32> {
    check_modulus(q)?;
    if order == 0 || (q as u64 - 1) % order != 0 {
        return Err(TesseraError::InvalidParameters(format!(
            "Order {} does not divide q-1 = {}",
            order,
            q - 1
        )));
    }

    let generator = find_generator(q)?;
    let root = mod_pow(generator, (q as u64 - 1) / order, q);

    if !is_primitive_root(root, order, q) {
        return Err(TesseraError::InvalidParameters(format!(
            "Root {} does not have order {} mod {}",
            root, order, q
        )));
    }

    Ok(root)
}

/// Checks that `root` has multiplicative order exactly `order` modulo q
pub fn is_primitive_root(root: u32, order: u64, q: u32) -> bool {
    if q < 2 || order == 0 {
        return false;
    }
    if mod_pow(root, order, q) != 1 {
        return false;
    }
    prime_factors(order)
        .iter()
        .all(|&p| mod_pow(root, order / p, q) != 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: u32 = 3329;

    #[test]
    fn test_add_sub_wraparound() {
        assert_eq!(mod_add(Q - 1, 1, Q), 0);
        assert_eq!(mod_add(Q - 1, Q - 1, Q), Q - 2);
        assert_eq!(mod_sub(0, 1, Q), Q - 1);
        assert_eq!(mod_sub(5, 5, Q), 0);

        for a in [0, 1, 17, 1664, Q - 1] {
            for b in [0, 2, 999, Q - 1] {
                assert_eq!(mod_add(mod_sub(a, b, Q), b, Q), a);
            }
        }
    }

    #[test]
    fn test_mul_and_reduce() {
        assert_eq!(mod_mul(Q - 1, Q - 1, Q), 1);
        assert_eq!(mod_reduce(Q as u64 * 7 + 3, Q), 3);
        assert_eq!(mod_reduce_signed(-1, Q), Q - 1);
        assert_eq!(mod_reduce_signed(-(Q as i64) * 3 - 2, Q), Q - 2);
    }

    #[test]
    fn test_pow_and_inverse() {
        assert_eq!(mod_pow(17, 0, Q), 1);
        assert_eq!(mod_pow(17, 256, Q), 1);
        assert_eq!(mod_pow(17, 128, Q), Q - 1);

        let inv = mod_inverse(256, Q).unwrap();
        assert_eq!(inv, 3316);
        assert_eq!(mod_mul(inv, 256, Q), 1);

        assert!(mod_inverse(6, 12).is_err());
    }

    #[test]
    fn test_primality() {
        let primes = [2u32, 3, 5, 17, 257, 3329, 7681, 12289, 65537, 8_380_417];
        for p in primes {
            assert!(is_prime(p), "{} should be prime", p);
        }
        let composites = [0u32, 1, 4, 561, 3328, 65535, 1_373_653];
        for c in composites {
            assert!(!is_prime(c), "{} should be composite", c);
        }
    }

    #[test]
    fn test_primitive_roots() {
        assert_eq!(prime_factors(3328), vec![2, 13]);

        let root = find_primitive_root(Q, 256).unwrap();
        assert!(is_primitive_root(root, 256, Q));
        assert!(is_primitive_root(3061, 256, Q));
        assert!(is_primitive_root(17, 256, Q));
        assert!(!is_primitive_root(17, 128, Q));

        // 512 does not divide 3328
        assert!(find_primitive_root(Q, 512).is_err());
    }

    #[test]
    fn test_degenerate_moduli_are_rejected() {
        for q in [0u32, 1] {
            assert!(matches!(
                mod_inverse(3, q),
                Err(TesseraError::InvalidModulus { .. })
            ));
            assert!(matches!(
                find_generator(q),
                Err(TesseraError::InvalidModulus { .. })
            ));
            assert!(matches!(
                find_primitive_root(q, 2),
                Err(TesseraError::InvalidModulus { .. })
            ));
            assert!(!is_primitive_root(1, 2, q));
        }
        assert!(check_modulus(2).is_ok());
    }
}
