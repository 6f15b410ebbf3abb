/// Baby-Kyber key encapsulation
///
/// A small module-LWE KEM over the cyclic ring Z_q[X]/(X^n - 1), used to
/// exercise the intermittent transform inside a real protocol. Every NTT
/// goes through a `Transform`, so the same code runs on the direct
/// transform and on the simulated intermittent device.
///
/// Parameters: rank k = 2, centered binomial noise with eta = 2, one message
/// bit per coefficient, uncompressed ciphertexts.
///
/// Protocol (hats denote the NTT domain, ∘ the pointwise product):
/// - KeyGen: Â ← SHAKE-128(seed), s, e ← CBD; t̂ = Â∘ŝ + NTT(e)
/// - Encaps: m random, r, e1, e2 ← CBD;
///   u = INTT(Âᵀ∘r̂) + e1, v = INTT(t̂ᵀ∘r̂) + e2 + ⌈q/2⌋·m,
///   ss = SHA3-256(m ‖ SHA3-256(ct))
/// - Decaps: w = v - INTT(ŝᵀ∘NTT(u)); each coefficient decodes to 1 when it
///   is closer to q/2 than to 0
///
/// This is a teaching construction: no compression, no FO transform, no
/// claim of security.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use rand_core::{CryptoRng, RngCore};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Digest, Sha3_256, Shake128};
use subtle::{Choice, ConstantTimeEq};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Result, TesseraError};
use crate::modular_arithmetic::{mod_add, mod_mul};
use crate::ntt::{Direction, NttParams, Transform};
use crate::polynomial::Polynomial;

/// Module rank k
pub const RANK: usize = 2;

/// Centered binomial parameter
pub const ETA: u32 = 2;

/// Length of the matrix seed in bytes
pub const SEED_LEN: usize = 32;

/// Length of the shared secret in bytes
pub const SHARED_SECRET_LEN: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    pub seed: [u8; SEED_LEN],
    /// t̂ in the NTT domain
    pub t_hat: Vec<Polynomial>,
}

impl PublicKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.seed.to_vec();
        bytes.extend(polys_to_bytes(&self.t_hat));
        bytes
    }

    pub fn from_bytes(bytes: &[u8], params: &NttParams) -> Result<Self> {
        let expected = SEED_LEN + RANK * params.dimension() * 2;
        if bytes.len() != expected {
            return Err(TesseraError::Serialization(format!(
                "public key must be {} bytes, got {}",
                expected,
                bytes.len()
            )));
        }

        let mut seed = [0u8; SEED_LEN];
        seed.copy_from_slice(&bytes[..SEED_LEN]);
        Ok(Self {
            seed,
            t_hat: polys_from_bytes(&bytes[SEED_LEN..], RANK, params)?,
        })
    }
}

/// Secret vector ŝ in the NTT domain
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    s_hat: Vec<Vec<u32>>,
    #[zeroize(skip)]
    modulus: u32,
}

impl SecretKey {
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut bytes = Zeroizing::new(Vec::new());
        for poly in &self.s_hat {
            bytes.extend(coefficients_to_bytes(poly));
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8], params: &NttParams) -> Result<Self> {
        let expected = RANK * params.dimension() * 2;
        if bytes.len() != expected {
            return Err(TesseraError::Serialization(format!(
                "secret key must be {} bytes, got {}",
                expected,
                bytes.len()
            )));
        }

        let s_hat = polys_from_bytes(bytes, RANK, params)?
            .into_iter()
            .map(Polynomial::into_coefficients)
            .collect();
        Ok(Self {
            s_hat,
            modulus: params.modulus(),
        })
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("rank", &self.s_hat.len())
            .field("modulus", &self.modulus)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ciphertext {
    pub u: Vec<Polynomial>,
    pub v: Polynomial,
}

impl Ciphertext {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = polys_to_bytes(&self.u);
        bytes.extend(coefficients_to_bytes(self.v.coefficients()));
        bytes
    }

    pub fn from_bytes(bytes: &[u8], params: &NttParams) -> Result<Self> {
        let poly_len = params.dimension() * 2;
        let expected = (RANK + 1) * poly_len;
        if bytes.len() != expected {
            return Err(TesseraError::Serialization(format!(
                "ciphertext must be {} bytes, got {}",
                expected,
                bytes.len()
            )));
        }

        let mut polys = polys_from_bytes(bytes, RANK + 1, params)?;
        let v = polys.pop().ok_or_else(|| {
            TesseraError::Serialization("ciphertext holds no polynomials".to_string())
        })?;
        Ok(Self { u: polys, v })
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.0
    }
}

impl ConstantTimeEq for SharedSecret {
    fn ct_eq(&self, other: &Self) -> Choice {
        self.0.ct_eq(&other.0)
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other).into()
    }
}

impl Eq for SharedSecret {}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

pub struct BabyKyber<T: Transform> {
    transform: T,
}

impl<T: Transform> BabyKyber<T> {
    pub fn new(transform: T) -> Result<Self> {
        let params = transform.params();
        if params.dimension() % 8 != 0 {
            return Err(TesseraError::InvalidParameters(format!(
                "message encoding needs a dimension divisible by 8, got {}",
                params.dimension()
            )));
        }
        if params.modulus() > u16::MAX as u32 {
            return Err(TesseraError::InvalidModulus {
                modulus: params.modulus() as u64,
            });
        }
        Ok(Self { transform })
    }

    pub fn params(&self) -> &NttParams {
        self.transform.params()
    }

    pub fn transform(&self) -> &T {
        &self.transform
    }

    pub fn into_transform(self) -> T {
        self.transform
    }

    /// Message length in bytes (one bit per coefficient)
    pub fn message_len(&self) -> usize {
        self.params().dimension() / 8
    }

    /// Generates a key pair
    pub fn keygen<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<(PublicKey, SecretKey)> {
        let mut seed = [0u8; SEED_LEN];
        rng.fill_bytes(&mut seed);
        let a_hat = self.expand_matrix(&seed)?;

        let mut s_hat = Vec::with_capacity(RANK);
        for _ in 0..RANK {
            let s = self.sample_noise(rng)?;
            s_hat.push(self.transform.transform(&s, Direction::Forward)?);
        }

        let mut t_hat = Vec::with_capacity(RANK);
        for row in &a_hat {
            let e = self.sample_noise(rng)?;
            let e_hat = self.transform.transform(&e, Direction::Forward)?;
            t_hat.push(self.inner_product(row, &s_hat)?.add(&e_hat)?);
        }

        let secret = SecretKey {
            s_hat: s_hat.into_iter().map(Polynomial::into_coefficients).collect(),
            modulus: self.params().modulus(),
        };
        Ok((PublicKey { seed, t_hat }, secret))
    }

    /// Encapsulates a fresh shared secret under `pk`
    pub fn encaps<R: RngCore + CryptoRng>(
        &mut self,
        pk: &PublicKey,
        rng: &mut R,
    ) -> Result<(Ciphertext, SharedSecret)> {
        self.check_public_key(pk)?;

        let mut message = Zeroizing::new(vec![0u8; self.message_len()]);
        rng.fill_bytes(&mut message);

        let ct = self.encrypt(pk, &message, rng)?;
        let ss = self.derive_secret(&message, &ct);
        Ok((ct, ss))
    }

    /// Recovers the shared secret from `ct`
    pub fn decaps(&mut self, sk: &SecretKey, ct: &Ciphertext) -> Result<SharedSecret> {
        let n = self.params().dimension();
        let q = self.params().modulus();
        if sk.s_hat.len() != RANK || sk.modulus != q || ct.u.len() != RANK {
            return Err(TesseraError::InvalidParameters(
                "key or ciphertext does not match the KEM parameters".to_string(),
            ));
        }

        let mut acc = vec![0u32; n];
        for (s_hat, u) in sk.s_hat.iter().zip(&ct.u) {
            let u_hat = self.transform.transform(u, Direction::Forward)?;
            for ((a, &s), &b) in acc.iter_mut().zip(s_hat).zip(u_hat.coefficients()) {
                *a = mod_add(*a, mod_mul(s, b, q), q);
            }
        }
        let su = self
            .transform
            .transform(&Polynomial::new(acc, q)?, Direction::Inverse)?;

        let w = ct.v.sub(&su)?;
        let message = Zeroizing::new(self.decode_message(&w));
        Ok(self.derive_secret(&message, ct))
    }

    fn encrypt<R: RngCore>(&mut self, pk: &PublicKey, message: &[u8], rng: &mut R) -> Result<Ciphertext> {
        let a_hat = self.expand_matrix(&pk.seed)?;

        let mut r_hat = Vec::with_capacity(RANK);
        for _ in 0..RANK {
            let r = self.sample_noise(rng)?;
            r_hat.push(self.transform.transform(&r, Direction::Forward)?);
        }

        let mut u = Vec::with_capacity(RANK);
        for i in 0..RANK {
            let column: Vec<Polynomial> = a_hat.iter().map(|row| row[i].clone()).collect();
            let product = self.inner_product(&column, &r_hat)?;
            let e1 = self.sample_noise(rng)?;
            u.push(self.transform.transform(&product, Direction::Inverse)?.add(&e1)?);
        }

        let product = self.inner_product(&pk.t_hat, &r_hat)?;
        let e2 = self.sample_noise(rng)?;
        let v = self
            .transform
            .transform(&product, Direction::Inverse)?
            .add(&e2)?
            .add(&self.encode_message(message)?)?;

        Ok(Ciphertext { u, v })
    }

    /// Σ a_i ∘ b_i in the NTT domain
    fn inner_product(&self, a: &[Polynomial], b: &[Polynomial]) -> Result<Polynomial> {
        let params = self.params();
        let mut acc = Polynomial::zero(params.dimension(), params.modulus())?;
        for (x, y) in a.iter().zip(b) {
            acc = acc.add(&params.pointwise_mul(x, y)?)?;
        }
        Ok(acc)
    }

    /// Expands the matrix Â directly in the NTT domain
    ///
    /// Entry (i, j) is read from SHAKE-128(seed ‖ i ‖ j) as little-endian
    /// u16 values masked to the bit length of q, rejecting values ≥ q.
    fn expand_matrix(&self, seed: &[u8; SEED_LEN]) -> Result<Vec<Vec<Polynomial>>> {
        let n = self.params().dimension();
        let q = self.params().modulus();
        let mask = (q.next_power_of_two() - 1) as u16;

        let mut matrix = Vec::with_capacity(RANK);
        for i in 0..RANK {
            let mut row = Vec::with_capacity(RANK);
            for j in 0..RANK {
                let mut xof = Shake128::default();
                xof.update(seed);
                xof.update(&[i as u8, j as u8]);
                let mut reader = xof.finalize_xof();

                let mut coefficients = Vec::with_capacity(n);
                let mut buf = [0u8; 2];
                while coefficients.len() < n {
                    reader.read(&mut buf);
                    let candidate = (LittleEndian::read_u16(&buf) & mask) as u32;
                    if candidate < q {
                        coefficients.push(candidate);
                    }
                }
                row.push(Polynomial::new(coefficients, q)?);
            }
            matrix.push(row);
        }
        Ok(matrix)
    }

    /// Centered binomial sample: popcount of eta bits minus popcount of eta bits
    fn sample_noise<R: RngCore + ?Sized>(&self, rng: &mut R) -> Result<Polynomial> {
        let n = self.params().dimension();
        let half = (1u32 << ETA) - 1;

        let values: Vec<i64> = (0..n)
            .map(|_| {
                let bits = rng.next_u32();
                let a = (bits & half).count_ones() as i64;
                let b = ((bits >> ETA) & half).count_ones() as i64;
                a - b
            })
            .collect();
        Polynomial::from_signed(&values, self.params().modulus())
    }

    fn encode_message(&self, message: &[u8]) -> Result<Polynomial> {
        let q = self.params().modulus();
        let half = (q + 1) / 2;
        let coefficients = (0..self.params().dimension())
            .map(|i| {
                let bit = (message[i / 8] >> (i % 8)) & 1;
                bit as u32 * half
            })
            .collect();
        Polynomial::new(coefficients, q)
    }

    fn decode_message(&self, w: &Polynomial) -> Vec<u8> {
        let q = w.modulus() as u64;
        let mut message = vec![0u8; self.message_len()];
        for (i, &c) in w.coefficients().iter().enumerate() {
            let scaled = 4 * c as u64;
            if scaled > q && scaled < 3 * q {
                message[i / 8] |= 1 << (i % 8);
            }
        }
        message
    }

    fn derive_secret(&self, message: &[u8], ct: &Ciphertext) -> SharedSecret {
        let ct_hash = Sha3_256::digest(ct.to_bytes());

        let mut hasher = Sha3_256::new();
        Digest::update(&mut hasher, message);
        Digest::update(&mut hasher, ct_hash);
        SharedSecret(hasher.finalize().into())
    }

    fn check_public_key(&self, pk: &PublicKey) -> Result<()> {
        if pk.t_hat.len() != RANK {
            return Err(TesseraError::InvalidParameters(format!(
                "public key must hold {} polynomials, got {}",
                RANK,
                pk.t_hat.len()
            )));
        }
        for poly in &pk.t_hat {
            self.params().check_polynomial(poly)?;
        }
        Ok(())
    }
}

fn coefficients_to_bytes(coefficients: &[u32]) -> Vec<u8> {
    let narrow: Vec<u16> = coefficients.iter().map(|&c| c as u16).collect();
    let mut bytes = vec![0u8; narrow.len() * 2];
    LittleEndian::write_u16_into(&narrow, &mut bytes);
    bytes
}

fn polys_to_bytes(polys: &[Polynomial]) -> Vec<u8> {
    polys
        .iter()
        .flat_map(|p| coefficients_to_bytes(p.coefficients()))
        .collect()
}

fn polys_from_bytes(bytes: &[u8], count: usize, params: &NttParams) -> Result<Vec<Polynomial>> {
    let n = params.dimension();
    let mut polys = Vec::with_capacity(count);
    for chunk in bytes.chunks_exact(n * 2).take(count) {
        let mut narrow = vec![0u16; n];
        LittleEndian::read_u16_into(chunk, &mut narrow);
        let coefficients = narrow.into_iter().map(u32::from).collect();
        polys.push(Polynomial::new(coefficients, params.modulus())?);
    }
    Ok(polys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PowerConfig, SimulationConfig};
    use crate::ntt::DirectTransform;
    use crate::simulation::IntermittentTransform;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn direct_kem() -> BabyKyber<DirectTransform> {
        BabyKyber::new(DirectTransform::new(NttParams::new(256, 3329).unwrap())).unwrap()
    }

    #[test]
    fn test_shared_secrets_agree() {
        let mut kem = direct_kem();
        let mut rng = ChaCha20Rng::seed_from_u64(1);

        for _ in 0..5 {
            let (pk, sk) = kem.keygen(&mut rng).unwrap();
            let (ct, ss_enc) = kem.encaps(&pk, &mut rng).unwrap();
            let ss_dec = kem.decaps(&sk, &ct).unwrap();
            assert_eq!(ss_enc, ss_dec);
            assert_eq!(ss_enc.as_bytes().len(), SHARED_SECRET_LEN);
        }
    }

    #[test]
    fn test_wrong_secret_key_disagrees() {
        let mut kem = direct_kem();
        let mut rng = ChaCha20Rng::seed_from_u64(2);

        let (pk, _) = kem.keygen(&mut rng).unwrap();
        let (_, other_sk) = kem.keygen(&mut rng).unwrap();
        let (ct, ss) = kem.encaps(&pk, &mut rng).unwrap();
        assert_ne!(kem.decaps(&other_sk, &ct).unwrap(), ss);
    }

    #[test]
    fn test_encapsulations_are_fresh() {
        let mut kem = direct_kem();
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let (pk, _) = kem.keygen(&mut rng).unwrap();

        let (ct1, ss1) = kem.encaps(&pk, &mut rng).unwrap();
        let (ct2, ss2) = kem.encaps(&pk, &mut rng).unwrap();
        assert_ne!(ct1, ct2);
        assert_ne!(ss1, ss2);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut kem = direct_kem();
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let params = kem.params().clone();

        let (pk, sk) = kem.keygen(&mut rng).unwrap();
        let pk_bytes = pk.to_bytes();
        assert_eq!(pk_bytes.len(), SEED_LEN + 2 * 256 * 2);
        assert_eq!(PublicKey::from_bytes(&pk_bytes, &params).unwrap(), pk);

        let sk = SecretKey::from_bytes(&sk.to_bytes(), &params).unwrap();
        let (ct, ss) = kem.encaps(&pk, &mut rng).unwrap();
        let ct = Ciphertext::from_bytes(&ct.to_bytes(), &params).unwrap();
        assert_eq!(kem.decaps(&sk, &ct).unwrap(), ss);

        assert!(PublicKey::from_bytes(&pk_bytes[1..], &params).is_err());
        let mut bad = ct.to_bytes();
        bad[0] = 0xFF;
        bad[1] = 0xFF;
        assert!(Ciphertext::from_bytes(&bad, &params).is_err());
    }

    #[test]
    fn test_matrix_expansion_is_deterministic() {
        let kem = direct_kem();
        let seed = [7u8; SEED_LEN];
        let a = kem.expand_matrix(&seed).unwrap();
        assert_eq!(a, kem.expand_matrix(&seed).unwrap());
        assert_ne!(a[0][0], a[0][1]);
        assert!(a.iter().flatten().all(|p| p.coefficients().iter().all(|&c| c < 3329)));
    }

    #[test]
    fn test_noise_is_small() {
        let kem = direct_kem();
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let noise = kem.sample_noise(&mut rng).unwrap();
        for &c in noise.coefficients() {
            assert!(c <= ETA || c >= 3329 - ETA, "coefficient {} is not small", c);
        }
    }

    #[test]
    fn test_kem_over_intermittent_device() {
        let config = SimulationConfig::default()
            .with_power(PowerConfig::exponential(60.0, 20.0))
            .with_seed(99);
        let mut kem = BabyKyber::new(IntermittentTransform::new(config).unwrap()).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(6);

        let (pk, sk) = kem.keygen(&mut rng).unwrap();
        let (ct, ss_enc) = kem.encaps(&pk, &mut rng).unwrap();
        assert_eq!(kem.decaps(&sk, &ct).unwrap(), ss_enc);

        let stats = kem.transform().total_stats();
        assert!(stats.power_failures > 0);
    }
}
