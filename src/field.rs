//! Prime-field arithmetic, univariate and symmetric bivariate polynomials, and Lagrange
//! interpolation at zero (§3, §9 "Numerical semantics").
//!
//! The modulus is the order of the secp256k1 curve, matching the reference implementation. All
//! arithmetic normalizes into `[0, p)`; there is no signed representation anywhere in this module.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use once_cell::sync::Lazy;
use rand::RngCore;
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};

/// Order of the secp256k1 group, used as the field modulus for all IVSS polynomial algebra.
static MODULUS: Lazy<BigUint> = Lazy::new(|| {
    BigUint::parse_bytes(
        b"FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEBAAEDCE6AF48A03BBFD25E8CD0364141",
        16,
    )
    .expect("hard-coded secp256k1 order parses")
});

/// An element of the prime field `Z_p`, always kept normalized into `[0, p)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fp(BigUint);

impl Fp {
    pub fn modulus() -> &'static BigUint {
        &MODULUS
    }

    pub fn zero() -> Self {
        Fp(BigUint::zero())
    }

    pub fn one() -> Self {
        Fp(BigUint::one())
    }

    pub fn from_u64(v: u64) -> Self {
        Fp(BigUint::from(v) % &*MODULUS)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Samples a uniformly random field element using the supplied cryptographic RNG.
    pub fn random<R: RngCore + rand::CryptoRng>(rng: &mut R) -> Self {
        Fp(rng.gen_biguint_below(&MODULUS))
    }

    /// Modular inverse via Fermat's little theorem (`p` is prime): `a^(p-2) mod p`.
    ///
    /// Panics on the zero element; callers (Lagrange interpolation) never invoke this with
    /// coincident interpolation points, which is the only way a zero denominator can arise.
    pub fn inverse(&self) -> Self {
        assert!(!self.is_zero(), "attempted to invert zero in the field");
        let exponent = &*MODULUS - BigUint::from(2u8);
        Fp(self.0.modpow(&exponent, &MODULUS))
    }

    /// Reduces this field element's canonical integer representative modulo a small integer `m`,
    /// used to collapse a reconstructed ICC value into the coin modulus `u`.
    pub fn mod_small(&self, m: u64) -> u64 {
        (&self.0 % BigUint::from(m)).to_u64_digits().first().copied().unwrap_or(0)
    }

    pub fn to_decimal_string(&self) -> String {
        self.0.to_str_radix(10)
    }

    pub fn from_decimal_string(s: &str) -> Option<Self> {
        BigUint::parse_bytes(s.as_bytes(), 10).map(Fp)
    }
}

impl From<u64> for Fp {
    fn from(v: u64) -> Self {
        Fp::from_u64(v)
    }
}

impl fmt::Display for Fp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for &Fp {
    type Output = Fp;
    fn add(self, rhs: &Fp) -> Fp {
        Fp((&self.0 + &rhs.0) % &*MODULUS)
    }
}

impl Sub for &Fp {
    type Output = Fp;
    fn sub(self, rhs: &Fp) -> Fp {
        if self.0 >= rhs.0 {
            Fp((&self.0 - &rhs.0) % &*MODULUS)
        } else {
            Fp(&*MODULUS - ((&rhs.0 - &self.0) % &*MODULUS))
        }
    }
}

impl Mul for &Fp {
    type Output = Fp;
    fn mul(self, rhs: &Fp) -> Fp {
        Fp((&self.0 * &rhs.0) % &*MODULUS)
    }
}

impl Neg for &Fp {
    type Output = Fp;
    fn neg(self) -> Fp {
        if self.is_zero() {
            Fp::zero()
        } else {
            Fp(&*MODULUS - &self.0)
        }
    }
}

impl Add for Fp {
    type Output = Fp;
    fn add(self, rhs: Fp) -> Fp {
        &self + &rhs
    }
}

impl Sub for Fp {
    type Output = Fp;
    fn sub(self, rhs: Fp) -> Fp {
        &self - &rhs
    }
}

impl Mul for Fp {
    type Output = Fp;
    fn mul(self, rhs: Fp) -> Fp {
        &self * &rhs
    }
}

/// Decimal-string wire encoding for arbitrary-precision field elements (§6).
impl Serialize for Fp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_decimal_string())
    }
}

impl<'de> Deserialize<'de> for Fp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fp::from_decimal_string(&s).ok_or_else(|| DeError::custom("invalid decimal big integer"))
    }
}

/// A univariate polynomial of degree `<= t`, stored as ascending coefficients `[c0, .., ct]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Polynomial {
    coeffs: Vec<Fp>,
}

impl Polynomial {
    pub fn new(coeffs: Vec<Fp>) -> Self {
        Polynomial { coeffs }
    }

    pub fn degree(&self) -> usize {
        self.coeffs.len().saturating_sub(1)
    }

    pub fn coeffs(&self) -> &[Fp] {
        &self.coeffs
    }

    /// Evaluates `P(x)` via Horner's rule.
    pub fn eval(&self, x: &Fp) -> Fp {
        let mut acc = Fp::zero();
        for c in self.coeffs.iter().rev() {
            acc = &(&acc * x) + c;
        }
        acc
    }

    pub fn eval_u64(&self, x: u64) -> Fp {
        self.eval(&Fp::from_u64(x))
    }
}

/// A symmetric bivariate polynomial `F(x,y)` of degree `t` in each variable, represented as the
/// `(t+1) x (t+1)` coefficient matrix `C_ij = C_ji` (§3).
#[derive(Clone, Debug)]
pub struct Bivariate {
    t: usize,
    /// `rows[i][j] == C_ij`, kept symmetric by construction.
    rows: Vec<Vec<Fp>>,
}

impl Bivariate {
    /// Samples a random symmetric bivariate polynomial of degree `t` with `F(0,0) = secret`.
    pub fn sample<R: RngCore + rand::CryptoRng>(t: usize, secret: Fp, rng: &mut R) -> Self {
        let mut rows = vec![vec![Fp::zero(); t + 1]; t + 1];
        for i in 0..=t {
            for j in i..=t {
                let c = if i == 0 && j == 0 {
                    secret.clone()
                } else {
                    Fp::random(rng)
                };
                rows[i][j] = c.clone();
                rows[j][i] = c;
            }
        }
        Bivariate { t, rows }
    }

    pub fn secret(&self) -> Fp {
        self.rows[0][0].clone()
    }

    /// The univariate slice `f_k(y) = F(k, y)` handed to receiver `k`: for each degree `i` in
    /// `y`, evaluate row `i` (a polynomial in `x`) at `x = k`.
    pub fn univariate_slice(&self, k: u64) -> Polynomial {
        let x = Fp::from_u64(k);
        let coeffs = (0..=self.t)
            .map(|i| Polynomial::new(self.rows[i].clone()).eval(&x))
            .collect();
        Polynomial::new(coeffs)
    }
}

/// Lagrange interpolation of `P(0)` given `(x_i, y_i)` sample points, all modulo the field prime.
pub fn interpolate_at_zero(points: &[(Fp, Fp)]) -> Fp {
    let mut result = Fp::zero();
    for (i, (x_i, y_i)) in points.iter().enumerate() {
        let mut numerator = Fp::one();
        let mut denominator = Fp::one();
        for (j, (x_j, _)) in points.iter().enumerate() {
            if i == j {
                continue;
            }
            // Term contributed by x_j: (0 - x_j) / (x_i - x_j), both normalized into [0, p).
            numerator = &numerator * &(-x_j);
            denominator = &denominator * &(x_i - x_j);
        }
        let term = &(&numerator * &denominator.inverse()) * y_i;
        result = &result + &term;
    }
    result
}
