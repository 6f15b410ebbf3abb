/// Decomposition of a transform into tesserae
///
/// A tessera is the atomic unit of intermittent work: one butterfly layer,
/// or an equal slice of one when `tiles_per_layer > 1`. Tesserae are
/// numbered layer-major, so tessera t covers layer t / tiles_per_layer and
/// slice t mod tiles_per_layer of that layer.
///
/// Tessera application is a pure function of the pre-tessera state. The
/// scheduler always feeds it the state restored from the last landed
/// checkpoint, which is what makes a replay after power loss idempotent.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::error::{Result, TesseraError};
use crate::ntt::{Direction, NttParams};
use crate::polynomial::{check_range, Polynomial};

/// One atomically checkpointed unit of a transform
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tessera {
    /// Position in the plan, t ∈ [0, T)
    pub index: u32,
    /// Butterfly layer this tessera belongs to
    pub layer: u32,
    /// Butterflies of `layer` applied by this tessera
    pub butterflies: Range<usize>,
}

/// What a checkpoint's progress index is relative to
///
/// Two plans over the same (n, q) produce records of the same shape, so the
/// record alone cannot tell them apart. The store keeps this identity beside
/// the live record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PlanId {
    pub direction: Direction,
    pub tiles_per_layer: usize,
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x{} tiles", self.direction, self.tiles_per_layer)
    }
}

/// Ordered tessera schedule for one transform direction
#[derive(Clone, Debug)]
pub struct TilePlan {
    params: Arc<NttParams>,
    direction: Direction,
    tiles_per_layer: usize,
    butterflies_per_tile: usize,
}

impl TilePlan {
    /// Creates a plan slicing each layer into `tiles_per_layer` tesserae
    ///
    /// # Arguments
    /// * `params` - NTT parameters
    /// * `direction` - Transform direction
    /// * `tiles_per_layer` - Power of two dividing n/2 (1 = one tessera per layer)
    pub fn new(params: Arc<NttParams>, direction: Direction, tiles_per_layer: usize) -> Result<Self> {
        let per_layer = params.butterflies_per_layer();

        if tiles_per_layer == 0
            || !tiles_per_layer.is_power_of_two()
            || tiles_per_layer > per_layer
        {
            return Err(TesseraError::InvalidParameters(format!(
                "tiles_per_layer must be a power of two in [1, {}], got {}",
                per_layer, tiles_per_layer
            )));
        }

        Ok(Self {
            butterflies_per_tile: per_layer / tiles_per_layer,
            params,
            direction,
            tiles_per_layer,
        })
    }

    pub fn params(&self) -> &NttParams {
        &self.params
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn tiles_per_layer(&self) -> usize {
        self.tiles_per_layer
    }

    pub fn id(&self) -> PlanId {
        PlanId {
            direction: self.direction,
            tiles_per_layer: self.tiles_per_layer,
        }
    }

    /// Total tessera count T = log2(n) · tiles_per_layer
    pub fn total_tesserae(&self) -> u32 {
        self.params.layers() * self.tiles_per_layer as u32
    }

    /// Fraction of a full layer that one tessera computes
    pub fn layer_fraction(&self) -> f64 {
        1.0 / self.tiles_per_layer as f64
    }

    pub fn tessera(&self, index: u32) -> Result<Tessera> {
        if index >= self.total_tesserae() {
            return Err(TesseraError::InvalidParameters(format!(
                "Tessera {} out of range for a plan of {} tesserae",
                index,
                self.total_tesserae()
            )));
        }

        let layer = index / self.tiles_per_layer as u32;
        let slice = index as usize % self.tiles_per_layer;
        let start = slice * self.butterflies_per_tile;

        Ok(Tessera {
            index,
            layer,
            butterflies: start..start + self.butterflies_per_tile,
        })
    }

    pub fn tesserae(&self) -> impl Iterator<Item = Tessera> + '_ {
        (0..self.total_tesserae()).filter_map(move |t| self.tessera(t).ok())
    }

    /// Working state before tessera 0, derived from the transform input
    pub fn initial_state(&self, input: &Polynomial) -> Result<Vec<u32>> {
        self.params.check_polynomial(input)?;
        Ok(self.params.prepare(self.direction, input.coefficients()))
    }

    /// Applies tessera `index` to a pre-tessera state
    ///
    /// # Returns
    /// * `Result<Vec<u32>>` - The post-tessera state, every coefficient checked
    ///   to lie in [0, q)
    pub fn apply(&self, index: u32, pre_state: &[u32]) -> Result<Vec<u32>> {
        let tessera = self.tessera(index)?;

        if pre_state.len() != self.params.dimension() {
            return Err(TesseraError::InvalidDimension {
                expected: self.params.dimension(),
                got: pre_state.len(),
            });
        }

        let mut working = pre_state.to_vec();
        self.params.apply_butterflies(
            self.direction,
            tessera.layer,
            tessera.butterflies,
            &mut working,
        );

        check_range(&working, self.params.modulus(), Some(index))?;
        Ok(working)
    }

    /// Transform output from the state after the final tessera
    pub fn output(&self, final_state: &[u32]) -> Result<Polynomial> {
        Polynomial::new(
            self.params.finish(self.direction, final_state),
            self.params.modulus(),
        )
    }
}
