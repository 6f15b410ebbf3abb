pub mod checkpoint;
pub mod config;
pub mod error;
pub mod kem;
pub mod leakage;
pub mod modular_arithmetic;
pub mod ntt;
pub mod nvm;
pub mod polynomial;
pub mod power;
pub mod scheduler;
pub mod sim;
pub mod simulation;
pub mod tiling;


pub use checkpoint::CheckpointRecord;
pub use config::{PowerConfig, SamplerConfig, SimulationConfig, TimingModel};
pub use error::{Result, TesseraError};
pub use kem::{BabyKyber, Ciphertext, PublicKey, SecretKey, SharedSecret};
pub use leakage::{hamming_weight, LeakageRecorder, LeakageSample, LeakageSummary};
pub use ntt::{DirectTransform, Direction, NttParams, Transform};
pub use nvm::{NvmStore, WriteReceipt};
pub use polynomial::Polynomial;
pub use power::{
    Deterministic, DurationSampler, Exponential, Fixed, PowerSource, PowerState, PowerTransition,
};
pub use scheduler::{Scheduler, SchedulerState, SchedulerStats, SchedulerStatus};
pub use sim::{EventKind, SimContext, SimTime};
pub use simulation::{run_transform, IntermittentTransform, RunReport, Simulation};
pub use tiling::{PlanId, Tessera, TilePlan};
