//! Tessera command-line entry point
//!
//! Runs intermittent NTT simulations, round-trip checks and the Baby-Kyber
//! KEM demonstration.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tessera::{
    run_transform, BabyKyber, DirectTransform, Direction, IntermittentTransform, Polynomial,
    SamplerConfig, Simulation, SimulationConfig, Transform,
};

#[derive(Parser)]
#[command(name = "tessera", version)]
#[command(about = "Atomic NTT tesserae on an intermittently powered device")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one intermittent forward NTT of a random polynomial
    Run(RunArgs),
    /// Check that inverse(forward(x)) == x for random inputs
    Verify(VerifyArgs),
    /// Key generation, encapsulation and decapsulation with Baby-Kyber
    Kem(KemArgs),
}

#[derive(Args)]
struct RunArgs {
    /// JSON simulation config; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Mean powered-on time
    #[arg(long)]
    on_avg: Option<f64>,

    /// Mean powered-off time
    #[arg(long)]
    off_avg: Option<f64>,

    /// Simulated time budget
    #[arg(long)]
    duration: Option<f64>,

    #[arg(long)]
    tiles_per_layer: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Write the leakage trace here as JSON
    #[arg(long)]
    trace_out: Option<PathBuf>,
}

#[derive(Args)]
struct VerifyArgs {
    /// Number of random polynomials to test
    #[arg(long, default_value_t = 5)]
    count: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Run every transform on the simulated intermittent device
    #[arg(long)]
    intermittent: bool,
}

#[derive(Args)]
struct KemArgs {
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Run every NTT on the simulated intermittent device
    #[arg(long)]
    intermittent: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Verify(args) => cmd_verify(args),
        Commands::Kem(args) => cmd_kem(args),
    }
}

fn rule() {
    println!("{}", "=".repeat(60));
}

fn load_config(args: &RunArgs) -> anyhow::Result<SimulationConfig> {
    let mut config = match &args.config {
        Some(path) => SimulationConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SimulationConfig::default(),
    };

    if let Some(mean) = args.on_avg {
        config.power.on = SamplerConfig::Exponential { mean };
    }
    if let Some(mean) = args.off_avg {
        config.power.off = SamplerConfig::Exponential { mean };
    }
    if let Some(duration) = args.duration {
        config.deadline = duration;
    }
    if let Some(tiles) = args.tiles_per_layer {
        config.tiles_per_layer = tiles;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    config.validate().context("invalid simulation config")?;
    Ok(config)
}

fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;

    rule();
    println!(" Tessera - Atomic NTT Simulation");
    println!(" Duration : {} time units", config.deadline);
    println!(" Power    : on={:?}  off={:?}", config.power.on, config.power.off);
    println!(" Tiling   : {} tesserae per layer", config.tiles_per_layer);
    rule();

    let mut rng = ChaCha20Rng::seed_from_u64(config.seed);
    let input = Polynomial::random(config.dimension, config.modulus, &mut rng)?;
    let mut simulation = Simulation::new(&config, input, Direction::Forward)?;

    let report = match simulation.run() {
        Ok(report) => report,
        Err(err) => {
            let status = simulation.scheduler().status();
            let store = simulation.scheduler().store();
            eprintln!("Simulation failed: {}", err);
            eprintln!("  Tessera index    : {:?}", err.tessera_index());
            eprintln!("  Scheduler        : {}", status);
            eprintln!(
                "  Live checkpoint  : {}",
                match store.checkpoint_extent() {
                    Some(extent) => format!("bytes {:#06x}..{:#06x}", extent.start, extent.end),
                    None => "none".to_string(),
                }
            );
            return Err(err.into());
        }
    };

    println!();
    rule();
    println!(" Simulation Summary");
    println!("  Status            : {}", report.status);
    println!("  Completed tesserae: {}", report.stats.completed_tesserae);
    println!("  Power failures    : {}", report.stats.power_failures);
    println!("  Lost tesserae     : {}", report.stats.lost_tesserae);
    println!("  NVM restores      : {}", report.stats.restores);
    println!("  Elapsed           : {:.1}", report.elapsed);
    match report.leakage_summary() {
        Some(summary) => println!("  {}", summary),
        None => println!("  Leakage trace: empty"),
    }
    rule();

    if let Some(path) = &args.trace_out {
        simulation
            .scheduler()
            .store()
            .recorder()
            .write_json(path)
            .with_context(|| format!("writing trace to {}", path.display()))?;
        info!(path = %path.display(), samples = report.trace.len(), "leakage trace written");
    }

    Ok(())
}

fn cmd_verify(args: VerifyArgs) -> anyhow::Result<()> {
    rule();
    println!(" Tessera - NTT Round-Trip Verification");
    if args.intermittent {
        println!(" Mode: intermittent device");
    }
    rule();

    let config = SimulationConfig::default();
    let params = config.ntt_params()?;
    let mut rng = ChaCha20Rng::seed_from_u64(args.seed);
    let mut failures = 0usize;

    for i in 0..args.count {
        let x = Polynomial::random(params.dimension(), params.modulus(), &mut rng)?;

        let round_trip = if args.intermittent {
            let config = config.clone().with_seed(args.seed.wrapping_add(i as u64));
            let forward = run_transform(&config, &x, Direction::Forward)?;
            run_transform(&config, &forward, Direction::Inverse)?
        } else {
            params.inverse(&params.forward(&x)?)?
        };

        if round_trip == x {
            println!("  [Test {}] PASS", i + 1);
        } else {
            failures += 1;
            println!("  [Test {}] FAIL", i + 1);
        }
    }

    println!();
    if failures > 0 {
        bail!("{}/{} round-trip tests failed", failures, args.count);
    }
    println!("All {} round-trip tests passed.", args.count);
    Ok(())
}

fn cmd_kem(args: KemArgs) -> anyhow::Result<()> {
    rule();
    println!(" Tessera - Baby-Kyber KEM Demo");
    rule();

    let config = SimulationConfig::default().with_seed(args.seed);
    if args.intermittent {
        let kem = BabyKyber::new(IntermittentTransform::new(config)?)?;
        let kem = exchange(kem, args.seed)?;
        let stats = kem.transform().total_stats();
        println!(
            "[KEM] {} transforms | {} power failures | {} restores",
            kem.transform().reports().len(),
            stats.power_failures,
            stats.restores
        );
        Ok(())
    } else {
        exchange(BabyKyber::new(DirectTransform::new(config.ntt_params()?))?, args.seed)?;
        Ok(())
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(16).map(|b| format!("{:02x}", b)).collect()
}

fn exchange<T: Transform>(mut kem: BabyKyber<T>, seed: u64) -> anyhow::Result<BabyKyber<T>> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);

    println!("[KEM] Generating key pair...");
    let (pk, sk) = kem.keygen(&mut rng)?;
    println!("      pk length = {} bytes", pk.to_bytes().len());
    println!("      sk length = {} bytes", sk.to_bytes().len());

    println!("[KEM] Encapsulating...");
    let (ct, ss_enc) = kem.encaps(&pk, &mut rng)?;
    println!("      ciphertext length = {} bytes", ct.to_bytes().len());
    println!("      shared secret (enc) = {}...", hex_prefix(ss_enc.as_bytes()));

    println!("[KEM] Decapsulating...");
    let ss_dec = kem.decaps(&sk, &ct)?;
    println!("      shared secret (dec) = {}...", hex_prefix(ss_dec.as_bytes()));

    if ss_enc != ss_dec {
        bail!("decapsulation produced a different shared secret");
    }
    println!("[KEM] Shared secrets match.");
    Ok(kem)
}
