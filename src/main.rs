//! nGPT command-line driver.
//!
//! Builds a network from a JSON config (or defaults), runs one forward pass
//! over random token ids and reports the next-token loss, hidden-state norms
//! and weight drift.

use anyhow::Context;
use clap::Parser;
use ndarray::Array2;
use ngpt::core::l2norm::lane_norms;
use ngpt::core::norm_linear::Enforcement;
use ngpt::{ForwardOptions, NetworkConfig, NgptModel, Parameters};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// nGPT smoke-run CLI.
#[derive(Parser, Debug)]
#[command(name = "ngpt", about = "Normalized transformer on the hypersphere", version)]
struct Cli {
    /// JSON config file; missing fields take their defaults.
    #[arg(short, long)]
    config: Option<String>,

    /// Seed for weight initialisation and the sampled token ids.
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Sequences per batch.
    #[arg(short, long, default_value_t = 2)]
    batch: usize,

    /// Tokens per sequence, including the final target.
    #[arg(short = 'n', long, default_value_t = 16)]
    seq_len: usize,

    /// Use lazy weight enforcement regardless of the config file.
    #[arg(long, default_value_t = false)]
    lazy: bool,

    /// Print the resolved config as JSON and exit.
    #[arg(long, default_value_t = false)]
    print_config: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NetworkConfig::from_json_file(path)?,
        None => NetworkConfig::default(),
    };
    if cli.lazy {
        config.enforcement = Enforcement::Lazy;
    }

    if cli.print_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    tracing::info!("nGPT v{}", env!("CARGO_PKG_VERSION"));
    let num_tokens = config.num_tokens;
    let mut model = NgptModel::new(config, cli.seed).context("failed to build network")?;

    let mut rng = StdRng::seed_from_u64(cli.seed.wrapping_add(1));
    let ids = Array2::from_shape_simple_fn((cli.batch, cli.seq_len), || {
        rng.gen_range(0..num_tokens as i64)
    });

    let options = ForwardOptions {
        return_loss: true,
        return_hiddens: true,
    };
    let output = model.forward(&ids, None, options).context("forward pass failed")?;

    if let Some(loss) = output.loss() {
        tracing::info!(
            loss,
            uniform = (num_tokens as f32).ln(),
            "next-token cross-entropy"
        );
    }
    if let Some(hiddens) = &output.hiddens {
        let worst = lane_norms(hiddens)
            .into_iter()
            .map(|n| (n - 1.0).abs())
            .fold(0.0f32, f32::max);
        tracing::info!(
            states = hiddens.len_of(ndarray::Axis(0)),
            max_norm_error = worst,
            "hidden states"
        );
    }

    tracing::info!(
        params = model.parameter_count(),
        drift = model.max_weight_deviation(),
        "weights"
    );
    model.norm_weights();
    tracing::info!(drift = model.max_weight_deviation(), "after norm_weights");

    tracing::info!("Done.");
    Ok(())
}
