// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! `mind-local`: inspect a device platform and run a replicated smoke test.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mind_local::{
    Computation, ExecutableBuildOptions, Literal, LocalClient, PrimitiveType, RuntimeConfig, Shape,
};

#[derive(Parser, Debug)]
#[command(name = "mind-local")]
#[command(about = "MIND local device client", long_about = None)]
#[command(version)]
struct Cli {
    /// Runtime configuration file (TOML); defaults to $MIND_LOCAL_CONFIG
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the platform and its visible device count
    Devices {
        #[arg(short, long, default_value = "cpu")]
        platform: String,
    },

    /// Compile `x * 2 + replica_id` and run it on every replica
    Smoke {
        #[arg(short, long, default_value = "cpu")]
        platform: String,

        /// Number of replicas (at most the device count)
        #[arg(short, long, default_value = "1")]
        replicas: usize,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => RuntimeConfig::from_env().context("failed to read runtime configuration"),
    }
}

fn smoke_program() -> Computation {
    let mut c = Computation::new("smoke");
    let x = c.parameter(0, Shape::scalar(PrimitiveType::S32));
    let two = c.constant(Literal::scalar(2i32));
    let doubled = c.mul(x, two);
    let replica = c.replica_id();
    let out = c.add(doubled, replica);
    c.output(out);
    c
}

fn run_smoke(client: &LocalClient, replicas: usize) -> Result<()> {
    let options = ExecutableBuildOptions::default().with_num_replicas(replicas);
    let executable = client
        .compile(&smoke_program(), &[Shape::scalar(PrimitiveType::S32)], &options)
        .context("compiling smoke program")?;

    let items: Vec<(Literal, usize)> = executable
        .device_ordinals()
        .into_iter()
        .enumerate()
        .map(|(replica, ordinal)| (Literal::scalar(10 * replica as i32 + 1), ordinal))
        .collect();
    let arguments = client
        .transfer_to_device_batch(&items)
        .context("transferring arguments")?;
    let per_replica: Vec<Vec<_>> = arguments.iter().map(|buffer| vec![buffer]).collect();
    let results = executable
        .execute_replicated(&per_replica)
        .context("executing smoke program")?;

    for (replica, (result, (input, ordinal))) in results.iter().zip(&items).enumerate() {
        let value = result.to_literal().context("reading result")?;
        println!("replica {replica} (device {ordinal}): {input} -> {value}");
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Devices { platform } => {
            let client = LocalClient::open_with_config(&platform, config)
                .with_context(|| format!("opening platform {platform}"))?;
            println!("platform: {}", client.platform_name());
            println!("devices:  {}", client.device_count());
        }
        Commands::Smoke { platform, replicas } => {
            let client = LocalClient::open_with_config(&platform, config)
                .with_context(|| format!("opening platform {platform}"))?;
            run_smoke(&client, replicas)?;
        }
    }
    Ok(())
}
