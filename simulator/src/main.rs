mod reading;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use rand::Rng;
use reading::{Batch, Reading};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{error, info, warn};

/// Posts random temperature batches to a climate ingestor.
#[derive(Debug, Parser)]
#[command(name = "climate-simulator", version)]
struct Args {
    /// Base URL of the ingestor
    #[arg(long, env = "INGEST_URL", default_value = "http://localhost:3000")]
    url: String,

    /// Shared secret sent as `x-api-key`
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: String,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    /// Measurements per request
    #[arg(long, env = "BATCH_SIZE", default_value_t = 10)]
    batch_size: usize,

    /// Requests per second
    #[arg(long, env = "RATE", default_value_t = 1)]
    rate: u64,

    #[arg(long, env = "LOCATION_ID", default_value = "lab")]
    location: String,

    /// Stop after this many requests (0 runs forever)
    #[arg(long, env = "COUNT", default_value_t = 0)]
    count: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    anyhow::ensure!(args.rate > 0, "--rate must be at least 1");
    anyhow::ensure!(args.devices > 0, "--devices must be at least 1");
    anyhow::ensure!(args.batch_size > 0, "--batch-size must be at least 1");

    info!("Starting climate simulator");
    info!(
        "Target: {}, Rate: {} req/s, Devices: {}, Batch size: {}",
        args.url, args.rate, args.devices, args.batch_size
    );

    let client = Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;
    let endpoint = format!("{}/temperatures", args.url.trim_end_matches('/'));

    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let mut rng = rand::thread_rng();
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / args.rate as f64));
    let mut sent = 0u64;
    let mut accepted = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }

        let device_id = format!("sim-{}-{}", &run_id[..8], sent % args.devices as u64);
        let batch = generate_batch(&mut rng, device_id, &args.location, args.batch_size);

        match post_batch(&client, &endpoint, &args.api_key, &batch).await {
            Ok(()) => accepted += 1,
            Err(e) => warn!("Batch for {} rejected: {}", batch.device_id, e),
        }
        sent += 1;

        if sent % 100 == 0 {
            info!("Sent {} batches, {} accepted", sent, accepted);
        }
        if args.count > 0 && sent >= args.count {
            break;
        }
    }

    info!("Simulator stopped: {} batches sent, {} accepted", sent, accepted);
    if accepted < sent {
        error!("{} batches were not accepted", sent - accepted);
    }
    Ok(())
}

async fn post_batch(
    client: &Client,
    endpoint: &str,
    api_key: &str,
    batch: &Batch,
) -> anyhow::Result<()> {
    let response = client
        .post(endpoint)
        .header("x-api-key", api_key)
        .json(batch)
        .send()
        .await?;

    match response.status() {
        StatusCode::OK => Ok(()),
        status => {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{}: {}", status, body)
        }
    }
}

fn generate_batch(rng: &mut impl Rng, device_id: String, location: &str, size: usize) -> Batch {
    let now = Utc::now();

    let measurements = (0..size)
        .map(|i| {
            let temperature = if rng.gen_bool(0.05) {
                rng.gen_range(-20.0..45.0) // 5% outliers
            } else {
                rng.gen_range(15.0..30.0)
            };

            // Some sensors only report temperature
            let humidity = if rng.gen_bool(0.1) {
                None
            } else {
                Some(rng.gen_range(30.0..80.0))
            };

            Reading {
                date_time: now - chrono::Duration::seconds((size - i) as i64),
                temperature,
                humidity,
            }
        })
        .collect();

    Batch {
        device_id,
        location_id: location.to_string(),
        measurements,
    }
}
