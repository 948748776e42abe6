use anyhow::{ensure, Context, Result};
use chrono::prelude::*;
use tokio::time::Duration;
use tracing::Level;

use dutycal::acquisition::{self, SweepConfig};
use dutycal::channels;
use dutycal::database::Store;
use dutycal::device::buspirate::BusPirate;
use dutycal::device::olsndot::Olsndot;
use dutycal::device::{PwmDriver, VoltageProbe};

// Include these modules as part of the binary crate, not the library crate
// as this contains the actual implementation of the logging facility
mod argparse;
mod logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = argparse::parse();

    let level = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let _guards = logging::init(level, cli.console, Some(cli.log_file.clone()));

    let database_url = cli
        .database
        .clone()
        .unwrap_or_else(dutycal::get_database_url);
    let mut store = Store::open(&database_url)?;

    let mut probe = BusPirate::open(&cli.buspirate_port).await?;
    probe.set_power(true).await?;

    let mut uut = Olsndot::open(&cli.olsndot_port, cli.mac).await?;
    println!("Connected to uut: {uut}");

    let run = store.create_run(&cli.run_name, cli.mac)?;

    let nbits = match cli.bits {
        Some(bits) => {
            ensure!(
                bits >= 1 && bits <= uut.native_resolution(),
                "--bits {bits} exceeds the driver's {} bit resolution",
                uut.native_resolution()
            );
            bits
        }
        None => uut.native_resolution(),
    };

    let selected = if cli.channels == "auto" {
        channels::autodetect(&mut uut, &mut probe)
            .await
            .context("channel auto-detection")?
    } else {
        channels::parse_spec(&cli.channels)
            .with_context(|| format!("parsing channel specification {:?}", cli.channels))?
    };

    println!(
        "Starting run {} \"{}\" at {}",
        run.run_id,
        run.name,
        Local::now().format("%y-%m-%d %H:%M:%S:%6f")
    );
    println!(
        "mac={:08x} channels={}",
        run.uut_mac,
        selected
            .iter()
            .map(|channel| format!("{channel:02}"))
            .collect::<Vec<_>>()
            .join(",")
    );
    println!("[measurement id] \" \" [hex setpoint value] \"(\" [float duty cycle] \")\" \" \" [reading (V)]");

    ensure!(
        cli.wait.is_finite() && cli.wait >= 0.0,
        "--wait must be a non-negative number of seconds"
    );
    let config = SweepConfig {
        settle: Duration::from_secs_f64(cli.wait),
        oversample: cli.oversample,
        bits: nbits,
    };
    let zero_mean = acquisition::zero_cal(&mut uut, &mut probe, &store, run.run_id, &config).await?;
    acquisition::sweep(
        &mut uut,
        &mut probe,
        &store,
        run.run_id,
        &selected,
        &config,
        zero_mean,
    )
    .await?;

    // leave the bench dark
    let all_off = vec![0u16; uut.channel_count()];
    uut.set_channel_values(&all_off).await?;
    probe.set_power(false).await?;
    Ok(())
}
