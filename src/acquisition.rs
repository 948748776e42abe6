use crate::database::models::{Measurement, ZERO_CAL_CHANNEL};
use crate::database::Store;
use crate::device::{PwmDriver, VoltageProbe};
use anyhow::{ensure, Result};
use tokio::time::{sleep, Duration};
use tracing::debug;

pub struct SweepConfig {
    /// Analog settle time between setpoint and sampling.
    pub settle: Duration,
    /// Probe readings taken per measurement row.
    pub oversample: usize,
    /// Bit positions to sweep, at most the driver's native resolution.
    pub bits: u8,
}

async fn collect<P: VoltageProbe>(probe: &mut P, count: usize) -> Result<Vec<f64>> {
    let mut readings = Vec::with_capacity(count);
    for _ in 0..count {
        readings.push(probe.read_voltage().await?);
    }
    Ok(readings)
}

/// Oversamples the probe and reduces to (mean, sample standard deviation).
pub async fn sample_statistics<P: VoltageProbe>(
    probe: &mut P,
    count: usize,
) -> Result<(f64, f64)> {
    ensure!(
        count >= 2,
        "oversample count {count} is too small, the standard deviation needs at least two samples"
    );
    let readings = collect(probe, count).await?;
    let mean = statistical::mean(&readings);
    let stdev = statistical::standard_deviation(&readings, Some(mean));
    Ok((mean, stdev))
}

/// Baseline reading with every output off, recorded as channel -1.
/// Returns the mean, which the sweep subtracts for display only.
pub async fn zero_cal<D, P>(
    uut: &mut D,
    probe: &mut P,
    store: &Store,
    run_id: i64,
    config: &SweepConfig,
) -> Result<f64>
where
    D: PwmDriver,
    P: VoltageProbe,
{
    let all_off = vec![0u16; uut.channel_count()];
    uut.set_channel_values(&all_off).await?;
    sleep(config.settle).await;
    let (mean, stdev) = sample_statistics(probe, config.oversample).await?;
    store.record_measurement(&Measurement {
        run_id,
        channel: ZERO_CAL_CHANNEL,
        duty_cycle: 0.0,
        voltage: mean,
        voltage_stdev: stdev,
    })?;
    println!("Zero cal: {mean:5.4}V stdev={stdev:5.4}V");
    Ok(mean)
}

/// Sweeps every selected channel through single-bit duty cycles, one
/// measurement row per bit position.
pub async fn sweep<D, P>(
    uut: &mut D,
    probe: &mut P,
    store: &Store,
    run_id: i64,
    channels: &[usize],
    config: &SweepConfig,
    zero_mean: f64,
) -> Result<()>
where
    D: PwmDriver,
    P: VoltageProbe,
{
    let nchannels = uut.channel_count();
    let native = uut.native_resolution();
    ensure!(
        config.bits >= 1 && config.bits <= native,
        "cannot sweep {} bits on a driver with {native} bits of resolution",
        config.bits
    );
    for &channel in channels {
        ensure!(
            channel < nchannels,
            "channel {channel} out of range, the driver has {nchannels} channels"
        );
        for bit in 0..config.bits {
            let setpoint = 1u16 << bit;
            // The logical fraction refers to the native resolution; the wire
            // word is left-aligned into the 16 bit framebuffer slot.
            let duty_cycle = f64::from(setpoint) / f64::from(1u32 << native);
            let value = setpoint << (16 - native);
            let mut values = vec![0u16; nchannels];
            values[channel] = value;
            uut.set_channel_values(&values).await?;
            sleep(config.settle).await;
            let (mean, stdev) = sample_statistics(probe, config.oversample).await?;
            let measurement_id = store.record_measurement(&Measurement {
                run_id,
                channel: channel as i32,
                duty_cycle,
                voltage: mean,
                voltage_stdev: stdev,
            })?;
            debug!("ch={channel} bit={bit} raw mean {mean:.4} V");
            println!(
                "{measurement_id:08} ch={channel} {value:04x}({duty_cycle:6.5}): {:5.4} stdev {stdev:5.4}",
                mean - zero_mean
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{MockDriver, MockProbe};

    fn config(bits: u8) -> SweepConfig {
        SweepConfig {
            settle: Duration::from_millis(100),
            oversample: 16,
            bits,
        }
    }

    fn run_store() -> (Store, i64) {
        let mut store = Store::open(":memory:").unwrap();
        let run_id = store.create_run("auto", 0xDEBE10BB).unwrap().run_id;
        (store, run_id)
    }

    #[tokio::test(start_paused = true)]
    async fn oversampling_consumes_exactly_the_configured_reads() {
        let (store, run_id) = run_store();
        let mut uut = MockDriver::new(4, 8);
        let mut probe = MockProbe::constant(0.25);
        zero_cal(&mut uut, &mut probe, &store, run_id, &config(8))
            .await
            .unwrap();
        assert_eq!(probe.reads, 16);
        // the baseline is taken with every channel off
        assert_eq!(uut.frames, vec![vec![0, 0, 0, 0]]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_sample_oversampling_is_rejected() {
        let mut probe = MockProbe::constant(0.25);
        assert!(sample_statistics(&mut probe, 1).await.is_err());
        assert_eq!(probe.reads, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn eight_bit_sweep_covers_the_power_of_two_duty_cycles() {
        let (store, run_id) = run_store();
        let mut uut = MockDriver::new(2, 8);
        let mut probe = MockProbe::constant(1.0);
        sweep(&mut uut, &mut probe, &store, run_id, &[1], &config(8), 0.1)
            .await
            .unwrap();
        let rows = store.measurements(run_id).unwrap();
        assert_eq!(rows.len(), 8);
        assert_eq!(rows[0].duty_cycle, 1.0 / 256.0); // 0.00390625
        assert_eq!(rows[7].duty_cycle, 0.5);
        // stored voltages keep the raw mean, the zero offset is display only
        assert!(rows.iter().all(|m| m.voltage == 1.0 && m.channel == 1));
        // wire words are left-aligned into the 16 bit slot
        let setpoints: Vec<u16> = uut.frames.iter().map(|frame| frame[1]).collect();
        assert_eq!(setpoints[0], 1 << 8);
        assert_eq!(setpoints[7], 0x8000);
        assert!(uut.frames.iter().all(|frame| frame[0] == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn a_run_holds_one_zero_cal_plus_channels_times_bits_rows() {
        let (store, run_id) = run_store();
        let mut uut = MockDriver::new(4, 11);
        let mut probe = MockProbe::constant(0.8);
        let cfg = config(11);
        let zero = zero_cal(&mut uut, &mut probe, &store, run_id, &cfg)
            .await
            .unwrap();
        sweep(&mut uut, &mut probe, &store, run_id, &[0, 2], &cfg, zero)
            .await
            .unwrap();
        let rows = store.measurements(run_id).unwrap();
        assert_eq!(rows.len(), 1 + 2 * 11);
        assert_eq!(rows[0].channel, ZERO_CAL_CHANNEL);
        assert_eq!(rows[0].duty_cycle, 0.0);
        assert_eq!(probe.reads, 16 * (1 + 2 * 11));
    }

    #[tokio::test(start_paused = true)]
    async fn bits_override_cannot_exceed_the_native_resolution() {
        let (store, run_id) = run_store();
        let mut uut = MockDriver::new(2, 8);
        let mut probe = MockProbe::constant(0.5);
        let result = sweep(&mut uut, &mut probe, &store, run_id, &[0], &config(12), 0.0).await;
        assert!(result.is_err());
        assert!(uut.frames.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_channels_are_rejected_before_commanding() {
        let (store, run_id) = run_store();
        let mut uut = MockDriver::new(2, 8);
        let mut probe = MockProbe::constant(0.5);
        let result = sweep(&mut uut, &mut probe, &store, run_id, &[5], &config(8), 0.0).await;
        assert!(result.is_err());
        assert!(uut.frames.is_empty());
    }
}
