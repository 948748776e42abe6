use crate::device::{PwmDriver, VoltageProbe};
use anyhow::{bail, Context, Result};
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

const FULL_SCALE: u16 = 0xffff;
const DETECT_THRESHOLD_VOLTS: f64 = 0.5;
const DETECT_SETTLE: Duration = Duration::from_millis(200);

/// Parses an explicit channel specification such as "0-3,5,7,8-10" into the
/// ordered union of all referenced indices. Duplicates are kept.
pub fn parse_spec(spec: &str) -> Result<Vec<usize>> {
    let mut channels = Vec::new();
    for token in spec.split(',') {
        if let Ok(channel) = token.parse::<usize>() {
            channels.push(channel);
        } else {
            let (low, high) = token
                .split_once('-')
                .with_context(|| format!("malformed channel token {token:?}"))?;
            let low: usize = low
                .parse()
                .with_context(|| format!("malformed range start in {token:?}"))?;
            let high: usize = high
                .parse()
                .with_context(|| format!("malformed range end in {token:?}"))?;
            channels.extend(low..=high);
        }
    }
    Ok(channels)
}

/// Finds the one channel the probe is attached to by driving each channel to
/// full scale in turn and watching for the threshold crossing.
pub async fn autodetect<D, P>(uut: &mut D, probe: &mut P) -> Result<Vec<usize>>
where
    D: PwmDriver,
    P: VoltageProbe,
{
    let nchannels = uut.channel_count();
    for channel in 0..nchannels {
        let mut values = vec![0u16; nchannels];
        values[channel] = FULL_SCALE;
        uut.set_channel_values(&values).await?;
        sleep(DETECT_SETTLE).await;
        let volts = probe.read_voltage().await?;
        debug!("channel {channel} at full scale reads {volts:.4} V");
        if volts > DETECT_THRESHOLD_VOLTS {
            info!("auto-detected active channel {channel} at {volts:.4} V");
            return Ok(vec![channel]);
        }
    }
    bail!("cannot find active channel: nothing rose above {DETECT_THRESHOLD_VOLTS} V")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{MockDriver, MockProbe};

    #[test]
    fn spec_with_ranges_and_singles() {
        assert_eq!(
            parse_spec("0-3,5,7,8-10").unwrap(),
            vec![0, 1, 2, 3, 5, 7, 8, 9, 10]
        );
    }

    #[test]
    fn spec_keeps_duplicates_and_order() {
        assert_eq!(parse_spec("5,1-2,1").unwrap(), vec![5, 1, 2, 1]);
    }

    #[test]
    fn backwards_range_is_empty() {
        assert_eq!(parse_spec("3-1").unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn malformed_specs_are_rejected() {
        assert!(parse_spec("x").is_err());
        assert!(parse_spec("1,2-").is_err());
        assert!(parse_spec("").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn autodetect_picks_the_first_channel_over_threshold() {
        let mut uut = MockDriver::new(4, 11);
        // channels 0 and 1 read dark, channel 2 lights the probe up
        let mut probe = MockProbe::scripted(vec![0.01, 0.02, 2.3], 0.0);
        let channels = autodetect(&mut uut, &mut probe).await.unwrap();
        assert_eq!(channels, vec![2]);
        assert_eq!(probe.reads, 3);
        assert_eq!(uut.frames.len(), 3);
        assert_eq!(uut.frames[2], vec![0, 0, FULL_SCALE, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn autodetect_fails_when_every_channel_is_dark() {
        let mut uut = MockDriver::new(3, 11);
        let mut probe = MockProbe::constant(0.01);
        let result = autodetect(&mut uut, &mut probe).await;
        assert!(result.is_err());
        assert_eq!(uut.frames.len(), 3);
    }
}
