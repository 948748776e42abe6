pub mod buspirate;
pub mod olsndot;

use anyhow::Result;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Capability surface of the PWM driver under test.
#[allow(async_fn_in_trait)]
pub trait PwmDriver {
    fn channel_count(&self) -> usize;
    /// Native PWM resolution in bits.
    fn native_resolution(&self) -> u8;
    /// Writes the duty-cycle registers of all channels at once.
    async fn set_channel_values(&mut self, values: &[u16]) -> Result<()>;
}

/// Capability surface of the analog measurement probe.
#[allow(async_fn_in_trait)]
pub trait VoltageProbe {
    /// One instantaneous reading in volts.
    async fn read_voltage(&mut self) -> Result<f64>;
    /// Switches the probe's power supply output.
    async fn set_power(&mut self, on: bool) -> Result<()>;
}

pub(crate) fn open_port(path: &str, baud: u32) -> tokio_serial::Result<SerialStream> {
    let mut port = tokio_serial::new(path, baud).open_native_async()?;
    #[cfg(unix)]
    port.set_exclusive(false)?;
    Ok(port)
}
