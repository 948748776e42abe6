// Bus Pirate used as a voltmeter, driven in raw bitbang mode.
//
// Entering bitbang mode takes up to twenty 0x00 bytes until the device
// answers its "BBIO1" banner. After that every command is a single byte:
// 0100wxyz configures the peripherals (w switches the supply output) and
// is acknowledged with 0x01; 0x14 probes the ADC, which answers two bytes
// of a big-endian 10 bit count referred to 3.3 V behind a 2:1 divider.

use super::VoltageProbe;
use anyhow::{bail, ensure, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use tokio_serial::SerialStream;
use tracing::{debug, info};

const BAUD: u32 = 115_200;
const ENTER_BITBANG: u8 = 0x00;
const BITBANG_BANNER: &[u8] = b"BBIO1";
const BITBANG_ATTEMPTS: usize = 20;
const CMD_CONFIG_PERIPH: u8 = 0x40;
const PERIPH_POWER: u8 = 0x08;
const CMD_PROBE_ADC: u8 = 0x14;
const REPLY_OK: u8 = 0x01;
const BANNER_TIMEOUT: Duration = Duration::from_millis(50);
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
// 10 bit ADC, 3.3 V reference, 2:1 input divider
const VOLTS_PER_COUNT: f64 = 6.6 / 1024.0;

pub struct BusPirate {
    port: SerialStream,
}

impl BusPirate {
    pub async fn open(path: &str) -> Result<Self> {
        let port = super::open_port(path, BAUD)
            .with_context(|| format!("opening probe port {path}"))?;
        let mut probe = Self { port };
        probe.enter_bitbang().await?;
        Ok(probe)
    }

    async fn enter_bitbang(&mut self) -> Result<()> {
        let mut seen = Vec::new();
        for attempt in 1..=BITBANG_ATTEMPTS {
            self.port.write_all(&[ENTER_BITBANG]).await?;
            let mut buf = [0u8; 64];
            match timeout(BANNER_TIMEOUT, self.port.read(&mut buf)).await {
                Ok(read) => {
                    let n = read.context("probe serial read")?;
                    seen.extend_from_slice(&buf[..n]);
                    if seen.ends_with(BITBANG_BANNER) {
                        debug!("probe in bitbang mode after {attempt} attempts");
                        return Ok(());
                    }
                }
                Err(_) => {} // no reply yet, keep poking
            }
        }
        bail!("probe did not enter bitbang mode after {BITBANG_ATTEMPTS} attempts")
    }

    async fn command(&mut self, cmd: u8) -> Result<()> {
        self.port.write_all(&[cmd]).await?;
        let mut reply = [0u8; 1];
        timeout(RESPONSE_TIMEOUT, self.port.read_exact(&mut reply))
            .await
            .map_err(|_| anyhow::anyhow!("probe timed out on command {cmd:#04x}"))??;
        ensure!(reply[0] == REPLY_OK, "probe rejected command {cmd:#04x}");
        Ok(())
    }
}

impl VoltageProbe for BusPirate {
    async fn read_voltage(&mut self) -> Result<f64> {
        self.port.write_all(&[CMD_PROBE_ADC]).await?;
        let mut raw = [0u8; 2];
        timeout(RESPONSE_TIMEOUT, self.port.read_exact(&mut raw))
            .await
            .map_err(|_| anyhow::anyhow!("probe timed out on ADC read"))??;
        let counts = u16::from_be_bytes(raw);
        Ok(f64::from(counts) * VOLTS_PER_COUNT)
    }

    async fn set_power(&mut self, on: bool) -> Result<()> {
        let config = CMD_CONFIG_PERIPH | if on { PERIPH_POWER } else { 0 };
        self.command(config)
            .await
            .context("switching probe supply")?;
        info!("probe supply {}", if on { "on" } else { "off" });
        Ok(())
    }
}
