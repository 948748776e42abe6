use clap::Parser;
use std::path::PathBuf;

// Lab bench defaults, the FTDI adapters keep stable by-id paths
const OLSNDOT_TTY: &str = "/dev/serial/by-id/usb-FTDI_FT232R_USB_UART_A50285BI-if00-port0";
const BUSPIRATE_TTY: &str = "/dev/serial/by-id/usb-FTDI_FT232R_USB_UART_AD01W1RF-if00-port0";

pub fn parse() -> Cli {
    Cli::parse()
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run name; a trailing non-digit gets a fresh numeric suffix appended
    #[arg(default_value = "auto")]
    pub run_name: String,

    /// Serial port of the LED driver under test
    #[arg(default_value = OLSNDOT_TTY)]
    pub olsndot_port: String,

    /// Serial port of the Bus Pirate voltage probe
    #[arg(default_value = BUSPIRATE_TTY)]
    pub buspirate_port: String,

    /// Driver channels to test, format: 0-3,5,7,8-10, or "auto" to detect
    #[arg(short, long, default_value = "auto")]
    pub channels: String,

    /// sqlite3 database file to store results in, defaults to $DATABASE_URL
    #[arg(short, long, value_name = "FILE")]
    pub database: Option<String>,

    /// Driver MAC address, hex or decimal
    #[arg(short, long, default_value = "0xDEBE10BB", value_parser = parse_mac)]
    pub mac: u32,

    /// Time to wait between setpoint and sampling in seconds
    #[arg(short, long, default_value_t = 0.1)]
    pub wait: f64,

    /// Oversampling ratio, probe readings averaged per setpoint
    #[arg(short, long, default_value_t = 16)]
    pub oversample: usize,

    /// Number of bits to sample, defaults to the driver's native resolution
    #[arg(short, long)]
    pub bits: Option<u8>,

    /// Turn console debugging information on
    #[arg(long)]
    pub console: bool,

    /// Log to a file
    #[arg(long, value_name = "FILE", default_value = "dutycal.log")]
    pub log_file: PathBuf,

    /// Verbosity, repeat for more detail
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_mac(arg: &str) -> Result<u32, String> {
    let arg = arg.trim();
    let (digits, radix) = match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (arg, 10),
    };
    u32::from_str_radix(digits, radix).map_err(|e| format!("invalid MAC address {arg:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_accepts_hex_and_decimal() {
        assert_eq!(parse_mac("0xDEBE10BB").unwrap(), 0xDEBE10BB);
        assert_eq!(parse_mac("0Xdebe10bb").unwrap(), 0xDEBE10BB);
        assert_eq!(parse_mac("1234").unwrap(), 1234);
        assert!(parse_mac("feed").is_err());
        assert!(parse_mac("0x1_0000_0000").is_err());
    }

    #[test]
    fn defaults_match_the_bench_setup() {
        let cli = Cli::parse_from(["dutycal"]);
        assert_eq!(cli.run_name, "auto");
        assert_eq!(cli.channels, "auto");
        assert_eq!(cli.mac, 0xDEBE10BB);
        assert_eq!(cli.wait, 0.1);
        assert_eq!(cli.oversample, 16);
        assert!(cli.bits.is_none());
        assert!(cli.database.is_none());
    }
}
