//! Command line settings of the calibration tool.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::instrument::Channel;

pub const USAGE: &str = "\
Usage: dp832_calibrate [OPTIONS]

Options:
  --psu <host:port>      DP832 raw SCPI socket (default 10.1.0.11:5555)
  --dmm <port>           Keithley 2000 serial port (default /dev/ttyS2)
  --baud <rate>          DMM baud rate (default 9600)
  --channels <list>      Channels to calibrate, e.g. 1,3 or all (default all)
  --manual-limit <amps>  Highest current the DMM can measure (default 3)
  --settle-ms <ms>       Settle time before each reading (default 2000)
  --commit               Write the new calibration into the PSU
  --simulate             Run against a simulated PSU and DMM
  -v, --verbose          Log instrument traffic
  -h, --help             Print this help

Without --commit the calibration tables of the selected channels are still cleared;
restart the PSU afterwards to get them back.";

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    /// The option is not known.
    UnknownOption(String),
    /// The option needs a value but none followed it.
    MissingValue(&'static str),
    /// The option's value could not be parsed.
    InvalidValue(&'static str, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownOption(option) => write!(f, "unknown option '{}'", option),
            ConfigError::MissingValue(option) => write!(f, "{} needs a value", option),
            ConfigError::InvalidValue(option, value) => write!(f, "invalid value '{}' for {}", value, option),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub psu_address: String,
    pub dmm_port: String,
    pub dmm_baud: u32,
    pub channels: Vec<Channel>,
    pub manual_current_limit: f64,
    pub settle_time: Duration,
    pub commit: bool,
    pub simulate: bool,
    pub verbose: bool,
    pub help: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            psu_address: String::from("10.1.0.11:5555"),
            dmm_port: String::from("/dev/ttyS2"),
            dmm_baud: 9600,
            channels: Channel::all(),
            // Keithley 2000 current input tops out at 3 A.
            manual_current_limit: 3.0,
            settle_time: Duration::from_secs(2),
            commit: false,
            simulate: false,
            verbose: false,
            help: false,
        }
    }
}

/// Parses `1,3`, `2` or `all` into a sorted list without duplicates.
fn parse_channels(text: &str) -> Result<Vec<Channel>, ConfigError> {
    let invalid = || ConfigError::InvalidValue("--channels", text.to_string());
    if text.eq_ignore_ascii_case("all") {
        return Ok(Channel::all());
    }

    let mut channels = BTreeSet::new();
    for part in text.split(',').map(str::trim) {
        let number = part.parse::<u8>().map_err(|_| invalid())?;
        channels.insert(Channel::new(number).map_err(|_| invalid())?);
    }
    if channels.is_empty() {
        return Err(invalid());
    }
    Ok(channels.into_iter().collect())
}

impl Settings {
    /// Builds settings from command line arguments, program name excluded.
    pub fn from_args<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut settings = Settings::default();
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            // accept both `--opt value` and `--opt=value`
            let (name, inline) = match arg.split_once('=') {
                Some((name, value)) if name.starts_with("--") => (name.to_string(), Some(value.to_string())),
                _ => (arg.clone(), None),
            };
            let mut value = |option: &'static str| -> Result<String, ConfigError> {
                match inline.clone() {
                    Some(value) => Ok(value),
                    None => args.next().ok_or(ConfigError::MissingValue(option)),
                }
            };

            match name.as_str() {
                "--psu" => settings.psu_address = value("--psu")?,
                "--dmm" => settings.dmm_port = value("--dmm")?,
                "--baud" => {
                    let text = value("--baud")?;
                    settings.dmm_baud = text.parse().map_err(|_| ConfigError::InvalidValue("--baud", text))?;
                }
                "--channels" => settings.channels = parse_channels(&value("--channels")?)?,
                "--manual-limit" => {
                    let text = value("--manual-limit")?;
                    settings.manual_current_limit = match text.parse::<f64>() {
                        Ok(amps) if amps > 0.0 => amps,
                        _ => return Err(ConfigError::InvalidValue("--manual-limit", text)),
                    };
                }
                "--settle-ms" => {
                    let text = value("--settle-ms")?;
                    let millis = text.parse().map_err(|_| ConfigError::InvalidValue("--settle-ms", text))?;
                    settings.settle_time = Duration::from_millis(millis);
                }
                "--commit" => settings.commit = true,
                "--simulate" => settings.simulate = true,
                "-v" | "--verbose" => settings.verbose = true,
                "-h" | "--help" => settings.help = true,
                _ => return Err(ConfigError::UnknownOption(arg)),
            }
        }

        Ok(settings)
    }

    pub fn log_level(&self) -> log::Level {
        if self.verbose {
            log::Level::Debug
        } else {
            log::Level::Info
        }
    }
}
