//! The interfaces the sequencer needs from the power supply and the multimeter.

use std::fmt;

use crate::error::CalError;

/// A DP832 output channel, numbered 1 to 3 as on the front panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(u8);

impl Channel {
    pub const COUNT: u8 = 3;

    pub fn new(number: u8) -> Result<Self, CalError> {
        if (1..=Self::COUNT).contains(&number) {
            Ok(Channel(number))
        } else {
            Err(CalError::InvalidChannel(number))
        }
    }

    /// Every channel, in front panel order.
    pub fn all() -> Vec<Channel> {
        (1..=Self::COUNT).map(Channel).collect()
    }

    pub fn number(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Channel {
    type Error = CalError;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        Channel::new(number)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CH{}", self.0)
    }
}

/// The four identity fields every SCPI instrument reports through `*IDN?`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_revision: String,
}

impl Identity {
    /// Parses a `manufacturer,model,serial,firmware` reply.
    pub fn parse_idn(reply: &str) -> Result<Self, CalError> {
        let fields: Vec<&str> = reply.trim().split(',').map(str::trim).collect();
        match fields.as_slice() {
            [manufacturer, model, serial_number, firmware_revision] => Ok(Self {
                manufacturer: manufacturer.to_string(),
                model: model.to_string(),
                serial_number: serial_number.to_string(),
                firmware_revision: firmware_revision.to_string(),
            }),
            _ => Err(CalError::InvalidResponse(reply.trim().to_string())),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}) {}",
            self.manufacturer, self.model, self.serial_number, self.firmware_revision
        )
    }
}

/// What the DMM measures during a calibration phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementFunction {
    DcVolts,
    DcCurrent,
}

/// Power supply being calibrated.
pub trait PowerSupply {
    fn identity(&self) -> &Identity;

    /// Sends a command verbatim, no response is expected.
    fn write_raw(&mut self, command: &str) -> Result<(), CalError>;

    /// Restores power-on defaults, which also switches every output off.
    fn reset(&mut self) -> Result<(), CalError>;

    fn set_output_enabled(&mut self, channel: Channel, enabled: bool) -> Result<(), CalError>;

    fn set_current_limit(&mut self, channel: Channel, amps: f64) -> Result<(), CalError>;
}

/// Reference multimeter.
pub trait Multimeter {
    fn identity(&self) -> &Identity;

    fn set_function(&mut self, function: MeasurementFunction) -> Result<(), CalError>;

    fn set_auto_range(&mut self, enabled: bool) -> Result<(), CalError>;

    fn reset(&mut self) -> Result<(), CalError>;

    /// Takes a single reading in the configured function.
    fn read(&mut self) -> Result<f64, CalError>;
}
