//! Error type shared by the sequencer, the instrument drivers and the operator console.

use std::{fmt, io};

use crate::catalog::Quantity;

/// Everything that can stop a calibration run.
#[derive(Debug)]
pub enum CalError {
    /// The power supply reported a model this tool does not know how to calibrate.
    UnsupportedInstrument(String),
    /// The operator cancelled at a prompt or during a settle wait.
    OperatorAbort,
    /// Reading from or writing to the PSU or DMM failed.
    InstrumentCommunication(io::Error),
    /// A manual DMM reading could not be parsed as a number.
    InvalidOperatorInput(String),
    /// Channel number outside 1..=3.
    InvalidChannel(u8),
    /// A calibration point table was built without any points.
    EmptyCatalog(Quantity),
    /// An instrument replied with something that could not be understood.
    InvalidResponse(String),
}

impl fmt::Display for CalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalError::UnsupportedInstrument(model) => {
                write!(f, "Model {} not recognised as a DP832 power supply", model)
            }
            CalError::OperatorAbort => write!(f, "calibration aborted by operator"),
            CalError::InstrumentCommunication(err) => write!(f, "instrument I/O failed: {}", err),
            CalError::InvalidOperatorInput(text) => write!(f, "'{}' is not a valid reading", text),
            CalError::InvalidChannel(channel) => {
                write!(f, "channel {} does not exist, expected 1, 2 or 3", channel)
            }
            CalError::EmptyCatalog(quantity) => {
                write!(f, "no calibration points given for {}", quantity.label())
            }
            CalError::InvalidResponse(text) => write!(f, "unexpected instrument response '{}'", text),
        }
    }
}

impl std::error::Error for CalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CalError::InstrumentCommunication(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CalError {
    fn from(err: io::Error) -> Self {
        CalError::InstrumentCommunication(err)
    }
}

impl From<serialport::Error> for CalError {
    fn from(err: serialport::Error) -> Self {
        CalError::InstrumentCommunication(err.into())
    }
}
