//! # DP832 Calibration Library
//!
//! Automates the bench calibration of a Rigol DP832 / DP832A triple output supply against a
//! reference multimeter. The supply is stepped through its factory calibration points, each
//! point is measured with the DMM (or read off a second meter by the operator when the
//! current is beyond the DMM's range) and the measured values are written back into the
//! supply's calibration tables.
//!
//! The procedure itself lives in [`sequencer`]. It talks to the instruments only through the
//! [`PowerSupply`] and [`Multimeter`] traits and to the operator only through [`Operator`],
//! so it runs the same against real hardware, the [`simulator`], or test doubles.

pub mod catalog;
pub mod command;
pub mod config;
pub mod error;
pub mod instrument;
pub mod operator;
pub mod scpi;
pub mod sequencer;
pub mod simulator;

pub use catalog::{CalibrationCatalog, PointTable, Quantity};
pub use command::CalCommand;
pub use error::CalError;
pub use instrument::{Channel, Identity, MeasurementFunction, Multimeter, PowerSupply};
pub use operator::{AbortFlag, ConsoleOperator, Operator, ScriptedOperator};
pub use sequencer::{percent_error, Calibrator, ChannelReport, PointResult, RunConfig};
