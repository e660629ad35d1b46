//! Calibration command definition and serialization

use std::fmt;

use chrono::NaiveDate;

use crate::{catalog::Quantity, instrument::Channel};

/// Code the DP832 expects before it accepts calibration writes.
pub const UNLOCK_CODE: u32 = 11111;

#[derive(Debug, Clone, PartialEq)]
pub enum CalCommand {
    /// Enter calibration mode for a channel
    ///
    /// Command: `CALibration:Start 11111,CH<n>`
    Start(Channel),
    /// Wipe every calibration table of a channel
    ///
    /// Command: `CALibration:Clear CH<n>,ALL`
    Clear(Channel),
    /// Drive a calibration point
    ///
    /// Command: `CALibration:Set CH<n>,<V|C>,<step>,<value><unit>,<index>`
    Set {
        channel: Channel,
        quantity: Quantity,
        step: usize,
        value: f64,
    },
    /// Report the externally measured value for the point last set
    ///
    /// Command: `CALibration:MEAS CH<n>,<V|C>,<step>,<value><unit>,<index>`
    Measure {
        channel: Channel,
        quantity: Quantity,
        step: usize,
        value: f64,
    },
    /// Store the new tables in non-volatile memory
    ///
    /// Command: `CALibration:End <YYYY-MM-DD>,CH<n>`
    End(NaiveDate, Channel),
}

impl fmt::Display for CalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalCommand::Start(channel) => write!(f, "CALibration:Start {},{}", UNLOCK_CODE, channel),
            CalCommand::Clear(channel) => write!(f, "CALibration:Clear {},ALL", channel),
            CalCommand::Set { channel, quantity, step, value } => {
                write!(f, "CALibration:Set ")?;
                write_point(f, *channel, *quantity, *step, *value)
            }
            CalCommand::Measure { channel, quantity, step, value } => {
                write!(f, "CALibration:MEAS ")?;
                write_point(f, *channel, *quantity, *step, *value)
            }
            CalCommand::End(date, channel) => {
                write!(f, "CALibration:End {},{}", date.format("%Y-%m-%d"), channel)
            }
        }
    }
}

fn write_point(
    f: &mut fmt::Formatter<'_>,
    channel: Channel,
    quantity: Quantity,
    step: usize,
    value: f64,
) -> fmt::Result {
    write!(
        f,
        "{},{},{},{}{},{}",
        channel,
        quantity.ident(),
        step,
        format_g(value, 6),
        quantity.unit(),
        quantity.pass_index()
    )
}

/// Formats a number like C's `%.<precision>g`.
///
/// Keeps `precision` significant digits, strips trailing zeros and switches to exponent
/// notation when the decimal exponent is below -4 or not below `precision`.
pub fn format_g(value: f64, precision: usize) -> String {
    if value == 0.0 {
        return String::from("0");
    }
    if !value.is_finite() {
        return value.to_string();
    }

    let precision = precision.max(1);
    // The exponent is taken after rounding to the requested digits.
    let scientific = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some(parts) => parts,
        None => return scientific,
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= precision as i32 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", strip_zeros(mantissa), sign, exponent.abs())
    } else {
        let decimals = (precision as i32 - 1 - exponent) as usize;
        strip_zeros(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn strip_zeros(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(n: u8) -> Channel {
        Channel::new(n).unwrap()
    }

    #[test]
    fn start_and_clear() {
        assert_eq!(CalCommand::Start(ch(1)).to_string(), "CALibration:Start 11111,CH1");
        assert_eq!(CalCommand::Clear(ch(3)).to_string(), "CALibration:Clear CH3,ALL");
    }

    #[test]
    fn voltage_set_point() {
        let cmd = CalCommand::Set {
            channel: ch(2),
            quantity: Quantity::DacVoltage,
            step: 1,
            value: 0.2,
        };
        assert_eq!(cmd.to_string(), "CALibration:Set CH2,V,1,0.2V,1");
    }

    #[test]
    fn current_measure_uses_c_identifier() {
        let cmd = CalCommand::Measure {
            channel: ch(1),
            quantity: Quantity::AdcCurrent,
            step: 6,
            value: 3.19987654,
        };
        assert_eq!(cmd.to_string(), "CALibration:MEAS CH1,C,6,3.19988A,0");
    }

    #[test]
    fn end_carries_iso_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(CalCommand::End(date, ch(3)).to_string(), "CALibration:End 2024-03-09,CH3");
    }

    #[test]
    fn format_g_matches_printf() {
        assert_eq!(format_g(0.0, 6), "0");
        assert_eq!(format_g(32.0, 6), "32");
        assert_eq!(format_g(0.05, 6), "0.05");
        assert_eq!(format_g(12.8, 6), "12.8");
        assert_eq!(format_g(0.199987654, 6), "0.199988");
        assert_eq!(format_g(-1.5, 6), "-1.5");
        assert_eq!(format_g(0.00001234, 6), "1.234e-05");
        assert_eq!(format_g(1234567.0, 6), "1.23457e+06");
        assert_eq!(format_g(0.0001, 6), "0.0001");
        assert_eq!(format_g(3.14159, 4), "3.142");
    }
}
