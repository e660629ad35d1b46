//! SCPI transport and the drivers for the supported instruments.
//!
//! Both instruments speak line-terminated ASCII. A [`ScpiLink`] sends one command per line
//! and, for queries, reads back one reply line. [`StreamLink`] implements it over any
//! blocking byte stream (a TCP socket to the DP832, a serial port to the Keithley 2000),
//! and the bench simulator implements it in-process.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;

use crate::{
    command::format_g,
    error::CalError,
    instrument::{Channel, Identity, MeasurementFunction, Multimeter, PowerSupply},
};

pub trait ScpiLink {
    /// Sends a command that produces no reply.
    fn send(&mut self, command: &str) -> Result<(), CalError>;

    /// Sends a query and returns its reply without the line terminator.
    fn query(&mut self, command: &str) -> Result<String, CalError>;
}

/// Line-oriented SCPI over a blocking stream.
pub struct StreamLink<T> {
    line_ending: &'static str,
    io_handle: T,
    read_buf: Vec<u8>,
}

impl<T> StreamLink<T>
where
    T: Read + Write,
{
    pub fn with(line_ending: &'static str, io_handle: T) -> Self {
        Self {
            line_ending,
            io_handle,
            read_buf: Vec::with_capacity(128),
        }
    }

    /// Drops the first `n` bytes from the read buffer
    ///
    /// Drops all bytes if `n >= self.read_buf.len()`
    fn drop_first(&mut self, n: usize) {
        if n >= self.read_buf.len() {
            self.read_buf.clear();
        } else {
            self.read_buf.drain(..n);
        }
    }

    /// Index of the first linefeed in the read buffer at or after `start_hint`.
    fn find_line_ending(&self, start_hint: usize) -> Option<usize> {
        self.read_buf
            .get(start_hint..)?
            .iter()
            .position(|byte| *byte == b'\n')
            .map(|offset| start_hint + offset)
    }

    /// Reads until the buffer holds a full line and returns the line's length including `LF`.
    fn read_line(&mut self) -> Result<usize, io::Error> {
        let mut searched = 0;

        loop {
            if let Some(end_index) = self.find_line_ending(searched) {
                return Ok(end_index + 1);
            }
            searched = self.read_buf.len();

            let mut temp_buf = [0u8; 64];
            let bytes_read = self.io_handle.read(&mut temp_buf)?;
            if bytes_read == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            self.read_buf.extend_from_slice(&temp_buf[..bytes_read]);
        }
    }
}

impl<T> ScpiLink for StreamLink<T>
where
    T: Read + Write,
{
    fn send(&mut self, command: &str) -> Result<(), CalError> {
        debug!("-> {}", command);
        let serialized = format!("{}{}", command, self.line_ending);
        self.io_handle.write_all(serialized.as_bytes())?;
        self.io_handle.flush()?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, CalError> {
        self.send(command)?;
        let line_len = self.read_line()?;
        let reply = String::from_utf8_lossy(&self.read_buf[..line_len]).trim_end().to_string();
        self.drop_first(line_len);
        debug!("<- {}", reply);
        Ok(reply)
    }
}

/// Opens the raw SCPI socket of a networked instrument (port 5555 on Rigol supplies).
pub fn connect_tcp<A: ToSocketAddrs>(address: A, timeout: Duration) -> Result<StreamLink<TcpStream>, CalError> {
    let address = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))?;
    let stream = TcpStream::connect_timeout(&address, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;
    Ok(StreamLink::with("\n", stream))
}

/// Opens an RS-232 instrument at 8N1 with the given baud rate.
pub fn connect_serial(
    port_name: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<StreamLink<Box<dyn serialport::SerialPort>>, CalError> {
    let port = serialport::new(port_name, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(timeout)
        .open()?;
    Ok(StreamLink::with("\n", port))
}

/// Rigol DP832 / DP832A triple output supply.
pub struct Dp832<L> {
    link: L,
    identity: Identity,
}

impl<L: ScpiLink> Dp832<L> {
    /// Wraps a link and reads the instrument's identity.
    pub fn connect(mut link: L) -> Result<Self, CalError> {
        let identity = Identity::parse_idn(&link.query("*IDN?")?)?;
        Ok(Self { link, identity })
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn into_link(self) -> L {
        self.link
    }
}

impl<L: ScpiLink> PowerSupply for Dp832<L> {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn write_raw(&mut self, command: &str) -> Result<(), CalError> {
        self.link.send(command)
    }

    fn reset(&mut self) -> Result<(), CalError> {
        self.link.send("*RST")
    }

    fn set_output_enabled(&mut self, channel: Channel, enabled: bool) -> Result<(), CalError> {
        let state = if enabled { "ON" } else { "OFF" };
        self.link.send(&format!(":OUTP {},{}", channel, state))
    }

    fn set_current_limit(&mut self, channel: Channel, amps: f64) -> Result<(), CalError> {
        self.link.send(&format!(":SOUR{}:CURR {}", channel.number(), format_g(amps, 6)))
    }
}

/// Averaging filter type of the Keithley 2000.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    Repeat,
    Moving,
}

/// Keithley 2000 bench multimeter.
pub struct Keithley2000<L> {
    link: L,
    identity: Identity,
    function: MeasurementFunction,
}

// The Keithley 2000 reports +9.9E37 when the input is beyond the selected range.
const OVERLOAD: f64 = 9.9e37;

fn sense_node(function: MeasurementFunction) -> &'static str {
    match function {
        MeasurementFunction::DcVolts => "VOLT:DC",
        MeasurementFunction::DcCurrent => "CURR:DC",
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "ON" } else { "OFF" }
}

impl<L: ScpiLink> Keithley2000<L> {
    /// Wraps a link and reads the instrument's identity.
    pub fn connect(mut link: L) -> Result<Self, CalError> {
        let identity = Identity::parse_idn(&link.query("*IDN?")?)?;
        Ok(Self {
            link,
            identity,
            function: MeasurementFunction::DcVolts,
        })
    }

    /// Integration time in power line cycles for the current function.
    pub fn set_nplc(&mut self, nplc: f64) -> Result<(), CalError> {
        let command = format!(":SENS:{}:NPLC {}", sense_node(self.function), format_g(nplc, 6));
        self.link.send(&command)
    }

    pub fn set_filter_count(&mut self, count: u32) -> Result<(), CalError> {
        let command = format!(":SENS:{}:AVER:COUN {}", sense_node(self.function), count);
        self.link.send(&command)
    }

    pub fn set_filter_type(&mut self, filter: FilterType) -> Result<(), CalError> {
        let control = match filter {
            FilterType::Repeat => "REP",
            FilterType::Moving => "MOV",
        };
        let command = format!(":SENS:{}:AVER:TCON {}", sense_node(self.function), control);
        self.link.send(&command)
    }

    pub fn set_filter_enabled(&mut self, enabled: bool) -> Result<(), CalError> {
        let command = format!(":SENS:{}:AVER:STAT {}", sense_node(self.function), on_off(enabled));
        self.link.send(&command)
    }

    pub fn into_link(self) -> L {
        self.link
    }
}

impl<L: ScpiLink> Multimeter for Keithley2000<L> {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn set_function(&mut self, function: MeasurementFunction) -> Result<(), CalError> {
        self.link.send(&format!(":SENS:FUNC '{}'", sense_node(function)))?;
        self.function = function;
        Ok(())
    }

    fn set_auto_range(&mut self, enabled: bool) -> Result<(), CalError> {
        let command = format!(":SENS:{}:RANG:AUTO {}", sense_node(self.function), on_off(enabled));
        self.link.send(&command)
    }

    fn reset(&mut self) -> Result<(), CalError> {
        self.link.send("*RST")?;
        self.function = MeasurementFunction::DcVolts;
        Ok(())
    }

    fn read(&mut self) -> Result<f64, CalError> {
        let reply = self.link.query(":READ?")?;
        // Readings may carry a unit suffix when the instrument is set to ASCII elements.
        let number = reply.trim().trim_end_matches(|c: char| c.is_ascii_alphabetic());
        let value = number
            .parse::<f64>()
            .map_err(|_| CalError::InvalidResponse(reply.clone()))?;
        if value.abs() >= OVERLOAD {
            return Err(CalError::InvalidResponse(format!("{} (input overload)", reply)));
        }
        Ok(value)
    }
}
