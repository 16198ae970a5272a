//! Serial-line temperature controller client.
//!
//! Used for testing with a climate chamber or heating pads: the controller
//! hangs off a USB serial device (typically `/dev/ttyUSB0`), accepts
//! `setTargetTemp;<t>\n` and answers `getActualTemp;\n` with one temperature
//! reading per line. Lines starting with `#` are controller chatter and are
//! skipped.

use std::ffi::CString;
use std::os::fd::RawFd;

use log::{debug, error, info, trace};
use thiserror::Error;

const IGNORE_CHAR: u8 = b'#';

/// Errors raised by the temperature controller client.
#[derive(Debug, Error)]
pub enum TemperatureError {
    /// Opening the serial device failed
    #[error("could not open device '{device}': {source}")]
    Open {
        /// Configured device path
        device: String,
        /// OS error
        source: std::io::Error,
    },
    /// Configuring the serial line failed
    #[error("could not configure device: {0}")]
    Configure(std::io::Error),
    /// Writing a command failed
    #[error("could not write command to device: {0}")]
    Write(std::io::Error),
    /// The controller sent an invalid reply
    #[error("received invalid reply from temperature controller")]
    Read,
}

/// Client for the serial temperature controller.
///
/// The device stays open for the whole session; the fd is closed on drop.
pub struct TemperatureController {
    fd: RawFd,
    target: i64,
}

impl TemperatureController {
    /// Connects to the controller on `device` and configures the line for
    /// 115200 8N1 with echo and output post-processing disabled.
    ///
    /// # Errors
    ///
    /// Returns an error when the device cannot be opened or configured.
    pub fn connect(device: &str) -> Result<Self, TemperatureError> {
        let path = CString::new(device).map_err(|_| TemperatureError::Open {
            device: device.into(),
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        })?;
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY | libc::O_SYNC) };
        if fd < 0 {
            return Err(TemperatureError::Open {
                device: device.into(),
                source: std::io::Error::last_os_error(),
            });
        }
        configure_serial_port(fd)?;
        info!("Connected to temperature controller on '{}'", device);
        Ok(TemperatureController { fd, target: 0 })
    }

    /// Sends a new target temperature to the controller.
    ///
    /// # Errors
    ///
    /// Returns an error when the command cannot be written.
    pub fn set_target_temperature(&mut self, target: i64) -> Result<(), TemperatureError> {
        self.target = target;
        self.write_string(&format!("setTargetTemp;{}\n", target))?;
        info!("Using target temperature {} °C", target);
        Ok(())
    }

    /// The most recently requested target temperature.
    pub fn target_temperature(&self) -> i64 {
        self.target
    }

    /// Queries the controller for the current temperature reading.
    ///
    /// Replies that fail to parse are logged and reported as `i64::MIN`, so
    /// a confused controller never masquerades as a reached target.
    ///
    /// # Errors
    ///
    /// Returns an error when the protocol exchange itself fails.
    pub fn actual_temperature(&self) -> Result<i64, TemperatureError> {
        self.write_string("getActualTemp;\n")?;
        let line = self.read_line()?;
        match line.trim().parse::<f64>() {
            Ok(temp) => {
                let temp = temp.floor() as i64;
                debug!("Current temperature: {} °C", temp);
                Ok(temp)
            }
            Err(_) => {
                error!("Could not parse temperature: {}", line);
                Ok(i64::MIN)
            }
        }
    }

    fn write_string(&self, command: &str) -> Result<(), TemperatureError> {
        trace!("Sending command '{}' to device", command.replace('\n', "\\n"));
        let bytes = command.as_bytes();
        let mut sent = 0;
        while sent < bytes.len() {
            let n = unsafe {
                libc::write(
                    self.fd,
                    bytes[sent..].as_ptr() as *const libc::c_void,
                    bytes.len() - sent,
                )
            };
            if n < 0 {
                return Err(TemperatureError::Write(std::io::Error::last_os_error()));
            }
            sent += n as usize;
        }
        Ok(())
    }

    /// Reads the next payload line, skipping blank lines and controller
    /// chatter.
    fn read_line(&self) -> Result<String, TemperatureError> {
        let mut buf = [0u8; 64];
        loop {
            let mut line = Vec::new();
            loop {
                let n = unsafe {
                    libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n < 0 {
                    return Err(TemperatureError::Read);
                }
                let chunk = &buf[..n as usize];
                match chunk.iter().position(|&b| b == b'\n') {
                    Some(end) => {
                        line.extend_from_slice(&chunk[..end]);
                        break;
                    }
                    None => line.extend_from_slice(chunk),
                }
            }
            if line.is_empty() {
                continue;
            }
            if line[0] == IGNORE_CHAR {
                trace!("{}", String::from_utf8_lossy(&line));
                continue;
            }
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
    }
}

impl Drop for TemperatureController {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// OPOST must stay disabled, the microcontroller drops commands otherwise.
fn configure_serial_port(fd: RawFd) -> Result<(), TemperatureError> {
    unsafe {
        let mut tio: libc::termios = std::mem::zeroed();
        libc::tcgetattr(fd, &mut tio);
        libc::cfsetspeed(&mut tio, libc::B115200);

        tio.c_cflag &= !(libc::CSTOPB | libc::PARENB);
        tio.c_cflag |= libc::CS8;
        tio.c_lflag &= !libc::ECHO;
        tio.c_iflag |= libc::IXOFF;
        tio.c_oflag &= !libc::OPOST;
        tio.c_cc[libc::VMIN] = 1;
        tio.c_cc[libc::VTIME] = 0;

        if libc::tcsetattr(fd, libc::TCSANOW, &tio) < 0 {
            return Err(TemperatureError::Configure(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}
