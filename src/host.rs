use crate::{Clock, Error, ErrorKind};
use ::std::{error, fmt, time::Instant};

impl<E: fmt::Debug> error::Error for Error<E> {}

impl<E: fmt::Debug> fmt::Display for Error<E>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Error::I2c(e) => write!(f, "I²C transaction failed: {:?}", e),
            other => write!(f, "{}", other.kind()),
        }
    }
}

impl fmt::Display for ErrorKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(match self {
            ErrorKind::Address => "bus address outside 0x44..=0x47",
            ErrorKind::Connect => "sensor did not acknowledge its address",
            ErrorKind::TooSoon => "less than 1000 ms since the previous read",
            ErrorKind::Bus => "I²C transaction failed",
            ErrorKind::Crc => "checksum mismatch",
        })
    }
}

/**
 * Millisecond clock counting from its own creation, for hosts where
 * ``std::time`` is available.
 */
#[derive(Copy, Clone, Debug)]
pub struct StdClock(Instant);

impl StdClock
{
    pub fn new() -> Self { Self(Instant::now()) }
}

impl Default for StdClock
{
    fn default() -> Self { Self::new() }
}

impl Clock for StdClock
{
    fn now_ms(&mut self) -> u32 { self.0.elapsed().as_millis() as u32 }
}
