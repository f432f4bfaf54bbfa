#![allow(unused)]
#![deny(unsafe_code)]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

/*!
 * CHT832X temperature / humidity sensor by Sensylink.
 *
 * The sensor speaks a Sensirion style protocol: 16 bit big endian commands,
 * answers made of 16 bit words each followed by a CRC-8 byte.
 *
 * Unlike most drivers of this kind the ``Sensor`` caches the most recent
 * reading and remembers the last error it ran into.  Reads are rate limited
 * to one per second; a CRC mismatch is reported but the decoded values are
 * published nonetheless so the caller gets to decide whether to trust them.
 *
 * Page references are to the CHT8320/CHT8325 datasheet.
 */

#[cfg(all(feature = "defmt", feature = "log"))]
compile_error!("features \"defmt\" and \"log\" are mutually exclusive");

#[macro_use]
mod fmt;

#[cfg(feature = "std")]
mod host;

#[cfg(feature = "std")]
pub use host::StdClock;

use core::ops::RangeInclusive;
use embedded_hal::blocking::{delay::DelayUs,
                             i2c::{Read, Write}};

mod constants
{
    /*
     * Below values are from the datasheet, pp. 12--17.
     */
    /** default slave address (ADDR pin tied to GND) */
    pub const I2C_ADDR: u8 = 0x44;

    /** the ADDR pin selects one of four consecutive addresses */
    pub const I2C_ADDR_FIRST: u8 = 0x44;
    pub const I2C_ADDR_LAST: u8 = 0x47;

    pub const CMD_READ: u16 = 0xe000;

    pub const CMD_ENABLE_HEATER: u16 = 0x306d;
    pub const CMD_DISABLE_HEATER: u16 = 0x3066;
    pub const CMD_CONFIG_HEATER: u16 = 0x306e;

    pub const CMD_READ_STATUS: u16 = 0xf32d;
    pub const CMD_CLEAR_STATUS: u16 = 0x3041;

    pub const CMD_SOFTWARE_RESET: u16 = 0x30a2;

    /** three consecutive NIST words starting here */
    pub const CMD_READ_NIST_BASE: u16 = 0x3683;
    pub const CMD_READ_MANUFACTURER: u16 = 0x3781;

    /** wait between issuing a read and fetching the result */
    pub const READ_DELAY_MS: u16 = 60;

    /** minimum spacing of two read attempts */
    pub const READ_INTERVAL_MS: u32 = 1000;

    /** x⁸ + x⁵ + x⁴ + 1 with the leading term implied */
    pub const CRC8_POLY: u8 = 0x31;
    pub const CRC8_INIT: u8 = 0xff;

    /** documented bits of the status register, the rest are reserved */
    pub const STATUS_MASK: u16 = 0x2013;
}

/** Default bus address of the CHT832X. */
pub const DEFAULT_ADDRESS: u8 = constants::I2C_ADDR;

/** Bus addresses the CHT832X can be strapped to. */
pub const ADDRESS_RANGE: RangeInclusive<u8> =
    constants::I2C_ADDR_FIRST..=constants::I2C_ADDR_LAST;

/**
 * Source of monotonic milliseconds, wrapping at ``u32::MAX``.
 *
 * Any ``FnMut() -> u32`` qualifies so a platform’s ``millis()`` can be
 * passed as a closure.
 */
pub trait Clock
{
    fn now_ms(&mut self) -> u32;
}

impl<F> Clock for F
where F: FnMut() -> u32
{
    fn now_ms(&mut self) -> u32 { self() }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Command
{
    Read,
    EnableHeater,
    DisableHeater,
    ConfigureHeater,
    ReadStatus,
    ClearStatus,
    SoftwareReset,
    /** only 0, 1 and 2 are valid */
    ReadNist(u8),
    ReadManufacturer,
}

impl From<Command> for u16
{
    fn from(cmd: Command) -> Self
    {
        use constants::*;

        match cmd {
            Command::Read => CMD_READ,
            Command::EnableHeater => CMD_ENABLE_HEATER,
            Command::DisableHeater => CMD_DISABLE_HEATER,
            Command::ConfigureHeater => CMD_CONFIG_HEATER,
            Command::ReadStatus => CMD_READ_STATUS,
            Command::ClearStatus => CMD_CLEAR_STATUS,
            Command::SoftwareReset => CMD_SOFTWARE_RESET,
            Command::ReadNist(id) => CMD_READ_NIST_BASE + id as u16,
            Command::ReadManufacturer => CMD_READ_MANUFACTURER,
        }
    }
}

/**
 * Heater power presets; cf. p. 16 of the datasheet.
 */
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeaterPower
{
    Full,
    Half,
    Quarter,
}

impl HeaterPower
{
    /** Parameter bytes following the heater configuration command. */
    pub const fn payload(self) -> [u8; 3]
    {
        match self {
            HeaterPower::Full => [0x3f, 0xff, 0x06],
            HeaterPower::Half => [0x03, 0xff, 0x00],
            HeaterPower::Quarter => [0x00, 0x9f, 0x96],
        }
    }
}

/**
 * Documented bits of the status register; cf. p. 17 of the datasheet.
 */
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status(u16);

impl Status
{
    pub const fn new(raw: u16) -> Self { Self(raw & constants::STATUS_MASK) }

    pub const fn bits(&self) -> u16 { self.0 }

    pub const fn heater_enabled(&self) -> bool { self.0 & (1 << 13) != 0 }

    /** set after power up, soft reset or brown-out until cleared */
    pub const fn reset_detected(&self) -> bool { self.0 & (1 << 4) != 0 }

    /** the last command was not understood */
    pub const fn command_failed(&self) -> bool { self.0 & (1 << 1) != 0 }

    /** the checksum of the last write transfer did not match */
    pub const fn write_checksum_failed(&self) -> bool { self.0 & 1 != 0 }
}

/**
 * Two bytes as received on the bus plus the CRC the sensor sent along.
 */
#[derive(Copy, Clone, Debug, PartialEq)]
struct RawWord
{
    hi:  u8,
    lo:  u8,
    crc: u8,
}

impl RawWord
{
    const fn new(buf: &[u8]) -> Self
    {
        Self { hi: buf[0], lo: buf[1], crc: buf[2] }
    }

    const fn crc_ok(&self) -> bool { crc8(self.value()) == self.crc }

    const fn value(&self) -> u16 { (self.hi as u16) << 8 | self.lo as u16 }
}

/**
 * Convert the raw temperature word to °C.
 *
 * The word is taken as *signed* which folds the upper half of the range
 * below −45 °C. The sensor never reports such values in practice.
 */
fn temperature_from_raw(raw: u16) -> f32
{
    -45.0_f32 + (175.0_f32 / 65535.0_f32) * (raw as i16 as f32)
}

/** Convert the raw humidity word to %RH. */
fn humidity_from_raw(raw: u16) -> f32 { (100.0_f32 / 65535.0_f32) * raw as f32 }

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Measurement
{
    /** °C, offset applied */
    pub temperature: f32,
    /** %RH, offset applied and clipped to 0--100 */
    pub humidity:    f32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<I2cError>
{
    /** configured address is not one the sensor can have */
    Address,
    /** nothing acknowledged the address */
    Connect,
    /** previous read attempt is less than a second ago */
    TooSoon,
    I2c(I2cError),
    Crc,
}

impl<E> Error<E>
{
    pub fn kind(&self) -> ErrorKind
    {
        match self {
            Error::Address => ErrorKind::Address,
            Error::Connect => ErrorKind::Connect,
            Error::TooSoon => ErrorKind::TooSoon,
            Error::I2c(_) => ErrorKind::Bus,
            Error::Crc => ErrorKind::Crc,
        }
    }
}

/**
 * Error code without the bus error payload, as kept by the ``Sensor``
 * between calls.  Zero is left for “no error”.
 */
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ErrorKind
{
    Address = 1,
    Connect = 2,
    TooSoon = 3,
    Bus = 4,
    Crc = 5,
}

/**
 * Struct representing an interface to the CHT832X on the I²C bus.
 *
 * The bus is owned for the lifetime of the driver; to share it with other
 * devices hand in a proxy (e. g. from ``shared-bus``).  All operations take
 * ``&mut self`` so concurrent use has to be serialized by the caller.
 */
#[derive(Debug)]
pub struct Sensor<I2C, CLK>
{
    i2c:                I2C,
    addr:               u8,
    clock:              CLK,
    last_read:          Option<u32>,
    temperature:        f32,
    humidity:           f32,
    temperature_offset: f32,
    humidity_offset:    f32,
    last_error:         Option<ErrorKind>,
}

impl<I2C, CLK, E> Sensor<I2C, CLK>
where
    I2C: Read<Error = E> + Write<Error = E>,
    CLK: Clock,
{
    /**
     * Create a new struct ``Sensor`` for the given I²C interface and bus
     * address. No bus traffic happens until ``begin()`` or another command
     * is issued.
     */
    pub fn new(i2c: I2C, addr: u8, clock: CLK) -> Self
    {
        Self {
            i2c,
            addr,
            clock,
            last_read: None,
            temperature: 0.0,
            humidity: 0.0,
            temperature_offset: 0.0,
            humidity_offset: 0.0,
            last_error: None,
        }
    }

    /**
     * Create a new struct ``Sensor`` with the CHT832X listening on the
     * default bus address 0x44.
     */
    pub fn with_default_address(i2c: I2C, clock: CLK) -> Self
    {
        Self::new(i2c, constants::I2C_ADDR, clock)
    }

    /** Give back the bus and the clock. */
    pub fn release(self) -> (I2C, CLK) { (self.i2c, self.clock) }

    pub fn address(&self) -> u8 { self.addr }

    /**
     * Validate the configured address and check that the sensor answers.
     *
     * An address outside 0x44--0x47 is rejected without touching the bus.
     */
    pub fn begin(&mut self) -> Result<(), Error<E>>
    {
        let res = if !ADDRESS_RANGE.contains(&self.addr) {
            warn!("address {:#x} out of range", self.addr);
            Err(Error::Address)
        } else if !self.is_connected() {
            warn!("no response at address {:#x}", self.addr);
            Err(Error::Connect)
        } else {
            Ok(())
        };
        self.settle(res)
    }

    /** Probe the address with an empty write. */
    pub fn is_connected(&mut self) -> bool
    {
        self.i2c.write(self.addr, &[]).is_ok()
    }

    /**
     * Take a measurement: issue the read command, wait 60 ms and fetch six
     * bytes holding temperature and humidity, each with its CRC.
     *
     * Fails with ``Error::TooSoon`` if the previous attempt is less than a
     * second ago; neither bus nor cached values are touched then. A bus
     * error leaves the cached values alone too.
     *
     * On a CRC mismatch the decoded values are still stored and can be
     * retrieved with ``temperature()`` and ``humidity()``; the return value
     * is ``Error::Crc`` in that case.
     */
    pub fn read(
        &mut self,
        delay: &mut impl DelayUs<u16>,
    ) -> Result<Measurement, Error<E>>
    {
        let now = self.clock.now_ms();
        if let Some(last) = self.last_read {
            if now.wrapping_sub(last) < constants::READ_INTERVAL_MS {
                debug!("read attempted {} ms after previous", now.wrapping_sub(last));
                return self.settle(Err(Error::TooSoon));
            }
        }
        self.last_read = Some(now);

        let buf = match self.send_command(Command::Read).and_then(|()| {
            delay.delay_us(constants::READ_DELAY_MS * 1000);
            self.fetch::<6>()
        }) {
            Ok(buf) => buf,
            Err(e) => return self.settle(Err(e)),
        };

        let temp = RawWord::new(&buf[0..3]);
        let humi = RawWord::new(&buf[3..6]);

        self.temperature = temperature_from_raw(temp.value());
        if self.temperature_offset != 0.0 {
            self.temperature += self.temperature_offset;
        }

        self.humidity = humidity_from_raw(humi.value());
        if self.humidity_offset != 0.0 {
            self.humidity = (self.humidity + self.humidity_offset).clamp(0.0, 100.0);
        }

        let mut crc_ok = true;
        if !temp.crc_ok() {
            warn!("temperature crc mismatch, got {:#x}", temp.crc);
            crc_ok = false;
        }
        if !humi.crc_ok() {
            warn!("humidity crc mismatch, got {:#x}", humi.crc);
            crc_ok = false;
        }

        let res = if crc_ok {
            Ok(Measurement { temperature: self.temperature,
                             humidity:    self.humidity, })
        } else {
            Err(Error::Crc)
        };
        self.settle(res)
    }

    /**
     * Milliseconds timestamp of the last read attempt that was not rejected
     * for being too early; 0 before the first one.
     */
    pub fn last_read(&self) -> u32 { self.last_read.unwrap_or(0) }

    /** Temperature in °C as of the last read. */
    pub fn temperature(&self) -> f32 { self.temperature }

    /** Relative humidity in percent as of the last read. */
    pub fn humidity(&self) -> f32 { self.humidity }

    /** Added to every temperature read from now on. */
    pub fn set_temperature_offset(&mut self, offset: f32)
    {
        self.temperature_offset = offset;
    }

    /** Added to every humidity read from now on. */
    pub fn set_humidity_offset(&mut self, offset: f32)
    {
        self.humidity_offset = offset;
    }

    pub fn temperature_offset(&self) -> f32 { self.temperature_offset }

    pub fn humidity_offset(&self) -> f32 { self.humidity_offset }

    /** Switch the heater on at its currently configured power. */
    pub fn enable_heater(&mut self) -> Result<(), Error<E>>
    {
        let res = self.send_command(Command::EnableHeater);
        self.settle(res)
    }

    /**
     * Configure the heater power. Cf. p. 16 of the datasheet; the heater
     * is not switched on by this.
     */
    pub fn configure_heater(&mut self, power: HeaterPower)
        -> Result<(), Error<E>>
    {
        let res = self.send_command_with(Command::ConfigureHeater, power.payload());
        self.settle(res)
    }

    pub fn enable_heater_full(&mut self) -> Result<(), Error<E>>
    {
        self.configure_heater(HeaterPower::Full)
    }

    pub fn enable_heater_half(&mut self) -> Result<(), Error<E>>
    {
        self.configure_heater(HeaterPower::Half)
    }

    pub fn enable_heater_quarter(&mut self) -> Result<(), Error<E>>
    {
        self.configure_heater(HeaterPower::Quarter)
    }

    pub fn disable_heater(&mut self) -> Result<(), Error<E>>
    {
        let res = self.send_command(Command::DisableHeater);
        self.settle(res)
    }

    /**
     * Read the raw status register.
     *
     * A CRC mismatch does not turn this into an error: the value is
     * returned anyway and the mismatch is recorded for ``take_error()``.
     */
    pub fn status_register(&mut self) -> Result<u16, Error<E>>
    {
        self.read_word(Command::ReadStatus)
    }

    /** Like ``status_register()`` with reserved bits masked out. */
    pub fn status(&mut self) -> Result<Status, Error<E>>
    {
        self.status_register().map(Status::new)
    }

    pub fn clear_status_register(&mut self) -> Result<(), Error<E>>
    {
        let res = self.send_command(Command::ClearStatus);
        self.settle(res)
    }

    /**
     * Reset the sensor. Unlike power cycling this does not wait for it to
     * come back up; allow a couple of milliseconds before the next command.
     */
    pub fn software_reset(&mut self) -> Result<(), Error<E>>
    {
        let res = self.send_command(Command::SoftwareReset);
        self.settle(res)
    }

    /**
     * Read one of the three NIST traceability words. Any ``id`` above 2
     * yields 0 without bus traffic and without affecting the error state.
     * CRC handling as with ``status_register()``.
     */
    pub fn nist(&mut self, id: u8) -> Result<u16, Error<E>>
    {
        if id > 2 {
            return Ok(0);
        }
        self.read_word(Command::ReadNist(id))
    }

    /** Manufacturer ID; CRC handling as with ``status_register()``. */
    pub fn manufacturer(&mut self) -> Result<u16, Error<E>>
    {
        self.read_word(Command::ReadManufacturer)
    }

    /**
     * Return the error recorded by the most recent fallible operation and
     * reset it.
     */
    pub fn take_error(&mut self) -> Option<ErrorKind> { self.last_error.take() }

    /** Record the outcome of an operation as the current error state. */
    fn settle<T>(&mut self, res: Result<T, Error<E>>) -> Result<T, Error<E>>
    {
        self.last_error = res.as_ref().err().map(Error::kind);
        res
    }

    /**
     * Issue commands to the CHT832X over I²C. ``cmd`` is sent MSB first.
     */
    fn send_command(&mut self, cmd: Command) -> Result<(), Error<E>>
    {
        self.write_frame(u16::from(cmd).to_be_bytes())
    }

    fn send_command_with(&mut self, cmd: Command, args: [u8; 3])
        -> Result<(), Error<E>>
    {
        let [hi, lo] = u16::from(cmd).to_be_bytes();
        self.write_frame([hi, lo, args[0], args[1], args[2]])
    }

    fn write_frame<const N: usize>(&mut self, frame: [u8; N])
        -> Result<(), Error<E>>
    {
        trace!("write {:#x} {:#x} (+{} bytes)", frame[0], frame[1], N - 2);
        self.i2c.write(self.addr, &frame).map_err(|e| {
            warn!("write to {:#x} failed", self.addr);
            Error::I2c(e)
        })
    }

    fn fetch<const N: usize>(&mut self) -> Result<[u8; N], Error<E>>
    {
        let mut buf = [0; N];
        self.i2c.read(self.addr, &mut buf).map_err(|e| {
            warn!("read of {} bytes from {:#x} failed", N, self.addr);
            Error::I2c(e)
        })?;
        Ok(buf)
    }

    /**
     * Read a single checked word following ``cmd``. The sensor answers
     * these commands immediately so there is no delay.
     */
    fn read_word(&mut self, cmd: Command) -> Result<u16, Error<E>>
    {
        let buf = match self.send_command(cmd).and_then(|()| self.fetch::<3>())
        {
            Ok(buf) => buf,
            Err(e) => return self.settle(Err(e)),
        };

        let word = RawWord::new(&buf);
        self.last_error = if word.crc_ok() {
            None
        } else {
            warn!("crc mismatch reading {:#x}", u16::from(cmd));
            Some(ErrorKind::Crc)
        };
        Ok(word.value())
    }
}

/**
 * Sensirion style CRC-8 over a big endian word: init 0xff, polynomial 0x31,
 * no reflection, no final XOR.
 */
pub const fn crc8(word: u16) -> u8
{
    let bytes = word.to_be_bytes();
    let mut crc = constants::CRC8_INIT;

    let mut i = 0;
    while i < bytes.len() {
        crc ^= bytes[i];
        let mut b = 0;
        while b < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ constants::CRC8_POLY
            } else {
                crc << 1
            };
            b += 1;
        }
        i += 1;
    }

    crc
}
