use std::time::Duration;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::bytes::{Buf as _, BytesMut};
use tokio_util::codec::Encoder as _;
use tracing::{debug, error, info, trace, warn};

use crate::bus::{self, BusArbiter};
use crate::register_cache::RawRegisterCache;
use crate::registers::{Kind, RegisterCatalog, RegisterEntry, WRITE_PROTECTED_ADDRESS};
use crate::snapshot::ValueSnapshot;
use crate::telegram::{self, BusAddress, Parsed, Telegram, TelegramCodec};
use crate::value::{self, Value};

/// Every write is broadcast to the remotes and mainboards, then addressed to `MB1` directly.
const WRITE_TARGETS: [BusAddress; 3] =
    [BusAddress::AllRemotes, BusAddress::AllMainboards, BusAddress::Mainboard1];

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("connecting to `{0}` did not complete within {1:?}")]
    ConnectTimeout(String, Duration),
    #[error("not connected to the ventilation unit")]
    NotConnected,
    #[error("could not send out the telegram")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("bus arbitration failed")]
    Bus(#[source] bus::Error),
    #[error("no valid reply for register {register:#04x} was received")]
    TelegramMismatch { register: u8 },
    #[error("variable `{0}` is not known")]
    UnknownVariable(String),
    #[error("variable `{0}` can not be read")]
    NotReadable(&'static str),
    #[error("variable `{0}` is read-only")]
    ReadOnly(&'static str),
    #[error("refusing to write `{name}`: register {address:#04x} is write-protected")]
    SafetyBlocked { name: &'static str, address: u8 },
    #[error("bad value for `{name}`")]
    Value {
        name: &'static str,
        #[source]
        source: value::Error,
    },
    #[error("reading register {address:#04x} failed after {attempts} attempts")]
    ReadFailed {
        address: u8,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
    #[error("writing `{name}` to {receiver} failed")]
    WriteFailed {
        name: &'static str,
        receiver: BusAddress,
        #[source]
        source: Box<Error>,
    },
    #[error("the operation did not complete within {0:?}")]
    Timeout(Duration),
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Host name or IP address of the RS-485 to LAN/Wi-Fi bridge.
    #[arg(long, default_value = "192.168.178.38")]
    pub host: String,

    /// TCP port of the bridge.
    #[arg(long, default_value = "8234")]
    pub port: u16,

    #[arg(long, default_value = "10s")]
    pub connect_timeout: humantime::Duration,

    /// Consider the bus free after it has been silent for this long.
    ///
    /// One character at 9600 baud takes roughly 1ms, so this leaves room for a few.
    #[arg(long, default_value = "10ms")]
    pub quiet_window: humantime::Duration,

    /// Give up waiting for a free bus after this amount of time.
    #[arg(long, default_value = "3s")]
    pub arbitration_ceiling: humantime::Duration,

    /// If the mainboard does not reply to a read request within this amount of time, consider
    /// the attempt failed.
    #[arg(long, default_value = "500ms")]
    pub reply_timeout: humantime::Duration,

    /// Number of attempts made at reading a single register.
    #[arg(long, default_value = "3")]
    pub attempts: u32,

    /// Pause between two attempts at reading the same register.
    #[arg(long, default_value = "50ms")]
    pub retry_delay: humantime::Duration,

    /// Pause before each request when reading out all the registers.
    #[arg(long, default_value = "20ms")]
    pub poll_pacing: humantime::Duration,

    /// Abandon a whole connect, operate and disconnect cycle after this amount of time.
    #[arg(long, default_value = "50s")]
    pub deadline: humantime::Duration,
}

impl Args {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Open a TCP connection to the bridge, bounded by the connect timeout.
pub async fn open_stream(args: &Args) -> Result<TcpStream, Error> {
    let address = args.address();
    let timeout = *args.connect_timeout;
    info!(message = "connecting...", address);
    let socket = tokio::time::timeout(timeout, async {
        let addresses = tokio::net::lookup_host(&address)
            .await
            .map_err(|e| Error::LookupHost(e, address.clone()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        TcpStream::connect(&*addresses).await.map_err(|e| Error::Connect(e, address.clone()))
    })
    .await
    .map_err(|_| Error::ConnectTimeout(address.clone(), timeout))??;
    let nodelay_result = socket.set_nodelay(true);
    trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
    info!(message = "connected");
    Ok(socket)
}

/// A session with the ventilation unit's remote control bus.
///
/// The client talks as `_HA` and queries `MB1`. It owns the TCP stream and a cache of raw
/// register bytes that lives as long as the connection.
pub struct DeviceClient {
    args: Args,
    catalog: RegisterCatalog,
    arbiter: BusArbiter,
    codec: TelegramCodec,
    stream: Option<TcpStream>,
    received: BytesMut,
    cache: RawRegisterCache,
}

impl DeviceClient {
    pub fn new(args: Args) -> Self {
        Self::with_catalog(args, RegisterCatalog::standard())
    }

    pub fn with_catalog(args: Args, catalog: RegisterCatalog) -> Self {
        let arbiter = BusArbiter {
            quiet_window: *args.quiet_window,
            ceiling: *args.arbitration_ceiling,
        };
        Self {
            args,
            catalog,
            arbiter,
            codec: TelegramCodec::default(),
            stream: None,
            received: BytesMut::with_capacity(64),
            cache: RawRegisterCache::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// The raw byte last read from or written to `address` during this session.
    pub fn cached_raw(&self, address: u8) -> Option<u8> {
        self.cache.get(address)
    }

    pub async fn connect(&mut self) -> Result<(), Error> {
        if self.stream.is_some() {
            return Ok(());
        }
        let socket = open_stream(&self.args).await?;
        self.stream = Some(socket);
        self.received.clear();
        self.cache.clear();
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(
                    message = "could not shut down the connection",
                    error = (&e as &dyn std::error::Error)
                );
            }
            info!(message = "disconnected");
        }
        self.drop_session();
    }

    fn drop_session(&mut self) {
        self.stream = None;
        self.received.clear();
        self.cache.clear();
    }

    /// Resolve `name` for writing, rejecting anything that must not go out on the bus.
    pub fn writable_entry(&self, name: &str) -> Result<&RegisterEntry, Error> {
        let entry = self
            .catalog
            .lookup(name)
            .ok_or_else(|| Error::UnknownVariable(name.to_string()))?;
        if entry.address == WRITE_PROTECTED_ADDRESS {
            error!(
                message = "refusing to write the write-protected register",
                variable = entry.name,
                address = entry.address
            );
            return Err(Error::SafetyBlocked { name: entry.name, address: entry.address });
        }
        if !entry.mode.is_writable() {
            return Err(Error::ReadOnly(entry.name));
        }
        Ok(entry)
    }

    pub async fn read_value(&mut self, name: &str) -> Result<Value, Error> {
        let entry = *self
            .catalog
            .lookup(name)
            .ok_or_else(|| Error::UnknownVariable(name.to_string()))?;
        if !entry.mode.is_readable() {
            return Err(Error::NotReadable(entry.name));
        }
        let raw = self.read_register(entry.address).await?;
        value::decode(&entry, raw).map_err(|source| Error::Value { name: entry.name, source })
    }

    /// Read every register once and decode all the variables it holds.
    ///
    /// Registers that can not be read are skipped, so the snapshot may be partial.
    pub async fn read_all_values(&mut self) -> Result<ValueSnapshot, Error> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let started = Instant::now();
        let mut snapshot = ValueSnapshot::default();
        for address in self.catalog.addresses() {
            tokio::time::sleep(*self.args.poll_pacing).await;
            let raw = match self.read_register(address).await {
                Ok(raw) => raw,
                Err(Error::NotConnected) => {
                    warn!(message = "connection lost, returning what was read so far");
                    break;
                }
                Err(e) => {
                    warn!(
                        message = "skipping register",
                        address,
                        error = (&e as &dyn std::error::Error)
                    );
                    continue;
                }
            };
            for entry in self.catalog.entries_for_address(address) {
                if !entry.mode.is_readable() {
                    continue;
                }
                match value::decode(entry, raw) {
                    Ok(value) => snapshot.insert(entry.name, value),
                    Err(e) => warn!(
                        message = "could not decode",
                        variable = entry.name,
                        raw,
                        error = (&e as &dyn std::error::Error)
                    ),
                }
            }
        }
        snapshot.derive_metrics();
        info!(message = "read all values", count = snapshot.len(), elapsed = ?started.elapsed());
        Ok(snapshot)
    }

    pub async fn write_value(&mut self, name: &str, value: Value) -> Result<(), Error> {
        let entry = *self.writable_entry(name)?;
        let current = match entry.kind {
            Kind::Bit(_) => match self.cache.get(entry.address) {
                Some(raw) => Some(raw),
                None if self.is_connected() => Some(self.read_register(entry.address).await?),
                None => None,
            },
            _ => None,
        };
        let raw = value::encode(&entry, value, current)
            .map_err(|source| Error::Value { name: entry.name, source })?;
        debug!(message = "writing", variable = entry.name, %value, raw, ?current);
        for receiver in WRITE_TARGETS {
            let failed = |source| Error::WriteFailed {
                name: entry.name,
                receiver,
                source: Box::new(source),
            };
            let telegram = Telegram::build(BusAddress::Software, receiver, entry.address, raw);
            self.arbitrate().await.map_err(failed)?;
            self.received.clear();
            self.send_telegram(telegram).await.map_err(failed)?;
            if receiver == BusAddress::Mainboard1 {
                // MB1 only commits the value once the checksum is repeated on its own.
                self.send_bytes(&[telegram.checksum]).await.map_err(failed)?;
            }
        }
        self.cache.set(entry.address, raw);
        info!(message = "written", variable = entry.name, %value);
        Ok(())
    }

    /// Read the raw byte of a register from `MB1`, retrying failed attempts.
    pub async fn read_register(&mut self, address: u8) -> Result<u8, Error> {
        let attempts = self.args.attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match self.read_attempt(address).await {
                Ok(raw) => {
                    trace!(message = "read register", address, raw, attempt);
                    self.cache.set(address, raw);
                    return Ok(raw);
                }
                Err(Error::NotConnected) => return Err(Error::NotConnected),
                Err(e @ Error::Bus(bus::Error::Closed)) => {
                    self.drop_session();
                    let source = Box::new(e);
                    return Err(Error::ReadFailed { address, attempts: attempt, source });
                }
                Err(e) => e,
            };
            if attempt >= attempts {
                return Err(Error::ReadFailed { address, attempts, source: Box::new(error) });
            }
            debug!(
                message = "read attempt failed, will retry",
                address,
                attempt,
                error = (&error as &dyn std::error::Error)
            );
            attempt += 1;
            tokio::time::sleep(*self.args.retry_delay).await;
        }
    }

    async fn read_attempt(&mut self, register: u8) -> Result<u8, Error> {
        self.arbitrate().await?;
        self.received.clear();
        self.send_telegram(Telegram::read_request(register)).await?;
        // The reply usually arrives while waiting here. It stays in `self.received`.
        self.arbitrate().await?;
        self.receive_reply(register).await
    }

    async fn arbitrate(&mut self) -> Result<(), Error> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let result = self.arbiter.wait_for_quiet(stream, &mut self.received).await;
        if let Err(e) = &result {
            warn!(message = "bus arbitration failed", error = (e as &dyn std::error::Error));
        }
        result.map_err(Error::Bus)
    }

    async fn receive_reply(&mut self, register: u8) -> Result<u8, Error> {
        let deadline = Instant::now() + *self.args.reply_timeout;
        loop {
            if let Some(data) = take_reply(&mut self.received, register) {
                return Ok(data);
            }
            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            match tokio::time::timeout_at(deadline, stream.read_buf(&mut self.received)).await {
                Err(_) => return Err(Error::TelegramMismatch { register }),
                Ok(Ok(0)) => return Err(Error::Bus(bus::Error::Closed)),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(Error::Receive(e)),
            }
        }
    }

    async fn send_telegram(&mut self, telegram: Telegram) -> Result<(), Error> {
        let mut buffer = BytesMut::with_capacity(telegram::LENGTH);
        self.codec.encode(telegram, &mut buffer).map_err(Error::Send)?;
        self.send_bytes(&buffer).await
    }

    async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        trace!(message = "sending", ?bytes);
        stream.write_all(bytes).await.map_err(Error::Send)?;
        stream.flush().await.map_err(Error::Send)
    }
}

/// Consume `buffer` up to and including the reply to a read of `register`.
///
/// Jitter, foreign telegrams and corrupt frames are discarded on the way.
fn take_reply(buffer: &mut BytesMut, register: u8) -> Option<u8> {
    loop {
        match telegram::parse(buffer) {
            Parsed::Incomplete => return None,
            Parsed::Jitter(count) => {
                trace!(message = "ignoring jitter", bytes = ?&buffer[..count]);
                buffer.advance(count);
            }
            Parsed::Telegram(telegram) if telegram.is_reply_to_read(register) => {
                buffer.advance(telegram::LENGTH);
                return Some(telegram.data);
            }
            Parsed::Telegram(telegram) if telegram.has_valid_checksum() => {
                trace!(message = "ignoring foreign telegram", %telegram);
                buffer.advance(telegram::LENGTH);
            }
            Parsed::Telegram(telegram) => {
                trace!(message = "ignoring corrupt telegram", %telegram);
                buffer.advance(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_is_found_behind_noise() {
        let reply = Telegram::build(BusAddress::Mainboard1, BusAddress::Software, 0x29, 63);
        let foreign = Telegram::build(BusAddress::Remote1, BusAddress::Mainboard1, 0x29, 1);
        let mut corrupt = reply;
        corrupt.checksum ^= 0xFF;
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&[0xFF, 0x00]);
        buffer.extend_from_slice(&foreign.to_bytes());
        buffer.extend_from_slice(&corrupt.to_bytes());
        buffer.extend_from_slice(&reply.to_bytes());
        buffer.extend_from_slice(&[0x01, 0x11]);
        assert_eq!(take_reply(&mut buffer, 0x29), Some(63));
        assert_eq!(&buffer[..], &[0x01, 0x11]);
        assert_eq!(take_reply(&mut buffer, 0x29), None);
    }

    #[test]
    fn replies_for_other_registers_are_skipped() {
        let other = Telegram::build(BusAddress::Mainboard1, BusAddress::Software, 0x32, 100);
        let mut buffer = BytesMut::from(&other.to_bytes()[..]);
        assert_eq!(take_reply(&mut buffer, 0x29), None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn defaults() {
        use clap::Parser as _;
        let args = Args::parse_from(["helios-vallox-tools"]);
        assert_eq!(args.address(), "192.168.178.38:8234");
        assert_eq!(*args.reply_timeout, Duration::from_millis(500));
        assert_eq!(*args.deadline, Duration::from_secs(50));
        assert_eq!(args.attempts, 3);
    }
}
