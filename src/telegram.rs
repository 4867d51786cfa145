use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

pub const START: u8 = 0x01;
pub const LENGTH: usize = 6;
/// Register number used by read requests. The register being requested is carried in the data
/// byte.
pub const READ_REQUEST_REGISTER: u8 = 0x00;

/// Participants on the remote control bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum BusAddress {
    #[strum(serialize = "MB*")]
    AllMainboards = 0x10,
    #[strum(serialize = "MB1")]
    Mainboard1 = 0x11,
    #[strum(serialize = "FB*")]
    AllRemotes = 0x20,
    #[strum(serialize = "FB1")]
    Remote1 = 0x21,
    #[strum(serialize = "LON")]
    Lon = 0x28,
    /// The address this tool talks as.
    #[strum(serialize = "_HA")]
    Software = 0x2E,
    #[strum(serialize = "_SH")]
    SecondarySoftware = 0x2F,
}

/// Short name of a bus participant, or its hex address if unknown.
pub fn address_name(address: u8) -> String {
    match BusAddress::from_repr(address) {
        Some(known) => known.to_string(),
        None => format!("{address:02x}"),
    }
}

/// Sum of the first five bytes, modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().take(LENGTH - 1).fold(0u8, |sum, b| sum.wrapping_add(*b))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Telegram {
    pub sender: u8,
    pub receiver: u8,
    pub register: u8,
    pub data: u8,
    pub checksum: u8,
}

impl Telegram {
    pub fn build(sender: BusAddress, receiver: BusAddress, register: u8, data: u8) -> Self {
        let (sender, receiver) = (sender as u8, receiver as u8);
        Self {
            sender,
            receiver,
            register,
            data,
            checksum: checksum(&[START, sender, receiver, register, data]),
        }
    }

    /// A request for `MB1` to report the value of `register`.
    pub fn read_request(register: u8) -> Self {
        Self::build(BusAddress::Software, BusAddress::Mainboard1, READ_REQUEST_REGISTER, register)
    }

    pub fn from_bytes(bytes: [u8; LENGTH]) -> Self {
        let [_, sender, receiver, register, data, checksum] = bytes;
        Self { sender, receiver, register, data, checksum }
    }

    pub fn to_bytes(&self) -> [u8; LENGTH] {
        [START, self.sender, self.receiver, self.register, self.data, self.checksum]
    }

    pub fn has_valid_checksum(&self) -> bool {
        checksum(&self.to_bytes()) == self.checksum
    }

    pub fn is_read_request(&self) -> bool {
        self.register == READ_REQUEST_REGISTER
    }

    /// Whether this is `MB1`'s answer to [`Telegram::read_request`] for `register`.
    pub fn is_reply_to_read(&self, register: u8) -> bool {
        self.sender == BusAddress::Mainboard1 as u8
            && self.receiver == BusAddress::Software as u8
            && self.register == register
            && self.has_valid_checksum()
    }
}

impl std::fmt::Display for Telegram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.to_bytes();
        write!(f, "{a:02x} {b:02x} {c:02x} {d:02x} {e:02x} {g:02x}")
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Parsed {
    /// Six bytes starting with [`START`]. The checksum is not validated.
    Telegram(Telegram),
    /// This many leading bytes can not start a telegram.
    Jitter(usize),
    Incomplete,
}

pub fn parse(buffer: &[u8]) -> Parsed {
    match buffer.iter().position(|b| *b == START) {
        None if buffer.is_empty() => Parsed::Incomplete,
        None => Parsed::Jitter(buffer.len()),
        Some(0) => match buffer.first_chunk::<LENGTH>() {
            Some(bytes) => Parsed::Telegram(Telegram::from_bytes(*bytes)),
            None => Parsed::Incomplete,
        },
        Some(offset) => Parsed::Jitter(offset),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Telegram(Telegram),
    Jitter(Vec<u8>),
}

/// Framing of a passively observed bus.
///
/// Telegrams with a bad checksum are still reported; the consumer decides what to make of them.
#[derive(Default)]
pub struct TelegramCodec {}

impl Decoder for TelegramCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        trace!(message = "attempt at decoding", buffer = ?src);
        match parse(src) {
            Parsed::Incomplete => Ok(None),
            Parsed::Jitter(count) => Ok(Some(Frame::Jitter(src.split_to(count).to_vec()))),
            Parsed::Telegram(telegram) => {
                src.advance(LENGTH);
                Ok(Some(Frame::Telegram(telegram)))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Ok(Some(Frame::Jitter(src.split().to_vec()))),
        }
    }
}

impl Encoder<Telegram> for TelegramCodec {
    type Error = std::io::Error;

    fn encode(&mut self, telegram: Telegram, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&telegram.to_bytes());
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}
