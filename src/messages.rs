//! Framing of CA messages.
//!
//! Every CA message starts with a fixed 16-byte header. When either the payload
//! size or the element count does not fit in 16 bits, the *extended* 24-byte form
//! is used instead: the payload size field carries the `0xFFFF` sentinel, the
//! count field is zero and both real values follow as `u32` after the two
//! parameters.
//!
//! Everything here is stateless. Incoming frames are read with [`Header::parse`],
//! which distinguishes "not enough bytes yet" (`nom::Err::Incomplete`) from a
//! malformed header, and outgoing requests are built from the small message
//! structs in this module and written with [`CAMessage::write`].

use std::{
    io::{self, Write},
    net::Ipv4Addr,
};

use nom::{
    Finish, IResult, Parser,
    bytes::complete::take,
    combinator::all_consuming,
    error::{Error, ErrorKind},
    multi::many0,
    number::streaming::{be_u16, be_u32},
};
use thiserror::Error;

/// Minor protocol revision spoken by this client
pub const CA_MINOR_PROTOCOL_REVISION: u16 = 13;
/// Size of the standard header
pub const CA_MESSAGE_HEADER_SIZE: usize = 16;
/// Size of the extended (large payload) header
pub const CA_EXTENDED_MESSAGE_HEADER_SIZE: usize = 24;
/// Default circuit priority
pub const CA_DEFAULT_PRIORITY: u16 = 0;
/// Largest datagram we will build when batching search requests
pub const MAX_UDP_SEND: usize = 1024;
/// Largest datagram we are prepared to receive
pub const MAX_UDP_RECV: usize = 0xFFFF + 16;

const EXTENDED_SENTINEL: u16 = 0xFFFF;

/// Search flag asking the server to reply even if it does not host the channel
const SEARCH_DO_REPLY: u16 = 10;
const SEARCH_DONT_REPLY: u16 = 5;

/// Command codes used on the wire
pub mod command {
    pub const VERSION: u16 = 0;
    pub const EVENT_ADD: u16 = 1;
    pub const EVENT_CANCEL: u16 = 2;
    pub const READ: u16 = 3;
    pub const WRITE: u16 = 4;
    pub const SEARCH: u16 = 6;
    pub const EVENTS_OFF: u16 = 8;
    pub const EVENTS_ON: u16 = 9;
    pub const ERROR: u16 = 11;
    pub const CLEAR_CHANNEL: u16 = 12;
    pub const RSRV_IS_UP: u16 = 13;
    pub const NOT_FOUND: u16 = 14;
    pub const READ_NOTIFY: u16 = 15;
    pub const REPEATER_CONFIRM: u16 = 17;
    pub const CREATE_CHAN: u16 = 18;
    pub const WRITE_NOTIFY: u16 = 19;
    pub const CLIENT_NAME: u16 = 20;
    pub const HOST_NAME: u16 = 21;
    pub const ACCESS_RIGHTS: u16 = 22;
    pub const ECHO: u16 = 23;
    pub const REPEATER_REGISTER: u16 = 24;
    pub const CREATE_CH_FAIL: u16 = 26;
    pub const SERVER_DISCONN: u16 = 27;
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("IO Error Occured")]
    IO(#[from] io::Error),
    #[error("An error occured parsing a message")]
    ParsingError(#[from] nom::Err<nom::error::Error<Vec<u8>>>),
    #[error("Message command ID does not match expected: {0}")]
    IncorrectCommandId(u16),
    #[error("Invalid message field: {0} == {1}")]
    InvalidField(String, String),
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for MessageError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        MessageError::ParsingError(err.to_owned())
    }
}

/// A decoded message header, with the extended fields already folded in
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: u16,
    pub payload_size: u32,
    pub data_type: u16,
    pub data_count: u32,
    pub parameter_1: u32,
    pub parameter_2: u32,
    /// Read in, or forced into, the 24-byte form even if the values would fit
    pub extended: bool,
}

impl Header {
    /// Parse a header from the front of `input`.
    ///
    /// Returns `nom::Err::Incomplete` when the header (standard or extended) is not
    /// yet fully buffered; the payload is never inspected.
    pub fn parse(input: &[u8]) -> IResult<&[u8], Header> {
        let (input, command) = be_u16::<_, Error<&[u8]>>(input)?;
        let (input, short_payload_size) = be_u16::<_, Error<&[u8]>>(input)?;
        let (input, data_type) = be_u16::<_, Error<&[u8]>>(input)?;
        let (input, short_data_count) = be_u16::<_, Error<&[u8]>>(input)?;
        let (input, parameter_1) = be_u32::<_, Error<&[u8]>>(input)?;
        let (input, parameter_2) = be_u32::<_, Error<&[u8]>>(input)?;

        if short_payload_size == EXTENDED_SENTINEL {
            let (input, payload_size) = be_u32::<_, Error<&[u8]>>(input)?;
            let (input, data_count) = be_u32::<_, Error<&[u8]>>(input)?;
            Ok((
                input,
                Header {
                    command,
                    payload_size,
                    data_type,
                    data_count,
                    parameter_1,
                    parameter_2,
                    extended: true,
                },
            ))
        } else {
            Ok((
                input,
                Header {
                    command,
                    payload_size: short_payload_size as u32,
                    data_type,
                    data_count: short_data_count as u32,
                    parameter_1,
                    parameter_2,
                    extended: false,
                },
            ))
        }
    }

    /// Is this header in the extended encoding.
    ///
    /// A parsed header keeps the form it arrived in. Otherwise the extended form
    /// is only used when the payload size or element count cannot be expressed in
    /// the standard one, so a standard header never reports itself as extended.
    pub fn is_extended(&self) -> bool {
        self.extended
            || self.payload_size >= EXTENDED_SENTINEL as u32
            || self.data_count > EXTENDED_SENTINEL as u32
    }

    /// Number of bytes this header occupies on the wire
    pub fn encoded_len(&self) -> usize {
        if self.is_extended() {
            CA_EXTENDED_MESSAGE_HEADER_SIZE
        } else {
            CA_MESSAGE_HEADER_SIZE
        }
    }

    /// Total bytes of header plus declared payload
    pub fn frame_len(&self) -> usize {
        self.encoded_len() + self.payload_size as usize
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.command.to_be_bytes())?;
        if self.is_extended() {
            writer.write_all(&EXTENDED_SENTINEL.to_be_bytes())?;
            writer.write_all(&self.data_type.to_be_bytes())?;
            writer.write_all(&0u16.to_be_bytes())?;
            writer.write_all(&self.parameter_1.to_be_bytes())?;
            writer.write_all(&self.parameter_2.to_be_bytes())?;
            writer.write_all(&self.payload_size.to_be_bytes())?;
            writer.write_all(&self.data_count.to_be_bytes())?;
        } else {
            writer.write_all(&(self.payload_size as u16).to_be_bytes())?;
            writer.write_all(&self.data_type.to_be_bytes())?;
            writer.write_all(&(self.data_count as u16).to_be_bytes())?;
            writer.write_all(&self.parameter_1.to_be_bytes())?;
            writer.write_all(&self.parameter_2.to_be_bytes())?;
        }
        Ok(())
    }
}

/// Common interface for writing a message struct to a writer.
pub trait CAMessage {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()>;
}

pub trait AsBytes {
    fn as_bytes(&self) -> Vec<u8>;
}

impl<T> AsBytes for T
where
    T: CAMessage,
{
    fn as_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        // Writing into a Vec cannot fail
        let _ = self.write(&mut buffer);
        buffer
    }
}

/// A header plus payload, the unit every specific message is written through
#[derive(Default, Debug, Clone)]
pub struct RawMessage {
    pub command: u16,
    pub data_type: u16,
    pub data_count: u32,
    pub parameter_1: u32,
    pub parameter_2: u32,
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// Parse an entire message (header and payload) from a complete buffer
    pub fn parse(input: &[u8]) -> IResult<&[u8], RawMessage> {
        // The buffer is complete, so running out of bytes is a plain failure
        let (input, header) = match Header::parse(input) {
            Err(nom::Err::Incomplete(_)) => {
                return Err(nom::Err::Error(Error::new(input, ErrorKind::Eof)));
            }
            result => result?,
        };
        let (input, payload) =
            take::<usize, &[u8], Error<&[u8]>>(header.payload_size as usize).parse(input)?;
        Ok((
            input,
            RawMessage {
                command: header.command,
                data_type: header.data_type,
                data_count: header.data_count,
                parameter_1: header.parameter_1,
                parameter_2: header.parameter_2,
                payload: payload.to_vec(),
            },
        ))
    }

    /// Parse an entire message, but check that it matches the expected tag
    fn parse_id(command_id: u16, input: &[u8]) -> IResult<&[u8], RawMessage> {
        let (rest, result) = RawMessage::parse(input)?;
        if result.command != command_id {
            return Err(nom::Err::Error(Error::new(input, ErrorKind::Tag)));
        }
        Ok((rest, result))
    }

    fn payload_as_string(&self) -> String {
        padded_string(&self.payload)
    }

    fn header(&self, padded_payload_size: usize) -> Header {
        Header {
            command: self.command,
            payload_size: padded_payload_size as u32,
            data_type: self.data_type,
            data_count: self.data_count,
            parameter_1: self.parameter_1,
            parameter_2: self.parameter_2,
            extended: false,
        }
    }
}

impl CAMessage for RawMessage {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        // The protocol requires payloads padded out to a multiple of 8 bytes
        let payload_size = self.payload.len().div_ceil(8) * 8;
        self.header(payload_size).write(writer)?;
        writer.write_all(&self.payload)?;
        let extra_bytes = payload_size - self.payload.len();
        if extra_bytes > 0 {
            writer.write_all(&[0u8; 8][..extra_bytes])?;
        }
        Ok(())
    }
}

/// Read a zero-terminated string out of a fixed-size field
pub(crate) fn padded_string(raw: &[u8]) -> String {
    let strlen = raw.iter().position(|&c| c == 0x00).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..strlen]).into_owned()
}

/// Zero-terminate a string and pad it to a multiple of 8 bytes
pub(crate) fn pad_string(string: &str) -> Vec<u8> {
    let mut bytes = string.as_bytes().to_vec();
    let padded_len = (bytes.len() + 1).div_ceil(8) * 8;
    bytes.resize(padded_len, 0);
    bytes
}

/// Message CA_PROTO_VERSION.
///
/// Exchanges client and server protocol versions and desired circuit
/// priority. MUST be the first message sent when a new TCP (Virtual
/// Circuit) connection is established. It is also sent as the first
/// message in UDP search datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub priority: u16,
    pub protocol_version: u16,
    /// Search datagram sequence number, zero on circuits
    pub sequence: u32,
}

impl Default for Version {
    fn default() -> Self {
        Version {
            priority: CA_DEFAULT_PRIORITY,
            protocol_version: CA_MINOR_PROTOCOL_REVISION,
            sequence: 0,
        }
    }
}

impl Version {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, raw) = RawMessage::parse_id(command::VERSION, input)?;
        Ok((
            input,
            Version {
                priority: raw.data_type,
                protocol_version: raw.data_count as u16,
                sequence: raw.parameter_1,
            },
        ))
    }
}

impl CAMessage for Version {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: command::VERSION,
            data_type: self.priority,
            data_count: self.protocol_version as u32,
            parameter_1: self.sequence,
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_SEARCH.
///
/// Searches for a given channel name. The client channel id is carried in both
/// parameters so that the reply can be matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    pub search_id: u32,
    pub channel_name: String,
    /// Indicating whether failed search response should be returned.
    pub should_reply: bool,
    pub protocol_version: u16,
}

impl Default for Search {
    fn default() -> Self {
        Search {
            search_id: 0,
            channel_name: String::new(),
            should_reply: false,
            protocol_version: CA_MINOR_PROTOCOL_REVISION,
        }
    }
}

impl Search {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, raw) = RawMessage::parse_id(command::SEARCH, input)?;
        Ok((
            input,
            Search {
                should_reply: raw.data_type == SEARCH_DO_REPLY,
                protocol_version: raw.data_count as u16,
                search_id: raw.parameter_1,
                channel_name: raw.payload_as_string(),
            },
        ))
    }

    /// Bytes this request adds to a datagram
    pub fn encoded_len(&self) -> usize {
        CA_MESSAGE_HEADER_SIZE + pad_string(&self.channel_name).len()
    }
}

impl CAMessage for Search {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: command::SEARCH,
            data_type: if self.should_reply {
                SEARCH_DO_REPLY
            } else {
                SEARCH_DONT_REPLY
            },
            data_count: self.protocol_version as u32,
            parameter_1: self.search_id,
            parameter_2: self.search_id,
            payload: pad_string(&self.channel_name),
        }
        .write(writer)
    }
}

/// Split a search datagram (as sent by a client) back into its requests
pub fn parse_search_packet(input: &[u8]) -> Result<Vec<Search>, nom::error::Error<&[u8]>> {
    // Starts with a version packet
    let (input, _) = Version::parse(input).finish()?;
    // Then a stream of multiple messages
    let (_, messages) = all_consuming(many0(Search::parse)).parse(input).finish()?;
    Ok(messages)
}

/// Message CA_PROTO_CLIENT_NAME, the user name of the client process
#[derive(Debug, Clone)]
pub struct ClientName {
    pub name: String,
}

impl CAMessage for ClientName {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: command::CLIENT_NAME,
            payload: pad_string(&self.name),
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_HOST_NAME, the host the client runs on
#[derive(Debug, Clone)]
pub struct HostName {
    pub name: String,
}

impl CAMessage for HostName {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: command::HOST_NAME,
            payload: pad_string(&self.name),
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_ECHO, used as a circuit heartbeat
#[derive(Default, Debug, Clone, Copy)]
pub struct Echo;

impl CAMessage for Echo {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: command::ECHO,
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_EVENTS_OFF: ask the server to stop sending subscription updates
#[derive(Default, Debug, Clone, Copy)]
pub struct EventsOff;

impl CAMessage for EventsOff {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: command::EVENTS_OFF,
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_EVENTS_ON: resume subscription updates
#[derive(Default, Debug, Clone, Copy)]
pub struct EventsOn;

impl CAMessage for EventsOn {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: command::EVENTS_ON,
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_REPEATER_REGISTER, sent to the local repeater
#[derive(Debug, Clone, Copy)]
pub struct RepeaterRegister {
    pub client_ip: Ipv4Addr,
}

impl CAMessage for RepeaterRegister {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: command::REPEATER_REGISTER,
            parameter_2: self.client_ip.to_bits(),
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_CREATE_CHAN.
///
/// Requests creation of channel. Server will allocate required
/// resources and return initialized SID. Sent over TCP.
#[derive(Debug, Clone)]
pub struct CreateChannel {
    pub client_id: u32,
    pub protocol_version: u32,
    pub channel_name: String,
}

impl CAMessage for CreateChannel {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: command::CREATE_CHAN,
            parameter_1: self.client_id,
            parameter_2: self.protocol_version,
            payload: pad_string(&self.channel_name),
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_CLEAR_CHANNEL
#[derive(Debug, Clone, Copy)]
pub struct ClearChannel {
    pub server_id: u32,
    pub client_id: u32,
}

impl CAMessage for ClearChannel {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: command::CLEAR_CHANNEL,
            parameter_1: self.server_id,
            parameter_2: self.client_id,
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_READ_NOTIFY
#[derive(Debug, Clone, Copy)]
pub struct ReadNotify {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
}

impl CAMessage for ReadNotify {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: command::READ_NOTIFY,
            data_type: self.data_type,
            data_count: self.data_count,
            parameter_1: self.server_id,
            parameter_2: self.client_ioid,
            ..Default::default()
        }
        .write(writer)
    }
}

/// Message CA_PROTO_WRITE_NOTIFY, with an already serialized payload
#[derive(Debug, Clone)]
pub struct WriteNotify {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}

impl CAMessage for WriteNotify {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: command::WRITE_NOTIFY,
            data_type: self.data_type,
            data_count: self.data_count,
            parameter_1: self.server_id,
            parameter_2: self.client_ioid,
            payload: self.data.clone(),
        }
        .write(writer)
    }
}

/// Which changes should trigger a subscription update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorMask {
    pub value: bool,
    pub log: bool,
    pub alarm: bool,
    pub property: bool,
}

impl Default for MonitorMask {
    fn default() -> Self {
        MonitorMask {
            value: true,
            log: false,
            alarm: true,
            property: false,
        }
    }
}

impl From<MonitorMask> for u16 {
    fn from(mask: MonitorMask) -> Self {
        (mask.value as u16)
            | (mask.log as u16) << 1
            | (mask.alarm as u16) << 2
            | (mask.property as u16) << 3
    }
}

/// Message CA_PROTO_EVENT_ADD
#[derive(Debug, Clone, Copy)]
pub struct EventAdd {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
    pub mask: MonitorMask,
}

impl CAMessage for EventAdd {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        // Three unused f32 deadband fields, then the mask
        let mut payload = vec![0u8; 12];
        payload.extend_from_slice(&u16::from(self.mask).to_be_bytes());
        payload.extend_from_slice(&[0u8; 2]);
        RawMessage {
            command: command::EVENT_ADD,
            data_type: self.data_type,
            data_count: self.data_count,
            parameter_1: self.server_id,
            parameter_2: self.subscription_id,
            payload,
        }
        .write(writer)
    }
}

/// Message CA_PROTO_EVENT_CANCEL
#[derive(Debug, Clone, Copy)]
pub struct EventCancel {
    pub data_type: u16,
    pub data_count: u32,
    pub server_id: u32,
    pub subscription_id: u32,
}

impl CAMessage for EventCancel {
    fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        RawMessage {
            command: command::EVENT_CANCEL,
            data_type: self.data_type,
            data_count: self.data_count,
            parameter_1: self.server_id,
            parameter_2: self.subscription_id,
            ..Default::default()
        }
        .write(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_beacon_header() {
        let raw_beacon = b"\x00\x0d\x00\x00\x00\x0d\x92\x32\x00\x06\xde\xde\xac\x17\x7c\xcf";
        let (rest, header) = Header::parse(raw_beacon).unwrap();
        assert!(rest.is_empty());
        assert_eq!(header.command, command::RSRV_IS_UP);
        assert_eq!(header.data_type, 13);
        assert_eq!(header.data_count, 37426);
        assert_eq!(header.parameter_1, 450270);
        assert_eq!(
            Ipv4Addr::from(header.parameter_2),
            "172.23.124.207".parse::<Ipv4Addr>().unwrap()
        );
        let mut writer = Vec::new();
        header.write(&mut writer).unwrap();
        assert_eq!(writer, raw_beacon);
    }

    #[test]
    fn incomplete_header_is_not_an_error() {
        let raw = b"\x00\x0d\x00\x00\x00\x0d\x92\x32";
        assert!(matches!(Header::parse(raw), Err(nom::Err::Incomplete(_))));
        // Extended header needs all 24 bytes
        let raw = b"\x00\x01\xff\xff\x00\x06\x00\x00\x00\x00\x00\x01\x00\x00\x00\x02\x00\x01";
        assert!(matches!(Header::parse(raw), Err(nom::Err::Incomplete(_))));
    }

    #[test]
    fn extended_header_used_for_large_counts() {
        let header = Header {
            command: command::EVENT_ADD,
            payload_size: 0x10000,
            data_type: 6,
            data_count: 0x2000,
            parameter_1: 1,
            parameter_2: 2,
            ..Default::default()
        };
        assert!(header.is_extended());
        let mut raw = Vec::new();
        header.write(&mut raw).unwrap();
        assert_eq!(raw.len(), CA_EXTENDED_MESSAGE_HEADER_SIZE);
        assert_eq!(&raw[2..4], &[0xFF, 0xFF]);
        assert_eq!(&raw[6..8], &[0x00, 0x00]);
        let (_, parsed) = Header::parse(&raw).unwrap();
        assert_eq!(
            parsed,
            Header {
                extended: true,
                ..header
            }
        );

        // Element count alone can force the extended form
        let header = Header {
            data_count: 0x10000,
            ..Default::default()
        };
        assert_eq!(header.encoded_len(), CA_EXTENDED_MESSAGE_HEADER_SIZE);
    }

    #[test]
    fn frame_length_follows_form_on_the_wire() {
        // Standard header whose element count is exactly 0xFFFF
        let mut wire = b"\x00\x0f\x00\x08\x00\x06\xff\xff\x00\x00\x00\x01\x00\x00\x00\x02".to_vec();
        wire.extend_from_slice(&[1; 8]);
        let (rest, header) = Header::parse(&wire).unwrap();
        assert_eq!(rest.len(), 8);
        assert!(!header.is_extended());
        assert_eq!(header.data_count, 0xFFFF);
        assert_eq!(header.encoded_len(), CA_MESSAGE_HEADER_SIZE);
        assert_eq!(header.frame_len(), wire.len());
        let mut rewritten = Vec::new();
        header.write(&mut rewritten).unwrap();
        assert_eq!(rewritten, &wire[..CA_MESSAGE_HEADER_SIZE]);

        // Extended header carrying values that would fit the standard form
        let mut wire = b"\x00\x0f\xff\xff\x00\x06\x00\x00\x00\x00\x00\x01\x00\x00\x00\x02".to_vec();
        wire.extend_from_slice(&8u32.to_be_bytes());
        wire.extend_from_slice(&1u32.to_be_bytes());
        wire.extend_from_slice(&[2; 8]);
        let (rest, header) = Header::parse(&wire).unwrap();
        assert_eq!(rest.len(), 8);
        assert!(header.is_extended());
        assert_eq!(header.payload_size, 8);
        assert_eq!(header.data_count, 1);
        assert_eq!(header.encoded_len(), CA_EXTENDED_MESSAGE_HEADER_SIZE);
        assert_eq!(header.frame_len(), wire.len());
        let mut rewritten = Vec::new();
        header.write(&mut rewritten).unwrap();
        assert_eq!(rewritten, &wire[..CA_EXTENDED_MESSAGE_HEADER_SIZE]);
    }

    #[test]
    fn parse_version() {
        let raw = b"\x00\x00\x00\x00\x00\x01\x00\x0d\x00\x00\x00\x00\x00\x00\x00\x00";
        let (_, ver) = Version::parse(raw).unwrap();
        assert_eq!(ver.priority, 1);
        assert_eq!(ver.protocol_version, 13);
        assert_eq!(ver.as_bytes(), raw);
    }

    #[test]
    fn parse_search() {
        let raw = b"\x00\x06\x00 \x00\x05\x00\r\x00\x00\x00\x01\x00\x00\x00\x01ME02P-MO-ALIGN-01:Z:TEMPAAAAAAA\x00";
        let (_, search) = Search::parse(raw).unwrap();
        assert_eq!(search.channel_name, "ME02P-MO-ALIGN-01:Z:TEMPAAAAAAA");
        assert!(!search.should_reply);
        assert_eq!(search.search_id, 1);
        assert_eq!(search.as_bytes(), raw);
        // Check parsing something that isn't a search
        let raw = b"\x00\x00\x00\x00\x00\x05\x00\r\x00\x00\x00\x01\x00\x00\x00\x00";
        assert!(Search::parse(raw).is_err());
    }

    #[test]
    fn search_names_are_zero_terminated_and_aligned() {
        let search = Search {
            search_id: 7,
            channel_name: "ABCDEFGH".to_string(),
            ..Default::default()
        };
        let bytes = search.as_bytes();
        // 8 characters need a terminator, so 16 bytes of payload
        assert_eq!(bytes.len(), CA_MESSAGE_HEADER_SIZE + 16);
        assert_eq!(search.encoded_len(), bytes.len());
        assert_eq!(bytes[CA_MESSAGE_HEADER_SIZE + 8], 0);

        let mut packet = Version::default().as_bytes();
        packet.extend(search.as_bytes());
        packet.extend(
            Search {
                search_id: 8,
                channel_name: "some".to_string(),
                ..Default::default()
            }
            .as_bytes(),
        );
        let searches = parse_search_packet(&packet).unwrap();
        assert_eq!(searches.len(), 2);
        assert_eq!(searches[0].channel_name, "ABCDEFGH");
        assert_eq!(searches[1].search_id, 8);
    }

    #[test]
    fn event_add_payload_carries_mask() {
        let bytes = EventAdd {
            data_type: 6,
            data_count: 1,
            server_id: 3,
            subscription_id: 4,
            mask: MonitorMask::default(),
        }
        .as_bytes();
        assert_eq!(bytes.len(), CA_MESSAGE_HEADER_SIZE + 16);
        assert_eq!(&bytes[28..30], &[0x00, 0x05]);
    }
}
