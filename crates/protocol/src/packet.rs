//! Packet value type and the newline-delimited wire codec.
//!
//! Every message exchanged between devices is a [`Packet`]: a typed,
//! immutable value with an ordered JSON body. On the wire a packet is a
//! single line of JSON terminated by `\n`. JSON string escaping guarantees
//! the delimiter cannot appear inside a serialized packet; the encoder
//! still refuses to emit a frame containing a raw newline.
//!
//! Unknown body keys survive a decode/encode round trip untouched, which
//! is what keeps old devices interoperable with newer capability versions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ProtocolError, Result};

/// Current protocol version, advertised in identity packets.
pub const PROTOCOL_VERSION: u8 = 3;

/// Packet type carrying a device's identity announcement.
pub const PACKET_TYPE_IDENTITY: &str = "tether.identity";

/// Packet type carrying a pairing request or response.
pub const PACKET_TYPE_PAIR: &str = "tether.pair";

/// Packet type for the built-in ping capability.
pub const PACKET_TYPE_PING: &str = "tether.ping";

/// Address information for the payload channel accompanying a packet.
///
/// The sender opens a listening socket and advertises its port here; the
/// receiver connects to `<packet source address>:<port>` to pull the
/// payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadTransferInfo {
    /// TCP port the payload channel listens on.
    pub port: u16,
}

/// A single protocol packet.
///
/// Packets are immutable values: once constructed, fields never change.
/// Anything that looks like an update constructs a fresh packet from
/// current state at send time. Packets are not retained as mutable state
/// after dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// The packet type tag, e.g. `tether.ping`. Determines which
    /// capability handler receives the packet.
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Unique-per-sender packet id, milliseconds since the Unix epoch.
    pub id: i64,

    /// Ordered mapping of body keys to values. Unknown keys are preserved
    /// opaquely for forward compatibility.
    pub body: Map<String, Value>,

    /// Size in bytes of the binary payload accompanying this packet, if
    /// any.
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none", default)]
    pub payload_size: Option<u64>,

    /// Payload channel address, present iff `payload_size` is.
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub payload_transfer_info: Option<PayloadTransferInfo>,
}

impl Packet {
    /// Creates a new packet of the given type with the given body.
    ///
    /// The id is the current wall-clock time in milliseconds.
    pub fn new(packet_type: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            packet_type: packet_type.into(),
            id: current_millis(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Creates a packet with an explicit id. Used by tests and by decode.
    pub fn with_id(packet_type: impl Into<String>, id: i64, body: Map<String, Value>) -> Self {
        Self {
            packet_type: packet_type.into(),
            id,
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Returns a copy of this packet annotated with a payload reference.
    pub fn with_payload(mut self, size: u64, info: PayloadTransferInfo) -> Self {
        self.payload_size = Some(size);
        self.payload_transfer_info = Some(info);
        self
    }

    /// Returns true if this packet announces a device identity.
    pub fn is_identity(&self) -> bool {
        self.packet_type == PACKET_TYPE_IDENTITY
    }

    /// Returns true if this packet belongs to the pairing exchange.
    pub fn is_pair(&self) -> bool {
        self.packet_type == PACKET_TYPE_PAIR
    }

    /// Returns true if this packet references a binary payload.
    pub fn has_payload(&self) -> bool {
        self.payload_size.is_some() && self.payload_transfer_info.is_some()
    }

    /// Fetches a string body field, if present and a string.
    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Fetches a boolean body field, if present and a boolean.
    pub fn body_bool(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(Value::as_bool)
    }
}

fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Encoder and decoder for the newline-delimited packet format.
///
/// The codec is stateless; a decode failure never touches caller state.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketCodec;

impl PacketCodec {
    /// Creates a new packet codec.
    pub fn new() -> Self {
        Self
    }

    /// Encodes a packet as one newline-terminated JSON line.
    ///
    /// Fails with [`ProtocolError::Serialization`] if the serialized form
    /// would contain a raw newline, which would corrupt the framing.
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>> {
        let mut bytes =
            serde_json::to_vec(packet).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if bytes.contains(&b'\n') {
            return Err(ProtocolError::Serialization(
                "serialized packet contains raw newline".to_string(),
            ));
        }
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Decodes one packet from a frame.
    ///
    /// Accepts the frame with or without its trailing newline. Fails with
    /// [`ProtocolError::MalformedPacket`] on invalid JSON, a non-object
    /// top level, or missing/mistyped required fields; truncated input is
    /// malformed, not a partial success.
    pub fn decode(&self, frame: &[u8]) -> Result<Packet> {
        let frame = match frame.split_last() {
            Some((b'\n', rest)) => rest,
            _ => frame,
        };
        if frame.is_empty() {
            return Err(ProtocolError::MalformedPacket("empty frame".to_string()));
        }
        let packet: Packet = serde_json::from_slice(frame)
            .map_err(|e| ProtocolError::MalformedPacket(e.to_string()))?;
        if packet.packet_type.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "empty packet type".to_string(),
            ));
        }
        // A payload reference is only meaningful with both halves present.
        if packet.payload_size.is_some() != packet.payload_transfer_info.is_some() {
            return Err(ProtocolError::MalformedPacket(
                "payloadSize and payloadTransferInfo must appear together".to_string(),
            ));
        }
        Ok(packet)
    }
}

/// Device class advertised in identity packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Phone,
    #[default]
    Desktop,
    Tablet,
    Tv,
    Laptop,
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceClass::Phone => "phone",
            DeviceClass::Desktop => "desktop",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Tv => "tv",
            DeviceClass::Laptop => "laptop",
        };
        f.write_str(s)
    }
}

/// Structured body of a `tether.identity` packet.
///
/// Broadcast in the clear on the discovery channel and sent as the first
/// packet on a fresh control connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityBody {
    /// Stable opaque device id.
    #[serde(rename = "deviceId")]
    pub device_id: String,
    /// Human-readable device name.
    #[serde(rename = "deviceName")]
    pub device_name: String,
    /// Device class (phone, desktop, ...).
    #[serde(rename = "deviceType")]
    pub device_class: DeviceClass,
    /// Protocol version this device speaks.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u8,
    /// Packet types this device can receive.
    #[serde(rename = "incomingCapabilities")]
    pub incoming_capabilities: Vec<String>,
    /// Packet types this device can send.
    #[serde(rename = "outgoingCapabilities")]
    pub outgoing_capabilities: Vec<String>,
    /// TCP port this device accepts control connections on.
    #[serde(rename = "tcpPort")]
    pub tcp_port: u16,
}

impl IdentityBody {
    /// Builds a fresh identity packet from this body.
    ///
    /// A new packet is constructed on every call; identity packets are
    /// never reused across sends.
    pub fn to_packet(&self) -> Result<Packet> {
        let value =
            serde_json::to_value(self).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        match value {
            Value::Object(body) => Ok(Packet::new(PACKET_TYPE_IDENTITY, body)),
            _ => Err(ProtocolError::Serialization(
                "identity body did not serialize to an object".to_string(),
            )),
        }
    }

    /// Parses an identity body out of a packet, which must be of type
    /// `tether.identity`.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_identity() {
            return Err(ProtocolError::MalformedPacket(format!(
                "expected {PACKET_TYPE_IDENTITY}, got {}",
                packet.packet_type
            )));
        }
        serde_json::from_value(Value::Object(packet.body.clone()))
            .map_err(|e| ProtocolError::MalformedPacket(e.to_string()))
    }
}

/// Structured body of a `tether.pair` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairBody {
    /// True for a pairing request or acceptance, false for a rejection or
    /// unpair.
    pub pair: bool,
}

impl PairBody {
    /// Builds a fresh pair packet from this body.
    pub fn to_packet(&self) -> Result<Packet> {
        let value =
            serde_json::to_value(self).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        match value {
            Value::Object(body) => Ok(Packet::new(PACKET_TYPE_PAIR, body)),
            _ => Err(ProtocolError::Serialization(
                "pair body did not serialize to an object".to_string(),
            )),
        }
    }

    /// Parses a pair body out of a packet.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_pair() {
            return Err(ProtocolError::MalformedPacket(format!(
                "expected {PACKET_TYPE_PAIR}, got {}",
                packet.packet_type
            )));
        }
        serde_json::from_value(Value::Object(packet.body.clone()))
            .map_err(|e| ProtocolError::MalformedPacket(e.to_string()))
    }
}
