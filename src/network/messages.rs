use std::net::{SocketAddr, SocketAddrV4};

use crate::frame_info::{EventBatch, GameEvent, GameEventKind};
use crate::network::codec::{CodecError, CodecResult, PayloadReader, PayloadWriter};

/// Every kind of message the mesh protocol knows, with its wire code.
///
/// `Client*` messages travel from a joiner to the host, `Server*` messages from the host to
/// joiners, and `Peer*` messages directly between any two participants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    /// A joiner asks the host to be admitted.
    ClientJoinRequest,
    /// A joiner's chat line, for the host to relay.
    ClientChat,
    /// Host name and current roster, sent to a newly admitted joiner.
    ServerGameInformation,
    /// The host refused a join request.
    ServerConnectionDenied,
    /// A chat line relayed by the host.
    ServerChat,
    /// A new participant was admitted.
    ServerPlayerJoined,
    /// A participant was kicked.
    ServerPlayerKicked,
    /// The game starts with the enclosed seed.
    ServerStartGame,
    /// Direct handshake between two participants.
    PeerConnect,
    /// A chat line sent directly to one participant.
    PeerChat,
    /// One lockstep batch, or opaque application data.
    PeerGameData,
}

impl MessageKind {
    /// All kinds in code order.
    pub const ALL: [MessageKind; 11] = [
        MessageKind::ClientJoinRequest,
        MessageKind::ClientChat,
        MessageKind::ServerGameInformation,
        MessageKind::ServerConnectionDenied,
        MessageKind::ServerChat,
        MessageKind::ServerPlayerJoined,
        MessageKind::ServerPlayerKicked,
        MessageKind::ServerStartGame,
        MessageKind::PeerConnect,
        MessageKind::PeerChat,
        MessageKind::PeerGameData,
    ];

    /// The code written into the frame header.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            MessageKind::ClientJoinRequest => 0,
            MessageKind::ClientChat => 1,
            MessageKind::ServerGameInformation => 2,
            MessageKind::ServerConnectionDenied => 3,
            MessageKind::ServerChat => 4,
            MessageKind::ServerPlayerJoined => 5,
            MessageKind::ServerPlayerKicked => 6,
            MessageKind::ServerStartGame => 7,
            MessageKind::PeerConnect => 8,
            MessageKind::PeerChat => 9,
            MessageKind::PeerGameData => 10,
        }
    }

    /// Whether only the host may send this kind.
    #[must_use]
    pub const fn is_server_message(self) -> bool {
        matches!(
            self,
            MessageKind::ServerGameInformation
                | MessageKind::ServerConnectionDenied
                | MessageKind::ServerChat
                | MessageKind::ServerPlayerJoined
                | MessageKind::ServerPlayerKicked
                | MessageKind::ServerStartGame
        )
    }
}

impl TryFrom<u16> for MessageKind {
    type Error = CodecError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .ok_or(CodecError::UnknownKind { code })
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One protocol unit as it comes off the wire.
///
/// `sender` is never transmitted; the receiving [`Peer`](crate::network::peer::Peer) fills it in.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Transport address the message arrived from.
    pub sender: Option<SocketAddr>,
    /// What the payload means.
    pub kind: MessageKind,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a message with no sender attached.
    #[must_use]
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            sender: None,
            kind,
            payload,
        }
    }

    /// Builds a message from a typed payload.
    pub fn from_payload<P: Payload>(payload: &P) -> CodecResult<Self> {
        let mut writer = PayloadWriter::new();
        payload.write(&mut writer)?;
        Ok(Self::new(P::KIND, writer.into_bytes()))
    }

    /// Parses the payload as `P`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownKind`] when the message is of a different kind than `P`, or
    /// the reader's error when the payload is malformed.
    pub fn parse<P: Payload>(&self) -> CodecResult<P> {
        if self.kind != P::KIND {
            return Err(CodecError::UnknownKind {
                code: self.kind.code(),
            });
        }
        P::read(&mut PayloadReader::new(&self.payload))
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Destructure to ensure all fields are included when new fields are added.
        let Self {
            sender,
            kind,
            payload,
        } = self;

        f.debug_struct("Message")
            .field("sender", sender)
            .field("kind", kind)
            .field("payload", &BytesDebug(payload))
            .finish()
    }
}

struct BytesDebug<'a>(&'a [u8]);

impl std::fmt::Debug for BytesDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A typed message payload with a fixed [`MessageKind`].
pub trait Payload: Sized {
    /// The kind this payload travels as.
    const KIND: MessageKind;

    /// Appends the payload's fields.
    fn write(&self, writer: &mut PayloadWriter) -> CodecResult<()>;

    /// Reads the payload's fields. Fixed-layout payloads reject trailing bytes.
    fn read(reader: &mut PayloadReader<'_>) -> CodecResult<Self>;
}

/// Name and reachable address of one participant, as carried in roster messages.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerRecord {
    /// Display name, unique within a session.
    pub name: String,
    /// Address of the participant's listening endpoint.
    pub addr: SocketAddrV4,
}

impl PeerRecord {
    pub(crate) fn write(&self, writer: &mut PayloadWriter) -> CodecResult<()> {
        writer.write_short_str(&self.name)?;
        writer.write_ipv4(*self.addr.ip());
        writer.write_u16(self.addr.port())
    }

    pub(crate) fn read(reader: &mut PayloadReader<'_>) -> CodecResult<Self> {
        let name = reader.read_short_str()?;
        let ip = reader.read_ipv4()?;
        let port = reader.read_u16()?;
        Ok(Self {
            name,
            addr: SocketAddrV4::new(ip, port),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct JoinRequest {
    pub protocol_version: u16,
    pub callback_port: u16,
    pub username: String,
    pub client_tag: String,
}

impl Payload for JoinRequest {
    const KIND: MessageKind = MessageKind::ClientJoinRequest;

    fn write(&self, writer: &mut PayloadWriter) -> CodecResult<()> {
        writer.write_u16(self.protocol_version)?;
        writer.write_u16(self.callback_port)?;
        writer.write_short_str(&self.username)?;
        writer.write_short_str(&self.client_tag)
    }

    fn read(reader: &mut PayloadReader<'_>) -> CodecResult<Self> {
        let protocol_version = reader.read_u16()?;
        let callback_port = reader.read_u16()?;
        let username = reader.read_short_str()?;
        let client_tag = reader.read_short_str()?;
        reader.finish()?;
        Ok(Self {
            protocol_version,
            callback_port,
            username,
            client_tag,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ClientChat {
    pub text: String,
}

impl Payload for ClientChat {
    const KIND: MessageKind = MessageKind::ClientChat;

    fn write(&self, writer: &mut PayloadWriter) -> CodecResult<()> {
        writer.write_rest(self.text.as_bytes());
        Ok(())
    }

    fn read(reader: &mut PayloadReader<'_>) -> CodecResult<Self> {
        Ok(Self {
            text: reader.read_rest_str()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct GameInformation {
    pub host_name: String,
    pub roster: Vec<PeerRecord>,
}

impl Payload for GameInformation {
    const KIND: MessageKind = MessageKind::ServerGameInformation;

    fn write(&self, writer: &mut PayloadWriter) -> CodecResult<()> {
        writer.write_short_str(&self.host_name)?;
        let count = i32::try_from(self.roster.len()).map_err(|_err| CodecError::InvalidCount {
            count: i32::MAX,
        })?;
        writer.write_i32(count)?;
        for record in &self.roster {
            record.write(writer)?;
        }
        Ok(())
    }

    fn read(reader: &mut PayloadReader<'_>) -> CodecResult<Self> {
        let host_name = reader.read_short_str()?;
        let count = reader.read_i32()?;
        let count = usize::try_from(count).map_err(|_err| CodecError::InvalidCount { count })?;
        // Each record is at least 7 bytes; cap the preallocation by what is actually there.
        let mut roster = Vec::with_capacity(count.min(reader.remaining() / 7));
        for _ in 0..count {
            roster.push(PeerRecord::read(reader)?);
        }
        reader.finish()?;
        Ok(Self { host_name, roster })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ConnectionDenied {
    pub reason: String,
}

impl Payload for ConnectionDenied {
    const KIND: MessageKind = MessageKind::ServerConnectionDenied;

    fn write(&self, writer: &mut PayloadWriter) -> CodecResult<()> {
        writer.write_short_str(&self.reason)
    }

    fn read(reader: &mut PayloadReader<'_>) -> CodecResult<Self> {
        let reason = reader.read_short_str()?;
        reader.finish()?;
        Ok(Self { reason })
    }
}

/// Chat line with its author, used for both relayed and direct chat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ChatLine {
    pub username: String,
    pub text: String,
}

impl ChatLine {
    fn write_fields(&self, writer: &mut PayloadWriter) -> CodecResult<()> {
        writer.write_short_str(&self.username)?;
        writer.write_rest(self.text.as_bytes());
        Ok(())
    }

    fn read_fields(reader: &mut PayloadReader<'_>) -> CodecResult<Self> {
        let username = reader.read_short_str()?;
        let text = reader.read_rest_str()?;
        Ok(Self { username, text })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ServerChat(pub ChatLine);

impl Payload for ServerChat {
    const KIND: MessageKind = MessageKind::ServerChat;

    fn write(&self, writer: &mut PayloadWriter) -> CodecResult<()> {
        self.0.write_fields(writer)
    }

    fn read(reader: &mut PayloadReader<'_>) -> CodecResult<Self> {
        ChatLine::read_fields(reader).map(Self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PeerChat(pub ChatLine);

impl Payload for PeerChat {
    const KIND: MessageKind = MessageKind::PeerChat;

    fn write(&self, writer: &mut PayloadWriter) -> CodecResult<()> {
        self.0.write_fields(writer)
    }

    fn read(reader: &mut PayloadReader<'_>) -> CodecResult<Self> {
        ChatLine::read_fields(reader).map(Self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PlayerJoined {
    pub record: PeerRecord,
}

impl Payload for PlayerJoined {
    const KIND: MessageKind = MessageKind::ServerPlayerJoined;

    fn write(&self, writer: &mut PayloadWriter) -> CodecResult<()> {
        self.record.write(writer)
    }

    fn read(reader: &mut PayloadReader<'_>) -> CodecResult<Self> {
        let record = PeerRecord::read(reader)?;
        reader.finish()?;
        Ok(Self { record })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PlayerKicked {
    pub username: String,
}

impl Payload for PlayerKicked {
    const KIND: MessageKind = MessageKind::ServerPlayerKicked;

    fn write(&self, writer: &mut PayloadWriter) -> CodecResult<()> {
        writer.write_short_str(&self.username)
    }

    fn read(reader: &mut PayloadReader<'_>) -> CodecResult<Self> {
        let username = reader.read_short_str()?;
        reader.finish()?;
        Ok(Self { username })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct StartGame {
    pub seed: i32,
}

impl Payload for StartGame {
    const KIND: MessageKind = MessageKind::ServerStartGame;

    fn write(&self, writer: &mut PayloadWriter) -> CodecResult<()> {
        writer.write_i32(self.seed)
    }

    fn read(reader: &mut PayloadReader<'_>) -> CodecResult<Self> {
        let seed = reader.read_i32()?;
        reader.finish()?;
        Ok(Self { seed })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PeerConnect {
    pub username: String,
    pub listen_port: u16,
}

impl Payload for PeerConnect {
    const KIND: MessageKind = MessageKind::PeerConnect;

    fn write(&self, writer: &mut PayloadWriter) -> CodecResult<()> {
        writer.write_short_str(&self.username)?;
        writer.write_u16(self.listen_port)
    }

    fn read(reader: &mut PayloadReader<'_>) -> CodecResult<Self> {
        let username = reader.read_short_str()?;
        let listen_port = reader.read_u16()?;
        reader.finish()?;
        Ok(Self {
            username,
            listen_port,
        })
    }
}

/// One lockstep batch: `count: i32` followed by `(kind: i32, value: i32)` pairs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct GameData {
    pub events: EventBatch,
}

impl Payload for GameData {
    const KIND: MessageKind = MessageKind::PeerGameData;

    fn write(&self, writer: &mut PayloadWriter) -> CodecResult<()> {
        let count = i32::try_from(self.events.len()).map_err(|_err| CodecError::InvalidCount {
            count: i32::MAX,
        })?;
        writer.write_i32(count)?;
        for event in &self.events {
            writer.write_i32(event.kind.code())?;
            writer.write_i32(event.value)?;
        }
        Ok(())
    }

    fn read(reader: &mut PayloadReader<'_>) -> CodecResult<Self> {
        let count = reader.read_i32()?;
        let count = usize::try_from(count).map_err(|_err| CodecError::InvalidCount { count })?;
        let mut events = EventBatch::with_capacity(count.min(reader.remaining() / 8));
        for _ in 0..count {
            let code = reader.read_i32()?;
            let kind = GameEventKind::try_from(code)?;
            let value = reader.read_i32()?;
            events.push(GameEvent { kind, value });
        }
        reader.finish()?;
        Ok(Self { events })
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn record(name: &str, port: u16) -> PeerRecord {
        PeerRecord {
            name: name.to_owned(),
            addr: SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), port),
        }
    }

    #[test]
    fn kind_codes_are_stable_and_dense() {
        for (index, kind) in MessageKind::ALL.iter().enumerate() {
            assert_eq!(kind.code() as usize, index);
            assert_eq!(MessageKind::try_from(kind.code()).unwrap(), *kind);
        }
        assert_eq!(
            MessageKind::try_from(11),
            Err(CodecError::UnknownKind { code: 11 })
        );
    }

    #[test]
    fn only_server_kinds_are_server_messages() {
        assert!(MessageKind::ServerStartGame.is_server_message());
        assert!(MessageKind::ServerConnectionDenied.is_server_message());
        assert!(!MessageKind::ClientJoinRequest.is_server_message());
        assert!(!MessageKind::PeerGameData.is_server_message());
    }

    #[test]
    fn peer_record_layout() {
        let mut writer = PayloadWriter::new();
        record("bob", 0x1234).write(&mut writer).unwrap();
        let bytes = writer.into_bytes();
        assert_eq!(bytes, vec![3, b'b', b'o', b'b', 192, 168, 1, 20, 0x34, 0x12]);
    }

    #[test]
    fn game_information_roundtrip() {
        let info = GameInformation {
            host_name: "host".to_owned(),
            roster: vec![record("alice", 4000), record("bob", 4001)],
        };
        let message = Message::from_payload(&info).unwrap();
        assert_eq!(message.kind, MessageKind::ServerGameInformation);
        assert_eq!(message.parse::<GameInformation>().unwrap(), info);
    }

    #[test]
    fn game_information_with_lying_count_is_truncated() {
        let mut writer = PayloadWriter::new();
        writer.write_short_str("host").unwrap();
        writer.write_i32(1_000_000).unwrap();
        let message = Message::new(MessageKind::ServerGameInformation, writer.into_bytes());
        assert!(matches!(
            message.parse::<GameInformation>(),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn join_request_rejects_trailing_bytes() {
        let request = JoinRequest {
            protocol_version: 1,
            callback_port: 5000,
            username: "carol".to_owned(),
            client_tag: "test".to_owned(),
        };
        let mut message = Message::from_payload(&request).unwrap();
        assert_eq!(message.parse::<JoinRequest>().unwrap(), request);

        message.payload.push(0);
        assert_eq!(
            message.parse::<JoinRequest>(),
            Err(CodecError::TrailingBytes { count: 1 })
        );
    }

    #[test]
    fn chat_text_is_the_rest_of_the_payload() {
        let line = ServerChat(ChatLine {
            username: "dave".to_owned(),
            text: "hello, mesh".to_owned(),
        });
        let message = Message::from_payload(&line).unwrap();
        assert_eq!(&message.payload[5..], b"hello, mesh");
        assert_eq!(message.parse::<ServerChat>().unwrap(), line);

        let client = Message::from_payload(&ClientChat {
            text: "raw".to_owned(),
        })
        .unwrap();
        assert_eq!(client.payload, b"raw");
    }

    #[test]
    fn parse_checks_the_kind() {
        let message = Message::from_payload(&StartGame { seed: 42 }).unwrap();
        assert!(message.parse::<PlayerKicked>().is_err());
        assert_eq!(message.parse::<StartGame>().unwrap().seed, 42);
    }

    #[test]
    fn game_data_layout() {
        let mut events = EventBatch::new();
        events.push(GameEvent::state(42));
        events.push(GameEvent::delta(-1));
        let message = Message::from_payload(&GameData { events }).unwrap();

        let mut expected = Vec::new();
        for word in [2i32, 0, 42, 1, -1] {
            expected.extend_from_slice(&word.to_le_bytes());
        }
        assert_eq!(message.payload, expected);
    }

    #[test]
    fn game_data_rejects_unknown_event_kind() {
        let mut payload = Vec::new();
        for word in [1i32, 5, 0] {
            payload.extend_from_slice(&word.to_le_bytes());
        }
        let message = Message::new(MessageKind::PeerGameData, payload);
        assert_eq!(
            message.parse::<GameData>(),
            Err(CodecError::UnknownEventKind { code: 5 })
        );
    }

    #[test]
    fn game_data_rejects_negative_count() {
        let message = Message::new(MessageKind::PeerGameData, (-1i32).to_le_bytes().to_vec());
        assert_eq!(
            message.parse::<GameData>(),
            Err(CodecError::InvalidCount { count: -1 })
        );
    }

    #[test]
    fn debug_prints_payload_as_hex() {
        let message = Message::new(MessageKind::ClientChat, vec![0xde, 0xad]);
        let debug = format!("{message:?}");
        assert!(debug.contains("0xdead"));
        assert!(debug.contains("ClientChat"));
    }
}
