//! NSB wire protocol: message sections, operation codes and version.

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Current protocol version. First byte of every encoded message (see wire module).
pub const PROTOCOL_VERSION: u8 = 1;

/// What a message asks for (or answers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Init,
    Ping,
    Exit,
    Send,
    Receive,
    Fetch,
    Post,
    /// Unsolicited delivery from the daemon in PUSH mode.
    Forward,
}

/// Which party produced a message. The daemon routes replies by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Originator {
    AppClient,
    SimClient,
    Daemon,
}

/// SUCCESS/FAILURE answer control operations; MESSAGE/NO_MESSAGE say whether a payload was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    Failure,
    Message,
    NoMessage,
}

/// Header present on every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub operation: Operation,
    pub originator: Originator,
    pub result_code: ResultCode,
}

/// Addressing scheme for source/destination identifiers. Only string identifiers exist today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    #[default]
    Str,
}

/// Routing information for SEND/RECEIVE/FETCH/POST.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub address_type: AddressType,
    pub source_id: Option<String>,
    pub destination_id: Option<String>,
    /// True byte length of the logical payload, also when only a store key travels inline.
    pub payload_size: u64,
}

/// Self-description a client sends with INIT so the daemon can register its channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intro {
    pub identifier: String,
    pub address: String,
    pub ctrl_port: u16,
    pub send_port: u16,
    pub recv_port: u16,
}

/// PULL: clients request deliveries. PUSH: the daemon forwards them unsolicited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemMode {
    #[default]
    Pull,
    Push,
}

/// Configuration the daemon returns in its INIT response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigParams {
    pub system_mode: SystemMode,
    pub use_external_store: bool,
    pub store_address: String,
    pub store_port: u16,
    pub store_index: u32,
}

/// Either the payload bytes themselves or the key of a payload held in the external store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Inline(Vec<u8>),
    Key(String),
}

/// One protocol message. Sections other than the manifest are present only for the operations that need them.
/// Encoded section by section (see wire module), not as one serde value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub manifest: Manifest,
    pub metadata: Option<Metadata>,
    pub intro: Option<Intro>,
    pub config: Option<ConfigParams>,
    pub payload: Option<Payload>,
}

impl Message {
    /// Manifest-only message.
    pub fn new(operation: Operation, originator: Originator, result_code: ResultCode) -> Self {
        Self {
            manifest: Manifest {
                operation,
                originator,
                result_code,
            },
            metadata: None,
            intro: None,
            config: None,
            payload: None,
        }
    }

    pub fn init(originator: Originator, intro: Intro) -> Self {
        let mut msg = Self::new(Operation::Init, originator, ResultCode::Success);
        msg.intro = Some(intro);
        msg
    }

    /// Daemon answer to INIT.
    pub fn init_response(result_code: ResultCode, config: ConfigParams) -> Self {
        let mut msg = Self::new(Operation::Init, Originator::Daemon, result_code);
        msg.config = Some(config);
        msg
    }

    pub fn ping(originator: Originator) -> Self {
        Self::new(Operation::Ping, originator, ResultCode::Success)
    }

    pub fn exit(originator: Originator) -> Self {
        Self::new(Operation::Exit, originator, ResultCode::Success)
    }

    /// Outbound payload from an application client.
    pub fn send(
        originator: Originator,
        source_id: &str,
        destination_id: &str,
        payload: Payload,
        payload_size: u64,
    ) -> Self {
        let mut msg = Self::new(Operation::Send, originator, ResultCode::Message);
        msg.metadata = Some(Metadata {
            address_type: AddressType::Str,
            source_id: Some(source_id.to_string()),
            destination_id: Some(destination_id.to_string()),
            payload_size,
        });
        msg.payload = Some(payload);
        msg
    }

    /// PULL-mode request for a payload addressed to `destination_id`.
    pub fn receive_request(originator: Originator, destination_id: &str) -> Self {
        let mut msg = Self::new(Operation::Receive, originator, ResultCode::Success);
        msg.metadata = Some(Metadata {
            destination_id: Some(destination_id.to_string()),
            ..Metadata::default()
        });
        msg
    }

    /// PULL-mode request for the next payload to simulate, optionally only from `source_id`.
    pub fn fetch_request(originator: Originator, source_id: Option<&str>) -> Self {
        let mut msg = Self::new(Operation::Fetch, originator, ResultCode::Success);
        if let Some(src) = source_id {
            msg.metadata = Some(Metadata {
                source_id: Some(src.to_string()),
                ..Metadata::default()
            });
        }
        msg
    }

    /// Simulator hand-back. A dropped payload (`success == false`) keeps its metadata but carries no payload.
    pub fn post(
        originator: Originator,
        source_id: &str,
        destination_id: &str,
        payload: Payload,
        payload_size: u64,
        success: bool,
    ) -> Self {
        let code = if success {
            ResultCode::Message
        } else {
            ResultCode::NoMessage
        };
        let mut msg = Self::new(Operation::Post, originator, code);
        msg.metadata = Some(Metadata {
            address_type: AddressType::Str,
            source_id: Some(source_id.to_string()),
            destination_id: Some(destination_id.to_string()),
            payload_size,
        });
        if success {
            msg.payload = Some(payload);
        }
        msg
    }

    pub fn operation(&self) -> Operation {
        self.manifest.operation
    }

    pub fn result_code(&self) -> ResultCode {
        self.manifest.result_code
    }

    /// Inline payload bytes, if the message carries them.
    pub fn payload_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Some(Payload::Inline(bytes)) => Some(bytes),
            _ => None,
        }
    }

    /// Store key, if the message carries a reference instead of bytes.
    pub fn payload_key(&self) -> Option<&str> {
        match &self.payload {
            Some(Payload::Key(key)) => Some(key),
            _ => None,
        }
    }

    pub fn source_id(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.source_id.as_deref())
    }

    pub fn destination_id(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.destination_id.as_deref())
    }

    pub fn payload_size(&self) -> u64 {
        self.metadata.as_ref().map(|m| m.payload_size).unwrap_or(0)
    }

    /// Structural checks applied to every decoded message.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.manifest.result_code == ResultCode::NoMessage && self.payload.is_some() {
            return Err(ProtocolError::Invalid("NO_MESSAGE carries a payload"));
        }
        if self.manifest.operation != Operation::Init
            && (self.intro.is_some() || self.config.is_some())
        {
            return Err(ProtocolError::Invalid("intro/config outside INIT"));
        }
        Ok(())
    }
}
