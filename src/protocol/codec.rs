//! Type-named envelope codec.

use prost::Message;

use super::messages::{
    ConnectionHandshake, ConnectionMessage, ErrorMessage, GoToProcessState, ProcessStateUpdate,
    ResumeProcess, SetConfig,
};

/// Malformed bytes that could not be turned into an [`Envelope`].
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Empty envelope")]
    Empty,

    #[error("Envelope truncated: type name needs {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Type name is not valid UTF-8")]
    InvalidTypeName,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
}

/// One decoded management message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    SetConfig(SetConfig),
    ProcessStateUpdate(ProcessStateUpdate),
    GoToProcessState(GoToProcessState),
    ResumeProcess(ResumeProcess),
    ConnectionMessage(ConnectionMessage),
    ConnectionHandshake(ConnectionHandshake),
    ErrorMessage(ErrorMessage),
}

/// Implements the envelope plumbing for each message type.
macro_rules! envelope_messages {
    ($($variant:ident),* $(,)?) => {
        impl Envelope {
            /// Wire name of the contained message type.
            pub fn type_name(&self) -> &'static str {
                match self {
                    $(Envelope::$variant(_) => stringify!($variant),)*
                }
            }

            fn encode_body(&self) -> Vec<u8> {
                match self {
                    $(Envelope::$variant(m) => m.encode_to_vec(),)*
                }
            }

            fn decode_body(type_name: &str, body: &[u8]) -> Result<Self, SerializationError> {
                match type_name {
                    $(stringify!($variant) => Ok(Envelope::$variant($variant::decode(body)?)),)*
                    other => Err(SerializationError::UnknownType(other.to_string())),
                }
            }
        }

        $(
            impl From<$variant> for Envelope {
                fn from(message: $variant) -> Self {
                    Envelope::$variant(message)
                }
            }

            impl Reply for $variant {
                const TYPE_NAME: &'static str = stringify!($variant);

                fn from_envelope(envelope: Envelope) -> Result<Self, Envelope> {
                    match envelope {
                        Envelope::$variant(m) => Ok(m),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

envelope_messages!(
    SetConfig,
    ProcessStateUpdate,
    GoToProcessState,
    ResumeProcess,
    ConnectionMessage,
    ConnectionHandshake,
    ErrorMessage,
);

/// A message type that can be expected as the reply to an exchange.
pub trait Reply: Sized {
    const TYPE_NAME: &'static str;

    /// Extract this type, handing the envelope back when it holds something else.
    fn from_envelope(envelope: Envelope) -> Result<Self, Envelope>;
}

impl Envelope {
    /// Serialize to `[u8 name length][type name][protobuf body]`.
    pub fn encode(&self) -> Vec<u8> {
        let name = self.type_name().as_bytes();
        let body = self.encode_body();
        let mut out = Vec::with_capacity(1 + name.len() + body.len());
        // Type names are compile-time identifiers well under 256 bytes.
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out.extend_from_slice(&body);
        out
    }

    /// Parse an envelope produced by [`Envelope::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, SerializationError> {
        let (&name_len, rest) = bytes.split_first().ok_or(SerializationError::Empty)?;
        let name_len = name_len as usize;
        if rest.len() < name_len {
            return Err(SerializationError::Truncated {
                needed: name_len,
                available: rest.len(),
            });
        }
        let (name, body) = rest.split_at(name_len);
        let name = std::str::from_utf8(name).map_err(|_| SerializationError::InvalidTypeName)?;
        Self::decode_body(name, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectionMode, ProcessStateCode};

    #[test]
    fn test_envelope_prefixes_type_name() {
        let envelope = Envelope::from(ErrorMessage {
            process_id: "p1".into(),
            debug_information: "boom".into(),
        });
        let bytes = envelope.encode();
        assert_eq!(bytes[0] as usize, "ErrorMessage".len());
        assert_eq!(&bytes[1..13], b"ErrorMessage");
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_connection_message_survives_encoding() {
        let message = ConnectionMessage {
            connection_id: "c1".into(),
            mode: ConnectionMode::Resume as i32,
            target_address: "tcp://10.0.0.2:5000".into(),
            listen_port: 5123,
            receive_hash: "rx".into(),
            send_hash: "tx".into(),
            remote_process_id: "p2".into(),
            remote_interface_id: "power".into(),
            remote_service_id: "meter".into(),
        };
        let decoded = Envelope::decode(&Envelope::from(message.clone()).encode()).unwrap();
        match decoded {
            Envelope::ConnectionMessage(m) => {
                assert_eq!(m, message);
                assert_eq!(m.connection_mode(), Some(ConnectionMode::Resume));
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(matches!(Envelope::decode(&[]), Err(SerializationError::Empty)));
    }

    #[test]
    fn test_truncated_type_name_rejected() {
        let err = Envelope::decode(&[20, b'S', b'e']).unwrap_err();
        assert!(matches!(
            err,
            SerializationError::Truncated {
                needed: 20,
                available: 2
            }
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut bytes = vec![7];
        bytes.extend_from_slice(b"Unknown");
        let err = Envelope::decode(&bytes).unwrap_err();
        assert!(matches!(err, SerializationError::UnknownType(name) if name == "Unknown"));
    }

    #[test]
    fn test_invalid_utf8_name_rejected() {
        let err = Envelope::decode(&[2, 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, SerializationError::InvalidTypeName));
    }

    #[test]
    fn test_corrupt_body_rejected() {
        let mut bytes = vec!["ProcessStateUpdate".len() as u8];
        bytes.extend_from_slice(b"ProcessStateUpdate");
        // Field 1, length-delimited, claims 100 bytes that are not there.
        bytes.extend_from_slice(&[0x0a, 100, b'x']);
        let err = Envelope::decode(&bytes).unwrap_err();
        assert!(matches!(err, SerializationError::Decode(_)));
    }

    #[test]
    fn test_reply_extraction_returns_other_types() {
        let update = ProcessStateUpdate {
            process_id: "p".into(),
            state: ProcessStateCode::Running as i32,
            state_data: vec![],
        };
        let envelope = Envelope::from(update.clone());
        assert_eq!(
            ProcessStateUpdate::from_envelope(envelope.clone()).unwrap(),
            update
        );
        assert_eq!(
            ConnectionHandshake::from_envelope(envelope.clone()).unwrap_err(),
            envelope
        );
    }
}
