//! Link message records and their JSON codec.
//!
//! Every WebSocket text frame carries exactly one JSON object with a
//! mandatory `type` field selecting the record. Parsing is two-stage so
//! that an unknown type name and a structurally broken message stay
//! distinguishable: the former is a protocol violation, the latter a
//! malformed message.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::proto::ProtoVersion;
use crate::{LinkVersion, Tid};

/// Errors produced by the wire codec.
#[derive(Debug, Error)]
pub enum WireError {
    /// The frame was not valid JSON or a field failed to decode.
    #[error("invalid message body: {0}")]
    Json(#[from] serde_json::Error),
    /// The message object has no string `type` field.
    #[error("message has no type field")]
    MissingType,
    /// The `type` field names no known message.
    #[error("unknown message type '{0}'")]
    UnknownType(String),
}

/// All message type names of the link protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Handshake offer carrying versions and the advertised name sets.
    Auth,
    /// Handshake acknowledgement for a received `auth`.
    AuthAck,
    /// Subscribe to an event by name.
    EvtSub,
    /// Unsubscribe from an event by name.
    EvtUnsub,
    /// Carry one event occurrence with its payload.
    EvtEmit,
    /// Reserved: subscribe to a data source.
    DataSub,
    /// Reserved: data subscription accepted.
    DataSubAck,
    /// Reserved: data subscription refused.
    DataSubNak,
    /// Reserved: cancel a data subscription.
    DataUnsub,
    /// Reserved: pushed data source value.
    DataChange,
    /// Invoke a remote function.
    FuncCall,
    /// Successful function result.
    FuncResult,
    /// Function failure with diagnostic info.
    FuncErr,
    /// Application-level keepalive response.
    Pong,
}

impl MsgType {
    /// Wire name of this message type.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::AuthAck => "auth_ack",
            Self::EvtSub => "evt_sub",
            Self::EvtUnsub => "evt_unsub",
            Self::EvtEmit => "evt_emit",
            Self::DataSub => "data_sub",
            Self::DataSubAck => "data_sub_ack",
            Self::DataSubNak => "data_sub_nak",
            Self::DataUnsub => "data_unsub",
            Self::DataChange => "data_change",
            Self::FuncCall => "func_call",
            Self::FuncResult => "func_result",
            Self::FuncErr => "func_err",
            Self::Pong => "pong",
        }
    }

    /// Resolves a wire name, or `None` for names outside the protocol.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "auth" => Self::Auth,
            "auth_ack" => Self::AuthAck,
            "evt_sub" => Self::EvtSub,
            "evt_unsub" => Self::EvtUnsub,
            "evt_emit" => Self::EvtEmit,
            "data_sub" => Self::DataSub,
            "data_sub_ack" => Self::DataSubAck,
            "data_sub_nak" => Self::DataSubNak,
            "data_unsub" => Self::DataUnsub,
            "data_change" => Self::DataChange,
            "func_call" => Self::FuncCall,
            "func_result" => Self::FuncResult,
            "func_err" => Self::FuncErr,
            "pong" => Self::Pong,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed link message.
///
/// Variants map 1:1 to the wire `type` names; see [`MsgType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Handshake offer. Each peer advertises what it can supply so the
    /// other side can check its own requirements against it.
    Auth {
        /// Transaction id of the offering side's auth transaction.
        tid: Tid,
        /// Protocol version of the sending implementation.
        proto_version: ProtoVersion,
        /// User-defined link schema version.
        link_version: LinkVersion,
        /// When `true`, the sender cannot observe transport-level pongs
        /// and asks for application-level `pong` messages instead.
        #[serde(skip_serializing_if = "Option::is_none")]
        no_ping: Option<bool>,
        /// Events the sender can emit.
        events: BTreeSet<String>,
        /// Data sources the sender can provide (reserved).
        data_sources: BTreeSet<String>,
        /// Functions the sender implements and the peer may call.
        functions: BTreeSet<String>,
    },
    /// Handshake acknowledgement, echoing the peer's auth tid.
    AuthAck {
        /// Tid of the acknowledged auth transaction.
        tid: Tid,
    },
    /// Subscribe to an event by name.
    EvtSub {
        /// Fresh tid from the sender's series.
        tid: Tid,
        /// Event name to activate.
        name: String,
    },
    /// Unsubscribe from an event by name.
    EvtUnsub {
        /// Fresh tid from the sender's series.
        tid: Tid,
        /// Event name to deactivate.
        name: String,
    },
    /// One event occurrence.
    EvtEmit {
        /// Fresh tid from the sender's series.
        tid: Tid,
        /// Event name.
        name: String,
        /// Encoded event payload.
        data: Value,
    },
    /// Reserved data subscription request.
    DataSub {
        /// Fresh tid from the sender's series.
        tid: Tid,
        /// Data source name.
        name: String,
    },
    /// Reserved data subscription acknowledgement.
    DataSubAck {
        /// Tid of the acknowledged `data_sub`.
        tid: Tid,
    },
    /// Reserved data subscription refusal.
    DataSubNak {
        /// Tid of the refused `data_sub`.
        tid: Tid,
    },
    /// Reserved data subscription cancellation.
    DataUnsub {
        /// Tid of the cancelled data subscription.
        tid: Tid,
    },
    /// Reserved data source value push.
    DataChange {
        /// Tid of the data subscription the value belongs to.
        tid: Tid,
        /// Encoded data source value.
        data: Value,
    },
    /// Remote function invocation.
    FuncCall {
        /// Fresh tid from the caller's series; responses echo it.
        tid: Tid,
        /// Function name.
        name: String,
        /// Encoded call parameters.
        params: Value,
    },
    /// Successful function response.
    FuncResult {
        /// Tid of the completed `func_call`.
        tid: Tid,
        /// Encoded function results.
        results: Value,
    },
    /// Failed function response.
    FuncErr {
        /// Tid of the failed `func_call`.
        tid: Tid,
        /// Human-readable failure info from the remote handler.
        info: String,
    },
    /// Application-level keepalive response. Carries no tid.
    Pong,
}

impl Message {
    /// The message's type tag.
    #[must_use]
    pub const fn msg_type(&self) -> MsgType {
        match self {
            Self::Auth { .. } => MsgType::Auth,
            Self::AuthAck { .. } => MsgType::AuthAck,
            Self::EvtSub { .. } => MsgType::EvtSub,
            Self::EvtUnsub { .. } => MsgType::EvtUnsub,
            Self::EvtEmit { .. } => MsgType::EvtEmit,
            Self::DataSub { .. } => MsgType::DataSub,
            Self::DataSubAck { .. } => MsgType::DataSubAck,
            Self::DataSubNak { .. } => MsgType::DataSubNak,
            Self::DataUnsub { .. } => MsgType::DataUnsub,
            Self::DataChange { .. } => MsgType::DataChange,
            Self::FuncCall { .. } => MsgType::FuncCall,
            Self::FuncResult { .. } => MsgType::FuncResult,
            Self::FuncErr { .. } => MsgType::FuncErr,
            Self::Pong => MsgType::Pong,
        }
    }

    /// The transaction id, if the message carries one.
    #[must_use]
    pub const fn tid(&self) -> Option<Tid> {
        match self {
            Self::Auth { tid, .. }
            | Self::AuthAck { tid }
            | Self::EvtSub { tid, .. }
            | Self::EvtUnsub { tid, .. }
            | Self::EvtEmit { tid, .. }
            | Self::DataSub { tid, .. }
            | Self::DataSubAck { tid }
            | Self::DataSubNak { tid }
            | Self::DataUnsub { tid }
            | Self::DataChange { tid, .. }
            | Self::FuncCall { tid, .. }
            | Self::FuncResult { tid, .. }
            | Self::FuncErr { tid, .. } => Some(*tid),
            Self::Pong => None,
        }
    }

    /// Parses one text frame into a message.
    ///
    /// # Errors
    ///
    /// [`WireError::Json`] / [`WireError::MissingType`] when the frame is
    /// structurally broken, [`WireError::UnknownType`] when the type name
    /// is outside the protocol vocabulary.
    pub fn parse(text: &str) -> Result<Self, WireError> {
        let value: Value = serde_json::from_str(text)?;
        match value.get("type").and_then(Value::as_str) {
            Some(name) => {
                if MsgType::from_name(name).is_none() {
                    return Err(WireError::UnknownType(name.to_owned()));
                }
            }
            None => return Err(WireError::MissingType),
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Serializes the message into one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Json`] if a payload value cannot be
    /// serialized.
    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}
