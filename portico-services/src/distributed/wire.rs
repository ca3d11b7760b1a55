//! The marshalled form of every operation crossing a host boundary.
use portico_core::{interface::Call, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error as ThisError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    Deliver { port: String, call: Call },
    DeliverAsync { port: String, call: Call },
    ObeyConnection { port: String, peer: String, connector: String },
    ObeyDisconnection { port: String },
    AttachClient { port: String, client: String },
    DetachClient { port: String, client: String },
}

impl Frame {
    pub fn port(&self) -> &str {
        match self {
            Frame::Deliver { port, .. }
            | Frame::DeliverAsync { port, .. }
            | Frame::ObeyConnection { port, .. }
            | Frame::ObeyDisconnection { port }
            | Frame::AttachClient { port, .. }
            | Frame::DetachClient { port, .. } => port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(Value),
    Err(WireError),
}

/// An [`Error`] flattened to what survives serialization.
#[derive(ThisError, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireError {
    #[error("contract violation: {message}")]
    Contract { message: String },
    #[error("rejected by {pool}: {reason}")]
    Rejected { pool: String, reason: String },
    #[error("unresolved: {uri}")]
    Unresolved { uri: String },
    #[error("execution failed: {message}")]
    Execution { message: String },
    #[error("cancelled")]
    Cancelled,
    #[error("{message}")]
    Other { message: String },
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        match err {
            Error::Contract(message) => WireError::Contract {
                message: message.clone(),
            },
            Error::Rejected { pool, reason } => WireError::Rejected {
                pool: pool.clone(),
                reason: reason.clone(),
            },
            Error::Unresolved(uri) => WireError::Unresolved { uri: uri.clone() },
            Error::Execution(cause) => WireError::Execution {
                message: format!("{cause:#}"),
            },
            Error::Cancelled => WireError::Cancelled,
            other => WireError::Other {
                message: other.to_string(),
            },
        }
    }
}

impl From<WireError> for Error {
    /// Rebuilt errors are not logged again; the owning host already did.
    fn from(err: WireError) -> Self {
        match err {
            WireError::Contract { message } => Error::Contract(message),
            WireError::Rejected { pool, reason } => Error::Rejected { pool, reason },
            WireError::Unresolved { uri } => Error::Unresolved(uri),
            WireError::Execution { message } => Error::Execution(anyhow::anyhow!(message)),
            WireError::Cancelled => Error::Cancelled,
            WireError::Other { message } => Error::Remote(message),
        }
    }
}

impl From<Result<Value, Error>> for Reply {
    fn from(outcome: Result<Value, Error>) -> Self {
        match outcome {
            Ok(value) => Reply::Ok(value),
            Err(e) => Reply::Err(WireError::from(&e)),
        }
    }
}

impl From<Reply> for Result<Value, Error> {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Ok(value) => Ok(value),
            Reply::Err(e) => Err(e.into()),
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(message).map_err(|e| Error::Remote(format!("unable to encode: {e}")))
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, Error> {
    serde_json::from_slice(bytes).map_err(|e| Error::Remote(format!("unable to decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_survive_the_hop() {
        let outcome: Result<Value, Error> = Err(Error::Contract("port p is not published".into()));
        let bytes = encode(&Reply::from(outcome)).unwrap();
        let back: Result<Value, Error> = decode::<Reply>(&bytes).unwrap().into();
        let err = back.unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!("contract violation: port p is not published", err.to_string());

        let outcome: Result<Value, Error> = Err(Error::Execution(
            anyhow::anyhow!("division by zero").context("dividing"),
        ));
        let back: Result<Value, Error> = Reply::from(outcome).into();
        assert_eq!(
            "execution failed: dividing: division by zero",
            back.unwrap_err().to_string()
        );

        let outcome: Result<Value, Error> = Err(Error::Start {
            uri: "c".into(),
            cause: anyhow::anyhow!("boom"),
        });
        let back: Result<Value, Error> = Reply::from(outcome).into();
        assert!(matches!(back, Err(Error::Remote(m)) if m == "component c failed to start: boom"));
    }

    #[test]
    fn test_frames_are_tagged_by_operation() {
        let frame = Frame::AttachClient {
            port: "in".into(),
            client: "out".into(),
        };
        let text = String::from_utf8(encode(&frame).unwrap()).unwrap();
        assert_eq!(r#"{"op":"attach_client","port":"in","client":"out"}"#, text);
        assert_eq!(frame, decode::<Frame>(text.as_bytes()).unwrap());
        assert!(decode::<Frame>(b"{\"op\":\"reboot\"}").is_err());
    }
}
