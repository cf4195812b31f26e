//! Wire envelope types.
//!
//! Three envelope shapes travel over the bus:
//! - **Request** (client → server): object id, interface index, function
//!   index, argument payload — field order is fixed and must match between
//!   proxy and service for a given interface version.
//! - **Reply** (server → client): the enum discriminator is the status byte
//!   decided before payload parsing; `Ok` carries the return payload, `Err`
//!   carries an error kind plus message.
//! - **Signal** (server → signal-group descriptor): pushed unsolicited to
//!   every subscriber of an object.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Process-unique non-zero identifier of a live service object.
///
/// Id 1 is reserved for the container's own core object; a plain integer
/// (not a UUID) because ids are container-assigned and compared constantly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    /// The container's self-descriptive root object.
    pub const CORE: ObjectId = ObjectId(1);

    pub fn new(raw: u64) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object path of the core object.
pub const CORE_OBJECT_PATH: &str = "/saftbus";

/// Interface exposed by the core object.
pub const CORE_INTERFACE: &str = "saftbus.Container";

/// Function indices on [`CORE_INTERFACE`].
pub mod core_fn {
    pub const REGISTER_PROXY: u32 = 0;
    pub const UNREGISTER_PROXY: u32 = 1;
    pub const GET_STATUS: u32 = 2;
    pub const QUIT: u32 = 3;
}

/// A method call envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub object_id: ObjectId,
    pub interface_no: u32,
    pub function_no: u32,
    pub args: Vec<u8>,
}

/// A method reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ok(Vec<u8>),
    Err { kind: ErrorKind, message: String },
}

impl Reply {
    pub fn from_result(result: Result<Vec<u8>>) -> Self {
        match result {
            Ok(payload) => Self::Ok(payload),
            Err(e) => Self::Err {
                kind: e.kind(),
                message: e.wire_message(),
            },
        }
    }

    pub fn into_result(self) -> Result<Vec<u8>> {
        match self {
            Self::Ok(payload) => Ok(payload),
            Self::Err { kind, message } => Err(Error::from_wire(kind, message)),
        }
    }
}

/// A signal envelope, broadcast to every subscriber descriptor of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub object_id: ObjectId,
    pub interface_no: u32,
    pub signal_no: u32,
    pub payload: Vec<u8>,
}

/// Arguments of `core_fn::REGISTER_PROXY`.
///
/// `attach_fd` marks the group's first registration on this connection: the
/// request frame then carries the group's send descriptor as SCM_RIGHTS
/// ancillary data. Later registrations reference the group by id only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterProxy {
    pub object_path: String,
    pub signal_group_id: u64,
    pub attach_fd: bool,
}

/// Reply payload of `core_fn::REGISTER_PROXY`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterProxyReply {
    pub object_id: ObjectId,
    pub interface_names: Vec<String>,
}

/// Arguments of `core_fn::UNREGISTER_PROXY`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnregisterProxy {
    pub object_id: ObjectId,
    pub signal_group_id: u64,
}

/// One object's entry in the introspection snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStatus {
    pub object_id: ObjectId,
    pub object_path: String,
    pub interface_names: Vec<String>,
    pub subscriber_count: u64,
}

/// Reply payload of `core_fn::GET_STATUS`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub objects: Vec<ObjectStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::codec::{decode_frame, encode_frame};
    use bytes::BytesMut;

    fn roundtrip<T>(value: &T) -> T
    where
        T: Serialize + serde::de::DeserializeOwned,
    {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(value).unwrap());
        decode_frame(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn object_id_zero_is_rejected() {
        assert!(ObjectId::new(0).is_none());
        assert_eq!(ObjectId::new(1), Some(ObjectId::CORE));
    }

    #[test]
    fn request_roundtrips() {
        let req = Request {
            object_id: ObjectId::new(2).unwrap(),
            interface_no: 0,
            function_no: 3,
            args: vec![1, 2, 3],
        };
        assert_eq!(roundtrip(&req), req);
    }

    #[test]
    fn reply_ok_roundtrips() {
        let reply = Reply::Ok(vec![9, 9]);
        assert_eq!(roundtrip(&reply), reply);
        assert_eq!(reply.into_result().unwrap(), vec![9, 9]);
    }

    #[test]
    fn reply_err_maps_back_to_error() {
        let reply = Reply::from_result(Err(Error::UnknownObject("/nope".to_string())));
        let reply = roundtrip(&reply);
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownObject);
        assert_eq!(err.wire_message(), "/nope");
    }

    #[test]
    fn signal_roundtrips() {
        let sig = Signal {
            object_id: ObjectId::new(4).unwrap(),
            interface_no: 1,
            signal_no: 0,
            payload: b"tick".to_vec(),
        };
        assert_eq!(roundtrip(&sig), sig);
    }

    #[test]
    fn register_proxy_roundtrips() {
        let reg = RegisterProxy {
            object_path: "/de/gsi/saftlib/tr0/simple-fw".to_string(),
            signal_group_id: 11,
            attach_fd: true,
        };
        assert_eq!(roundtrip(&reg), reg);
    }
}
