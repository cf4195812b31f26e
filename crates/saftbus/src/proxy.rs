//! Client-side object stubs.
//!
//! A `Proxy` is bound to one object path on one connection and mirrors the
//! service's interface surface. It owns no server-side state — just the
//! transport and serialization helpers, plus the bookkeeping for the signal
//! handlers it registered in its group.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::connection::ClientConnection;
use crate::error::Result;
use crate::signal_group::{SignalGroup, SignalKey};
use crate::wire::codec::{decode_payload, encode_payload};
use crate::wire::protocol::{
    CORE_OBJECT_PATH, ObjectId, RegisterProxy, RegisterProxyReply, Request, Status,
    UnregisterProxy, core_fn,
};

pub struct Proxy {
    connection: Arc<ClientConnection>,
    group: SignalGroup,
    object_id: ObjectId,
    object_path: String,
    interface_names: Vec<String>,
    registered_keys: Mutex<Vec<SignalKey>>,
}

impl Proxy {
    /// Register with the daemon's core object and bind to `object_path`.
    ///
    /// The group's descriptor travels along on the group's first
    /// registration over this connection; later proxies reference the group
    /// by id only.
    pub fn connect(
        connection: &Arc<ClientConnection>,
        group: &SignalGroup,
        object_path: &str,
    ) -> Result<Self> {
        let attach_fd = !group.is_attached(connection.id());
        let request = Request {
            object_id: ObjectId::CORE,
            interface_no: 0,
            function_no: core_fn::REGISTER_PROXY,
            args: encode_payload(&RegisterProxy {
                object_path: object_path.to_string(),
                signal_group_id: group.id(),
                attach_fd,
            })?,
        };
        let attach: &[_] = if attach_fd { &[group.send_fd()] } else { &[] };
        let payload = connection.call_raw(&request, attach)?.into_result()?;
        let reply: RegisterProxyReply = decode_payload(&payload)?;
        if attach_fd {
            group.mark_attached(connection.id());
        }
        tracing::debug!(path = %object_path, id = %reply.object_id, "Proxy bound");
        Ok(Self {
            connection: Arc::clone(connection),
            group: group.clone(),
            object_id: reply.object_id,
            object_path: object_path.to_string(),
            interface_names: reply.interface_names,
            registered_keys: Mutex::new(Vec::new()),
        })
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    /// The service's interface names in index order, as reported at
    /// registration.
    pub fn interface_names(&self) -> &[String] {
        &self.interface_names
    }

    pub fn interface_index(&self, name: &str) -> Option<u32> {
        self.interface_names
            .iter()
            .position(|n| n == name)
            .map(|i| i as u32)
    }

    /// Synchronous method call: serialize the arguments, block for the
    /// reply, decode the return value. Error envelopes come back as their
    /// original [`crate::Error`] kind.
    pub fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        interface_no: u32,
        function_no: u32,
        args: &A,
    ) -> Result<R> {
        let request = Request {
            object_id: self.object_id,
            interface_no,
            function_no,
            args: encode_payload(args)?,
        };
        let payload = self.connection.call_raw(&request, &[])?.into_result()?;
        decode_payload(&payload)
    }

    /// Install a handler for one of this object's signals in the group's
    /// subscription table. The handler runs on whichever thread waits on
    /// the group.
    pub fn on_signal(
        &self,
        interface_no: u32,
        signal_no: u32,
        handler: impl FnMut(&[u8]) + Send + 'static,
    ) {
        let key = (self.object_id, interface_no, signal_no);
        self.group.register_handler(key, Box::new(handler));
        if let Ok(mut keys) = self.registered_keys.lock() {
            keys.push(key);
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if let Ok(keys) = self.registered_keys.lock() {
            for key in keys.iter() {
                self.group.unregister_handler(key);
            }
        }
        let request = Request {
            object_id: ObjectId::CORE,
            interface_no: 0,
            function_no: core_fn::UNREGISTER_PROXY,
            args: match encode_payload(&UnregisterProxy {
                object_id: self.object_id,
                signal_group_id: self.group.id(),
            }) {
                Ok(args) => args,
                Err(_) => return,
            },
        };
        // Best effort: the daemon may already be gone.
        if let Err(e) = self.connection.call_raw(&request, &[]) {
            tracing::debug!(path = %self.object_path, error = %e, "Unregister on drop failed");
        }
    }
}

/// Typed stub for the daemon's core object (id 1).
pub struct CoreProxy {
    proxy: Proxy,
}

impl CoreProxy {
    pub fn connect(connection: &Arc<ClientConnection>, group: &SignalGroup) -> Result<Self> {
        Ok(Self {
            proxy: Proxy::connect(connection, group, CORE_OBJECT_PATH)?,
        })
    }

    /// Introspection snapshot of every object the daemon currently owns.
    pub fn get_status(&self) -> Result<Status> {
        self.proxy.call(0, core_fn::GET_STATUS, &())
    }

    /// Ask the daemon to leave its event loop.
    pub fn quit(&self) -> Result<()> {
        self.proxy.call(0, core_fn::QUIT, &())
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }
}
