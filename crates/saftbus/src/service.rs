//! Server-side service dispatch.
//!
//! A `Service` is the polymorphic capability behind one object: an ordered
//! interface-name list plus one dispatch entry point taking
//! (interface index, function index, serialized arguments) to a serialized
//! return value or an error. `CoreService` is the container's own object
//! (id 1): proxy registration, introspection and daemon shutdown.

use std::cell::RefCell;
use std::os::fd::OwnedFd;
use std::rc::{Rc, Weak};

use crate::container::{ClientId, Container, SignalSender};
use crate::error::{Error, Result};
use crate::wire::codec::{decode_payload, encode_payload};
use crate::wire::protocol::{
    CORE_INTERFACE, RegisterProxy, RegisterProxyReply, UnregisterProxy, core_fn,
};
use crate::wire::transport::into_nonblocking;

/// Per-call server-side context handed through dispatch.
///
/// Owned by the connection serving the call: the client identity, any
/// descriptor that arrived as ancillary data with this request, the
/// connection's signal-group table, and the quit flag the core object sets
/// for the server to act on after the reply is written.
pub struct CallContext<'a> {
    pub client: ClientId,
    pub pending_fd: Option<OwnedFd>,
    pub groups: &'a mut std::collections::HashMap<u64, Rc<OwnedFd>>,
    pub quit_requested: bool,
}

/// The capability exposed by a registered object.
pub trait Service {
    /// Interface names in index order; the proxy side mirrors this list.
    fn interface_names(&self) -> Vec<String>;

    /// Execute one method call. Index pairs outside the declared surface
    /// must come back as [`Error::UnknownMethod`].
    fn dispatch(
        &mut self,
        interface_no: u32,
        function_no: u32,
        args: &[u8],
        ctx: &mut CallContext<'_>,
    ) -> Result<Vec<u8>>;

    /// Called once at registration with the object's signal fan-out handle.
    fn attach(&mut self, _sender: SignalSender) {}
}

/// The error every service returns for an out-of-range index pair.
pub fn unknown_method(interface_no: u32, function_no: u32) -> Error {
    Error::UnknownMethod(format!(
        "interface {interface_no} function {function_no} out of range"
    ))
}

/// The container's self-descriptive root object, always id 1.
pub struct CoreService {
    container: Weak<RefCell<Container>>,
}

impl CoreService {
    pub(crate) fn new(container: Weak<RefCell<Container>>) -> Self {
        Self { container }
    }

    fn container(&self) -> Result<Rc<RefCell<Container>>> {
        self.container
            .upgrade()
            .ok_or_else(|| Error::failed("container already torn down"))
    }

    fn register_proxy(&mut self, args: &[u8], ctx: &mut CallContext<'_>) -> Result<Vec<u8>> {
        let req: RegisterProxy = decode_payload(args)?;

        if req.attach_fd {
            let fd = ctx.pending_fd.take().ok_or_else(|| {
                Error::invalid_args("register_proxy announced a descriptor but none arrived")
            })?;
            let fd = into_nonblocking(fd)?;
            ctx.groups.insert(req.signal_group_id, Rc::new(fd));
        }
        let sink = ctx.groups.get(&req.signal_group_id).cloned().ok_or_else(|| {
            Error::invalid_args(format!(
                "signal group {} not attached on this connection",
                req.signal_group_id
            ))
        })?;

        let container = self.container()?;
        let registered = container.borrow_mut().register_proxy(
            &req.object_path,
            ctx.client,
            req.signal_group_id,
            sink,
        );
        match registered {
            Some((object_id, interface_names)) => {
                tracing::debug!(
                    path = %req.object_path,
                    %object_id,
                    client = %ctx.client,
                    "Proxy registered"
                );
                encode_payload(&RegisterProxyReply {
                    object_id,
                    interface_names,
                })
            }
            None => Err(Error::UnknownObject(req.object_path)),
        }
    }

    fn unregister_proxy(&mut self, args: &[u8], ctx: &mut CallContext<'_>) -> Result<Vec<u8>> {
        let req: UnregisterProxy = decode_payload(args)?;
        self.container()?.borrow_mut().unregister_proxy(
            req.object_id,
            ctx.client,
            req.signal_group_id,
        );
        encode_payload(&())
    }
}

impl Service for CoreService {
    fn interface_names(&self) -> Vec<String> {
        vec![CORE_INTERFACE.to_string()]
    }

    fn dispatch(
        &mut self,
        interface_no: u32,
        function_no: u32,
        args: &[u8],
        ctx: &mut CallContext<'_>,
    ) -> Result<Vec<u8>> {
        if interface_no != 0 {
            return Err(unknown_method(interface_no, function_no));
        }
        match function_no {
            core_fn::REGISTER_PROXY => self.register_proxy(args, ctx),
            core_fn::UNREGISTER_PROXY => self.unregister_proxy(args, ctx),
            core_fn::GET_STATUS => encode_payload(&self.container()?.borrow().status()),
            core_fn::QUIT => {
                tracing::info!(client = %ctx.client, "Shutdown requested over the bus");
                ctx.quit_requested = true;
                encode_payload(&())
            }
            _ => Err(unknown_method(interface_no, function_no)),
        }
    }
}
