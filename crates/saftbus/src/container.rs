//! The server-side object registry.
//!
//! A `Container` owns every service object: path → id lookup, id → record,
//! creation order. All mutation happens on the loop thread, so the registry
//! is `Rc<RefCell<…>>` with no locks. Destruction runs in reverse creation
//! order because later objects may hold back-references to earlier ones.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;

use crate::error::Error;
use crate::service::{CallContext, CoreService, Service};
use crate::wire::codec::{encode_frame, encode_payload};
use crate::wire::protocol::{CORE_OBJECT_PATH, ObjectId, ObjectStatus, Reply, Request, Signal, Status};
use crate::wire::transport::{SendOutcome, try_send_all};

/// Server-side identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One signal subscriber of one object: a (client, group) pair holding the
/// group's sink descriptor and a use count, since several proxies of the
/// same client may reference the same object through one group.
struct Subscriber {
    client: ClientId,
    group: u64,
    sink: Rc<OwnedFd>,
    use_count: u32,
}

/// Fan-out handle given to a service at registration. Cloneable; emission
/// may happen at any time, not just in response to a call.
#[derive(Clone)]
pub struct SignalSender {
    object_id: ObjectId,
    subscribers: Rc<RefCell<Vec<Subscriber>>>,
}

impl SignalSender {
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Broadcast a pre-serialized payload to every subscriber. Best-effort
    /// per sink: a momentarily full sink drops this one envelope, a broken
    /// sink is culled; neither touches the other subscribers. Returns how
    /// many sinks accepted the envelope.
    pub fn emit(&self, interface_no: u32, signal_no: u32, payload: Vec<u8>) -> usize {
        let envelope = Signal {
            object_id: self.object_id,
            interface_no,
            signal_no,
            payload,
        };
        let frame = match encode_frame(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(object = %self.object_id, error = %e, "Signal did not encode");
                return 0;
            }
        };

        let mut delivered = 0usize;
        self.subscribers.borrow_mut().retain(|sub| {
            match try_send_all(sub.sink.as_raw_fd(), &frame) {
                SendOutcome::Sent => {
                    delivered += 1;
                    true
                }
                SendOutcome::WouldBlock => {
                    tracing::warn!(
                        object = %self.object_id,
                        client = %sub.client,
                        group = sub.group,
                        "Signal dropped for slow subscriber"
                    );
                    true
                }
                SendOutcome::Broken => {
                    tracing::debug!(
                        object = %self.object_id,
                        client = %sub.client,
                        group = sub.group,
                        "Culling broken signal subscriber"
                    );
                    false
                }
            }
        });
        delivered
    }

    /// Serialize `value` and broadcast it.
    pub fn emit_value<T: serde::Serialize>(
        &self,
        interface_no: u32,
        signal_no: u32,
        value: &T,
    ) -> crate::error::Result<usize> {
        Ok(self.emit(interface_no, signal_no, encode_payload(value)?))
    }
}

struct ObjectRecord {
    object_path: String,
    /// Shared with in-flight dispatch so a service may create or remove
    /// objects from inside its own methods.
    service: Rc<RefCell<Box<dyn Service>>>,
    subscribers: Rc<RefCell<Vec<Subscriber>>>,
}

pub struct Container {
    next_id: u64,
    objects: HashMap<ObjectId, ObjectRecord>,
    paths: HashMap<String, ObjectId>,
    creation_order: Vec<ObjectId>,
}

impl Container {
    /// Build a container with its core object already registered. The core
    /// object receiving id 1 is a load-bearing startup invariant; violating
    /// it is fatal by design.
    pub fn new() -> Rc<RefCell<Self>> {
        let container = Rc::new(RefCell::new(Self {
            next_id: 0,
            objects: HashMap::new(),
            paths: HashMap::new(),
            creation_order: Vec::new(),
        }));
        let core = CoreService::new(Rc::downgrade(&container));
        let id = container
            .borrow_mut()
            .create_object(CORE_OBJECT_PATH, Box::new(core));
        assert_eq!(
            id,
            Some(ObjectId::CORE),
            "core object must be created first and receive id 1"
        );
        container
    }

    fn generate_id(&mut self) -> ObjectId {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            let Some(id) = ObjectId::new(self.next_id) else {
                continue;
            };
            if !self.objects.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a new object under a fresh id. Returns `None` when the path
    /// is already taken — a double-created path is the caller's programming
    /// error, reported rather than fatal.
    pub fn create_object(
        &mut self,
        object_path: &str,
        mut service: Box<dyn Service>,
    ) -> Option<ObjectId> {
        if self.paths.contains_key(object_path) {
            tracing::warn!(path = %object_path, "create_object on an already registered path");
            return None;
        }
        let id = self.generate_id();
        let subscribers = Rc::new(RefCell::new(Vec::new()));
        service.attach(SignalSender {
            object_id: id,
            subscribers: Rc::clone(&subscribers),
        });
        self.objects.insert(
            id,
            ObjectRecord {
                object_path: object_path.to_string(),
                service: Rc::new(RefCell::new(service)),
                subscribers,
            },
        );
        self.paths.insert(object_path.to_string(), id);
        self.creation_order.push(id);
        tracing::debug!(path = %object_path, %id, "Object created");
        Some(id)
    }

    /// Destroy one object. The core object refuses removal.
    pub fn remove_object(&mut self, id: ObjectId) -> bool {
        if id == ObjectId::CORE {
            tracing::warn!("remove_object on the core object refused");
            return false;
        }
        let Some(record) = self.objects.remove(&id) else {
            tracing::warn!(%id, "remove_object on unknown id");
            return false;
        };
        self.paths.remove(&record.object_path);
        self.creation_order.retain(|entry| *entry != id);
        tracing::debug!(path = %record.object_path, %id, "Object removed");
        true
    }

    /// Resolve `object_path` and add (or re-reference) a subscriber entry.
    /// Returns the object's id and interface names, or `None` for an
    /// unknown path.
    pub fn register_proxy(
        &mut self,
        object_path: &str,
        client: ClientId,
        group: u64,
        sink: Rc<OwnedFd>,
    ) -> Option<(ObjectId, Vec<String>)> {
        let id = *self.paths.get(object_path)?;
        let record = self.objects.get_mut(&id)?;
        let mut subscribers = record.subscribers.borrow_mut();
        match subscribers
            .iter_mut()
            .find(|s| s.client == client && s.group == group)
        {
            Some(existing) => existing.use_count += 1,
            None => subscribers.push(Subscriber {
                client,
                group,
                sink,
                use_count: 1,
            }),
        }
        Some((id, record.service.borrow().interface_names()))
    }

    /// Drop one proxy reference; the subscriber entry goes away when its use
    /// count reaches zero. Unknown ids or subscribers are a programming
    /// error on the caller's side and only logged.
    pub fn unregister_proxy(&mut self, id: ObjectId, client: ClientId, group: u64) {
        let Some(record) = self.objects.get_mut(&id) else {
            tracing::warn!(%id, "unregister_proxy on unknown object id");
            return;
        };
        let mut subscribers = record.subscribers.borrow_mut();
        let Some(index) = subscribers
            .iter()
            .position(|s| s.client == client && s.group == group)
        else {
            tracing::warn!(%id, client = %client, group, "unregister_proxy with no matching subscriber");
            return;
        };
        if subscribers[index].use_count > 1 {
            subscribers[index].use_count -= 1;
        } else {
            subscribers.remove(index);
        }
    }

    /// Drop every subscription a disconnected client held.
    pub fn purge_client(&mut self, client: ClientId) {
        for record in self.objects.values_mut() {
            record
                .subscribers
                .borrow_mut()
                .retain(|s| s.client != client);
        }
    }

    pub fn object_id_for_path(&self, object_path: &str) -> Option<ObjectId> {
        self.paths.get(object_path).copied()
    }

    pub fn subscriber_count(&self, id: ObjectId) -> usize {
        self.objects
            .get(&id)
            .map(|r| r.subscribers.borrow().len())
            .unwrap_or(0)
    }

    /// Introspection snapshot in creation order.
    pub fn status(&self) -> Status {
        let objects = self
            .creation_order
            .iter()
            .filter_map(|id| self.objects.get(id).map(|record| (id, record)))
            .map(|(id, record)| ObjectStatus {
                object_id: *id,
                object_path: record.object_path.clone(),
                interface_names: record.service.borrow().interface_names(),
                subscriber_count: record.subscribers.borrow().len() as u64,
            })
            .collect();
        Status { objects }
    }

    /// Look up the target object and run one call through its service.
    ///
    /// Returns `None` for an unknown object id — the caller reports
    /// `UnknownObject` to the remote peer. Panics inside a service are
    /// contained here and become a `Failed` reply; one driver's bug must
    /// not take the bus down.
    pub fn call_service(
        this: &Rc<RefCell<Container>>,
        request: &Request,
        ctx: &mut CallContext<'_>,
    ) -> Option<Reply> {
        let service = {
            let container = this.borrow();
            let record = container.objects.get(&request.object_id)?;
            Rc::clone(&record.service)
        };
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            service.borrow_mut().dispatch(
                request.interface_no,
                request.function_no,
                &request.args,
                ctx,
            )
        }));
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(&panic);
                tracing::error!(
                    object = %request.object_id,
                    interface = request.interface_no,
                    function = request.function_no,
                    %message,
                    "Service panicked during dispatch"
                );
                Err(Error::failed(format!("service panicked: {message}")))
            }
        };
        Some(Reply::from_result(result))
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        // Reverse creation order; HashMap drop order would be arbitrary.
        for id in std::mem::take(&mut self.creation_order).into_iter().rev() {
            self.objects.remove(&id);
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::service::unknown_method;
    use crate::wire::codec::decode_payload;
    use std::os::unix::net::UnixStream;

    struct EchoService;

    impl Service for EchoService {
        fn interface_names(&self) -> Vec<String> {
            vec!["test.Echo".to_string()]
        }

        fn dispatch(
            &mut self,
            interface_no: u32,
            function_no: u32,
            args: &[u8],
            _ctx: &mut CallContext<'_>,
        ) -> crate::error::Result<Vec<u8>> {
            if interface_no != 0 {
                return Err(unknown_method(interface_no, function_no));
            }
            match function_no {
                0 => {
                    let text: String = decode_payload(args)?;
                    encode_payload(&text)
                }
                1 => {
                    let (a, b): (i32, i32) = decode_payload(args)?;
                    encode_payload(&(a + b))
                }
                2 => panic!("dice fell off the table"),
                _ => Err(unknown_method(interface_no, function_no)),
            }
        }
    }

    /// Records its drop into a shared log, for destruction-order checks.
    struct DropProbe {
        name: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Service for DropProbe {
        fn interface_names(&self) -> Vec<String> {
            vec!["test.Probe".to_string()]
        }

        fn dispatch(
            &mut self,
            interface_no: u32,
            function_no: u32,
            _args: &[u8],
            _ctx: &mut CallContext<'_>,
        ) -> crate::error::Result<Vec<u8>> {
            Err(unknown_method(interface_no, function_no))
        }
    }

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.log.borrow_mut().push(self.name);
        }
    }

    fn sink() -> Rc<OwnedFd> {
        let (_keep, send_half) = UnixStream::pair().unwrap();
        // Keep only the send half; tests that read signals build their own
        // pairs and hold both ends.
        Rc::new(OwnedFd::from(send_half))
    }

    fn call(
        container: &Rc<RefCell<Container>>,
        request: &Request,
    ) -> Option<Reply> {
        let mut groups = HashMap::new();
        let mut ctx = CallContext {
            client: ClientId::new(1),
            pending_fd: None,
            groups: &mut groups,
            quit_requested: false,
        };
        Container::call_service(container, request, &mut ctx)
    }

    #[test]
    fn fresh_container_owns_the_core_object_as_id_1() {
        let container = Container::new();
        let container = container.borrow();
        assert_eq!(container.object_id_for_path("/saftbus"), Some(ObjectId::CORE));
        assert_eq!(container.status().objects.len(), 1);
    }

    #[test]
    fn ids_increase_from_2_for_distinct_paths() {
        let container = Container::new();
        let mut container = container.borrow_mut();
        let a = container.create_object("/a", Box::new(EchoService)).unwrap();
        let b = container.create_object("/b", Box::new(EchoService)).unwrap();
        assert_eq!(a.raw(), 2);
        assert_eq!(b.raw(), 3);
    }

    #[test]
    fn duplicate_path_is_rejected() {
        let container = Container::new();
        let mut container = container.borrow_mut();
        assert!(container.create_object("/a", Box::new(EchoService)).is_some());
        assert!(container.create_object("/a", Box::new(EchoService)).is_none());
    }

    #[test]
    fn live_ids_are_never_reissued() {
        let container = Container::new();
        let mut container = container.borrow_mut();
        let a = container.create_object("/a", Box::new(EchoService)).unwrap();
        assert!(container.remove_object(a));
        let b = container.create_object("/b", Box::new(EchoService)).unwrap();
        assert_ne!(b.raw(), 0);
        assert_ne!(b, ObjectId::CORE);
    }

    #[test]
    fn use_counts_balance_register_and_unregister() {
        let container = Container::new();
        let mut container = container.borrow_mut();
        let id = container.create_object("/a", Box::new(EchoService)).unwrap();
        let client = ClientId::new(7);

        let (registered, names) = container
            .register_proxy("/a", client, 1, sink())
            .unwrap();
        assert_eq!(registered, id);
        assert_eq!(names, vec!["test.Echo".to_string()]);

        // Second proxy, same client and group: one entry, use count 2.
        container.register_proxy("/a", client, 1, sink()).unwrap();
        assert_eq!(container.subscriber_count(id), 1);

        container.unregister_proxy(id, client, 1);
        assert_eq!(container.subscriber_count(id), 1);
        container.unregister_proxy(id, client, 1);
        assert_eq!(container.subscriber_count(id), 0);

        // Over-unregistering is logged, never under- or over-removes.
        container.unregister_proxy(id, client, 1);
        assert_eq!(container.subscriber_count(id), 0);
    }

    #[test]
    fn register_proxy_unknown_path_returns_none() {
        let container = Container::new();
        let mut container = container.borrow_mut();
        assert!(container
            .register_proxy("/nope", ClientId::new(1), 1, sink())
            .is_none());
    }

    #[test]
    fn unregister_unknown_id_does_not_abort() {
        let container = Container::new();
        container
            .borrow_mut()
            .unregister_proxy(ObjectId::new(99).unwrap(), ClientId::new(1), 1);
    }

    #[test]
    fn purge_client_drops_only_that_clients_subscriptions() {
        let container = Container::new();
        let mut container = container.borrow_mut();
        let id = container.create_object("/a", Box::new(EchoService)).unwrap();
        container.register_proxy("/a", ClientId::new(1), 1, sink()).unwrap();
        container.register_proxy("/a", ClientId::new(2), 1, sink()).unwrap();

        container.purge_client(ClientId::new(1));
        assert_eq!(container.subscriber_count(id), 1);
    }

    #[test]
    fn call_to_unknown_object_returns_none() {
        let container = Container::new();
        let request = Request {
            object_id: ObjectId::new(99).unwrap(),
            interface_no: 0,
            function_no: 0,
            args: Vec::new(),
        };
        assert!(call(&container, &request).is_none());
    }

    #[test]
    fn call_in_range_returns_well_formed_response() {
        let container = Container::new();
        let id = container
            .borrow_mut()
            .create_object("/a", Box::new(EchoService))
            .unwrap();
        assert_eq!(id.raw(), 2);

        let request = Request {
            object_id: id,
            interface_no: 0,
            function_no: 1,
            args: encode_payload(&(20i32, 22i32)).unwrap(),
        };
        let reply = call(&container, &request).unwrap();
        let sum: i32 = decode_payload(&reply.into_result().unwrap()).unwrap();
        assert_eq!(sum, 42);
    }

    #[test]
    fn call_out_of_range_is_unknown_method() {
        let container = Container::new();
        let id = container
            .borrow_mut()
            .create_object("/a", Box::new(EchoService))
            .unwrap();
        let request = Request {
            object_id: id,
            interface_no: 0,
            function_no: 9,
            args: Vec::new(),
        };
        let err = call(&container, &request).unwrap().into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownMethod);
    }

    #[test]
    fn panicking_service_becomes_a_failed_reply() {
        let container = Container::new();
        let id = container
            .borrow_mut()
            .create_object("/a", Box::new(EchoService))
            .unwrap();
        let request = Request {
            object_id: id,
            interface_no: 0,
            function_no: 2,
            args: Vec::new(),
        };
        let err = call(&container, &request).unwrap().into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Failed);
        assert!(err.wire_message().contains("dice fell off the table"));

        // The container keeps serving after the panic.
        let request = Request {
            object_id: id,
            interface_no: 0,
            function_no: 0,
            args: encode_payload(&"still alive".to_string()).unwrap(),
        };
        let reply = call(&container, &request).unwrap();
        assert!(reply.into_result().is_ok());
    }

    #[test]
    fn destruction_runs_in_reverse_creation_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let container = Container::new();
            let mut c = container.borrow_mut();
            for name in ["first", "second", "third"] {
                c.create_object(
                    &format!("/{name}"),
                    Box::new(DropProbe {
                        name,
                        log: Rc::clone(&log),
                    }),
                )
                .unwrap();
            }
        }
        assert_eq!(&*log.borrow(), &["third", "second", "first"]);
    }

    #[test]
    fn signals_fan_out_to_subscribers_and_cull_broken_sinks() {
        let container = Container::new();
        let mut container = container.borrow_mut();

        struct Ticker {
            sender: Option<SignalSender>,
        }
        impl Service for Ticker {
            fn interface_names(&self) -> Vec<String> {
                vec!["test.Ticker".to_string()]
            }
            fn dispatch(
                &mut self,
                interface_no: u32,
                function_no: u32,
                _args: &[u8],
                _ctx: &mut CallContext<'_>,
            ) -> crate::error::Result<Vec<u8>> {
                Err(unknown_method(interface_no, function_no))
            }
            fn attach(&mut self, sender: SignalSender) {
                self.sender = Some(sender);
            }
        }

        let ticker = Rc::new(RefCell::new(Ticker { sender: None }));
        struct Shared(Rc<RefCell<Ticker>>);
        impl Service for Shared {
            fn interface_names(&self) -> Vec<String> {
                self.0.borrow().interface_names()
            }
            fn dispatch(
                &mut self,
                interface_no: u32,
                function_no: u32,
                args: &[u8],
                ctx: &mut CallContext<'_>,
            ) -> crate::error::Result<Vec<u8>> {
                self.0.borrow_mut().dispatch(interface_no, function_no, args, ctx)
            }
            fn attach(&mut self, sender: SignalSender) {
                self.0.borrow_mut().attach(sender);
            }
        }

        let id = container
            .create_object("/ticker", Box::new(Shared(Rc::clone(&ticker))))
            .unwrap();

        let (live_recv, live_send) = UnixStream::pair().unwrap();
        live_recv.set_nonblocking(true).unwrap();
        container
            .register_proxy("/ticker", ClientId::new(1), 1, Rc::new(OwnedFd::from(live_send)))
            .unwrap();

        // Second subscriber whose receive half is already gone.
        let (dead_recv, dead_send) = UnixStream::pair().unwrap();
        drop(dead_recv);
        container
            .register_proxy("/ticker", ClientId::new(2), 1, Rc::new(OwnedFd::from(dead_send)))
            .unwrap();
        assert_eq!(container.subscriber_count(id), 2);

        let sender = ticker.borrow().sender.clone().unwrap();
        let delivered = sender.emit_value(0, 0, &123u64).unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(container.subscriber_count(id), 1);

        // The live subscriber got a complete envelope.
        use bytes::BytesMut;
        use std::io::Read;
        let mut reader = live_recv;
        let mut buf = BytesMut::new();
        let mut scratch = [0u8; 1024];
        let n = reader.read(&mut scratch).unwrap();
        buf.extend_from_slice(&scratch[..n]);
        let signal: Signal = crate::wire::codec::decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(signal.object_id, id);
        let value: u64 = decode_payload(&signal.payload).unwrap();
        assert_eq!(value, 123);
    }
}
