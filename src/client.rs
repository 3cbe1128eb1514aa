//! The client layer: an introspection cache, path/interface/signature
//! inference, property access and signal subscription streams.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_channel as channel;
use async_lock::Mutex as AsyncMutex;

use crate::{
    connection::{Connection, SignalFilter, SignalMsg},
    error::{Error, ProtocolError},
    marshal::{parse_signature, Arg, CompoundArg, Kind, ValidArg},
    message::{Message, MessageFlags},
    schema::Schema,
};

pub struct Client {
    con: Arc<Connection>,
    /// (destination, path) -> parsed introspection document; read-through,
    /// never invalidated while the connection lives
    cache: AsyncMutex<HashMap<(String, String), Arc<Schema>>>,
}

#[derive(Clone, Copy)]
enum MemberKind {
    Method,
    Property,
    /// any node exposing the interface at all
    Interface,
}

impl Client {
    pub fn new(con: Arc<Connection>) -> Self {
        Self {
            con,
            cache: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.con
    }

    pub fn unique_name(&self) -> Option<&str> {
        self.con.unique_name()
    }

    /// Tears the connection down; everything else on this client fails with
    /// a disconnect afterwards.
    pub fn close(&self) {
        self.con.close();
    }

    /// The introspection document of one object, parsed and cached.
    pub async fn introspect(&self, dest: &str, path: &str) -> Result<Arc<Schema>, Error> {
        let key = (dest.to_string(), path.to_string());
        if let Some(schema) = self.cache.lock().await.get(&key) {
            return Ok(schema.clone());
        }

        let body = self
            .con
            .call(
                dest,
                path,
                "org.freedesktop.DBus.Introspectable",
                "Introspect",
                Vec::new(),
                None,
                MessageFlags::empty(),
            )
            .await?;
        let xml = body
            .into_iter()
            .next()
            .and_then(String::unpack)
            .ok_or(Error::Protocol(ProtocolError::Malformed("Introspect returned no document")))?;

        let mut schema = Schema::from_xml(&xml).map_err(|err| Error::Resolution(err.to_string()))?;
        schema.add_defaults();
        let schema = Arc::new(schema);
        self.cache.lock().await.insert(key, schema.clone());
        Ok(schema)
    }

    /// Fills in whatever of path and interface the caller left out. With
    /// both missing the object tree is walked depth-first from `/`; the
    /// first interface carrying the member wins.
    async fn resolve(
        &self,
        dest: &str,
        path: Option<&str>,
        iface: Option<&str>,
        kind: MemberKind,
        member: &str,
    ) -> Result<(String, String), Error> {
        if let (Some(path), Some(iface)) = (path, iface) {
            return Ok((path.to_string(), iface.to_string()));
        }

        match path {
            Some(path) => {
                let schema = self.introspect(dest, path).await?;
                let iface = find_member(&schema, iface, kind, member)
                    .ok_or_else(|| not_found(dest, member))?;
                Ok((path.to_string(), iface))
            }
            None => {
                let mut stack = vec!["/".to_string()];
                while let Some(path) = stack.pop() {
                    let schema = self.introspect(dest, &path).await?;
                    if let Some(iface) = find_member(&schema, iface, kind, member) {
                        return Ok((path, iface));
                    }
                    // reversed so the first child is visited next
                    for child in schema.nodes.iter().rev() {
                        stack.push(join_path(&path, child));
                    }
                }
                Err(not_found(dest, member))
            }
        }
    }

    /// A method call. Omitted path and interface are resolved through
    /// introspection, an omitted signature is read from the method's input
    /// descriptors; a caller-supplied signature is sent as-is, mismatch and
    /// all, so the peer gets to reject it.
    pub async fn call(
        &self,
        dest: &str,
        path: Option<&str>,
        iface: Option<&str>,
        member: &str,
        body: Vec<Arg>,
        signature: Option<&str>,
    ) -> Result<Vec<Arg>, Error> {
        let (path, iface) = self.resolve(dest, path, iface, MemberKind::Method, member).await?;

        let kinds = match signature {
            Some(text) => {
                let kinds = parse_signature(text).map_err(Error::Protocol)?;
                if kinds.is_empty() { None } else { Some(kinds) }
            }
            None if body.is_empty() => None,
            None => {
                let schema = self.introspect(dest, &path).await?;
                let method = schema
                    .interface(&iface)
                    .and_then(|i| i.methods.get(member))
                    .ok_or_else(|| not_found(dest, member))?;
                Some(parse_signature(&method.input_signature()).map_err(Error::Protocol)?)
            }
        };

        self.con.call(dest, &path, &iface, member, body, kinds, MessageFlags::empty()).await
    }

    /// `org.freedesktop.DBus.Properties.Get`, variant already unwrapped.
    pub async fn get_property(
        &self,
        dest: &str,
        path: Option<&str>,
        iface: Option<&str>,
        name: &str,
    ) -> Result<Arg, Error> {
        let (path, iface) = self.resolve(dest, path, iface, MemberKind::Property, name).await?;
        let body = self
            .con
            .call(
                dest,
                &path,
                "org.freedesktop.DBus.Properties",
                "Get",
                vec![iface.pack(), name.to_string().pack()],
                Some(vec![Kind::String, Kind::String]),
                MessageFlags::empty(),
            )
            .await?;
        match body.into_iter().next() {
            Some(Arg::Compound(CompoundArg::Variant(inner))) => Ok(*inner),
            _ => Err(Error::Protocol(ProtocolError::Malformed("Get did not return a variant"))),
        }
    }

    /// `org.freedesktop.DBus.Properties.Set`; the value is wrapped into the
    /// variant the interface expects.
    pub async fn set_property(
        &self,
        dest: &str,
        path: Option<&str>,
        iface: Option<&str>,
        name: &str,
        value: Arg,
    ) -> Result<(), Error> {
        let (path, iface) = self.resolve(dest, path, iface, MemberKind::Property, name).await?;
        self.con
            .call(
                dest,
                &path,
                "org.freedesktop.DBus.Properties",
                "Set",
                vec![
                    iface.pack(),
                    name.to_string().pack(),
                    Arg::Compound(CompoundArg::Variant(Box::new(value))),
                ],
                Some(vec![Kind::String, Kind::String, Kind::Variant]),
                MessageFlags::empty(),
            )
            .await?;
        Ok(())
    }

    /// `org.freedesktop.DBus.Properties.GetAll`, variants unwrapped.
    pub async fn get_all_properties(
        &self,
        dest: &str,
        path: Option<&str>,
        iface: &str,
    ) -> Result<Vec<(String, Arg)>, Error> {
        let (path, iface) = self.resolve(dest, path, Some(iface), MemberKind::Interface, "").await?;
        let body = self
            .con
            .call(
                dest,
                &path,
                "org.freedesktop.DBus.Properties",
                "GetAll",
                vec![iface.pack()],
                Some(vec![Kind::String]),
                MessageFlags::empty(),
            )
            .await?;
        match body.into_iter().next() {
            Some(Arg::Compound(CompoundArg::Dict(.., entries))) => {
                let mut out = Vec::with_capacity(entries.len());
                for (key, val) in entries {
                    let Some(key) = String::unpack(Arg::Simple(key)) else {
                        return Err(Error::Protocol(ProtocolError::Malformed("GetAll key is not a string")));
                    };
                    out.push((key, unwrap_variant(val)));
                }
                Ok(out)
            }
            _ => Err(Error::Protocol(ProtocolError::Malformed("GetAll did not return a dict"))),
        }
    }

    /// Registers a match rule with the bus and yields matching signals as a
    /// stream. Dropping the stream detaches it and removes the rule.
    pub async fn subscribe_signal(
        &self,
        sender: Option<&str>,
        path: Option<&str>,
        iface: Option<&str>,
        member: &str,
    ) -> Result<SignalStream, Error> {
        let rule = match_rule(sender, path, iface, Some(member));
        let filter = SignalFilter {
            sender: sender.map(Into::into),
            path: path.map(Into::into),
            interface: iface.map(Into::into),
            member: Some(member.into()),
        };

        // install locally first so nothing between the AddMatch reply and the
        // first delivery is lost
        let (id, queue, overflow) = self.con.add_subscription(filter)?;
        let added = self
            .con
            .call(
                "org.freedesktop.DBus",
                "/org/freedesktop/DBus",
                "org.freedesktop.DBus",
                "AddMatch",
                vec![rule.clone().pack()],
                Some(vec![Kind::String]),
                MessageFlags::empty(),
            )
            .await;
        if let Err(err) = added {
            self.con.remove_subscription(id);
            return Err(err);
        }

        Ok(SignalStream {
            con: self.con.clone(),
            id,
            queue,
            rule,
            overflow,
        })
    }

    /// Asks the bus driver for a well-known name. Returns the
    /// `RequestName` status code.
    pub async fn request_name(&self, name: &str) -> Result<u32, Error> {
        let body = self
            .con
            .call(
                "org.freedesktop.DBus",
                "/org/freedesktop/DBus",
                "org.freedesktop.DBus",
                "RequestName",
                vec![name.to_string().pack(), 0u32.pack()],
                Some(vec![Kind::String, Kind::U32]),
                MessageFlags::empty(),
            )
            .await?;
        body.into_iter()
            .next()
            .and_then(u32::unpack)
            .ok_or(Error::Protocol(ProtocolError::Malformed("RequestName returned no status")))
    }

    pub async fn release_name(&self, name: &str) -> Result<u32, Error> {
        let body = self
            .con
            .call(
                "org.freedesktop.DBus",
                "/org/freedesktop/DBus",
                "org.freedesktop.DBus",
                "ReleaseName",
                vec![name.to_string().pack()],
                Some(vec![Kind::String]),
                MessageFlags::empty(),
            )
            .await?;
        body.into_iter()
            .next()
            .and_then(u32::unpack)
            .ok_or(Error::Protocol(ProtocolError::Malformed("ReleaseName returned no status")))
    }
}

fn find_member(schema: &Schema, iface: Option<&str>, kind: MemberKind, member: &str) -> Option<String> {
    schema
        .interfaces
        .iter()
        .find(|(name, data)| {
            iface.map_or(true, |want| want == name)
                && match kind {
                    MemberKind::Method => data.methods.contains_key(member),
                    MemberKind::Property => data.properties.contains_key(member),
                    MemberKind::Interface => true,
                }
        })
        .map(|(name, ..)| name.clone())
}

fn join_path(base: &str, child: &str) -> String {
    if base == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", base, child)
    }
}

fn not_found(dest: &str, member: &str) -> Error {
    Error::Resolution(format!("member {:?} not found on {}", member, dest))
}

pub(crate) fn unwrap_variant(arg: Arg) -> Arg {
    if let Arg::Compound(CompoundArg::Variant(inner)) = arg { *inner } else { arg }
}

fn match_rule(sender: Option<&str>, path: Option<&str>, iface: Option<&str>, member: Option<&str>) -> String {
    let mut rule = String::from("type='signal'");
    let parts = [("sender", sender), ("path", path), ("interface", iface), ("member", member)];
    for (key, val) in parts {
        if let Some(val) = val {
            rule.push_str(&format!(",{}='{}'", key, val));
        }
    }
    rule
}

/// A live signal subscription. Single-consumer; drop it to unsubscribe.
pub struct SignalStream {
    con: Arc<Connection>,
    id: u64,
    queue: channel::Receiver<SignalMsg>,
    rule: String,
    overflow: Arc<AtomicBool>,
}

impl SignalStream {
    /// The next matching signal, `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<SignalMsg> {
        self.recv().await.ok()
    }

    pub(crate) async fn recv(&mut self) -> Result<SignalMsg, Error> {
        self.con.drive_until(&self.queue).await
    }

    /// Whether this subscription ever dropped a signal to keep up.
    pub fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::Relaxed)
    }
}

impl Drop for SignalStream {
    fn drop(&mut self) {
        self.con.remove_subscription(self.id);
        let mut msg = Message::method_call(
            "org.freedesktop.DBus",
            "/org/freedesktop/DBus",
            "org.freedesktop.DBus",
            "RemoveMatch",
        );
        msg.flags = MessageFlags::NO_REPLY_EXPECTED;
        msg.body = vec![std::mem::take(&mut self.rule).pack()];
        self.con.queue_frame(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testbus::spawn_bus;
    use crate::marshal::{signature_text, ObjectPath, SimpleArg, Variant};
    use crate::message::MessageKind;

    fn client(addr: &str) -> Client {
        Client::new(async_io::block_on(Connection::open(addr)).unwrap())
    }

    const ROOT_XML: &str = r#"<node>
        <node name="desk"/>
        <node name="other"/>
    </node>"#;

    const DESK_XML: &str = r#"<node>
        <interface name="org.example.Settings">
            <method name="ReadOne">
                <arg name="namespace" type="s" direction="in"/>
                <arg name="key" type="s" direction="in"/>
                <arg name="value" type="v" direction="out"/>
            </method>
            <property name="Version" type="u" access="read"/>
        </interface>
    </node>"#;

    fn introspecting_peer(msg: &Message) -> Option<Vec<Arg>> {
        if msg.headers.member.as_deref() != Some("Introspect") {
            return None;
        }
        let xml = match msg.headers.path.as_deref() {
            Some("/") => ROOT_XML,
            Some("/desk") => DESK_XML,
            _ => "<node/>",
        };
        Some(vec![xml.to_string().pack()])
    }

    #[test]
    fn call_resolves_path_interface_and_signature() {
        let addr = spawn_bus(|mut peer| {
            peer.handshake();
            peer.serve_hello();
            peer.serve(|msg| {
                if let Some(body) = introspecting_peer(msg) {
                    return body;
                }
                // echo what the client inferred so it can be asserted there
                let echo = format!(
                    "{}|{}|{}",
                    msg.headers.path.as_deref().unwrap_or(""),
                    msg.headers.interface.as_deref().unwrap_or(""),
                    msg.headers.signature.as_ref().map(|s| signature_text(s)).unwrap_or_default(),
                );
                vec![Variant::new(echo).pack()]
            });
        });

        let client = client(&addr);
        let out = async_io::block_on(client.call(
            "org.example.Svc",
            None,
            None,
            "ReadOne",
            vec!["org.example".pack(), "mode".pack()],
            None,
        ))
        .unwrap();

        let echo = Variant::unpack(out.into_iter().next().unwrap())
            .and_then(Variant::get::<String>)
            .unwrap();
        assert_eq!(echo, "/desk|org.example.Settings|ss");
    }

    #[test]
    fn missing_members_are_a_resolution_error() {
        let addr = spawn_bus(|mut peer| {
            peer.handshake();
            peer.serve_hello();
            peer.serve(|msg| introspecting_peer(msg).unwrap_or_default());
        });

        let client = client(&addr);
        let err = async_io::block_on(client.call("org.example.Svc", None, None, "Vanish", vec![], None))
            .unwrap_err();
        assert!(matches!(err, Error::Resolution(..)));
    }

    #[test]
    fn properties_resolve_and_unwrap() {
        let addr = spawn_bus(|mut peer| {
            peer.handshake();
            peer.serve_hello();
            peer.serve(|msg| {
                if let Some(body) = introspecting_peer(msg) {
                    return body;
                }
                match msg.headers.member.as_deref() {
                    Some("Get") => vec![Variant::new(7u32).pack()],
                    Some("Set") => {
                        assert_eq!(msg.headers.interface.as_deref(), Some("org.freedesktop.DBus.Properties"));
                        vec![]
                    }
                    Some("GetAll") => vec![Arg::Compound(CompoundArg::Dict(
                        Kind::String,
                        Kind::Variant,
                        vec![(SimpleArg::String("Version".into()), Variant::new(7u32).pack())],
                    ))],
                    _ => vec![],
                }
            });
        });

        let client = client(&addr);
        async_io::block_on(async {
            let val = client.get_property("org.example.Svc", None, None, "Version").await.unwrap();
            assert_eq!(val, 7u32.pack());

            client
                .set_property("org.example.Svc", Some("/desk"), Some("org.example.Settings"), "Version", 8u32.pack())
                .await
                .unwrap();

            let all = client
                .get_all_properties("org.example.Svc", Some("/desk"), "org.example.Settings")
                .await
                .unwrap();
            assert_eq!(all, vec![("Version".to_string(), 7u32.pack())]);
        });
    }

    #[test]
    fn signal_subscription_sees_the_requested_name() {
        let addr = spawn_bus(|mut peer| {
            peer.handshake();
            peer.serve_hello();

            let add_match = peer.read_frame().unwrap();
            assert_eq!(add_match.headers.member.as_deref(), Some("AddMatch"));
            peer.reply(&add_match, vec![]);

            let request = peer.read_frame().unwrap();
            assert_eq!(request.headers.member.as_deref(), Some("RequestName"));
            peer.reply(&request, vec![1u32.pack()]);

            let mut sig = Message::signal("/org/freedesktop/DBus", "org.freedesktop.DBus", "NameOwnerChanged");
            sig.headers.sender = Some("org.freedesktop.DBus".into());
            sig.body = vec![
                "org.example.Spurious".to_string().pack(),
                "".to_string().pack(),
                ":1.99".to_string().pack(),
            ];
            peer.write_frame(sig);

            peer.serve(|_| vec![]);
        });

        let client = client(&addr);
        async_io::block_on(async {
            let mut stream = client
                .subscribe_signal(Some("org.freedesktop.DBus"), None, None, "NameOwnerChanged")
                .await
                .unwrap();
            assert_eq!(client.request_name("org.example.Spurious").await.unwrap(), 1);

            let signal = stream.next().await.unwrap();
            assert_eq!(signal.member, "NameOwnerChanged");
            assert_eq!(signal.body[0], "org.example.Spurious".to_string().pack());
            assert!(!stream.overflowed());
        });
    }

    #[test]
    fn dropping_a_stream_queues_remove_match() {
        let addr = spawn_bus(|mut peer| {
            peer.handshake();
            peer.serve_hello();

            let add_match = peer.read_frame().unwrap();
            peer.reply(&add_match, vec![]);

            // the Ping frame goes out on the call path, the queued
            // RemoveMatch follows when the driver takes over
            let ping = peer.read_frame().unwrap();
            assert_eq!(ping.headers.member.as_deref(), Some("Ping"));

            let remove = peer.read_frame().unwrap();
            assert_eq!(remove.headers.member.as_deref(), Some("RemoveMatch"));
            assert_eq!(remove.kind, MessageKind::MethodCall);
            assert!(remove.flags.contains(crate::message::MessageFlags::NO_REPLY_EXPECTED));

            peer.reply(&ping, vec![ObjectPath::new("/ok").pack()]);
        });

        let client = client(&addr);
        async_io::block_on(async {
            let stream = client.subscribe_signal(None, Some("/a"), None, "Pulse").await.unwrap();
            drop(stream);

            // the queued RemoveMatch is flushed before this call is driven
            let out = client
                .call("org.example.Svc", Some("/"), Some("a.b.C"), "Ping", vec![], Some(""))
                .await
                .unwrap();
            assert_eq!(out, vec![ObjectPath::new("/ok").pack()]);
        });
    }
}
