//! The desktop-portal request pattern: a call returns a handle object which
//! later emits a `Response` signal carrying the actual results.

use std::{
    borrow::Cow,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    client::{unwrap_variant, Client},
    error::{Error, ProtocolError},
    marshal::{signature_text, Arg, CompoundArg, Kind, SimpleArg, ValidArg},
};

const REQUEST_IFACE: &str = "org.freedesktop.portal.Request";

static TOKEN: AtomicU64 = AtomicU64::new(1);

/// The request object path the portal derives from a sender and token.
fn request_path(unique_name: &str, token: &str) -> String {
    let sender = unique_name.trim_start_matches(':').replace('.', "_");
    format!("/org/freedesktop/portal/desktop/request/{}/{}", sender, token)
}

impl Client {
    /// A portal method call. Subscribes to the `Response` signal on the
    /// predicted request path before calling, follows the handle the reply
    /// actually names, and waits for the response tuple. A response code of
    /// zero yields the results; anything else is a [`Error::Portal`].
    pub async fn portal_call(
        &self,
        dest: &str,
        path: Option<&str>,
        iface: Option<&str>,
        member: &str,
        mut args: Vec<Arg>,
        options: Vec<(String, Arg)>,
    ) -> Result<Vec<(String, Arg)>, Error> {
        let unique = self
            .unique_name()
            .ok_or(Error::Disconnect(None))?
            .to_string();

        let mut options = options;
        let token = options
            .iter()
            .find(|(key, ..)| key == "handle_token")
            .and_then(|(.., val)| match val {
                Arg::Simple(SimpleArg::String(s)) => Some(s.clone().into_owned()),
                _ => None,
            });
        let token = match token {
            Some(token) => token,
            None => {
                let token = format!("minibus{}", TOKEN.fetch_add(1, Ordering::Relaxed));
                options.push(("handle_token".to_string(), token.clone().pack()));
                token
            }
        };

        // listen before calling, the response can beat the reply
        let predicted = request_path(&unique, &token);
        let mut responses = self
            .subscribe_signal(None, Some(&predicted), Some(REQUEST_IFACE), "Response")
            .await?;

        // options ride as the trailing a{sv}
        let entries = options
            .into_iter()
            .map(|(key, val)| {
                let val = Arg::Compound(CompoundArg::Variant(Box::new(val)));
                (SimpleArg::String(Cow::Owned(key)), val)
            })
            .collect();
        args.push(Arg::Compound(CompoundArg::Dict(Kind::String, Kind::Variant, entries)));
        let signature = signature_text(&args.iter().map(Arg::kind).collect::<Vec<_>>());

        let reply = self.call(dest, path, iface, member, args, Some(&signature)).await?;
        let handle = match reply.into_iter().next() {
            Some(Arg::Simple(SimpleArg::ObjPath(handle))) => handle.into_owned(),
            _ => {
                return Err(Error::Protocol(ProtocolError::Malformed(
                    "portal call returned no request handle",
                )))
            }
        };

        if handle != predicted {
            // older portals pick their own handle; follow it
            responses = self
                .subscribe_signal(None, Some(&handle), Some(REQUEST_IFACE), "Response")
                .await?;
        }

        let response = responses.recv().await?;
        let mut body = response.body.into_iter();
        let code = body
            .next()
            .and_then(u32::unpack)
            .ok_or(Error::Protocol(ProtocolError::Malformed("portal response carried no code")))?;
        let results = match body.next() {
            Some(Arg::Compound(CompoundArg::Dict(.., entries))) => {
                let mut out = Vec::with_capacity(entries.len());
                for (key, val) in entries {
                    let SimpleArg::String(key) = key else {
                        return Err(Error::Protocol(ProtocolError::Malformed(
                            "portal result key is not a string",
                        )));
                    };
                    out.push((key.into_owned(), unwrap_variant(val)));
                }
                out
            }
            None => Vec::new(),
            Some(..) => {
                return Err(Error::Protocol(ProtocolError::Malformed(
                    "portal response results are not a dict",
                )))
            }
        };

        if code == 0 {
            Ok(results)
        } else {
            Err(Error::Portal { code, results })
        }
    }
}
