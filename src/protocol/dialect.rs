//! Protocol dialects.
//!
//! CDP and WebDriver BiDi share the envelope in [`codec`](super::codec) but
//! differ in how sessions are tagged, how lifecycle is reported, and how
//! scripts are evaluated. [`Protocol`] resolves those differences with an
//! exhaustive `match` per concern.
//!
//! # Session Tagging
//!
//! | Dialect | Outgoing | Incoming scope |
//! |---------|----------|----------------|
//! | CDP | `sessionId` on the envelope | envelope `sessionId` |
//! | BiDi | never tagged | `params.context` / `params.source.context` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::identifiers::{RemoteContextId, SessionId};

use super::codec::{self, Incoming};
use super::event::{ContextDescriptor, Event, Lifecycle, RealmOwner, TargetInfo};
use super::request::Request;
use super::value::{RemoteObject, RemoteRef, json_to_local_value};

// ============================================================================
// Protocol
// ============================================================================

/// Wire dialect spoken over a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Chrome DevTools Protocol.
    Cdp,
    /// WebDriver BiDi.
    Bidi,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cdp => f.write_str("cdp"),
            Self::Bidi => f.write_str("bidi"),
        }
    }
}

// ============================================================================
// Outgoing Call
// ============================================================================

/// A dialect-specific command ready to send.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Call {
    pub method: &'static str,
    pub params: Value,
}

impl Call {
    fn new(method: &'static str, params: Value) -> Self {
        Self { method, params }
    }
}

/// Argument to a remote function, as the dialect sees it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WireArgument<'a> {
    Value(&'a Value),
    Remote(&'a RemoteRef),
}

/// How the caller wants an evaluation result returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResultMode {
    /// Serialized JSON value.
    Value,
    /// Remote reference kept alive by the peer.
    Handle,
}

// ============================================================================
// Envelope
// ============================================================================

impl Protocol {
    /// Encodes a request, dropping the session tag for BiDi.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn encode(self, request: Request) -> Result<String> {
        let request = match self {
            Self::Cdp => request,
            Self::Bidi => request.with_session(None),
        };
        codec::encode(&request)
    }

    /// Decodes one inbound message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] for unclassifiable input.
    pub fn decode(self, text: &str) -> Result<Incoming> {
        codec::decode(text)
    }

    /// Returns `true` if the session tag travels on the envelope.
    #[inline]
    #[must_use]
    pub fn tags_sessions(self) -> bool {
        matches!(self, Self::Cdp)
    }

    /// Returns the session an event belongs to (`None` = connection root).
    #[must_use]
    pub fn event_scope(self, event: &Event) -> Option<SessionId> {
        match self {
            Self::Cdp => event.session_id.clone(),
            Self::Bidi => {
                let params = &event.params;
                match event.method.as_str() {
                    "browsingContext.contextCreated" | "browsingContext.contextDestroyed" => params
                        .get("parent")
                        .and_then(Value::as_str)
                        .map(SessionId::from),
                    _ => params
                        .get("context")
                        .or_else(|| params.get("source").and_then(|s| s.get("context")))
                        .and_then(Value::as_str)
                        .map(SessionId::from),
                }
            }
        }
    }
}

// ============================================================================
// Lifecycle Interpretation
// ============================================================================

impl Protocol {
    /// Interprets lifecycle events; returns `None` for everything else.
    #[must_use]
    pub fn lifecycle(self, event: &Event) -> Option<Lifecycle> {
        match self {
            Self::Cdp => cdp_lifecycle(event),
            Self::Bidi => bidi_lifecycle(event),
        }
    }
}

fn cdp_lifecycle(event: &Event) -> Option<Lifecycle> {
    let params = &event.params;
    let session = event.session_id.clone();

    match event.method.as_str() {
        "Target.attachedToTarget" => Some(Lifecycle::Attached {
            parent: session,
            session: SessionId::from(event.str_param("sessionId")?),
            target: params
                .get("targetInfo")
                .map(TargetInfo::from_cdp)
                .unwrap_or_default(),
        }),

        "Target.detachedFromTarget" => Some(Lifecycle::Detached {
            session: SessionId::from(event.str_param("sessionId")?),
            reason: "target detached".to_string(),
        }),

        "Runtime.executionContextCreated" => {
            let context = params.get("context")?;
            let id = context.get("id").and_then(Value::as_i64)?;
            let aux = context.get("auxData");
            let aux_str = |key: &str| aux.and_then(|a| a.get(key)).and_then(Value::as_str);

            // Worker sessions carry a single context without a frame.
            let owner = match aux_str("frameId") {
                Some(frame) => RealmOwner::frame(frame),
                None => RealmOwner::worker(session.as_ref().map_or("", SessionId::as_str)),
            };
            let is_default = aux
                .and_then(|a| a.get("isDefault"))
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let sandbox = (!is_default).then(|| {
                context
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            });

            Some(Lifecycle::ContextCreated {
                session,
                context: ContextDescriptor {
                    remote: RemoteContextId::Numeric(id),
                    owner,
                    sandbox,
                    origin: context
                        .get("origin")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                },
            })
        }

        "Runtime.executionContextDestroyed" => Some(Lifecycle::ContextDestroyed {
            session,
            remote: RemoteContextId::Numeric(params.get("executionContextId")?.as_i64()?),
        }),

        "Runtime.executionContextsCleared" => Some(Lifecycle::ContextsCleared { session }),

        // `swap` moves the frame to another process; the frame lives on.
        "Page.frameDetached" if event.str_param("reason") != Some("swap") => {
            Some(Lifecycle::OwnerGone {
                session,
                owner: RealmOwner::frame(event.str_param("frameId")?),
                reason: "frame detached".to_string(),
            })
        }

        _ => None,
    }
}

fn bidi_lifecycle(event: &Event) -> Option<Lifecycle> {
    let params = &event.params;

    match event.method.as_str() {
        "browsingContext.contextCreated" => {
            let context = event.str_param("context")?;
            let parent = event.str_param("parent").map(SessionId::from);
            let kind = if parent.is_some() { "iframe" } else { "page" };
            let mut target = TargetInfo::new(context, kind);
            target.url = event.str_param("url").unwrap_or_default().to_string();

            Some(Lifecycle::Attached {
                parent,
                session: SessionId::from(context),
                target,
            })
        }

        "browsingContext.contextDestroyed" => Some(Lifecycle::Detached {
            session: SessionId::from(event.str_param("context")?),
            reason: "browsing context destroyed".to_string(),
        }),

        "script.realmCreated" => {
            let realm = event.str_param("realm")?;
            let context = event.str_param("context");
            let (session, owner) = match (event.str_param("type"), context) {
                (Some("window"), Some(context)) => {
                    (Some(SessionId::from(context)), RealmOwner::frame(context))
                }
                _ => (None, RealmOwner::worker(realm)),
            };

            Some(Lifecycle::ContextCreated {
                session,
                context: ContextDescriptor {
                    remote: RemoteContextId::Named(Arc::from(realm)),
                    owner,
                    sandbox: params
                        .get("sandbox")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    origin: event.str_param("origin").unwrap_or_default().to_string(),
                },
            })
        }

        "script.realmDestroyed" => Some(Lifecycle::ContextDestroyed {
            session: None,
            remote: RemoteContextId::Named(Arc::from(event.str_param("realm")?)),
        }),

        _ => None,
    }
}

// ============================================================================
// Command Builders
// ============================================================================

impl Protocol {
    /// Builds a script evaluation in the given context.
    pub(crate) fn evaluate_call(
        self,
        remote: &RemoteContextId,
        expression: &str,
        mode: ResultMode,
    ) -> Call {
        match self {
            Self::Cdp => {
                let mut params = json!({
                    "expression": expression,
                    "returnByValue": mode == ResultMode::Value,
                    "awaitPromise": true,
                });
                insert_cdp_context(&mut params, "contextId", remote);
                Call::new("Runtime.evaluate", params)
            }
            Self::Bidi => Call::new(
                "script.evaluate",
                json!({
                    "expression": expression,
                    "target": { "realm": remote.to_string() },
                    "awaitPromise": true,
                    "resultOwnership": bidi_ownership(mode),
                }),
            ),
        }
    }

    /// Builds a function call in the given context.
    pub(crate) fn call_function_call(
        self,
        remote: &RemoteContextId,
        declaration: &str,
        args: &[WireArgument<'_>],
        mode: ResultMode,
    ) -> Call {
        let arguments: Vec<Value> = args.iter().map(|arg| self.encode_argument(*arg)).collect();

        match self {
            Self::Cdp => {
                let mut params = json!({
                    "functionDeclaration": declaration,
                    "arguments": arguments,
                    "returnByValue": mode == ResultMode::Value,
                    "awaitPromise": true,
                });
                insert_cdp_context(&mut params, "executionContextId", remote);
                Call::new("Runtime.callFunctionOn", params)
            }
            Self::Bidi => Call::new(
                "script.callFunction",
                json!({
                    "functionDeclaration": declaration,
                    "target": { "realm": remote.to_string() },
                    "arguments": arguments,
                    "awaitPromise": true,
                    "resultOwnership": bidi_ownership(mode),
                }),
            ),
        }
    }

    /// Encodes one function argument.
    pub(crate) fn encode_argument(self, arg: WireArgument<'_>) -> Value {
        match (self, arg) {
            (Self::Cdp, WireArgument::Value(value)) => json!({ "value": value }),
            (Self::Cdp, WireArgument::Remote(remote)) => json!({ "objectId": remote.object_id }),
            (Self::Bidi, WireArgument::Value(value)) => json_to_local_value(value),
            (Self::Bidi, WireArgument::Remote(remote)) => match &remote.shared_id {
                Some(shared) => json!({ "sharedId": shared }),
                None => json!({ "handle": remote.object_id }),
            },
        }
    }

    /// Builds the release call for a remote reference.
    pub(crate) fn release_call(self, remote: &RemoteContextId, object: &RemoteRef) -> Call {
        match self {
            Self::Cdp => Call::new("Runtime.releaseObject", json!({ "objectId": object.object_id })),
            Self::Bidi => Call::new(
                "script.disown",
                json!({
                    "handles": [object.object_id],
                    "target": { "realm": remote.to_string() },
                }),
            ),
        }
    }

    /// Builds the node lookup that starts a CDP adoption.
    pub(crate) fn describe_node_call(self, object: &RemoteRef) -> Call {
        Call::new("DOM.describeNode", json!({ "objectId": object.object_id }))
    }

    /// Builds the CDP call resolving a backend node inside a context.
    pub(crate) fn resolve_node_call(self, backend_node_id: i64, remote: &RemoteContextId) -> Call {
        let mut params = json!({ "backendNodeId": backend_node_id });
        insert_cdp_context(&mut params, "executionContextId", remote);
        Call::new("DOM.resolveNode", params)
    }

    /// Builds the explicit detach call, if the dialect has one.
    pub(crate) fn detach_call(self, session: &SessionId) -> Option<Call> {
        match self {
            Self::Cdp => Some(Call::new(
                "Target.detachFromTarget",
                json!({ "sessionId": session.as_str() }),
            )),
            Self::Bidi => None,
        }
    }

    /// Decodes an evaluate / call-function result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Evaluation`] if the script threw.
    pub(crate) fn parse_evaluation(self, result: &Value) -> Result<RemoteObject> {
        match self {
            Self::Cdp => {
                if let Some(details) = result.get("exceptionDetails") {
                    return Err(Error::evaluation(exception_text(details)));
                }
                Ok(RemoteObject::from_cdp(result.get("result").unwrap_or(&Value::Null)))
            }
            Self::Bidi => {
                if result.get("type").and_then(Value::as_str) == Some("exception") {
                    let details = result.get("exceptionDetails").unwrap_or(&Value::Null);
                    return Err(Error::evaluation(exception_text(details)));
                }
                Ok(RemoteObject::from_bidi(result.get("result").unwrap_or(&Value::Null)))
            }
        }
    }
}

fn insert_cdp_context(params: &mut Value, key: &str, remote: &RemoteContextId) {
    let Some(map) = params.as_object_mut() else {
        return;
    };
    match remote {
        RemoteContextId::Numeric(id) => {
            map.insert(key.to_string(), json!(id));
        }
        RemoteContextId::Named(unique) => {
            map.insert("uniqueContextId".to_string(), json!(unique.as_ref()));
        }
    }
}

fn bidi_ownership(mode: ResultMode) -> &'static str {
    match mode {
        ResultMode::Value => "none",
        ResultMode::Handle => "root",
    }
}

/// Picks the most descriptive text from exception details.
fn exception_text(details: &Value) -> String {
    details
        .get("exception")
        .and_then(|e| e.get("description"))
        .and_then(Value::as_str)
        .or_else(|| details.get("text").and_then(Value::as_str))
        .unwrap_or("script threw")
        .to_string()
}

// ============================================================================
// Tests
// ============================================================================
