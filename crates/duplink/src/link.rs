//! The per-connection link state machine and its user-facing handle.
//!
//! All link state lives in [`LinkCore`], which is owned and driven by the
//! connection supervisor task; it is never touched from two threads. User
//! code holds a [`Link`] handle that validates operations against the
//! immutable schema and forwards them as [`Command`]s over a FIFO channel,
//! so registration order, fan-out order and write order all coincide with
//! command order.

use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use duplink_common::{CloseCode, LinkVersion, Message, ProtoVersion, SubId, Tid};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::schema::{
    wrap_listener, EventListener, InboundEvent, OutboundEvent, OutboundFunction, Protocol,
    Registry, Schema,
};
use crate::subscription::{EventSubscription, RemoveOutcome, SubscriptionTable};
use crate::transaction::{
    CallOutcome, Direction, KindTag, TidSeries, TransactionKind, TransactionTable,
};

/// Which side of the connection a link plays. Determines the sign of its
/// transaction id series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The accepting side; positive transaction ids.
    Server,
    /// The dialing side; negative transaction ids.
    Client,
}

/// Link lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    AuthPending,
    Authenticated,
    Closing,
    Closed,
}

/// An operation submitted by a [`Link`] handle.
pub(crate) enum Command {
    Emit {
        name: &'static str,
        data: Value,
    },
    Call {
        name: &'static str,
        params: Value,
        reply: oneshot::Sender<CallOutcome>,
    },
    Subscribe {
        name: &'static str,
        sub_id: SubId,
        listener: EventListener,
    },
    CancelSubscription {
        name: &'static str,
        sub_id: SubId,
    },
    Close,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Emit { name, .. } => f.debug_struct("Emit").field("name", name).finish(),
            Self::Call { name, .. } => f.debug_struct("Call").field("name", name).finish(),
            Self::Subscribe { name, sub_id, .. } => f
                .debug_struct("Subscribe")
                .field("name", name)
                .field("sub_id", sub_id)
                .finish(),
            Self::CancelSubscription { name, sub_id } => f
                .debug_struct("CancelSubscription")
                .field("name", name)
                .field("sub_id", sub_id)
                .finish(),
            Self::Close => f.write_str("Close"),
        }
    }
}

/// Something the link wants written to the transport.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Message),
    Close { code: CloseCode },
}

/// Builds the per-connection machinery for one protocol instance:
/// the state machine, the user handle, and the command receiver.
pub(crate) fn build<P: Protocol>(
    role: Role,
    protocol: &mut P,
    config: &LinkConfig,
) -> (LinkCore, Link, mpsc::UnboundedReceiver<Command>) {
    let mut registry = Registry::default();
    protocol.define(&mut registry);
    let (schema, initial_listeners) = registry.seal();
    let schema = Arc::new(schema);

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let sub_ids = Arc::new(AtomicU64::new(0));

    let mut core = LinkCore::new(
        role,
        protocol.link_version(),
        Arc::clone(&schema),
        config.request_pong_messages,
    );
    for (name, listener) in initial_listeners {
        let sub_id = sub_ids.fetch_add(1, Ordering::Relaxed) + 1;
        core.register_listener(name, sub_id, listener);
    }

    let link = Link {
        schema,
        commands: command_tx,
        sub_ids,
    };
    (core, link, command_rx)
}

/// Runtime handle to one link, cloneable and usable from any thread.
///
/// Obtained through [`Protocol::on_ready`]. Operations on a link whose
/// connection has ended fail with [`LinkError::ConnectionClosed`] (or are
/// silently dropped where the operation has no result).
#[derive(Debug, Clone)]
pub struct Link {
    schema: Arc<Schema>,
    commands: mpsc::UnboundedSender<Command>,
    sub_ids: Arc<AtomicU64>,
}

impl Link {
    /// Emits an event to the peer.
    ///
    /// Silently does nothing while the peer has no listener for the
    /// event.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidOutgoingEvent`] immediately (no wire traffic)
    /// when `E` was not defined as outgoing, and
    /// [`LinkError::ConnectionClosed`] when the link is gone.
    pub fn emit<E: OutboundEvent>(&self, event: &E) -> Result<(), LinkError> {
        if !self.schema.has_outgoing_event(E::NAME) {
            return Err(LinkError::InvalidOutgoingEvent(E::NAME.to_owned()));
        }
        let data = serde_json::to_value(event)?;
        self.commands
            .send(Command::Emit { name: E::NAME, data })
            .map_err(|_| LinkError::ConnectionClosed)
    }

    /// Calls a remote function.
    ///
    /// The call message is sent right away; the returned future resolves
    /// once the peer responds. Await it anywhere **except** inside a
    /// listener or function handler of the same link: those run on the
    /// connection task, and blocking it would deadlock the response.
    ///
    /// The future fails with [`LinkError::RemoteFunction`] when the
    /// remote handler reports an error, with
    /// [`LinkError::ConnectionClosed`] when the connection ends first,
    /// and with the local cause when the call could not be sent at all.
    pub fn call<F: OutboundFunction>(
        &self,
        params: &F::Params,
    ) -> impl Future<Output = Result<F::Results, LinkError>> + Send + 'static {
        let submitted = (|| {
            if !self.schema.has_outgoing_function(F::NAME) {
                return Err(LinkError::InvalidIdentifier(F::NAME.to_owned()));
            }
            let params = serde_json::to_value(params)?;
            let (reply, receiver) = oneshot::channel();
            self.commands
                .send(Command::Call {
                    name: F::NAME,
                    params,
                    reply,
                })
                .map_err(|_| LinkError::ConnectionClosed)?;
            Ok(receiver)
        })();

        async move {
            match submitted?.await {
                Ok(CallOutcome::Results(results)) => Ok(serde_json::from_value(results)?),
                Ok(CallOutcome::RemoteError(info)) => Err(LinkError::RemoteFunction(info)),
                Ok(CallOutcome::Failed(err)) => Err(err),
                Err(_) => Err(LinkError::ConnectionClosed),
            }
        }
    }

    /// Registers a listener for an incoming event.
    ///
    /// The returned handle cancels the listener when dropped. The first
    /// listener for an event subscribes it with the peer; the
    /// subscription message is deferred until the handshake completes if
    /// necessary.
    ///
    /// # Errors
    ///
    /// [`LinkError::InvalidIdentifier`] when `E` was not defined as
    /// incoming, [`LinkError::ConnectionClosed`] when the link is gone.
    pub fn subscribe<E, L>(&self, listener: L) -> Result<EventSubscription, LinkError>
    where
        E: InboundEvent,
        L: Fn(E) + Send + 'static,
    {
        if !self.schema.has_incoming_event(E::NAME) {
            return Err(LinkError::InvalidIdentifier(E::NAME.to_owned()));
        }
        let sub_id = self.sub_ids.fetch_add(1, Ordering::Relaxed) + 1;
        self.commands
            .send(Command::Subscribe {
                name: E::NAME,
                sub_id,
                listener: wrap_listener(listener),
            })
            .map_err(|_| LinkError::ConnectionClosed)?;
        Ok(EventSubscription::new(E::NAME, sub_id, self.commands.clone()))
    }

    /// Asks the connection to close gracefully (code 1000).
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Whether the connection behind this handle is still being driven.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// The link state machine. Owned by the connection supervisor; all
/// methods are synchronous and buffer their outbound traffic for the
/// supervisor to flush.
pub(crate) struct LinkCore {
    role: Role,
    link_version: LinkVersion,
    schema: Arc<Schema>,
    request_pong_messages: bool,

    tids: TidSeries,
    transactions: TransactionTable,
    subs: SubscriptionTable,
    /// Outgoing events the peer has subscribed to.
    active_outgoing: BTreeSet<String>,

    phase: Phase,
    ack_sent: bool,
    ack_received: bool,
    just_authenticated: bool,
    /// Peer asked for application-level pong messages (`no_ping: true`).
    peer_needs_pong: bool,

    out: VecDeque<Outbound>,
}

impl LinkCore {
    fn new(
        role: Role,
        link_version: LinkVersion,
        schema: Arc<Schema>,
        request_pong_messages: bool,
    ) -> Self {
        Self {
            role,
            link_version,
            schema,
            request_pong_messages,
            tids: TidSeries::new(role),
            transactions: TransactionTable::default(),
            subs: SubscriptionTable::default(),
            active_outgoing: BTreeSet::new(),
            phase: Phase::AuthPending,
            ack_sent: false,
            ack_received: false,
            just_authenticated: false,
            peer_needs_pong: false,
            out: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn authenticated(&self) -> bool {
        !matches!(self.phase, Phase::AuthPending)
    }

    /// True exactly once, right after the handshake completes.
    pub(crate) fn take_just_authenticated(&mut self) -> bool {
        std::mem::take(&mut self.just_authenticated)
    }

    /// Buffered outbound traffic, in send order.
    pub(crate) fn take_outbound(&mut self) -> VecDeque<Outbound> {
        std::mem::take(&mut self.out)
    }

    /// Opens the handshake: registers the outgoing auth transaction and
    /// sends our offer.
    pub(crate) fn on_connection_established(&mut self) -> Result<(), LinkError> {
        let tid = self.tids.next();
        self.transactions
            .create(tid, Direction::Outgoing, TransactionKind::Auth)?;
        self.send(Message::Auth {
            tid,
            proto_version: ProtoVersion::CURRENT,
            link_version: self.link_version,
            no_ping: self.request_pong_messages.then_some(true),
            events: self.schema.outgoing_events.clone(),
            data_sources: self.schema.outgoing_data.clone(),
            functions: self.schema.advertised_functions(),
        });
        Ok(())
    }

    /// Handles one inbound text frame.
    pub(crate) fn handle_frame(&mut self, text: &str) -> Result<(), LinkError> {
        let msg = Message::parse(text)?;
        if matches!(msg, Message::Pong) {
            // This side reads transport pongs directly and never asks for
            // application-level ones.
            warn!("ignoring unsolicited pong message");
            return Ok(());
        }
        if self.authenticated() {
            self.handle_post_auth(msg)
        } else {
            self.handle_pre_auth(msg)
        }
    }

    fn handle_pre_auth(&mut self, msg: Message) -> Result<(), LinkError> {
        match msg {
            Message::Auth {
                tid,
                proto_version,
                link_version,
                no_ping,
                events,
                data_sources,
                functions,
            } => {
                // The higher side decides protocol compatibility; the
                // lower side will accept in the mirrored exchange.
                if ProtoVersion::CURRENT > proto_version && !proto_version.is_compatible() {
                    return Err(LinkError::IncompatibleLink {
                        code: CloseCode::ProtoVersionIncompatible,
                        reason: format!(
                            "incompatible protocol versions: ours {}, peer {proto_version}",
                            ProtoVersion::CURRENT
                        ),
                    });
                }
                if link_version != self.link_version {
                    return Err(LinkError::IncompatibleLink {
                        code: CloseCode::LinkVersionMismatch,
                        reason: format!(
                            "link versions do not match: ours {}, peer {link_version}",
                            self.link_version
                        ),
                    });
                }
                if let Some(no_ping) = no_ping {
                    self.peer_needs_pong = no_ping;
                }
                if !self.schema.incoming_events.is_subset(&events) {
                    return Err(LinkError::IncompatibleLink {
                        code: CloseCode::EventRequirementsNotSatisfied,
                        reason: "peer does not supply all events this side requires".to_owned(),
                    });
                }
                if !self.schema.incoming_data.is_subset(&data_sources) {
                    return Err(LinkError::IncompatibleLink {
                        code: CloseCode::DataSourceRequirementsNotSatisfied,
                        reason: "peer does not supply all data sources this side requires"
                            .to_owned(),
                    });
                }
                if !self.schema.outgoing_functions.is_subset(&functions) {
                    return Err(LinkError::IncompatibleLink {
                        code: CloseCode::FunctionRequirementsNotSatisfied,
                        reason: "peer does not implement all functions this side calls".to_owned(),
                    });
                }

                // The peer's auth transaction completes with this single
                // reply, so it is never registered locally.
                self.send(Message::AuthAck { tid });
                self.ack_sent = true;
                self.update_auth_done();
                Ok(())
            }
            Message::AuthAck { tid } => {
                let transaction = self.transactions.expect(tid, KindTag::Auth)?;
                if transaction.direction != Direction::Outgoing {
                    return Err(LinkError::Protocol(
                        "received auth_ack for the peer's own auth transaction".to_owned(),
                    ));
                }
                self.transactions.complete(tid);
                self.ack_received = true;
                self.update_auth_done();
                Ok(())
            }
            other => Err(LinkError::Protocol(format!(
                "unexpected pre-auth message '{}'",
                other.msg_type()
            ))),
        }
    }

    fn update_auth_done(&mut self) {
        if self.ack_sent && self.ack_received && self.phase == Phase::AuthPending {
            self.phase = Phase::Authenticated;
            self.just_authenticated = true;
            debug!(role = ?self.role, "link authenticated");

            // Subscribe everything that gathered listeners while the
            // handshake was still running.
            let pending: Vec<String> = self.subs.active_names().map(str::to_owned).collect();
            for name in pending {
                self.send_event_subscribe(&name);
            }
        }
    }

    fn handle_post_auth(&mut self, msg: Message) -> Result<(), LinkError> {
        match msg {
            Message::EvtSub { name, .. } => {
                // The handshake guaranteed the peer only subscribes to
                // events we advertised; anything else is a peer library
                // bug, not worth killing the connection over.
                if self.schema.has_outgoing_event(&name) {
                    self.active_outgoing.insert(name);
                } else {
                    warn!(event = %name, "subscribe for an event not defined as outgoing; ignoring");
                }
                Ok(())
            }
            Message::EvtUnsub { name, .. } => {
                if !self.active_outgoing.remove(&name) {
                    warn!(event = %name, "unsubscribe for an event that was not subscribed; ignoring");
                }
                Ok(())
            }
            Message::EvtEmit { name, data, .. } => {
                if !self.subs.is_active(&name) {
                    warn!(event = %name, "emit for an event without local listeners; ignoring");
                    return Ok(());
                }
                for sub_id in self.subs.ids_for(&name) {
                    if let Some(listener) = self.subs.listener(sub_id) {
                        listener(&data);
                    }
                }
                Ok(())
            }
            Message::DataSub { .. }
            | Message::DataSubAck { .. }
            | Message::DataSubNak { .. }
            | Message::DataUnsub { .. }
            | Message::DataChange { .. } => {
                debug!(
                    msg_type = %msg.msg_type(),
                    "data subscription messages are reserved and not handled"
                );
                Ok(())
            }
            Message::FuncCall { tid, name, params } => {
                let schema = Arc::clone(&self.schema);
                let Some(handler) = schema.function_handler(&name) else {
                    // No response: the handshake should have prevented
                    // this, and answering unknown names invites
                    // amplification.
                    warn!(function = %name, "call for an unknown function; ignoring");
                    return Ok(());
                };
                let response = match handler(params) {
                    Ok(results) => Message::FuncResult { tid, results },
                    Err(info) => Message::FuncErr { tid, info },
                };
                self.send(response);
                Ok(())
            }
            Message::FuncResult { tid, results } => {
                self.transactions.expect(tid, KindTag::FunctionCall)?;
                self.complete_call(tid, CallOutcome::Results(results));
                Ok(())
            }
            Message::FuncErr { tid, info } => {
                self.transactions.expect(tid, KindTag::FunctionCall)?;
                self.complete_call(tid, CallOutcome::RemoteError(info));
                Ok(())
            }
            Message::Auth { .. } | Message::AuthAck { .. } => Err(LinkError::Protocol(
                "authentication message after handshake completion".to_owned(),
            )),
            Message::Pong => Ok(()),
        }
    }

    fn complete_call(&mut self, tid: Tid, outcome: CallOutcome) {
        if let Some(transaction) = self.transactions.complete(tid) {
            if let TransactionKind::FunctionCall { reply } = transaction.kind {
                if reply.send(outcome).is_err() {
                    debug!(tid, "caller dropped its future before the response arrived");
                }
            }
        }
    }

    /// Handles one command submitted through a [`Link`] handle.
    pub(crate) fn handle_command(&mut self, command: Command) -> Result<(), LinkError> {
        match command {
            Command::Emit { name, data } => {
                if !self.schema.has_outgoing_event(name) {
                    return Err(LinkError::InvalidOutgoingEvent(name.to_owned()));
                }
                if !self.active_outgoing.contains(name) {
                    // Peer has no listeners; nothing goes on the wire.
                    return Ok(());
                }
                let tid = self.tids.next();
                self.send(Message::EvtEmit {
                    tid,
                    name: name.to_owned(),
                    data,
                });
                Ok(())
            }
            Command::Call { name, params, reply } => {
                let tid = self.tids.next();
                if self.transactions.contains(tid) {
                    // A collided tid fails this one call; the link and
                    // every other in-flight exchange stay up.
                    let _ = reply.send(CallOutcome::Failed(LinkError::DuplicateTransaction(tid)));
                    return Err(LinkError::DuplicateTransaction(tid));
                }
                self.transactions.create(
                    tid,
                    Direction::Outgoing,
                    TransactionKind::FunctionCall { reply },
                )?;
                self.send(Message::FuncCall {
                    tid,
                    name: name.to_owned(),
                    params,
                });
                Ok(())
            }
            Command::Subscribe {
                name,
                sub_id,
                listener,
            } => {
                self.register_listener(name, sub_id, listener);
                Ok(())
            }
            Command::CancelSubscription { name, sub_id } => {
                self.unregister_listener(name, sub_id);
                Ok(())
            }
            Command::Close => {
                self.phase = Phase::Closing;
                self.out.push_back(Outbound::Close {
                    code: CloseCode::ClosedByUser,
                });
                Ok(())
            }
        }
    }

    pub(crate) fn register_listener(&mut self, name: &str, sub_id: SubId, listener: EventListener) {
        let first_for_name = self.subs.insert(name, sub_id, listener);
        // For the first listener the event just became active; tell the
        // peer, unless the handshake is still pending (the transition to
        // Authenticated flushes those).
        if first_for_name && self.phase == Phase::Authenticated {
            self.send_event_subscribe(name);
        }
    }

    fn unregister_listener(&mut self, name: &str, sub_id: SubId) {
        if let RemoveOutcome::Removed {
            last_for_name: true,
        } = self.subs.remove(name, sub_id)
        {
            if self.phase == Phase::Authenticated {
                self.send_event_unsubscribe(name);
            }
        }
    }

    /// Called when a transport pong arrives; forwards it as an
    /// application-level pong iff the peer asked for that during auth.
    pub(crate) fn on_pong_received(&mut self) {
        if self.peer_needs_pong {
            self.send(Message::Pong);
        }
    }

    /// Final cleanup when the connection ends: releases every awaiting
    /// call future.
    pub(crate) fn teardown(&mut self) {
        self.transactions.fail_pending();
        self.phase = Phase::Closed;
    }

    fn send(&mut self, msg: Message) {
        self.out.push_back(Outbound::Frame(msg));
    }

    fn send_event_subscribe(&mut self, name: &str) {
        let tid = self.tids.next();
        self.send(Message::EvtSub {
            tid,
            name: name.to_owned(),
        });
    }

    fn send_event_unsubscribe(&mut self, name: &str) {
        let tid = self.tids.next();
        self.send(Message::EvtUnsub {
            tid,
            name: name.to_owned(),
        });
    }
}
