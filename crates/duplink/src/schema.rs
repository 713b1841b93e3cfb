//! Typed message definitions and the per-link schema catalog.
//!
//! User payloads are plain serde structs tagged with a stable wire name
//! through the [`Event`] / [`Function`] traits. Direction is expressed by
//! the [`InboundEvent`] / [`OutboundEvent`] (and function) marker traits;
//! a bidirectional item implements both markers. The markers gate the
//! runtime API at compile time: only an `OutboundEvent` can be emitted,
//! only an `InboundEvent` can be listened for.

use std::collections::{BTreeSet, HashMap};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use duplink_common::LinkVersion;

use crate::link::Link;

/// A typed event record with a stable wire name.
pub trait Event: Serialize + DeserializeOwned + Send + 'static {
    /// Wire identifier of the event. Must match on both peers.
    const NAME: &'static str;
}

/// Capability marker: this side is willing to receive the event.
pub trait InboundEvent: Event {}

/// Capability marker: this side may emit the event.
pub trait OutboundEvent: Event {}

/// A typed function record with a stable wire name and parameter/result
/// payload types.
pub trait Function: Send + 'static {
    /// Wire identifier of the function. Must match on both peers.
    const NAME: &'static str;
    /// Call parameter record.
    type Params: Serialize + DeserializeOwned + Send + 'static;
    /// Call result record.
    type Results: Serialize + DeserializeOwned + Send + 'static;
}

/// Capability marker: this side implements the function.
pub trait InboundFunction: Function {}

/// Capability marker: this side may call the function.
pub trait OutboundFunction: Function {}

/// Type-erased event listener. Decodes the payload and runs user code.
pub(crate) type EventListener = Box<dyn Fn(&Value) + Send + 'static>;

/// Type-erased function handler: decode params, invoke, encode results.
pub(crate) type FunctionHandler = Box<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

pub(crate) fn wrap_listener<E, L>(listener: L) -> EventListener
where
    E: InboundEvent,
    L: Fn(E) + Send + 'static,
{
    Box::new(move |data: &Value| match serde_json::from_value::<E>(data.clone()) {
        Ok(event) => listener(event),
        Err(err) => warn!(event = E::NAME, error = %err, "dropping undecodable event payload"),
    })
}

fn wrap_handler<F, H>(handler: H) -> FunctionHandler
where
    F: InboundFunction,
    H: Fn(F::Params) -> Result<F::Results, String> + Send + Sync + 'static,
{
    Box::new(move |params: Value| {
        let params: F::Params = serde_json::from_value(params)
            .map_err(|err| format!("invalid parameters for '{}': {err}", F::NAME))?;
        let results = handler(params)?;
        serde_json::to_value(results)
            .map_err(|err| format!("unencodable results from '{}': {err}", F::NAME))
    })
}

/// A user-defined link protocol: schema version, item definitions, and
/// lifecycle hooks.
pub trait Protocol: Send + 'static {
    /// Version number of this schema. Both peers must present the same
    /// value during the handshake.
    fn link_version(&self) -> LinkVersion;

    /// Declare every event and function of the link. Called once during
    /// link construction; the resulting catalog is immutable afterwards.
    fn define(&mut self, reg: &mut Registry);

    /// Called once when the handshake completes, with the runtime handle.
    fn on_ready(&mut self, link: Link) {
        let _ = link;
    }

    /// Called after the connection has been torn down.
    fn on_close(&mut self) {}
}

/// Collects item definitions while [`Protocol::define`] runs.
#[derive(Default)]
pub struct Registry {
    incoming_events: BTreeSet<String>,
    outgoing_events: BTreeSet<String>,
    incoming_functions: HashMap<String, FunctionHandler>,
    outgoing_functions: BTreeSet<String>,
    initial_listeners: Vec<(&'static str, EventListener)>,
}

impl Registry {
    /// Declare an event this side is willing to receive.
    pub fn incoming_event<E: InboundEvent>(&mut self) {
        self.incoming_events.insert(E::NAME.to_owned());
    }

    /// Declare an incoming event together with a fixed listener that
    /// lives as long as the link. The subscribe message is sent once the
    /// handshake completes.
    pub fn incoming_event_with<E, L>(&mut self, listener: L)
    where
        E: InboundEvent,
        L: Fn(E) + Send + 'static,
    {
        self.incoming_event::<E>();
        self.initial_listeners.push((E::NAME, wrap_listener(listener)));
    }

    /// Declare an event this side may emit.
    pub fn outgoing_event<E: OutboundEvent>(&mut self) {
        self.outgoing_events.insert(E::NAME.to_owned());
    }

    /// Declare an event both sides may emit and receive.
    pub fn bidirectional_event<E: InboundEvent + OutboundEvent>(&mut self) {
        self.incoming_event::<E>();
        self.outgoing_event::<E>();
    }

    /// Declare a function this side implements.
    pub fn incoming_function<F, H>(&mut self, handler: H)
    where
        F: InboundFunction,
        H: Fn(F::Params) -> Result<F::Results, String> + Send + Sync + 'static,
    {
        self.incoming_functions
            .insert(F::NAME.to_owned(), wrap_handler::<F, H>(handler));
    }

    /// Declare a function this side intends to call on the peer.
    pub fn outgoing_function<F: OutboundFunction>(&mut self) {
        self.outgoing_functions.insert(F::NAME.to_owned());
    }

    /// Declare a function both sides implement and may call.
    pub fn bidirectional_function<F, H>(&mut self, handler: H)
    where
        F: InboundFunction + OutboundFunction,
        H: Fn(F::Params) -> Result<F::Results, String> + Send + Sync + 'static,
    {
        self.incoming_function::<F, H>(handler);
        self.outgoing_function::<F>();
    }

    pub(crate) fn seal(self) -> (Schema, Vec<(&'static str, EventListener)>) {
        let schema = Schema {
            incoming_events: self.incoming_events,
            outgoing_events: self.outgoing_events,
            incoming_functions: self.incoming_functions,
            outgoing_functions: self.outgoing_functions,
            incoming_data: BTreeSet::new(),
            outgoing_data: BTreeSet::new(),
        };
        (schema, self.initial_listeners)
    }
}

/// The immutable schema catalog of one link: which events and functions
/// exist in each direction, plus the handlers for incoming functions.
pub struct Schema {
    pub(crate) incoming_events: BTreeSet<String>,
    pub(crate) outgoing_events: BTreeSet<String>,
    pub(crate) incoming_functions: HashMap<String, FunctionHandler>,
    pub(crate) outgoing_functions: BTreeSet<String>,
    // The data-source vocabulary is reserved in the wire protocol; these
    // stay empty but participate in the handshake.
    pub(crate) incoming_data: BTreeSet<String>,
    pub(crate) outgoing_data: BTreeSet<String>,
}

impl Schema {
    pub(crate) fn has_incoming_event(&self, name: &str) -> bool {
        self.incoming_events.contains(name)
    }

    pub(crate) fn has_outgoing_event(&self, name: &str) -> bool {
        self.outgoing_events.contains(name)
    }

    pub(crate) fn has_outgoing_function(&self, name: &str) -> bool {
        self.outgoing_functions.contains(name)
    }

    pub(crate) fn function_handler(&self, name: &str) -> Option<&FunctionHandler> {
        self.incoming_functions.get(name)
    }

    /// Names advertised in our auth message: what this side can supply.
    pub(crate) fn advertised_functions(&self) -> BTreeSet<String> {
        self.incoming_functions.keys().cloned().collect()
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("incoming_events", &self.incoming_events)
            .field("outgoing_events", &self.outgoing_events)
            .field("incoming_functions", &self.incoming_functions.keys())
            .field("outgoing_functions", &self.outgoing_functions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Temp {
        c: f64,
    }

    impl Event for Temp {
        const NAME: &'static str = "Temp";
    }
    impl InboundEvent for Temp {}
    impl OutboundEvent for Temp {}

    struct Ping;

    #[derive(Serialize, Deserialize)]
    struct PingParams {
        seq: u64,
    }

    #[derive(Serialize, Deserialize)]
    struct PingResults {
        pong: u64,
    }

    impl Function for Ping {
        const NAME: &'static str = "Ping";
        type Params = PingParams;
        type Results = PingResults;
    }
    impl InboundFunction for Ping {}
    impl OutboundFunction for Ping {}

    #[test]
    fn bidirectional_items_land_in_both_sets() {
        let mut reg = Registry::default();
        reg.bidirectional_event::<Temp>();
        reg.bidirectional_function::<Ping, _>(|p| Ok(PingResults { pong: p.seq }));
        let (schema, listeners) = reg.seal();

        assert!(schema.has_incoming_event("Temp"));
        assert!(schema.has_outgoing_event("Temp"));
        assert!(schema.has_outgoing_function("Ping"));
        assert!(schema.function_handler("Ping").is_some());
        assert_eq!(schema.advertised_functions().len(), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn fixed_listeners_are_collected_with_their_event_name() {
        let mut reg = Registry::default();
        reg.incoming_event_with::<Temp, _>(|_t| {});
        let (schema, listeners) = reg.seal();

        assert!(schema.has_incoming_event("Temp"));
        assert!(!schema.has_outgoing_event("Temp"));
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].0, "Temp");
    }

    #[test]
    fn handler_wrapper_decodes_invokes_and_encodes() {
        let mut reg = Registry::default();
        reg.incoming_function::<Ping, _>(|p| {
            if p.seq == 0 {
                Err("zero sequence".to_owned())
            } else {
                Ok(PingResults { pong: p.seq })
            }
        });
        let (schema, _) = reg.seal();
        let handler = schema.function_handler("Ping").unwrap();

        assert_eq!(handler(json!({"seq": 1})).unwrap(), json!({"pong": 1}));
        assert_eq!(handler(json!({"seq": 0})).unwrap_err(), "zero sequence");
        let err = handler(json!({"bogus": true})).unwrap_err();
        assert!(err.contains("invalid parameters"), "{err}");
    }

    #[test]
    fn listener_wrapper_swallows_undecodable_payloads() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        let listener = wrap_listener::<Temp, _>(move |t| {
            assert!(t.c > 20.0);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        listener(&json!({"c": 21.0}));
        listener(&json!({"c": "not a number"}));
        listener(&json!({"c": 22.5}));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
