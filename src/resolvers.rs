//! Field resolvers: map a client operation onto a store read or a stream
//! pipeline, and shape readings into response objects.

use crate::bus::EventBus;
use crate::error::{FeedError, Result};
use crate::query::{Operation, OperationKind, RootField};
use crate::store::Store;
use crate::subscriptions::{Pipeline, Source, SourceItem};
use crate::timer::TimerStream;
use crate::types::{ChangeOperation, Reading};
use serde_json::{Map, Value};
use std::time::Duration;

/// Query field returning the latest stored reading.
pub const CURRENT_READING: &str = "currentReading";

/// Subscription field streaming synthetic readings on a timer.
pub const CURRENT_READING_SUBSCRIBE: &str = "currentReadingSubscribe";

/// Subscription field streaming readings as they are created.
pub const READING_CREATED: &str = "readingCreated";

/// Object type name reported for `__typename`.
pub const READING_TYPE_NAME: &str = "ReadingType";

/// Fields of the reading object, in response order.
pub const READING_FIELDS: [&str; 4] = ["id", "timestamp", "value", "unit"];

/// Arguments accepted (and ignored) by the reading fields.
const READING_ARGS: &[&str] = &["timestamp", "value", "unit"];

const NO_ARGS: &[&str] = &[];

/// Which resolver serves an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolver {
    CurrentReading,
    TimerSubscription,
    CreationSubscription,
}

impl Resolver {
    /// Check the root field against the operation kind and its arguments.
    pub fn select(op: &Operation) -> Result<Self> {
        let field = &op.field;
        let (resolver, accepted_args): (Resolver, &[&str]) = match (op.kind, field.name.as_str()) {
            (OperationKind::Query, CURRENT_READING) => (Resolver::CurrentReading, READING_ARGS),
            (OperationKind::Subscription, CURRENT_READING_SUBSCRIBE) => {
                (Resolver::TimerSubscription, READING_ARGS)
            }
            (OperationKind::Subscription, READING_CREATED) => (Resolver::CreationSubscription, NO_ARGS),
            (kind, name) => {
                return Err(FeedError::InvalidOperation(format!(
                    "unknown {} field {:?}",
                    match kind {
                        OperationKind::Query => "query",
                        OperationKind::Subscription => "subscription",
                    },
                    name
                )))
            }
        };

        for (arg, _) in &field.arguments {
            if !accepted_args.contains(&arg.as_str()) {
                return Err(FeedError::InvalidOperation(format!(
                    "unknown argument {:?} on field {:?}",
                    arg, field.name
                )));
            }
        }

        Ok(resolver)
    }

    pub fn is_subscription(&self) -> bool {
        !matches!(self, Resolver::CurrentReading)
    }
}

/// The most recently created reading, or `NotFound` when the store is empty.
///
/// Filter arguments on the field are accepted but do not narrow the result.
pub fn resolve_current_reading(store: &Store) -> Result<Reading> {
    store.latest()?.ok_or(FeedError::NotFound)
}

/// Every stored reading, oldest first.
pub fn list_readings(store: &Store) -> Result<Vec<Reading>> {
    store.list()
}

/// Synthetic readings every `interval`.
pub fn resolve_timer_subscription(interval: Duration) -> Result<Pipeline> {
    let timer = TimerStream::start(interval)?;
    Ok(Pipeline::new(Source::Timer(timer), |item| match item {
        SourceItem::Tick(tick) => Ok(tick.synthetic_reading()),
        SourceItem::Change(_) => Err(FeedError::SourceFault(
            "change event on a timer stream".into(),
        )),
    }))
}

/// Readings as they are created in the store.
pub fn resolve_creation_subscription(bus: &EventBus) -> Pipeline {
    Pipeline::new(Source::Bus(bus.subscribe()), |item| match item {
        SourceItem::Change(event) => match event.instance.as_reading() {
            Some(reading) => Ok(reading.clone()),
            None => Err(FeedError::SubscriptionFault(
                "change event is not a reading".into(),
            )),
        },
        SourceItem::Tick(_) => Err(FeedError::SourceFault("tick on an event stream".into())),
    })
    .filter(|item| {
        Ok(match item {
            SourceItem::Change(event) => {
                event.operation == ChangeOperation::Created && event.instance.as_reading().is_some()
            }
            SourceItem::Tick(_) => false,
        })
    })
}

/// Response shape for a reading field: the key it is reported under and the
/// selected sub-fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadingSelection {
    response_key: String,
    fields: Vec<String>,
}

impl ReadingSelection {
    /// Validate the field's selection set. An empty selection means all fields.
    pub fn from_field(field: &RootField) -> Result<Self> {
        for name in &field.selection {
            if name != "__typename" && !READING_FIELDS.contains(&name.as_str()) {
                return Err(FeedError::InvalidOperation(format!(
                    "unknown field {:?} on {}",
                    name, READING_TYPE_NAME
                )));
            }
        }

        let fields = if field.selection.is_empty() {
            READING_FIELDS.iter().map(|f| f.to_string()).collect()
        } else {
            field.selection.clone()
        };

        Ok(Self {
            response_key: field.response_key().to_string(),
            fields,
        })
    }

    pub fn response_key(&self) -> &str {
        &self.response_key
    }

    /// `{<key>: {..selected fields..}}`, or `{<key>: null}`.
    pub fn render(&self, reading: Option<&Reading>) -> Value {
        let object = match reading {
            Some(reading) => {
                let mut obj = Map::new();
                for name in &self.fields {
                    let value = match name.as_str() {
                        "id" => reading
                            .id
                            .map(|id| Value::from(id.0))
                            .unwrap_or(Value::Null),
                        "timestamp" => Value::from(reading.timestamp.0),
                        "value" => Value::from(reading.value),
                        "unit" => Value::from(reading.unit.clone()),
                        "__typename" => Value::from(READING_TYPE_NAME),
                        _ => Value::Null,
                    };
                    obj.insert(name.clone(), value);
                }
                Value::Object(obj)
            }
            None => Value::Null,
        };

        let mut data = Map::new();
        data.insert(self.response_key.clone(), object);
        Value::Object(data)
    }
}
