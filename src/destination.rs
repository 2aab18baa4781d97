//! Destinations and their URI representation.
//!
//! Destinations are written as URIs such as `queue://orders` or
//! `topic://prices?consumer.prefetchSize=10`. Query parameters carry
//! configuration applied when an object is created against the destination:
//! keys under the `consumer.` prefix configure the broker-side
//! [`ConsumerInfo`](crate::command::ConsumerInfo), keys under
//! `consumer.nms.` configure the consumer object itself. Unknown keys are
//! ignored so destinations can carry options for other layers.

use std::{collections::BTreeMap, fmt};

use crate::error::{Result, WirebusError};

/// The four destination kinds supported by the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DestinationKind {
    Queue,
    Topic,
    TemporaryQueue,
    TemporaryTopic,
}

impl DestinationKind {
    fn scheme(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Topic => "topic",
            Self::TemporaryQueue => "temp-queue",
            Self::TemporaryTopic => "temp-topic",
        }
    }
}

/// A broker destination plus any options carried on its URI.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    kind: DestinationKind,
    name: String,
    options: BTreeMap<String, String>,
}

impl Destination {
    /// Create a queue destination with no options.
    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Queue, name.into())
    }

    /// Create a topic destination with no options.
    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Topic, name.into())
    }

    /// Create a temporary queue destination.
    pub fn temporary_queue(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::TemporaryQueue, name.into())
    }

    /// Create a temporary topic destination.
    pub fn temporary_topic(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::TemporaryTopic, name.into())
    }

    fn new(kind: DestinationKind, name: String) -> Self {
        Self {
            kind,
            name,
            options: BTreeMap::new(),
        }
    }

    /// Parse a destination URI of the form `scheme://name?key=value&...`.
    ///
    /// A URI without a scheme is treated as a queue name. The query string is
    /// percent-decoded with the same rules as HTML form encoding.
    ///
    /// # Errors
    ///
    /// Returns [`WirebusError::InvalidUri`] when the scheme is unknown or the
    /// destination name is empty.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = match uri.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("queue", uri),
        };
        let kind = match scheme {
            "queue" => DestinationKind::Queue,
            "topic" => DestinationKind::Topic,
            "temp-queue" => DestinationKind::TemporaryQueue,
            "temp-topic" => DestinationKind::TemporaryTopic,
            other => {
                return Err(WirebusError::InvalidUri(format!(
                    "unknown destination scheme '{other}' in '{uri}'"
                )));
            }
        };
        let (name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (rest, None),
        };
        if name.is_empty() {
            return Err(WirebusError::InvalidUri(format!(
                "destination name missing in '{uri}'"
            )));
        }
        let mut destination = Self::new(kind, name.to_owned());
        if let Some(query) = query {
            destination.options = parse_query(query);
        }
        Ok(destination)
    }

    /// The destination kind.
    #[must_use]
    pub fn kind(&self) -> DestinationKind { self.kind }

    /// The destination name without scheme or options.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// All options carried on the destination URI.
    #[must_use]
    pub fn options(&self) -> &BTreeMap<String, String> { &self.options }

    /// Options whose keys start with `prefix`, with the prefix stripped.
    ///
    /// Keys that continue with a further dotted prefix in `exclude` are left
    /// out, so `consumer.` options can be collected without swallowing the
    /// `consumer.nms.` namespace.
    #[must_use]
    pub fn options_with_prefix(&self, prefix: &str, exclude: &[&str]) -> BTreeMap<String, String> {
        self.options
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| !exclude.iter().any(|ex| key.starts_with(ex)))
            .map(|(key, value)| (key[prefix.len()..].to_owned(), value.clone()))
            .collect()
    }

    #[must_use]
    pub fn is_queue(&self) -> bool {
        matches!(
            self.kind,
            DestinationKind::Queue | DestinationKind::TemporaryQueue
        )
    }

    #[must_use]
    pub fn is_topic(&self) -> bool { !self.is_queue() }

    #[must_use]
    pub fn is_temporary(&self) -> bool {
        matches!(
            self.kind,
            DestinationKind::TemporaryQueue | DestinationKind::TemporaryTopic
        )
    }
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind.scheme(), self.name)
    }
}
