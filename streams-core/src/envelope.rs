//! Envelope is the unit of data flowing through the graph. It is created by a source on each
//! `consume`, carries the source's [Position] contribution, and is gone once every stage of the
//! pass has finished with it.
//! NOTE: It is cheap to clone, fan-out clones the envelope once per child.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::position::Position;

#[derive(Debug, Clone)]
pub struct Envelope<P> {
    /// key of the message, also used as the partition key by log sinks.
    pub key: Option<Bytes>,
    /// actual payload of the message.
    pub value: Option<Bytes>,
    /// headers of the message.
    pub headers: Arc<HashMap<String, String>>,
    /// progress contribution attached by the source or a later stage.
    position: Option<P>,
}

impl<P> Default for Envelope<P> {
    fn default() -> Self {
        Self {
            key: None,
            value: None,
            headers: Arc::new(HashMap::new()),
            position: None,
        }
    }
}

impl<P: Position> Envelope<P> {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    /// An envelope without key and value. Sources return it when nothing is ready yet.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.value.is_none()
    }

    pub fn with_value(value: impl Into<Bytes>) -> Self {
        Self {
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Arc::new(headers);
        self
    }

    /// Attaches (or replaces) the Position contribution.
    pub fn with_position(mut self, position: P) -> Self {
        self.position = Some(position);
        self
    }

    pub fn position(&self) -> Option<&P> {
        self.position.as_ref()
    }

    pub fn take_position(&mut self) -> Option<P> {
        self.position.take()
    }
}
