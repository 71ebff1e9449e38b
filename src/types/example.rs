use std::collections::HashSet;

use serde::Deserialize;

use super::Uid;
use crate::address;

/// The public demo inbox and the messages it is allowed to show.
///
/// Allow-listed UIDs are exempt from purge and from deletion; any other mail addressed to the
/// demo inbox is dropped from the index as soon as the inbox is read.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExampleInbox {
    address: Option<String>,
    uids: HashSet<Uid>,
}

impl ExampleInbox {
    pub fn new<I>(address: &str, uids: I) -> Self
    where
        I: IntoIterator<Item = Uid>,
    {
        ExampleInbox {
            address: Some(address::normalize(address)),
            uids: uids.into_iter().collect(),
        }
    }

    /// No demo inbox at all.
    pub fn none() -> Self {
        ExampleInbox::default()
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn is_example_address(&self, address: &str) -> bool {
        match self.address {
            Some(ref a) => address::normalize(a) == address::normalize(address),
            None => false,
        }
    }

    pub fn is_example_uid(&self, uid: Uid) -> bool {
        self.uids.contains(&uid)
    }
}
