//! Connection registry — ephemeral identity for each live connection.
//!
//! DESIGN
//! ======
//! Owned exclusively by the relay engine. Each entry pairs the generated
//! identity with the connection's outbound queue (its transport handle).
//! Ids are UUID v4 and never reused. Unregistering is idempotent so
//! disconnect races never error.

use std::collections::{BTreeMap, HashMap};

use rand::Rng;
use rand::seq::IndexedRandom;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::frame::{ServerEvent, UserInfo};

/// Presence colors handed out to connections.
pub const PALETTE: [&str; 7] = ["#4361ee", "#f72585", "#7209b7", "#3a0ca3", "#4cc9f0", "#22577a", "#38a3a5"];

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("connection limit reached ({limit})")]
    Full { limit: usize },
}

/// Identity assigned to a connection for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub connection_id: Uuid,
    pub display_name: String,
    pub color: String,
    pub initials: String,
}

impl ConnectionIdentity {
    #[must_use]
    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            id: self.connection_id,
            username: self.display_name.clone(),
            color: self.color.clone(),
            initials: self.initials.clone(),
        }
    }
}

struct Entry {
    identity: ConnectionIdentity,
    outbound: mpsc::Sender<ServerEvent>,
    /// Key into `join_order`.
    joined: u64,
}

pub struct ConnectionRegistry {
    entries: HashMap<Uuid, Entry>,
    /// Registration sequence -> connection id; iteration is join order.
    join_order: BTreeMap<u64, Uuid>,
    max_connections: Option<usize>,
    next_join: u64,
}

// =============================================================================
// REGISTRY
// =============================================================================

impl ConnectionRegistry {
    #[must_use]
    pub fn new(max_connections: Option<usize>) -> Self {
        Self { entries: HashMap::new(), join_order: BTreeMap::new(), max_connections, next_join: 0 }
    }

    /// Register a connection and generate its identity.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Full`] when the configured cap is reached.
    pub fn register(&mut self, outbound: mpsc::Sender<ServerEvent>) -> Result<ConnectionIdentity, RegistryError> {
        if let Some(limit) = self.max_connections {
            if self.entries.len() >= limit {
                return Err(RegistryError::Full { limit });
            }
        }

        let mut rng = rand::rng();
        let display_name = format!("User{}", rng.random_range(0..1000));
        let initials = initials_for(&display_name);
        let color = self.pick_color(&mut rng);

        let mut connection_id = Uuid::new_v4();
        while self.entries.contains_key(&connection_id) {
            connection_id = Uuid::new_v4();
        }

        let identity = ConnectionIdentity { connection_id, display_name, color, initials };
        let joined = self.next_join;
        self.next_join += 1;
        self.join_order.insert(joined, connection_id);
        self.entries
            .insert(connection_id, Entry { identity: identity.clone(), outbound, joined });
        Ok(identity)
    }

    /// Remove a connection. Returns its identity if it was still registered.
    pub fn unregister(&mut self, connection_id: Uuid) -> Option<ConnectionIdentity> {
        let entry = self.entries.remove(&connection_id)?;
        self.join_order.remove(&entry.joined);
        Some(entry.identity)
    }

    #[must_use]
    pub fn lookup(&self, connection_id: Uuid) -> Option<&ConnectionIdentity> {
        self.entries.get(&connection_id).map(|e| &e.identity)
    }

    /// Every live identity in registration order.
    #[must_use]
    pub fn all(&self) -> Vec<ConnectionIdentity> {
        self.in_join_order().map(|e| e.identity.clone()).collect()
    }

    /// Outbound queues of every live connection, in registration order.
    pub(crate) fn outbound(&self) -> impl Iterator<Item = (Uuid, &mpsc::Sender<ServerEvent>)> {
        self.in_join_order().map(|e| (e.identity.connection_id, &e.outbound))
    }

    fn in_join_order(&self) -> impl Iterator<Item = &Entry> {
        self.join_order.values().filter_map(|id| self.entries.get(id))
    }

    pub(crate) fn outbound_for(&self, connection_id: Uuid) -> Option<&mpsc::Sender<ServerEvent>> {
        self.entries.get(&connection_id).map(|e| &e.outbound)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Random palette color, preferring ones no live connection holds.
    fn pick_color(&self, rng: &mut impl Rng) -> String {
        let free: Vec<&str> = PALETTE
            .iter()
            .copied()
            .filter(|c| !self.entries.values().any(|e| e.identity.color == *c))
            .collect();
        let pool: &[&str] = if free.is_empty() { &PALETTE } else { &free };
        pool.choose(rng).copied().unwrap_or(PALETTE[0]).to_owned()
    }
}

/// First letters of the first two words, or the first two characters of a
/// single word, upper-cased.
#[must_use]
pub fn initials_for(name: &str) -> String {
    let words: Vec<&str> = name.split_whitespace().collect();
    let initials: String = match words.as_slice() {
        [] => String::new(),
        [single] => single.chars().take(2).collect(),
        [first, second, ..] => first.chars().take(1).chain(second.chars().take(1)).collect(),
    };
    initials.to_uppercase()
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
