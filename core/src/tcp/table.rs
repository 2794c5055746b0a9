//! The connection table: tracks every live flow, with an admission-control
//! cap on how many can be open at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{CoreError, CoreResult};
use crate::tcp::connection::{Connection, FlowKey};

pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

pub struct ConnectionTable {
    connections: Mutex<HashMap<FlowKey, Arc<Mutex<Connection>>>>,
    max_connections: usize,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        ConnectionTable {
            connections: Mutex::new(HashMap::new()),
            max_connections,
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<Mutex<Connection>>> {
        self.connections.lock().unwrap().get(key).cloned()
    }

    /// Admits a new connection, rejecting it once the table is at capacity.
    /// The caller (the SYN handler) responds to a rejection with RST, as it
    /// does for any other unrecognized flow.
    pub fn insert(&self, connection: Connection) -> CoreResult<Arc<Mutex<Connection>>> {
        let mut table = self.connections.lock().unwrap();
        if table.len() >= self.max_connections {
            return Err(CoreError::resource(format!(
                "connection table full ({} connections)",
                self.max_connections
            )));
        }
        let key = connection.key;
        let entry = Arc::new(Mutex::new(connection));
        table.insert(key, entry.clone());
        Ok(entry)
    }

    pub fn remove(&self, key: &FlowKey) {
        self.connections.lock().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn flow(port: u16) -> FlowKey {
        FlowKey {
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
            local_port: 443,
            remote_addr: Ipv4Addr::new(10, 0, 0, 2),
            remote_port: port,
        }
    }

    #[test]
    fn inserts_and_fetches_by_key() {
        let table = ConnectionTable::new(DEFAULT_MAX_CONNECTIONS);
        let key = flow(1);
        table.insert(Connection::new(key, 1, 2)).unwrap();
        assert!(table.get(&key).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn rejects_once_at_capacity() {
        let table = ConnectionTable::new(1);
        table.insert(Connection::new(flow(1), 1, 2)).unwrap();
        assert!(table.insert(Connection::new(flow(2), 1, 2)).is_err());
    }

    #[test]
    fn remove_frees_capacity() {
        let table = ConnectionTable::new(1);
        let key = flow(1);
        table.insert(Connection::new(key, 1, 2)).unwrap();
        table.remove(&key);
        assert!(table.insert(Connection::new(flow(2), 1, 2)).is_ok());
    }
}
