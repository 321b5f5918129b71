//! Process-wide shared space
//!
//! The first isolate initialized with `shared_space` set owns the space;
//! later ones attach as clients. Clients must detach before the owner tears
//! down.

use super::IsolateId;
use crate::fatal::{fatal_error, FatalError};
use parking_lot::Mutex;

#[derive(Debug)]
pub struct SharedSpace {
    owner: IsolateId,
    clients: Mutex<Vec<IsolateId>>,
}

impl SharedSpace {
    pub fn new(owner: IsolateId) -> Self {
        Self {
            owner,
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn owner(&self) -> IsolateId {
        self.owner
    }

    pub fn attach(&self, client: IsolateId) {
        let mut clients = self.clients.lock();
        if !clients.contains(&client) {
            clients.push(client);
        }
    }

    /// Returns false if `client` was not attached
    pub fn detach(&self, client: IsolateId) -> bool {
        let mut clients = self.clients.lock();
        match clients.iter().position(|c| *c == client) {
            Some(index) => {
                clients.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clients(&self) -> Vec<IsolateId> {
        self.clients.lock().clone()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Fatal if any client is still attached
    pub fn assert_no_clients_on_tear_down(&self) {
        let clients = self.client_count();
        if clients != 0 {
            fatal_error(FatalError::SharedSpaceClientsAlive {
                owner: self.owner.as_u64(),
                clients,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_detach() {
        let space = SharedSpace::new(IsolateId::new());
        let client = IsolateId::new();
        space.attach(client);
        space.attach(client);
        assert_eq!(space.client_count(), 1);
        assert!(space.detach(client));
        assert!(!space.detach(client));
        space.assert_no_clients_on_tear_down();
    }
}
