//! Client Registry: the AID -> connection map plus the currently selected
//! client, both guarded by the single mutex the server and engine share.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;

use crate::aid::Aid;

/// One registered client process.
pub struct ClientConnection {
    pub stream: UnixStream,
    pub aid: Aid,
}

/// The AID -> connection map plus which AID (if any) currently has the
/// card's attention. There is at most one selection at a time; selecting a
/// new AID implicitly deselects the previous one (spec.md §3).
#[derive(Default)]
pub struct Registry {
    clients: HashMap<Aid, ClientConnection>,
    selected: Option<Aid>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            selected: None,
        }
    }

    /// Register a client under `aid`. Returns `false` (and registers
    /// nothing) if `aid` is already taken, matching the original's
    /// `AID_EXISTS` response.
    pub fn register(&mut self, aid: Aid, stream: UnixStream) -> bool {
        if self.clients.contains_key(&aid) {
            return false;
        }
        self.clients.insert(aid.clone(), ClientConnection { stream, aid });
        true
    }

    /// Remove a client (disconnect, I/O failure, or explicit DISCONNECT).
    /// Clears the selection if the removed client was selected.
    pub fn remove(&mut self, aid: &Aid) -> Option<ClientConnection> {
        if self.selected.as_ref() == Some(aid) {
            self.selected = None;
        }
        self.clients.remove(aid)
    }

    pub fn get(&self, aid: &Aid) -> Option<&ClientConnection> {
        self.clients.get(aid)
    }

    pub fn get_mut(&mut self, aid: &Aid) -> Option<&mut ClientConnection> {
        self.clients.get_mut(aid)
    }

    pub fn contains(&self, aid: &Aid) -> bool {
        self.clients.contains_key(aid)
    }

    /// Select `aid` as the target of subsequent APDUs. No-op success if
    /// `aid` isn't registered (a SELECT for an unknown AID leaves the
    /// reader answering with the default 6A82-equivalent status, handled
    /// by the caller, not here).
    pub fn select(&mut self, aid: Option<Aid>) {
        self.selected = aid;
    }

    pub fn selected(&self) -> Option<&Aid> {
        self.selected.as_ref()
    }

    pub fn selected_client_mut(&mut self) -> Option<&mut ClientConnection> {
        let aid = self.selected.clone()?;
        self.clients.get_mut(&aid)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// All registered AIDs, for POWER_UP/POWER_DOWN broadcast.
    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut ClientConnection> {
        self.clients.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aid(bytes: &[u8]) -> Aid {
        Aid::new(bytes).unwrap()
    }

    fn pair() -> (UnixStream, UnixStream) {
        UnixStream::pair().unwrap()
    }

    #[test]
    fn rejects_duplicate_registration() {
        let mut reg = Registry::new();
        let (a, _keep_a) = pair();
        let (b, _keep_b) = pair();
        assert!(reg.register(aid(b"AID1"), a));
        assert!(!reg.register(aid(b"AID1"), b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn removing_selected_client_clears_selection() {
        let mut reg = Registry::new();
        let (a, _keep) = pair();
        reg.register(aid(b"AID1"), a);
        reg.select(Some(aid(b"AID1")));
        assert_eq!(reg.selected(), Some(&aid(b"AID1")));
        reg.remove(&aid(b"AID1"));
        assert_eq!(reg.selected(), None);
    }

    #[test]
    fn selecting_a_new_aid_replaces_the_old_selection() {
        let mut reg = Registry::new();
        let (a, _ka) = pair();
        let (b, _kb) = pair();
        reg.register(aid(b"AID1"), a);
        reg.register(aid(b"AID2"), b);
        reg.select(Some(aid(b"AID1")));
        reg.select(Some(aid(b"AID2")));
        assert_eq!(reg.selected(), Some(&aid(b"AID2")));
    }
}
