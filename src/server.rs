//! Client Registry and Server (CRS): the Unix domain socket front end.
//!
//! Grounded in original_source/src/bin/edna_comm.cpp's accept/handshake
//! loop and, for the framed-I/O shape, the broker pattern in
//! other_examples' Tonksthebear-trybotster `broker/mod.rs`. Unlike that
//! broker, edna keeps exactly one mutex (`parking_lot::Mutex<Registry>`)
//! shared with the emulation engine rather than per-connection actors,
//! per spec.md §5's concurrency model.

use std::io::{self, ErrorKind};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::aid::Aid;
use crate::error::ProtocolError;
use crate::proto::{self, AID_EXISTS, API_VERSION, EDNA_OK, GET_API_VERSION, REGISTER_AID};
use crate::registry::Registry;

/// How often the accept/poll loop wakes up when there is nothing to do.
const TICK: Duration = Duration::from_millis(10);

pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    registry: Arc<Mutex<Registry>>,
    running: Arc<std::sync::atomic::AtomicBool>,
}

impl Server {
    /// Bind the rendezvous socket, removing a stale one left behind by a
    /// previous crashed instance (edna_comm.cpp does the same unlink before
    /// bind).
    pub fn bind(
        socket_path: &Path,
        registry: Arc<Mutex<Registry>>,
        running: Arc<std::sync::atomic::AtomicBool>,
    ) -> io::Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            registry,
            running,
        })
    }

    /// Run the accept/poll loop until `running` is cleared. Call on its own
    /// thread; see [`crate::daemon`].
    pub fn run(&self) {
        while self.running.load(std::sync::atomic::Ordering::Relaxed) {
            self.accept_ready();
            self.poll_idle_clients();
            std::thread::sleep(TICK);
        }
        self.shutdown();
    }

    fn accept_ready(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => self.handshake(stream),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Run the three-step handshake synchronously: GET_API_VERSION then
    /// REGISTER_AID. A client that misbehaves is dropped without a reply
    /// where the protocol gives no response to send.
    fn handshake(&self, mut stream: UnixStream) {
        if let Err(e) = stream.set_nonblocking(false) {
            log::warn!("failed to configure new connection: {e}");
            return;
        }
        match self.run_handshake(&mut stream) {
            Ok(aid) => {
                log::info!("client registered under AID {aid}");
                if let Err(e) = stream.set_nonblocking(true) {
                    log::warn!("failed to park registered client {aid}: {e}");
                    return;
                }
                let mut registry = self.registry.lock();
                registry.register(aid, stream);
            }
            Err(e) => {
                log::debug!("handshake failed: {e}");
            }
        }
    }

    fn run_handshake(&self, stream: &mut UnixStream) -> Result<Aid, ProtocolError> {
        let req = proto::read_frame(&mut *stream)?;
        if req.first().copied() != Some(GET_API_VERSION) {
            return Err(ProtocolError::BadVersionRequest(req.first().copied().unwrap_or(0)));
        }
        proto::write_frame(&mut *stream, &[API_VERSION])?;

        let req = proto::read_frame(&mut *stream)?;
        if req.first().copied() != Some(REGISTER_AID) {
            return Err(ProtocolError::BadRegistration(req.first().copied().unwrap_or(0)));
        }
        if req.len() < 2 {
            return Err(ProtocolError::RegistrationTooShort);
        }
        let aid = Aid::new(&req[1..]).ok_or(ProtocolError::RegistrationTooShort)?;

        let already_taken = self.registry.lock().contains(&aid);
        if already_taken {
            proto::write_frame(&mut *stream, &[AID_EXISTS])?;
            return Err(ProtocolError::BadRegistration(REGISTER_AID));
        }
        proto::write_frame(&mut *stream, &[EDNA_OK])?;
        Ok(aid)
    }

    /// Non-blocking check of every registered-but-not-selected client for a
    /// DISCONNECT message or a closed socket. The currently selected
    /// client's socket is left alone here: the engine owns it for the
    /// duration of the selection, serialised through the same mutex.
    ///
    /// `peek` only establishes that *a* byte has arrived, not that the full
    /// frame has; once that much is known the stream is switched to
    /// blocking for the single `read_frame` call, the same way
    /// `transceive`/`notify` do it, so a frame split across two `recv`s
    /// doesn't surface as a spurious `WouldBlock` protocol violation.
    fn poll_idle_clients(&self) {
        let mut registry = self.registry.lock();
        let selected = registry.selected().cloned();
        let mut dead = Vec::new();
        for conn in registry.connections_mut() {
            if Some(&conn.aid) == selected.as_ref() {
                continue;
            }
            let mut byte = [0u8; 1];
            match conn.stream.peek(&mut byte) {
                Ok(0) => dead.push(conn.aid.clone()),
                Ok(_) => {
                    if let Err(e) = conn.stream.set_nonblocking(false) {
                        log::warn!("client {}: failed to prepare for idle read: {e}", conn.aid);
                        dead.push(conn.aid.clone());
                        continue;
                    }
                    match proto::read_frame(&mut conn.stream) {
                        Ok(msg) if msg.first().copied() == Some(proto::DISCONNECT) => {
                            log::info!("client {}: {}", conn.aid, ProtocolError::ClientDisconnect);
                            dead.push(conn.aid.clone());
                        }
                        Ok(_) => {
                            log::warn!("client {} sent an unexpected message while idle", conn.aid);
                            dead.push(conn.aid.clone());
                        }
                        Err(e) => {
                            log::warn!("client {}: idle read failed: {e}", conn.aid);
                            dead.push(conn.aid.clone());
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::warn!("client {}: idle peek failed: {e}", conn.aid);
                    dead.push(conn.aid.clone());
                }
            }
        }
        for aid in dead {
            log::info!("removing client {aid}");
            registry.remove(&aid);
        }
    }

    /// Close every client connection and remove the rendezvous socket.
    pub fn shutdown(&self) {
        let mut registry = self.registry.lock();
        let aids: Vec<Aid> = registry.connections_mut().map(|c| c.aid.clone()).collect();
        for aid in aids {
            if let Some(conn) = registry.remove(&aid) {
                let _ = conn.stream.shutdown(std::net::Shutdown::Both);
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Exchange one C-APDU/R-APDU pair with the currently selected client.
/// Called by the emulation engine while holding `registry`'s lock.
///
/// The stream is briefly switched to blocking mode for the duration of the
/// exchange: spec.md §5 explicitly allows unbounded blocking on framed
/// client I/O, matching the original's behaviour.
pub fn transceive(stream: &mut UnixStream, capdu: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    stream.set_nonblocking(false)?;
    proto::write_frame(&mut *stream, capdu)?;
    let rapdu = proto::read_frame(&mut *stream)?;
    stream.set_nonblocking(true)?;
    Ok(rapdu)
}

/// Send a POWER_UP/POWER_DOWN notification and consume its one-byte
/// acknowledgement (spec.md §4.2). Framed I/O on this stream is strictly
/// turn-taking: leaving the ack unread would desync the length header of
/// whatever framed message comes next for this client.
pub fn notify(stream: &mut UnixStream, opcode: u8) -> Result<(), ProtocolError> {
    stream.set_nonblocking(false)?;
    proto::write_frame(&mut *stream, &[opcode])?;
    proto::read_frame(&mut *stream)?;
    stream.set_nonblocking(true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("edna-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn handshake_registers_a_well_behaved_client() {
        let path = socket_path("handshake-ok");
        let registry = Arc::new(Mutex::new(Registry::new()));
        let running = Arc::new(AtomicBool::new(true));
        let server = Server::bind(&path, registry.clone(), running).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        let server_thread = std::thread::spawn(move || {
            // Accept exactly one connection synchronously for the test.
            loop {
                if let Ok((stream, _)) = server.listener.accept() {
                    server.handshake(stream);
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        proto::write_frame(&mut client, &[GET_API_VERSION]).unwrap();
        let resp = proto::read_frame(&mut client).unwrap();
        assert_eq!(resp, vec![API_VERSION]);

        let mut reg_msg = vec![REGISTER_AID];
        reg_msg.extend_from_slice(b"TESTAID1");
        proto::write_frame(&mut client, &reg_msg).unwrap();
        let resp = proto::read_frame(&mut client).unwrap();
        assert_eq!(resp, vec![EDNA_OK]);

        server_thread.join().unwrap();
        assert_eq!(registry.lock().len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn duplicate_aid_is_rejected() {
        let path = socket_path("dup-aid");
        let registry = Arc::new(Mutex::new(Registry::new()));
        registry
            .lock()
            .register(Aid::new(b"TESTAID1").unwrap(), UnixStream::pair().unwrap().0);
        let running = Arc::new(AtomicBool::new(true));
        let server = Server::bind(&path, registry.clone(), running).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        let server_thread = std::thread::spawn(move || loop {
            if let Ok((stream, _)) = server.listener.accept() {
                server.handshake(stream);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        });

        proto::write_frame(&mut client, &[GET_API_VERSION]).unwrap();
        let _ = proto::read_frame(&mut client).unwrap();
        let mut reg_msg = vec![REGISTER_AID];
        reg_msg.extend_from_slice(b"TESTAID1");
        proto::write_frame(&mut client, &reg_msg).unwrap();
        let resp = proto::read_frame(&mut client).unwrap();
        assert_eq!(resp, vec![AID_EXISTS]);

        server_thread.join().unwrap();
        assert_eq!(registry.lock().len(), 1);
        let _ = std::fs::remove_file(&path);
    }
}
