//! Emulation Engine (EE): the event loop driving the reader through its
//! card-emulation life cycle and dispatching APDUs to the selected client.
//!
//! Grounded in original_source/src/bin/edna_emu.cpp's main loop: start
//! emulation, poll for events, react to SELECT/DESELECT/field transitions,
//! and on DESELECT perform the reset sequence (brief pause, then
//! END_EMU -> SET_ATQ_SAK -> BUZZER_OFF -> START_EMU) before resuming polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::EmulationConfig;
use crate::error::HardwareError;
use crate::hardware::{CapduOutcome, Event, Hardware};
use crate::proto;
use crate::registry::Registry;
use crate::select::{self, parse_select};
use crate::server;

/// Pause observed between a DESELECT event and reinitialising emulation,
/// matching edna_emu.cpp's reset delay.
const DESELECT_RESET_DELAY: Duration = Duration::from_secs(2);

pub struct Engine {
    hardware: Hardware,
    config: EmulationConfig,
    registry: Arc<Mutex<Registry>>,
    running: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        hardware: Hardware,
        config: EmulationConfig,
        registry: Arc<Mutex<Registry>>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            hardware,
            config,
            registry,
            running,
        }
    }

    /// Run the event loop until `running` is cleared or a hardware error
    /// makes continuing unsafe. Call on its own thread; see
    /// [`crate::daemon`].
    pub fn run(&self) -> Result<(), HardwareError> {
        self.enter_emulation()?;
        while self.running.load(Ordering::Relaxed) {
            match self.hardware.poll_event()? {
                Event::None => {}
                Event::Select => {
                    log::debug!("ISO 14443A SELECT observed");
                    self.notify_selected(proto::POWER_UP);
                }
                Event::RapduTransmitted => {
                    log::debug!("R-APDU transmitted to the field");
                }
                Event::CapduAvailable => self.handle_capdu()?,
                Event::Deselect => self.handle_deselect()?,
            }
        }
        let _ = self.hardware.end_emu();
        Ok(())
    }

    fn enter_emulation(&self) -> Result<(), HardwareError> {
        self.hardware.start_emu()?;
        self.hardware.set_atq_sak(self.config.atq, self.config.sak)?;
        self.hardware.buzzer_off()?;
        Ok(())
    }

    /// Handle a single C-APDU fetched from the reader: resolve SELECT, or
    /// forward to the currently selected client, applying the configured
    /// command delay.
    fn handle_capdu(&self) -> Result<(), HardwareError> {
        let capdu = match self.hardware.get_capdu()? {
            CapduOutcome::Ready(capdu) => capdu,
            CapduOutcome::Retry => return Ok(()),
            CapduOutcome::Skip => {
                log::warn!("GET_CAPDU reported a recoverable error, skipping this event");
                return Ok(());
            }
        };

        let rapdu = match parse_select(&capdu) {
            Some(Ok(aid_bytes)) => dispatch_select(&self.registry, aid_bytes, &capdu),
            Some(Err(())) => select::SW_WRONG_LENGTH.to_vec(),
            None => dispatch_data(&self.registry, &capdu),
        };

        let succeeded = rapdu.ends_with(&[0x90, 0x00]);
        self.apply_cmd_delay(succeeded);

        self.hardware.send_rapdu(&rapdu)
    }

    fn notify_selected(&self, opcode: u8) {
        notify_selected(&self.registry, opcode)
    }

    /// Sleep for `emulation.cmd_delay` milliseconds, honouring
    /// `delay_success_only`: if set, the delay is skipped unless the
    /// command about to be answered succeeded (status `90 00`), mirroring
    /// edna_emu.cpp's `cmd_delay`/`delay_success_only` pair.
    fn apply_cmd_delay(&self, will_likely_succeed: bool) {
        if self.config.cmd_delay == 0 {
            return;
        }
        if self.config.delay_success_only && !will_likely_succeed {
            return;
        }
        std::thread::sleep(Duration::from_millis(self.config.cmd_delay));
    }

    /// ISO 14443A DESELECT (event `0x04`): notify the currently selected
    /// client of the power-down, clear the selection, and — only if an
    /// application was actually selected — replay the reset sequence after
    /// a settle delay (spec.md §4.1's event table, row `0x04`).
    fn handle_deselect(&self) -> Result<(), HardwareError> {
        let had_selection = self.registry.lock().selected().is_some();
        self.notify_selected(proto::POWER_DOWN);
        self.registry.lock().select(None);

        if !had_selection {
            return Ok(());
        }
        std::thread::sleep(DESELECT_RESET_DELAY);
        self.hardware.end_emu()?;
        self.hardware.set_atq_sak(self.config.atq, self.config.sak)?;
        self.hardware.buzzer_off()?;
        self.hardware.start_emu()?;
        Ok(())
    }
}

/// Resolve a SELECT-by-AID against `registry`, then — selection changed or
/// not — forward *this same APDU* to whatever client ends up selected,
/// exactly as an ordinary C-APDU would be (spec.md §4.2 step 3: "the SELECT
/// is forwarded, not swallowed"). A SELECT naming an unregistered AID
/// leaves the current selection untouched and is logged, per spec.md §4.2
/// step 2.
///
/// Free function (rather than an `Engine` method) so it only depends on the
/// registry mutex the server thread shares, not on a live PC/SC reader —
/// that is what lets it be unit-tested below without real hardware.
fn dispatch_select(registry: &Mutex<Registry>, aid_bytes: &[u8], capdu: &[u8]) -> Vec<u8> {
    match crate::aid::Aid::new(aid_bytes) {
        Some(aid) => {
            let mut reg = registry.lock();
            if reg.contains(&aid) {
                reg.select(Some(aid));
            } else {
                log::warn!("SELECT for unregistered AID {aid}, selection unchanged");
            }
        }
        None => log::warn!("SELECT carried an empty AID, selection unchanged"),
    }
    dispatch_data(registry, capdu)
}

/// Forward `capdu` to whatever client is currently selected in `registry`,
/// tearing the client down and falling back to [`select::SW_NOT_FOUND`] on
/// any I/O failure mid-exchange (spec.md §4.2 step 3, §7).
fn dispatch_data(registry: &Mutex<Registry>, capdu: &[u8]) -> Vec<u8> {
    let mut reg = registry.lock();
    let Some(conn) = reg.selected_client_mut() else {
        return select::SW_NOT_FOUND.to_vec();
    };
    match server::transceive(&mut conn.stream, capdu) {
        Ok(rapdu) => rapdu,
        Err(e) => {
            log::warn!("client disconnected mid-exchange: {e}");
            let aid = conn.aid.clone();
            reg.remove(&aid);
            select::SW_NOT_FOUND.to_vec()
        }
    }
}

/// Send a POWER_UP/POWER_DOWN notification to whatever client is currently
/// selected in `registry`, tearing it down on I/O failure. A no-op if
/// nothing is selected.
fn notify_selected(registry: &Mutex<Registry>, opcode: u8) {
    let mut reg = registry.lock();
    let Some(conn) = reg.selected_client_mut() else {
        return;
    };
    if let Err(e) = server::notify(&mut conn.stream, opcode) {
        log::warn!("failed to notify selected client: {e}");
        let aid = conn.aid.clone();
        reg.remove(&aid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn aid(bytes: &[u8]) -> crate::aid::Aid {
        crate::aid::Aid::new(bytes).unwrap()
    }

    /// spec.md §8 scenario S3: a SELECT-by-AID APDU to a registered client
    /// is forwarded to that client (not swallowed/synthesized), and the
    /// client's real R-APDU is returned.
    #[test]
    fn select_forwards_the_apdu_and_returns_the_clients_real_reply() {
        let registry = Mutex::new(Registry::new());
        let (daemon_side, client_side) = UnixStream::pair().unwrap();
        registry.lock().register(aid(b"IRMAcard"), daemon_side);

        let client_thread = std::thread::spawn(move || {
            let mut client_side = client_side;
            let capdu = proto::read_frame(&mut client_side).unwrap();
            proto::write_frame(&mut client_side, &[0x90, 0x00]).unwrap();
            capdu
        });

        let select_apdu = [0x00, 0xA4, 0x04, 0x00, 0x08, b'I', b'R', b'M', b'A', b'c', b'a', b'r', b'd'];
        let rapdu = dispatch_select(&registry, &select_apdu[5..], &select_apdu);

        let observed_capdu = client_thread.join().unwrap();
        assert_eq!(observed_capdu, select_apdu);
        assert_eq!(rapdu, vec![0x90, 0x00]);
        assert_eq!(registry.lock().selected(), Some(&aid(b"IRMAcard")));
    }

    /// spec.md §8 scenario S4: with no client selected, an ordinary C-APDU
    /// gets the default "instruction not supported" fallback.
    #[test]
    fn no_selection_falls_back_to_not_found() {
        let registry = Mutex::new(Registry::new());
        let capdu = [0x00, 0xB0, 0x00, 0x00, 0x00];
        let rapdu = dispatch_data(&registry, &capdu);
        assert_eq!(rapdu, select::SW_NOT_FOUND);
    }

    /// spec.md §8 scenario S5: the client closes its socket after reading
    /// the C-APDU but before replying. The exchange still completes with
    /// the default fallback, and the dead client is torn down and its
    /// selection cleared.
    #[test]
    fn client_crash_mid_exchange_tears_down_and_clears_selection() {
        let registry = Mutex::new(Registry::new());
        let (daemon_side, client_side) = UnixStream::pair().unwrap();
        registry.lock().register(aid(b"IRMAcard"), daemon_side);
        registry.lock().select(Some(aid(b"IRMAcard")));

        let client_thread = std::thread::spawn(move || {
            let mut client_side = client_side;
            let _capdu = proto::read_frame(&mut client_side).unwrap();
            // Close without replying.
        });

        let capdu = [0x00, 0xB0, 0x00, 0x00, 0x00];
        let rapdu = dispatch_data(&registry, &capdu);

        client_thread.join().unwrap();
        assert_eq!(rapdu, select::SW_NOT_FOUND);
        assert_eq!(registry.lock().selected(), None);
        assert!(!registry.lock().contains(&aid(b"IRMAcard")));
    }

    /// A POWER_UP/POWER_DOWN notification to a dead client is torn down the
    /// same way a failed transceive is.
    #[test]
    fn notify_selected_tears_down_a_dead_client() {
        let registry = Mutex::new(Registry::new());
        let (daemon_side, client_side) = UnixStream::pair().unwrap();
        registry.lock().register(aid(b"IRMAcard"), daemon_side);
        registry.lock().select(Some(aid(b"IRMAcard")));
        drop(client_side);

        notify_selected(&registry, proto::POWER_UP);

        assert_eq!(registry.lock().selected(), None);
        assert!(!registry.lock().contains(&aid(b"IRMAcard")));
    }
}
