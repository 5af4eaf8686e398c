//! Hardware Channel: the PC/SC binding that drives the reader's
//! card-emulation escape channel.
//!
//! Grounded in original_source/src/bin/edna_emu.cpp: the reader is opened
//! with `SCARD_SHARE_DIRECT` (no protocol negotiation, since emulation mode
//! commands bypass T=0/T=1 entirely) and every command is a `control()` call
//! against the vendor's escape IOCTL, `SCARD_CTL_CODE(1)`.

use pcsc::{Context, Protocols, ShareMode};

use crate::error::HardwareError;

/// `pcsc::ctl_code(1)` is the vendor escape IOCTL the original C program
/// addresses its control commands to (`IOCTL_CCID_ESCAPE_DIRECT`).
fn escape_ctl_code() -> std::os::raw::c_ulong {
    pcsc::ctl_code(1)
}

/// One polled event from the reader, decoded from a `POLL_EVENT` response's
/// second byte (spec.md §4.1's event code table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// `0x00` - no event, re-poll.
    None,
    /// `0x01` - ISO 14443A SELECT: a field activated and chose this card.
    Select,
    /// `0x02` - a C-APDU is waiting in `GET_CAPDU`.
    CapduAvailable,
    /// `0x03` - the previous `SEND_RAPDU` was transmitted to the field.
    RapduTransmitted,
    /// `0x04` - ISO 14443A DESELECT: the field let go of this card.
    Deselect,
}

impl Event {
    fn from_byte(b: u8) -> Self {
        match b {
            0x01 => Event::Select,
            0x02 => Event::CapduAvailable,
            0x03 => Event::RapduTransmitted,
            0x04 => Event::Deselect,
            _ => Event::None,
        }
    }
}

/// Outcome of a `GET_CAPDU` call, decoded from its leading status octet
/// (spec.md §4.1).
#[derive(Debug)]
pub enum CapduOutcome {
    /// Status `0x00`: `data` is the fetched C-APDU.
    Ready(Vec<u8>),
    /// Status `0x03`: nothing buffered yet, re-enter the poll loop.
    Retry,
    /// Status `0x13`/`0x70`/`0x7D`: a recoverable FIFO/buffer/length error.
    /// Log and move on without a response.
    Skip,
}

/// A live connection to the reader in emulation mode.
pub struct Hardware {
    card: pcsc::Card,
}

impl Hardware {
    /// Establish a PC/SC context and connect to `reader_name` directly
    /// (`ShareMode::Direct`), bypassing protocol negotiation.
    pub fn connect(reader_name: &str) -> Result<Self, HardwareError> {
        let ctx = Context::establish(pcsc::Scope::User).map_err(HardwareError::Context)?;
        let card = ctx
            .connect(
                &std::ffi::CString::new(reader_name).unwrap_or_default(),
                ShareMode::Direct,
                Protocols::ANY,
            )
            .map_err(|source| HardwareError::Connect {
                reader: reader_name.to_string(),
                source,
            })?;
        Ok(Self { card })
    }

    fn control(&self, command: &[u8]) -> Result<Vec<u8>, HardwareError> {
        let mut buf = [0u8; pcsc::MAX_BUFFER_SIZE];
        let response = self
            .card
            .control(escape_ctl_code(), command, &mut buf)
            .map_err(HardwareError::Control)?;
        Ok(response.to_vec())
    }

    /// `83100100` — enter emulation mode.
    pub fn start_emu(&self) -> Result<(), HardwareError> {
        self.control(&[0x83, 0x10, 0x01, 0x00]).map(|_| ())
    }

    /// `83100000` — leave emulation mode.
    pub fn end_emu(&self) -> Result<(), HardwareError> {
        self.control(&[0x83, 0x10, 0x00, 0x00]).map(|_| ())
    }

    /// `588de3<ATQ><SAK>` — program the ATQ/SAK the emulated card answers
    /// field activation with.
    pub fn set_atq_sak(&self, atq: u16, sak: u8) -> Result<(), HardwareError> {
        let atq = atq.to_be_bytes();
        self.control(&[0x58, 0x8d, 0xe3, atq[0], atq[1], sak])
            .map(|_| ())
    }

    /// `588dcc00` — silence the reader's confirmation buzzer.
    pub fn buzzer_off(&self) -> Result<(), HardwareError> {
        self.control(&[0x58, 0x8d, 0xcc, 0x00]).map(|_| ())
    }

    /// `83000064` — poll for the next field/select/deselect event, with a
    /// 100ms (`0x64`) timeout on the reader's side. The event code is the
    /// *second* byte of the 3-byte status the reader returns (spec.md §4.1).
    pub fn poll_event(&self) -> Result<Event, HardwareError> {
        let resp = self.control(&[0x83, 0x00, 0x00, 0x64])?;
        if resp.len() < 2 {
            return Err(HardwareError::ShortResponse(resp.len()));
        }
        Ok(Event::from_byte(resp[1]))
    }

    /// `84` — fetch the C-APDU the reader buffered after a C-APDU-available
    /// event. The response carries a leading status octet; non-zero values
    /// are classified per spec.md §4.1's table rather than treated as part
    /// of the APDU.
    pub fn get_capdu(&self) -> Result<CapduOutcome, HardwareError> {
        let resp = self.control(&[0x84])?;
        let status = *resp.first().ok_or(HardwareError::ShortResponse(0))?;
        match status {
            0x00 => Ok(CapduOutcome::Ready(resp[1..].to_vec())),
            0x03 => Ok(CapduOutcome::Retry),
            0x13 | 0x70 | 0x7D => Ok(CapduOutcome::Skip),
            0x3B | 0x3C => Err(HardwareError::FatalCapduStatus(status)),
            other => {
                log::warn!("GET_CAPDU returned unrecognised status {other:#04x}, treating as ready");
                Ok(CapduOutcome::Ready(resp[1..].to_vec()))
            }
        }
    }

    /// Send the R-APDU back to the reader for transmission to the field.
    /// `SEND_RAPDU`'s wire form is `84 || R-APDU` — the same leading opcode
    /// byte as `GET_CAPDU`, per spec.md §4.1's command table.
    pub fn send_rapdu(&self, rapdu: &[u8]) -> Result<(), HardwareError> {
        let mut cmd = Vec::with_capacity(rapdu.len() + 1);
        cmd.push(0x84);
        cmd.extend_from_slice(rapdu);
        self.control(&cmd).map(|_| ())
    }
}
