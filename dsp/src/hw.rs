use std::sync::{Arc, Mutex};

/// Memory mapped hardware registers at 0xff00..=0xffff of data memory.
pub trait Hardware: Send {
    fn read(&mut self, addr: u16) -> u16;
    fn write(&mut self, addr: u16, value: u16);
}

pub const DMBH: u16 = 0xfffc;
pub const DMBL: u16 = 0xfffd;
pub const CMBH: u16 = 0xfffe;
pub const CMBL: u16 = 0xffff;

const MAIL_VALID: u32 = 0x8000_0000;

#[derive(Debug, Default)]
struct MailState {
    cpu_to_dsp: u32,
    dsp_to_cpu: u32,
    // Writes to unmodelled registers, kept so they read back
    other: Vec<(u16, u16)>,
}

/// The two mailboxes shared between the DSP and the host CPU.
///
/// Cloning gives another handle onto the same mailboxes, so the host side can post mail from a
/// different thread than the one running the DSP.
#[derive(Clone, Debug, Default)]
pub struct Mailboxes {
    state: Arc<Mutex<MailState>>,
}

impl Mailboxes {
    pub fn new() -> Mailboxes {
        Mailboxes::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MailState) -> R) -> R {
        // A poisoned lock only means another handle panicked mid update; the words are still valid
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Host side: post a mail for the DSP to pick up from CMBH/CMBL
    pub fn send_to_dsp(&self, mail: u32) {
        self.with(|s| s.cpu_to_dsp = mail | MAIL_VALID);
    }

    /// Host side: take the mail the DSP left in DMBH/DMBL, if any
    pub fn take_from_dsp(&self) -> Option<u32> {
        self.with(|s| {
            if s.dsp_to_cpu & MAIL_VALID != 0 {
                let mail = s.dsp_to_cpu & !MAIL_VALID;
                s.dsp_to_cpu &= !MAIL_VALID;
                Some(mail)
            } else {
                None
            }
        })
    }

    pub fn dsp_mail_pending(&self) -> bool {
        self.with(|s| s.dsp_to_cpu & MAIL_VALID != 0)
    }
}

impl Hardware for Mailboxes {
    fn read(&mut self, addr: u16) -> u16 {
        self.with(|s| match addr {
            DMBH => (s.dsp_to_cpu >> 16) as u16,
            DMBL => s.dsp_to_cpu as u16,
            CMBH => (s.cpu_to_dsp >> 16) as u16,
            CMBL => {
                s.cpu_to_dsp &= !MAIL_VALID;
                s.cpu_to_dsp as u16
            }
            _ => s.other.iter().rev().find(|(a, _)| *a == addr).map_or(0, |(_, v)| *v),
        })
    }

    fn write(&mut self, addr: u16, value: u16) {
        self.with(|s| match addr {
            DMBH => s.dsp_to_cpu = (s.dsp_to_cpu & 0xffff) | ((value as u32) << 16 & !MAIL_VALID),
            DMBL => s.dsp_to_cpu = (s.dsp_to_cpu & 0xffff_0000) | value as u32 | MAIL_VALID,
            CMBH | CMBL => log::warn!("DSP wrote to read-only mailbox register {:04x}", addr),
            _ => {
                s.other.retain(|(a, _)| *a != addr);
                s.other.push((addr, value));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mail_round_trip() {
        let host = Mailboxes::new();
        let mut dsp = host.clone();

        assert_eq!(dsp.read(CMBH) & 0x8000, 0);
        host.send_to_dsp(0x1234_5678);
        assert_eq!(dsp.read(CMBH), 0x9234);
        assert_eq!(dsp.read(CMBL), 0x5678);
        assert_eq!(dsp.read(CMBH) & 0x8000, 0);

        dsp.write(DMBH, 0xdead);
        assert_eq!(host.take_from_dsp(), None);
        dsp.write(DMBL, 0xbeef);
        assert!(host.dsp_mail_pending());
        assert_eq!(dsp.read(DMBH) & 0x8000, 0x8000);
        assert_eq!(host.take_from_dsp(), Some(0x5ead_beef));
        assert!(!host.dsp_mail_pending());
        assert_eq!(dsp.read(DMBH) & 0x8000, 0);
    }
}
