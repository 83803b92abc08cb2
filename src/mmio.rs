//! Memory-mapped device dispatch.
//!
//! Addresses outside RAM fall into one of a handful of device
//! windows: a 16550-style UART, a CLINT-style timer, and a SYSCON
//! poweroff/reboot register. Everything else in the low 512 MiB below
//! RAM is treated as an ignored device (loads return 0); anything
//! further out is a genuine access fault.

use crate::host::Host;

pub const UART_DATA: u32 = 0x1000_0000;
pub const UART_LSR: u32 = 0x1000_0005;
pub const CLINT_TIMERMATCHL: u32 = 0x1100_4000;
pub const CLINT_TIMERMATCHH: u32 = 0x1100_4004;
pub const CLINT_TIMERL: u32 = 0x1100_BFF8;
pub const CLINT_TIMERH: u32 = 0x1100_BFFC;
pub const SYSCON: u32 = 0x1110_0000;

const DEVICE_REGION_START: u32 = 0x1000_0000;
const DEVICE_REGION_END: u32 = 0x1200_0000;

pub enum LoadOutcome {
    Value(u32),
    /// Address fell outside any known device window.
    Unmapped,
}

pub fn load(host: &mut dyn Host, addr: u32) -> LoadOutcome {
    match addr {
        UART_LSR => {
            let ready = host.stdin_ready();
            LoadOutcome::Value(0x60 | if ready { 1 } else { 0 })
        }
        UART_DATA => {
            if host.stdin_ready() {
                LoadOutcome::Value(host.read_stdin_byte() as u32)
            } else {
                LoadOutcome::Value(0)
            }
        }
        CLINT_TIMERL => LoadOutcome::Value(host.timer_low()),
        CLINT_TIMERH => LoadOutcome::Value(host.timer_high()),
        _ if (DEVICE_REGION_START..DEVICE_REGION_END).contains(&addr) => LoadOutcome::Value(0),
        _ => LoadOutcome::Unmapped,
    }
}

pub enum StoreOutcome {
    Ok,
    /// The guest wrote a halt code to SYSCON.
    Halt(u32),
    Reboot,
    Unmapped,
}

pub fn store(host: &mut dyn Host, addr: u32, value: u32) -> StoreOutcome {
    match addr {
        UART_DATA => {
            host.write_stdout_byte(value as u8);
            StoreOutcome::Ok
        }
        CLINT_TIMERMATCHL => {
            host.set_timermatch_low(value);
            StoreOutcome::Ok
        }
        CLINT_TIMERMATCHH => {
            host.set_timermatch_high(value);
            StoreOutcome::Ok
        }
        SYSCON => match value {
            0x7777 => StoreOutcome::Reboot,
            other => StoreOutcome::Halt(other),
        },
        _ if (DEVICE_REGION_START..DEVICE_REGION_END).contains(&addr) => StoreOutcome::Ok,
        _ => StoreOutcome::Unmapped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::tests::FakeHost;

    #[test]
    fn uart_status_reflects_stdin_readiness() {
        let mut host = FakeHost::with_stdin(b"x".to_vec());
        match load(&mut host, UART_LSR) {
            LoadOutcome::Value(v) => assert_eq!(v, 0x61),
            _ => panic!("expected value"),
        }
    }

    #[test]
    fn uart_store_appends_to_captured_stdout() {
        let mut host = FakeHost::default();
        store(&mut host, UART_DATA, b'H' as u32);
        store(&mut host, UART_DATA, b'i' as u32);
        assert_eq!(host.stdout, b"Hi");
    }

    #[test]
    fn syscon_poweroff_code_is_halt() {
        let mut host = FakeHost::default();
        match store(&mut host, SYSCON, 0x5555) {
            StoreOutcome::Halt(code) => assert_eq!(code, 0x5555),
            _ => panic!("expected halt"),
        }
    }

    #[test]
    fn syscon_reboot_code() {
        let mut host = FakeHost::default();
        assert!(matches!(store(&mut host, SYSCON, 0x7777), StoreOutcome::Reboot));
    }

    #[test]
    fn address_outside_device_region_is_unmapped() {
        let mut host = FakeHost::default();
        assert!(matches!(load(&mut host, 0x2000_0000), LoadOutcome::Unmapped));
    }
}
