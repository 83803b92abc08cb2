//! Command-line surface (external interfaces, §6/§4.7).

use clap::Parser;

use crate::error::EmulatorError;

/// Emulate a 32-bit RISC-V (RV32IA) machine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
pub struct Args {
    /// Path to the kernel image to load at the base of RAM
    pub image: String,

    /// Path to a device tree blob, or "disable" to boot without one
    #[arg(long)]
    pub dtb: Option<String>,

    /// RAM size, e.g. "64m", "128m", "1g" (default 64m)
    #[arg(long, default_value = "64m")]
    pub ram_size: String,

    /// Instructions executed per batch before refreshing the timer
    #[arg(long, default_value_t = 10_000)]
    pub instrs_per_batch: u32,

    /// Busy-poll instead of sleeping briefly while the hart is parked in WFI
    #[arg(long)]
    pub no_sleep_on_wfi: bool,

    /// Raise the tracing log level (equivalent to RUST_LOG=debug)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn ram_bytes(&self) -> Result<u32, EmulatorError> {
        parse_ram_size(&self.ram_size)
            .ok_or_else(|| EmulatorError::InvalidRamSize(self.ram_size.clone()))
    }
}

fn parse_ram_size(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last() {
        Some('k' | 'K') => (&raw[..raw.len() - 1], 1024u64),
        Some('m' | 'M') => (&raw[..raw.len() - 1], 1024 * 1024),
        Some('g' | 'G') => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        Some(_) => (raw, 1),
        None => return None,
    };
    let value: u64 = digits.parse().ok()?;
    u32::try_from(value.saturating_mul(multiplier)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_digits_as_bytes() {
        assert_eq!(parse_ram_size("1024"), Some(1024));
    }

    #[test]
    fn parses_suffixed_sizes() {
        assert_eq!(parse_ram_size("64m"), Some(64 * 1024 * 1024));
        assert_eq!(parse_ram_size("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_ram_size("4k"), Some(4 * 1024));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_ram_size("not-a-size"), None);
    }
}
