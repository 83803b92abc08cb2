//! The batch-stepping cadence: refresh the timer, call `step`, act
//! on the result. Mirrors the reference core's two driver variants
//! (an embedded-core version and an independently-allocated one) by
//! always allocating the `Hart` independently rather than inside the
//! guest RAM buffer, per the design's state-placement guidance.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::info;

use crate::cli::Args;
use crate::error::EmulatorError;
use crate::hart::Hart;
use crate::host::RealHost;
use crate::loader;
use crate::trap::StepStatus;

pub const DEFAULT_DTB: &[u8] = &[];

/// Install a SIGINT handler that only sets an atomic flag, per the
/// async-signal-safety requirement: no allocation or I/O happens in
/// the signal context itself, only in the driver loop that observes
/// the flag between batches.
fn install_sigint_handler() -> Arc<AtomicBool> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    // If installation fails (e.g. a signal handler is already set by
    // the embedding process) we keep running; Ctrl-C then falls back
    // to whatever default the platform provides.
    let _ = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    });
    interrupted
}

fn dump_state(hart: &Hart) {
    let pc = hart.csr.pc();
    eprintln!("PC: {pc:08x}");
    for n in 0..32 {
        eprint!("x{:<2}:{:08x} ", n, hart.regs.read(n));
        if n % 8 == 7 {
            eprintln!();
        }
    }
}

pub fn run(args: Args) -> Result<i32, EmulatorError> {
    let ram_bytes = args.ram_bytes()?;
    let mut hart = Hart::new(ram_bytes, 0x8000_0000);
    let image_path = PathBuf::from(&args.image);
    let dtb_path = args.dtb.as_ref().map(PathBuf::from);

    loader::load(&mut hart, &image_path, dtb_path.as_deref(), DEFAULT_DTB)?;

    let interrupted = install_sigint_handler();
    let mut host = RealHost::new();

    info!(
        ram_bytes,
        instrs_per_batch = args.instrs_per_batch,
        sleep_on_wfi = !args.no_sleep_on_wfi,
        "starting emulation"
    );

    loop {
        if interrupted.load(Ordering::SeqCst) {
            info!("interrupted, dumping state");
            dump_state(&hart);
            return Ok(130);
        }

        host.tick();
        match hart.step(args.instrs_per_batch, &mut host) {
            StepStatus::Continue => {}
            StepStatus::WfiIdle => {
                if !args.no_sleep_on_wfi {
                    thread::sleep(Duration::from_micros(200));
                }
            }
            StepStatus::Halt(code) => {
                info!(code = format!("0x{code:x}"), "guest halted");
                dump_state(&hart);
                return Ok(if code == 0x5555 { 0 } else { 1 });
            }
            StepStatus::Reboot => {
                info!("guest requested reboot");
                loader::load(&mut hart, &image_path, dtb_path.as_deref(), DEFAULT_DTB)?;
                host = RealHost::new();
            }
        }
    }
}
