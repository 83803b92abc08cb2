//! Placing a kernel image and device tree blob into guest RAM.
//!
//! Mirrors the reference core's boot sequence: the image lands at
//! byte 0 of RAM (guest address `base_ofs`), the DTB is placed near
//! the top of RAM, and if it is the default DTB, the RAM-size cell at
//! a fixed offset is patched to describe the actual allocation.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::error::EmulatorError;
use crate::hart::Hart;

/// Big-endian marker this core's skeleton DTB carries at offset
/// 0x13c, standing in for the RAM-size cell. Only present (and only
/// patched) when using the bundled default DTB, never a
/// caller-supplied one.
const DTB_RAM_SIZE_MARKER: u32 = 0x00c0_ff03;
const DTB_RAM_SIZE_OFFSET: usize = 0x13c;

pub struct LoadedImage {
    pub dtb_addr: u32,
}

/// Load `image_path` at the base of RAM and, unless `dtb_path` is
/// `Some("disable")`, place a device tree blob near the top of RAM.
/// `dtb_path = None` uses `default_dtb`.
pub fn load(
    hart: &mut Hart,
    image_path: &Path,
    dtb_path: Option<&Path>,
    default_dtb: &[u8],
) -> Result<LoadedImage, EmulatorError> {
    let total_mem = hart.mem.len();
    let image = fs::read(image_path).map_err(|source| EmulatorError::ImageOpen {
        path: image_path.display().to_string(),
        source,
    })?;

    if image.len() as u64 > total_mem as u64 {
        return Err(EmulatorError::ImageTooLarge {
            path: image_path.display().to_string(),
            size: image.len() as u64,
            ram: total_mem,
        });
    }

    for byte in hart.mem.raw_mut().iter_mut() {
        *byte = 0;
    }
    hart.mem.raw_mut()[..image.len()].copy_from_slice(&image);
    info!(bytes = image.len(), path = %image_path.display(), "loaded kernel image");

    let disabled = matches!(dtb_path.and_then(|p| p.to_str()), Some("disable"));

    let (dtb_bytes, dtb_is_default, dtb_source_path): (Option<Vec<u8>>, bool, Option<String>) =
        if disabled {
            (None, false, None)
        } else if let Some(path) = dtb_path {
            let bytes = fs::read(path).map_err(|source| EmulatorError::DtbOpen {
                path: path.display().to_string(),
                source,
            })?;
            (Some(bytes), false, Some(path.display().to_string()))
        } else {
            (Some(default_dtb.to_vec()), true, None)
        };

    let dtb_addr = match dtb_bytes {
        None => 0,
        Some(bytes) => {
            if bytes.len() as u64 > total_mem as u64 {
                return Err(EmulatorError::DtbTooLarge {
                    path: dtb_source_path.unwrap_or_default(),
                    size: bytes.len() as u64,
                    ram: total_mem,
                });
            }
            let dtb_ofs = total_mem as usize - bytes.len();
            hart.mem.raw_mut()[dtb_ofs..dtb_ofs + bytes.len()].copy_from_slice(&bytes);
            debug!(bytes = bytes.len(), offset = dtb_ofs, "placed device tree blob");

            if dtb_is_default {
                patch_ram_size(hart, dtb_ofs as u32);
            }

            dtb_ofs as u32 + hart.mem.base_ofs
        }
    };

    reset_boot_state(hart, dtb_addr);
    Ok(LoadedImage { dtb_addr })
}

/// The skeleton DTB marks its RAM-size cell with a fixed big-endian
/// sentinel at a known offset *within the DTB itself*; if present,
/// rewrite it (byte-swapped, per the reference core's convention) to
/// the real DTB load offset. `dtb_ofs` is where the DTB was placed in
/// RAM, so the marker lives at `dtb_ofs + 0x13c`, not at `0x13c` from
/// the start of RAM.
fn patch_ram_size(hart: &mut Hart, dtb_ofs: u32) {
    let bytes = hart.mem.raw_mut();
    let marker_ofs = dtb_ofs as usize + DTB_RAM_SIZE_OFFSET;
    if marker_ofs + 4 > bytes.len() {
        return;
    }
    let marker = u32::from_be_bytes(bytes[marker_ofs..marker_ofs + 4].try_into().unwrap());
    if marker == DTB_RAM_SIZE_MARKER {
        bytes[marker_ofs..marker_ofs + 4].copy_from_slice(&dtb_ofs.to_le_bytes());
    }
}

/// Boot contract (external interfaces, §6): pc at the base of RAM,
/// a0 = hart id 0, a1 = DTB guest address (or 0), machine mode.
fn reset_boot_state(hart: &mut Hart, dtb_addr: u32) {
    hart.csr.set_pc(hart.mem.base_ofs);
    hart.regs.write(10, 0);
    hart.regs.write(11, dtb_addr);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(bytes: &[u8]) -> tempfile_path::TempFile {
        tempfile_path::TempFile::new(bytes)
    }

    // A tiny, dependency-free temp file helper: the teacher corpus
    // does not standardize on a temp-file crate, and a single-use
    // harness here keeps loader tests independent of disk layout.
    mod tempfile_path {
        use std::io::Write;
        use std::sync::atomic::{AtomicU32, Ordering};

        static COUNTER: AtomicU32 = AtomicU32::new(0);

        pub struct TempFile {
            pub path: std::path::PathBuf,
        }
        impl TempFile {
            pub fn new(bytes: &[u8]) -> Self {
                let n = COUNTER.fetch_add(1, Ordering::Relaxed);
                let mut path = std::env::temp_dir();
                path.push(format!("rv32ima-loader-test-{}-{n}", std::process::id()));
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(bytes).unwrap();
                Self { path }
            }
        }
        impl Drop for TempFile {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn image_loads_at_base_of_ram() {
        let mut hart = Hart::new(4096, 0x8000_0000);
        let image = write_temp(&[0x13, 0x00, 0x00, 0x00]);
        let result = load(&mut hart, &image.path, Some(Path::new("disable")), &[]);
        assert!(result.is_ok());
        assert_eq!(hart.mem.read_word(0).unwrap(), 0x13);
        assert_eq!(hart.csr.pc(), 0x8000_0000);
        assert_eq!(hart.regs.read(11), 0);
    }

    #[test]
    fn oversized_image_is_rejected() {
        let mut hart = Hart::new(4, 0x8000_0000);
        let image = write_temp(&[0u8; 16]);
        let result = load(&mut hart, &image.path, Some(Path::new("disable")), &[]);
        assert!(matches!(result, Err(EmulatorError::ImageTooLarge { .. })));
    }

    #[test]
    fn default_dtb_ram_size_marker_is_patched() {
        let mut hart = Hart::new(4096, 0x8000_0000);
        let mut dtb = vec![0u8; 512];
        dtb[DTB_RAM_SIZE_OFFSET..DTB_RAM_SIZE_OFFSET + 4]
            .copy_from_slice(&DTB_RAM_SIZE_MARKER.to_be_bytes());
        let image = write_temp(&[0u8; 4]);
        let result = load(&mut hart, &image.path, None, &dtb).unwrap();
        let dtb_ofs = result.dtb_addr - hart.mem.base_ofs;
        let marker_slice =
            &hart.mem.raw()[dtb_ofs as usize + DTB_RAM_SIZE_OFFSET..][..4];
        assert_eq!(
            u32::from_le_bytes(marker_slice.try_into().unwrap()),
            dtb_ofs
        );
        assert_eq!(hart.regs.read(11), result.dtb_addr);
    }

    #[test]
    fn disabled_dtb_leaves_a1_zero() {
        let mut hart = Hart::new(4096, 0x8000_0000);
        let image = write_temp(&[0u8; 4]);
        load(&mut hart, &image.path, Some(Path::new("disable")), &[1, 2, 3]).unwrap();
        assert_eq!(hart.regs.read(11), 0);
    }
}
