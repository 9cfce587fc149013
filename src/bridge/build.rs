//! Adapter source generation and the external compile step.
//!
//! The generated adapter gives each slot a unique set of exported symbols
//! (`sim_init_<N>`, `sim_tick_<N>`, ...) wrapping the firmware artifact's
//! fixed entry points. The firmware side of the contract is:
//!
//! ```c
//! void firmware_init(void);
//! void firmware_tick(void);
//! unsigned char firmware_memory[];
//! unsigned long long firmware_memory_size;
//! ```

use std::path::Path;
use std::process::Command;

use super::{BridgeError, SlotId};

pub fn generate_adapter_source(slot: SlotId) -> String {
    let n = slot.index();
    format!(
        r#"/* Generated communicator adapter for {slot}. Do not edit. */
#include <string.h>

extern void firmware_init(void);
extern void firmware_tick(void);
extern unsigned char firmware_memory[];
extern unsigned long long firmware_memory_size;

void sim_init_{n}(void) {{
    firmware_init();
}}

void sim_tick_{n}(void) {{
    firmware_tick();
}}

unsigned long long sim_memory_size_{n}(void) {{
    return firmware_memory_size;
}}

unsigned long long sim_ref_addr_{n}(void) {{
    return (unsigned long long)(unsigned long)firmware_memory;
}}

void sim_get_memory_{n}(unsigned long long offset, unsigned long long length, unsigned char *dst) {{
    memcpy(dst, firmware_memory + offset, length);
}}

void sim_set_memory_{n}(unsigned long long offset, unsigned long long length, const unsigned char *src) {{
    memcpy(firmware_memory + offset, src, length);
}}
"#
    )
}

/// Compile the adapter together with the firmware artifact into a shared
/// object. Nonzero exit status becomes `BridgeError::Build` carrying the
/// toolchain's combined stdout/stderr.
pub fn compile_adapter(
    compiler: &str,
    extra_cflags: &[String],
    source: &Path,
    firmware: &Path,
    output: &Path,
) -> Result<(), BridgeError> {
    let mut command = Command::new(compiler);
    command
        .arg("-shared")
        .arg("-fPIC")
        .args(extra_cflags)
        .arg(source)
        .arg(firmware)
        .arg("-o")
        .arg(output);
    log::debug!("running adapter build: {:?}", command);

    let result = command.output().map_err(|source| BridgeError::BuildSpawn {
        command: compiler.to_string(),
        source,
    })?;

    if !result.status.success() {
        let mut diagnostics = String::from_utf8_lossy(&result.stdout).into_owned();
        diagnostics.push_str(&String::from_utf8_lossy(&result.stderr));
        return Err(BridgeError::Build {
            code: result.status.code().unwrap_or(-1),
            diagnostics,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::CommunicatorFactory;

    #[test]
    fn adapter_symbols_carry_the_slot_index() {
        let mut factory = CommunicatorFactory::new("cc", Vec::new());
        factory.allocate_slot();
        let slot = factory.allocate_slot();
        let source = generate_adapter_source(slot);

        assert!(source.contains("void sim_init_1(void)"));
        assert!(source.contains("void sim_tick_1(void)"));
        assert!(source.contains("sim_get_memory_1"));
        assert!(source.contains("sim_set_memory_1"));
        assert!(source.contains("sim_ref_addr_1"));
        // The firmware-side contract stays unsuffixed.
        assert!(source.contains("firmware_tick();"));
    }

    #[test]
    fn distinct_slots_generate_distinct_adapters() {
        let mut factory = CommunicatorFactory::new("cc", Vec::new());
        let a = generate_adapter_source(factory.allocate_slot());
        let b = generate_adapter_source(factory.allocate_slot());
        assert_ne!(a, b);
    }

    #[test]
    fn missing_compiler_maps_to_spawn_error() {
        let err = compile_adapter(
            "/nonexistent/compiler-binary",
            &[],
            Path::new("adapter.c"),
            Path::new("firmware.o"),
            Path::new("out.so"),
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::BuildSpawn { .. }));
    }
}
