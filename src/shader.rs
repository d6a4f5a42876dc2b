//! SPIR-V loading and shader module creation.
//!
//! Compiled shader binaries are read whole from the shader directory and
//! treated as opaque blobs; only the magic number and word alignment are
//! checked before handing them to the driver.

use ash::vk;
use std::path::Path;

use crate::error::{Error, Result};

/// The SPIR-V magic number (little-endian).
const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Read a SPIR-V binary and return its contents as words.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;

    if bytes.len() < 4 || bytes.len() % 4 != 0 {
        return Err(Error::Asset(format!(
            "{:?}: size {} is not a whole number of SPIR-V words",
            path,
            bytes.len()
        )));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(Error::Asset(format!(
            "{:?}: bad SPIR-V magic 0x{:08X}",
            path, words[0]
        )));
    }

    Ok(words)
}

/// Create a shader module from SPIR-V words.
pub fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);
    unsafe {
        device
            .create_shader_module(&create_info, None)
            .map_err(|e| Error::vk("create shader module", e))
    }
}

/// Load a `.spv` file from `dir` and create its module in one step.
pub fn load_shader_module(
    device: &ash::Device,
    dir: &Path,
    file_name: &str,
) -> Result<vk::ShaderModule> {
    let code = load_spirv(&dir.join(file_name))?;
    create_shader_module(device, &code)
}
