//! Torch/CUDA compatibility data.

use crate::version::strip_patch_version;

/// CUDA versions each torch release publishes wheels for, oldest first.
const TORCH_CUDA_COMPATIBILITY: &[(&str, &[&str])] = &[
    ("1.13", &["11.6", "11.7"]),
    ("2.0", &["11.7", "11.8"]),
    ("2.1", &["11.8", "12.1"]),
    ("2.2", &["11.8", "12.1"]),
    ("2.3", &["11.8", "12.1"]),
];

pub const DEFAULT_CUDNN: &str = "8";

/// CUDA versions compatible with `torch_version` (any patch level).
pub fn compatible_cuda_versions(torch_version: &str) -> &'static [&'static str] {
    let Ok((torch, _)) = strip_patch_version(torch_version) else {
        return &[];
    };
    TORCH_CUDA_COMPATIBILITY
        .iter()
        .find(|(t, _)| *t == torch)
        .map(|(_, cudas)| *cudas)
        .unwrap_or(&[])
}

/// Newest CUDA version torch `torch_version` supports.
pub fn latest_cuda_for_torch(torch_version: &str) -> Option<&'static str> {
    compatible_cuda_versions(torch_version).last().copied()
}

/// PyTorch wheel index suffix for a CUDA version, e.g. `11.8` -> `cu118`.
pub fn torch_index_suffix(cuda: &str) -> String {
    format!("cu{}", cuda.replace('.', ""))
}
