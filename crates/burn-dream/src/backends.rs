//! Backend selection
//!
//! The pipeline is generic over `B: Backend`. These re-exports pick a
//! concrete backend from the enabled feature, in priority order
//! `ndarray`, `tch`, `wgpu`, `cuda`:
//!
//! ```toml
//! [dependencies]
//! burn-dream = { version = "0.1", features = ["wgpu"] }
//! ```
//!
//! ```ignore
//! use burn_dream::backends::{DefaultBackend, default_device};
//!
//! let device = default_device();
//! let pipeline = GenerationPipeline::<DefaultBackend>::new(services, &device);
//! ```

#[cfg(feature = "ndarray")]
pub use burn_ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "tch")]
pub use burn_tch::{LibTorch, LibTorchDevice};

#[cfg(feature = "wgpu")]
pub use burn_wgpu::{Wgpu, WgpuDevice};

#[cfg(feature = "cuda")]
pub use burn_cuda::{Cuda, CudaDevice};

#[cfg(feature = "ndarray")]
pub type DefaultBackend = NdArray<f32>;

#[cfg(all(feature = "tch", not(feature = "ndarray")))]
pub type DefaultBackend = LibTorch<f32>;

#[cfg(all(feature = "wgpu", not(any(feature = "ndarray", feature = "tch"))))]
pub type DefaultBackend = Wgpu;

#[cfg(all(
    feature = "cuda",
    not(any(feature = "ndarray", feature = "tch", feature = "wgpu"))
))]
pub type DefaultBackend = Cuda;

/// Device for [`DefaultBackend`]
#[cfg(feature = "ndarray")]
pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// Device for [`DefaultBackend`], CUDA when libtorch sees a GPU
#[cfg(all(feature = "tch", not(feature = "ndarray")))]
pub fn default_device() -> LibTorchDevice {
    if burn_tch::is_cuda_available() {
        LibTorchDevice::Cuda(0)
    } else {
        LibTorchDevice::Cpu
    }
}

#[cfg(all(feature = "wgpu", not(any(feature = "ndarray", feature = "tch"))))]
pub fn default_device() -> WgpuDevice {
    WgpuDevice::default()
}

#[cfg(all(
    feature = "cuda",
    not(any(feature = "ndarray", feature = "tch", feature = "wgpu"))
))]
pub fn default_device() -> CudaDevice {
    CudaDevice::default()
}

/// Name of the backend behind [`DefaultBackend`], for logs
pub fn backend_name() -> &'static str {
    if cfg!(feature = "ndarray") {
        "ndarray"
    } else if cfg!(feature = "tch") {
        "tch"
    } else if cfg!(feature = "wgpu") {
        "wgpu"
    } else if cfg!(feature = "cuda") {
        "cuda"
    } else {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(feature = "ndarray")]
    fn test_default_backend_runs_a_pipeline_op() {
        use burn::prelude::*;

        let device = default_device();
        let t = Tensor::<DefaultBackend, 4>::ones([1, 4, 2, 2], &device);
        let out = crate::pipeline::apply_guidance(t.clone(), t * 2.0, 3.0);
        assert_eq!(out.into_data().to_vec::<f32>().unwrap(), vec![4.0; 16]);
        assert_eq!(backend_name(), "ndarray");
    }

    #[test]
    fn test_backend_name_is_known() {
        assert!(["ndarray", "tch", "wgpu", "cuda", "none"].contains(&backend_name()));
    }
}
