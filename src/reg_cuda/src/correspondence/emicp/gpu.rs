//! CUDA E-step backend.
//!
//! The target set is uploaded once; each E-step uploads the transformed
//! source points, launches one thread per source point and reads back four
//! floats per point. Device arithmetic is single precision, so rows agree
//! with the host backends to roughly 1e-5 relative.

use anyhow::Context;
use cubecl::client::ComputeClient;
use cubecl::cuda::{CudaDevice, CudaRuntime};
use cubecl::prelude::*;
use cubecl::server::Handle;
use nalgebra::Vector3;
use tracing::debug;

use super::kernels::{emicp_expectation_kernel, OUTPUT_STRIDE};
use super::{EStepBackend, OutlierModel, MIN_ROW_MASS};
use crate::error::Result;
use crate::pose::SoftMatch;

/// Type alias for CUDA compute client
type CudaClient = ComputeClient<<CudaRuntime as Runtime>::Server>;

/// Threads per cube.
const BLOCK_SIZE: u32 = 256;

/// EM-ICP expectation on a CUDA device.
pub struct CudaBackend {
    /// CUDA device (kept alive for runtime lifetime)
    #[allow(dead_code)]
    device: CudaDevice,
    client: CudaClient,
    /// Target points [M * 3]
    target: Handle,
    num_target: usize,
}

impl CudaBackend {
    /// Create on device 0 and upload the target set.
    pub fn new(target: &[Vector3<f64>]) -> anyhow::Result<Self> {
        Self::with_device_id(target, 0)
    }

    pub fn with_device_id(target: &[Vector3<f64>], device_id: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(!target.is_empty(), "empty target set");
        anyhow::ensure!(
            target.len() <= u32::MAX as usize / 3,
            "target set too large for 32-bit indexing: {}",
            target.len()
        );

        let device = CudaDevice::new(device_id);
        let client = CudaRuntime::client(&device);

        let flat = flatten(target);
        let target_gpu = client.create(f32::as_bytes(&flat));
        debug!(num_target = target.len(), device_id, "Uploaded EM-ICP target set");

        Ok(Self {
            device,
            client,
            target: target_gpu,
            num_target: target.len(),
        })
    }

    fn launch(
        &self,
        moved_source: &[Vector3<f64>],
        sigma2: f64,
        outlier: &OutlierModel,
    ) -> anyhow::Result<Vec<f32>> {
        let num_source = moved_source.len();
        anyhow::ensure!(
            num_source <= u32::MAX as usize / OUTPUT_STRIDE as usize,
            "source set too large for 32-bit indexing: {num_source}"
        );

        let source_flat = flatten(moved_source);
        let source_gpu = self.client.create(f32::as_bytes(&source_flat));
        let rows_gpu = self
            .client
            .empty(num_source * OUTPUT_STRIDE as usize * std::mem::size_of::<f32>());

        let e0 = outlier.exponent(sigma2);
        let cube_count = (num_source as u32).div_ceil(BLOCK_SIZE);
        unsafe {
            emicp_expectation_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                CubeCount::Static(cube_count, 1, 1),
                CubeDim::new(BLOCK_SIZE, 1, 1),
                ArrayArg::from_raw_parts::<f32>(&source_gpu, num_source * 3, 1),
                ArrayArg::from_raw_parts::<f32>(&self.target, self.num_target * 3, 1),
                ScalarArg::new((1.0 / (2.0 * sigma2)) as f32),
                ScalarArg::new(e0.unwrap_or(0.0) as f32),
                ScalarArg::new(u32::from(e0.is_some())),
                ScalarArg::new(num_source as u32),
                ScalarArg::new(self.num_target as u32),
                ArrayArg::from_raw_parts::<f32>(
                    &rows_gpu,
                    num_source * OUTPUT_STRIDE as usize,
                    1,
                ),
            );
        }

        let bytes = self.client.read_one(rows_gpu);
        let rows = f32::from_bytes(&bytes).to_vec();
        anyhow::ensure!(
            rows.len() >= num_source * OUTPUT_STRIDE as usize,
            "short read from device: {} values",
            rows.len()
        );
        Ok(rows)
    }
}

impl EStepBackend for CudaBackend {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn expectation(
        &mut self,
        moved_source: &[Vector3<f64>],
        sigma2: f64,
        outlier: &OutlierModel,
    ) -> Result<Vec<SoftMatch>> {
        if moved_source.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .launch(moved_source, sigma2, outlier)
            .context("EM-ICP expectation kernel")?;

        Ok(rows
            .chunks_exact(OUTPUT_STRIDE as usize)
            .map(|r| {
                let mass = r[0] as f64;
                if mass < MIN_ROW_MASS {
                    SoftMatch::empty()
                } else {
                    SoftMatch::from_weighted_sum(
                        mass,
                        Vector3::new(r[1] as f64, r[2] as f64, r[3] as f64),
                    )
                }
            })
            .collect())
    }
}

fn flatten(points: &[Vector3<f64>]) -> Vec<f32> {
    points
        .iter()
        .flat_map(|p| [p.x as f32, p.y as f32, p.z as f32])
        .collect()
}

/// Check if CUDA is available on this system.
pub fn is_cuda_available() -> bool {
    // creating the device panics when no driver or GPU is present
    std::panic::catch_unwind(|| {
        let _device = CudaDevice::new(0);
    })
    .is_ok()
}
