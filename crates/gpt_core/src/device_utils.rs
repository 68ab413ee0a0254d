use candle_core::Device;

/// Pick the compute device. Uses CUDA device 0 when compiled with the `cuda`
/// feature and a GPU is present, otherwise the CPU.
pub fn select_device(cpu_only: bool) -> Device {
    if cpu_only {
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(e) => {
            tracing::warn!("Failed to initialize CUDA device 0: {e}. Falling back to CPU.");
            Device::Cpu
        }
    }
}
