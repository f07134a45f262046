//! Round-robin GPU assignment.

use crate::command::CommandSpec;
use crate::limiter::ConcurrencyLimiter;

/// Environment variable the MD tools read to pick a device.
pub const DEVICE_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Maps task `i` to `devices[i % devices.len()]`.
///
/// Two tasks never share a device as long as no more than `devices.len()`
/// run at once, which is why the matching limiter is built here rather than
/// by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuAllocator {
    devices: Vec<String>,
}

impl GpuAllocator {
    pub fn new(devices: Vec<String>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device for a task, or `None` when running CPU only.
    pub fn device_for(&self, task_index: usize) -> Option<&str> {
        if self.devices.is_empty() {
            return None;
        }
        Some(self.devices[task_index % self.devices.len()].as_str())
    }

    /// Bind a command to the device of `task_index`.
    pub fn bind(&self, task_index: usize, spec: &mut CommandSpec) -> Option<String> {
        let device = self.device_for(task_index)?.to_string();
        spec.set_env(DEVICE_ENV, device.clone());
        Some(device)
    }

    /// A limiter with exactly one permit per device (one when CPU only).
    pub fn limiter(&self) -> ConcurrencyLimiter {
        ConcurrencyLimiter::new(self.devices.len().max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpus(n: usize) -> GpuAllocator {
        GpuAllocator::new((0..n).map(|i| i.to_string()).collect())
    }

    #[test]
    fn assignment_is_index_modulo_count() {
        for g in 1..=4 {
            let alloc = gpus(g);
            for i in 0..20 {
                assert_eq!(alloc.device_for(i), Some((i % g).to_string().as_str()));
            }
        }
    }

    #[test]
    fn preserves_configured_device_ids() {
        let alloc = GpuAllocator::new(vec!["3".into(), "5".into()]);
        assert_eq!(alloc.device_for(0), Some("3"));
        assert_eq!(alloc.device_for(1), Some("5"));
        assert_eq!(alloc.device_for(2), Some("3"));
    }

    #[test]
    fn bind_sets_device_env() {
        let alloc = gpus(2);
        let mut spec = CommandSpec::new("python");
        assert_eq!(alloc.bind(3, &mut spec).as_deref(), Some("1"));
        assert_eq!(spec.env_value(DEVICE_ENV), Some("1"));
    }

    #[test]
    fn cpu_only_binds_nothing() {
        let alloc = gpus(0);
        let mut spec = CommandSpec::new("charmm");
        assert_eq!(alloc.bind(0, &mut spec), None);
        assert!(spec.env.is_empty());
        assert_eq!(alloc.limiter().permits(), 1);
    }

    #[test]
    fn limiter_matches_device_count() {
        assert_eq!(gpus(4).limiter().permits(), 4);
    }
}
