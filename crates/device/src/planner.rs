//! Dispatch planning from kernel work sizes.

use crate::device::{DeviceError, Kernel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPlan {
    pub local_size: [u32; 2],
    pub workgroups: [u32; 3],
}

impl DispatchPlan {
    /// Number of work groups per dimension, rounding the global size up.
    pub fn for_kernel(kernel: &Kernel) -> Result<Self, DeviceError> {
        let local = kernel.local_work_size();
        let global = kernel.global_work_size();
        if local.contains(&0) {
            return Err(DeviceError::Dispatch {
                kernel: kernel.name().to_string(),
                message: format!("local work size {local:?} has a zero dimension"),
            });
        }
        Ok(Self {
            local_size: local,
            workgroups: [
                global[0].div_ceil(local[0]).max(1),
                global[1].div_ceil(local[1]).max(1),
                1,
            ],
        })
    }

    pub fn total_workgroups(&self) -> u64 {
        self.workgroups.iter().map(|&n| n as u64).product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroups_round_up() {
        let mut kernel = Kernel::new("p", "k0");
        kernel.set_local_work_size(0, 64);
        kernel.set_local_work_size(1, 2);
        kernel.set_global_work_size(0, 130);
        kernel.set_global_work_size(1, 4);
        let plan = DispatchPlan::for_kernel(&kernel).unwrap();
        assert_eq!(plan.workgroups, [3, 2, 1]);
        assert_eq!(plan.total_workgroups(), 6);
    }

    #[test]
    fn zero_local_size_is_rejected() {
        let mut kernel = Kernel::new("p", "k0");
        kernel.set_local_work_size(0, 0);
        assert!(DispatchPlan::for_kernel(&kernel).is_err());
    }
}
