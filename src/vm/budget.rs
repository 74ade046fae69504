use crate::config::ClusterLimits;

use super::Reservation;

/// Running totals of what live VMs hold against the cluster limits.
///
/// vCPUs may be oversubscribed up to `max_vcpu_oversubscription`; memory is
/// never oversubscribed. A reservation is admitted only when both dimensions
/// fit, checked independently.
#[derive(Debug, Clone)]
pub struct ClusterBudget {
    limits: ClusterLimits,
    committed_vcpu: u32,
    committed_memory_mb: u32,
}

impl ClusterBudget {
    pub fn new(limits: ClusterLimits) -> Self {
        Self {
            limits,
            committed_vcpu: 0,
            committed_memory_mb: 0,
        }
    }

    /// Largest vCPU total the cluster may commit
    pub fn vcpu_capacity(&self) -> u32 {
        let oversub = self.limits.max_vcpu_oversubscription.max(0.0);
        // epsilon keeps 8 * 1.5 from rounding down to 11
        (self.limits.total_vcpu_count as f64 * oversub + 1e-9).floor() as u32
    }

    pub fn memory_capacity_mb(&self) -> u32 {
        self.limits.total_memory_mb
    }

    pub fn committed(&self) -> Reservation {
        Reservation {
            vcpu: self.committed_vcpu,
            memory_mb: self.committed_memory_mb,
        }
    }

    pub fn fits(&self, reservation: Reservation) -> bool {
        let vcpu = self.committed_vcpu as u64 + reservation.vcpu as u64;
        let memory = self.committed_memory_mb as u64 + reservation.memory_mb as u64;
        vcpu <= self.vcpu_capacity() as u64 && memory <= self.memory_capacity_mb() as u64
    }

    /// Commits the reservation if it fits, leaving the totals untouched otherwise
    pub fn try_commit(&mut self, reservation: Reservation) -> bool {
        if !self.fits(reservation) {
            return false;
        }
        self.committed_vcpu += reservation.vcpu;
        self.committed_memory_mb += reservation.memory_mb;
        true
    }

    pub fn release(&mut self, reservation: Reservation) {
        debug_assert!(self.committed_vcpu >= reservation.vcpu);
        debug_assert!(self.committed_memory_mb >= reservation.memory_mb);
        self.committed_vcpu = self.committed_vcpu.saturating_sub(reservation.vcpu);
        self.committed_memory_mb = self.committed_memory_mb.saturating_sub(reservation.memory_mb);
    }
}
