use maestro_core::ResourceRequirements;
use parking_lot::Mutex;

/// Resource accounting for one workflow.
///
/// Check-and-reserve happens under a single lock, so two stages can never
/// both be admitted into the last slice of the budget.
#[derive(Debug)]
pub struct ResourceLedger {
    budget: ResourceRequirements,
    allocated: Mutex<ResourceRequirements>,
}

impl ResourceLedger {
    pub fn new(budget: ResourceRequirements) -> Self {
        Self {
            budget,
            allocated: Mutex::new(ResourceRequirements::ZERO),
        }
    }

    pub fn budget(&self) -> ResourceRequirements {
        self.budget
    }

    pub fn allocated(&self) -> ResourceRequirements {
        *self.allocated.lock()
    }

    pub fn available(&self) -> ResourceRequirements {
        self.budget.saturating_sub(self.allocated())
    }

    /// Whether `requested` fits next to current allocations. Reserves nothing.
    pub fn would_fit(&self, requested: ResourceRequirements) -> bool {
        self.allocated
            .lock()
            .saturating_add(requested)
            .fits_within(&self.budget)
    }

    /// Reserve `requested` if it fits.
    pub fn try_allocate(&self, requested: ResourceRequirements) -> bool {
        let mut allocated = self.allocated.lock();
        let next = allocated.saturating_add(requested);
        if next.fits_within(&self.budget) {
            *allocated = next;
            true
        } else {
            false
        }
    }

    pub fn release(&self, released: ResourceRequirements) {
        let mut allocated = self.allocated.lock();
        *allocated = allocated.saturating_sub(released);
    }
}
