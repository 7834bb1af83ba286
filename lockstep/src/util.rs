pub(crate) mod ring;
#[cfg(all(test, not(lockstep_loom)))]
pub(crate) mod rng;
