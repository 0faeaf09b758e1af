use thiserror::Error;

#[derive(Error, Debug)]
pub enum DistributedError {
    #[error("Collective operation failed: {0}")]
    Collective(String),
}

/// Process group the training loop runs in
pub trait Distributed {
    /// Global rank of this process
    fn rank(&self) -> usize;

    /// Rank of this process on its host
    fn local_rank(&self) -> usize;

    /// Number of processes
    fn size(&self) -> usize;

    /// Sum of `value` over all processes
    fn all_reduce_sum(&self, value: f64) -> Result<f64, DistributedError>;

    /// Mean of `value` over all processes
    fn all_reduce_mean(&self, value: f64) -> Result<f64, DistributedError> {
        Ok(self.all_reduce_sum(value)? / self.size().max(1) as f64)
    }

    fn is_primary(&self) -> bool {
        self.rank() == 0
    }

    fn is_local_primary(&self) -> bool {
        self.local_rank() == 0
    }
}

/// The trivial group of one process
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Distributed for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn local_rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, value: f64) -> Result<f64, DistributedError> {
        Ok(value)
    }
}
