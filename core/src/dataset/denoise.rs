use super::{Attributes, DataSet};
use crate::context::ComputeContext;
use crate::device::{DataElem, Device, DeviceBuffer};
use crate::distributed::CollectiveBackend;
use crate::error::{DataSetError, Result};
use rand::Rng;
use tracing::{debug, warn};

impl<T: DataElem, D: Device> DataSet<T, D> {
    /// Enables or disables the denoising mask: one `f32` draw per local sparse entry.
    ///
    /// Returns `Ok(false)` without changing anything on a dense dataset.
    pub fn set_denoising<B: CollectiveBackend>(
        &mut self,
        flag: bool,
        ctx: &ComputeContext<B, D>,
    ) -> Result<bool> {
        if !self.is_sparse() {
            warn!(name = %self.name, "denoising requested for a dense dataset");
            return Ok(false);
        }
        if flag {
            let entries = self.local_nonzeros();
            self.denoising_random = Some(ctx.device().allocate::<f32>(entries)?);
            self.attributes.insert(Attributes::DENOISING);
            debug!(name = %self.name, entries, "allocated denoising mask");
        } else {
            self.denoising_random = None;
            self.attributes.remove(Attributes::DENOISING);
        }
        Ok(true)
    }

    /// Refills the denoising mask with uniform `[0, 1)` draws from the context generator.
    ///
    /// Returns `Ok(false)` on a dense dataset or when denoising is disabled.
    pub fn generate_denoising_data<B: CollectiveBackend>(
        &mut self,
        ctx: &mut ComputeContext<B, D>,
    ) -> Result<bool> {
        match self.fill_denoising_mask(ctx) {
            Ok(()) => Ok(true),
            Err(e) if !e.is_fatal() => {
                warn!(name = %self.name, error = %e, "denoising data not generated");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn fill_denoising_mask<B: CollectiveBackend>(
        &mut self,
        ctx: &mut ComputeContext<B, D>,
    ) -> Result<()> {
        if !self.is_sparse() {
            return Err(DataSetError::NotSparse);
        }
        let Some(mask) = self.denoising_random.as_mut() else {
            return Err(DataSetError::DenoisingDisabled);
        };
        let rng = ctx.rng_mut();
        let draws: Vec<f32> = (0..mask.len()).map(|_| rng.random::<f32>()).collect();
        mask.upload(&draws)
    }

    /// The current denoising mask, if enabled.
    pub fn denoising_random(&self) -> Option<&D::Buffer<f32>> {
        self.denoising_random.as_ref()
    }
}
