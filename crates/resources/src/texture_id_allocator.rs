use gpu_context::{GraphicsContext, TextureId};

/// Hands out texture names fetched from the driver in batches.
#[derive(Debug)]
pub(crate) struct TextureIdAllocator {
    batch_size: usize,
    free: Vec<TextureId>,
}

impl TextureIdAllocator {
    pub(crate) fn new(batch_size: usize) -> Self {
        if batch_size == 0 {
            panic!("texture id batch size must be at least 1");
        }
        Self {
            batch_size,
            free: Vec::new(),
        }
    }

    pub(crate) fn allocate(&mut self, context: &mut dyn GraphicsContext) -> TextureId {
        if self.free.is_empty() {
            let mut batch = context.gen_textures(self.batch_size);
            if batch.len() != self.batch_size {
                panic!(
                    "driver returned {} texture names for a batch of {}",
                    batch.len(),
                    self.batch_size
                );
            }
            batch.reverse();
            self.free = batch;
        }
        let Some(texture) = self.free.pop() else {
            panic!("texture id batch drained unexpectedly");
        };
        texture
    }

    pub(crate) fn unused_count(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn release_unused(&mut self, context: &mut dyn GraphicsContext) {
        if self.free.is_empty() {
            return;
        }
        context.delete_textures(&self.free);
        self.free.clear();
    }

    /// Forgets names that belonged to a context that no longer exists.
    pub(crate) fn discard_unused(&mut self) {
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_context::TestContext;

    #[test]
    fn names_come_out_in_driver_order_one_batch_at_a_time() {
        let inspect = TestContext::new();
        let mut context = inspect.clone();
        let mut allocator = TextureIdAllocator::new(3);

        let first = allocator.allocate(&mut context);
        let second = allocator.allocate(&mut context);
        assert!(first.0 < second.0);
        assert_eq!(inspect.created_texture_count(), 3);
        assert_eq!(allocator.unused_count(), 1);

        let _ = allocator.allocate(&mut context);
        let _ = allocator.allocate(&mut context);
        assert_eq!(inspect.created_texture_count(), 6);
    }

    #[test]
    fn unused_names_are_returned_to_the_driver() {
        let inspect = TestContext::new();
        let mut context = inspect.clone();
        let mut allocator = TextureIdAllocator::new(4);
        let _ = allocator.allocate(&mut context);

        allocator.release_unused(&mut context);
        assert_eq!(inspect.deleted_texture_count(), 3);
        assert_eq!(allocator.unused_count(), 0);
    }
}
