use resource_protocol::{ResourceFormat, ResourceId, Size, TextureUsageHint, WrapMode};

use crate::ResourceProvider;

/// A resource deleted when the handle drops.
#[derive(Debug)]
pub struct ScopedResource<'a> {
    provider: &'a ResourceProvider,
    id: ResourceId,
    size: Size,
    format: ResourceFormat,
}

impl<'a> ScopedResource<'a> {
    /// Creates the resource with the provider's default backing.
    pub fn allocate(
        provider: &'a ResourceProvider,
        size: Size,
        wrap_mode: WrapMode,
        hint: TextureUsageHint,
        format: ResourceFormat,
    ) -> Self {
        let id = provider.create_resource(size, wrap_mode, hint, format);
        Self {
            provider,
            id,
            size,
            format,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn format(&self) -> ResourceFormat {
        self.format
    }

    /// Bytes of storage the resource accounts for.
    pub fn bytes(&self) -> usize {
        self.format.byte_len(self.size)
    }

    pub(crate) fn provider(&self) -> &'a ResourceProvider {
        self.provider
    }
}

impl Drop for ScopedResource<'_> {
    fn drop(&mut self) {
        self.provider.delete_resource(self.id);
    }
}
