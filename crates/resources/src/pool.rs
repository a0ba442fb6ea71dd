use std::collections::VecDeque;

use resource_protocol::{ResourceFormat, Size, TextureUsageHint, WrapMode};

use crate::{ResourceProvider, ScopedResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsageLimits {
    pub max_memory_usage_bytes: usize,
    pub max_unused_memory_usage_bytes: usize,
    pub max_resource_count: usize,
}

impl ResourceUsageLimits {
    pub const UNLIMITED: ResourceUsageLimits = ResourceUsageLimits {
        max_memory_usage_bytes: usize::MAX,
        max_unused_memory_usage_bytes: usize::MAX,
        max_resource_count: usize::MAX,
    };
}

/// Recycles released resources of matching size and format.
///
/// Unused resources are kept most recently released first. Eviction takes
/// from the other end, where read lock fences are most likely to have
/// passed.
#[derive(Debug)]
pub struct ResourcePool<'a> {
    provider: &'a ResourceProvider,
    limits: ResourceUsageLimits,
    unused: VecDeque<ScopedResource<'a>>,
    memory_usage_bytes: usize,
    unused_memory_usage_bytes: usize,
    resource_count: usize,
}

impl<'a> ResourcePool<'a> {
    pub fn new(provider: &'a ResourceProvider, limits: ResourceUsageLimits) -> Self {
        Self {
            provider,
            limits,
            unused: VecDeque::new(),
            memory_usage_bytes: 0,
            unused_memory_usage_bytes: 0,
            resource_count: 0,
        }
    }

    pub fn acquire(&mut self, size: Size, format: ResourceFormat) -> ScopedResource<'a> {
        let reusable = self.unused.iter().position(|resource| {
            resource.size() == size
                && resource.format() == format
                && self.provider.can_lock_for_write(resource.id())
        });
        if let Some(resource) = reusable.and_then(|index| self.unused.remove(index)) {
            self.unused_memory_usage_bytes -= resource.bytes();
            tracing::trace!(id = %resource.id(), "pooled resource reused");
            return resource;
        }

        let resource = ScopedResource::allocate(
            self.provider,
            size,
            WrapMode::ClampToEdge,
            TextureUsageHint::Any,
            format,
        );
        self.provider.enable_read_lock_fences(resource.id(), true);
        self.memory_usage_bytes = self
            .memory_usage_bytes
            .checked_add(resource.bytes())
            .expect("pool memory usage overflow");
        self.resource_count += 1;
        resource
    }

    pub fn release(&mut self, resource: ScopedResource<'a>) {
        if !std::ptr::eq(resource.provider(), self.provider) {
            panic!("released {} into a pool of another provider", resource.id());
        }
        let bytes = resource.bytes();
        if self.usage_too_high() {
            self.memory_usage_bytes -= bytes;
            self.resource_count -= 1;
            tracing::trace!(id = %resource.id(), "pool over limits; resource deleted");
            return;
        }
        self.unused_memory_usage_bytes += bytes;
        self.unused.push_front(resource);
    }

    pub fn set_usage_limits(&mut self, limits: ResourceUsageLimits) {
        self.limits = limits;
        self.reduce_resource_usage();
    }

    pub fn usage_limits(&self) -> ResourceUsageLimits {
        self.limits
    }

    /// Deletes unused resources, least recently released first, until usage
    /// fits the limits.
    pub fn reduce_resource_usage(&mut self) {
        while self.usage_too_high() {
            let Some(resource) = self.unused.pop_back() else {
                break;
            };
            let bytes = resource.bytes();
            self.memory_usage_bytes -= bytes;
            self.unused_memory_usage_bytes -= bytes;
            self.resource_count -= 1;
        }
    }

    fn usage_too_high(&self) -> bool {
        self.memory_usage_bytes > self.limits.max_memory_usage_bytes
            || self.unused_memory_usage_bytes > self.limits.max_unused_memory_usage_bytes
            || self.resource_count > self.limits.max_resource_count
    }

    pub fn total_memory_usage_bytes(&self) -> usize {
        self.memory_usage_bytes
    }

    pub fn acquired_memory_usage_bytes(&self) -> usize {
        self.memory_usage_bytes - self.unused_memory_usage_bytes
    }

    pub fn total_resource_count(&self) -> usize {
        self.resource_count
    }

    pub fn acquired_resource_count(&self) -> usize {
        self.resource_count - self.unused.len()
    }

    pub fn unused_resource_count(&self) -> usize {
        self.unused.len()
    }
}
