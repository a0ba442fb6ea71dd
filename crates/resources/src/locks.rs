use std::ops::Deref;

use gpu_context::{BitmapPixels, TextureId, TextureUnit};
use resource_protocol::{Filter, ResourceId};

use crate::{ResourceProvider, ResourceView};

/// Holds a read lock for as long as the guard lives.
#[derive(Debug)]
pub struct ReadLock<'a> {
    provider: &'a ResourceProvider,
    id: ResourceId,
    view: ResourceView,
}

impl<'a> ReadLock<'a> {
    pub fn new(provider: &'a ResourceProvider, id: ResourceId) -> Self {
        let view = provider.lock_for_read(id);
        Self { provider, id, view }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn view(&self) -> &ResourceView {
        &self.view
    }

    pub fn texture(&self) -> Option<TextureId> {
        self.view.texture()
    }

    pub fn pixels(&self) -> Option<&BitmapPixels> {
        self.view.pixels()
    }

    pub fn is_lost(&self) -> bool {
        self.view.is_lost()
    }
}

impl Drop for ReadLock<'_> {
    fn drop(&mut self) {
        self.provider.unlock_for_read(self.id);
    }
}

/// A read lock that has also bound the texture to a sampler unit with the
/// requested filter. The filter stays applied after the guard is gone.
#[derive(Debug)]
pub struct SamplerLock<'a> {
    lock: ReadLock<'a>,
    unit: TextureUnit,
    filter: Filter,
}

impl<'a> SamplerLock<'a> {
    pub fn new(provider: &'a ResourceProvider, id: ResourceId, filter: Filter) -> Self {
        Self::with_unit(provider, id, TextureUnit::DEFAULT, filter)
    }

    pub fn with_unit(
        provider: &'a ResourceProvider,
        id: ResourceId,
        unit: TextureUnit,
        filter: Filter,
    ) -> Self {
        let lock = ReadLock::new(provider, id);
        provider.bind_for_sampling(id, unit, filter);
        Self { lock, unit, filter }
    }

    pub fn unit(&self) -> TextureUnit {
        self.unit
    }

    pub fn filter(&self) -> Filter {
        self.filter
    }
}

impl<'a> Deref for SamplerLock<'a> {
    type Target = ReadLock<'a>;

    fn deref(&self) -> &ReadLock<'a> {
        &self.lock
    }
}

/// Exclusive write access. Lazily allocated storage exists once the guard
/// is built.
#[derive(Debug)]
pub struct WriteLock<'a> {
    provider: &'a ResourceProvider,
    id: ResourceId,
    view: ResourceView,
}

impl<'a> WriteLock<'a> {
    pub fn new(provider: &'a ResourceProvider, id: ResourceId) -> Self {
        let view = provider.lock_for_write(id);
        Self { provider, id, view }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn view(&self) -> &ResourceView {
        &self.view
    }

    pub fn texture(&self) -> Option<TextureId> {
        self.view.texture()
    }

    pub fn pixels(&self) -> Option<&BitmapPixels> {
        self.view.pixels()
    }
}

impl Drop for WriteLock<'_> {
    fn drop(&mut self) {
        self.provider.unlock_for_write(self.id);
    }
}
