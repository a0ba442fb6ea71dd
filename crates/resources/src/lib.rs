//! Resource table for GPU textures and shared-memory bitmaps.
//!
//! [`ResourceProvider`] owns every resource of one compositor instance. Lock
//! guards borrow the provider to read or write a resource, the transfer
//! protocol loans resources between child and parent compositors through
//! mailboxes, and [`ResourcePool`] recycles released storage.

use gpu_context::{BitmapPixels, SharedBitmap, TextureId};
use resource_protocol::{ChildId, Filter, MailboxHolder, ResourceFormat, Size, SyncPoint};

mod locks;
mod pool;
mod provider;
mod readback;
mod resource;
mod scoped;
mod texture_id_allocator;
mod transfer;


pub use locks::{ReadLock, SamplerLock, WriteLock};
pub use pool::{ResourcePool, ResourceUsageLimits};
pub use provider::{MappedPixelBuffer, ResourceProvider};
pub use readback::{ReadbackCallback, ReadbackId, ReadbackResult};
pub use scoped::ScopedResource;
pub use transfer::ReturnCallback;

/// Runs once when an externally supplied resource leaves the table.
///
/// `sync_point` orders the owner's next use of the texture after every read
/// issued here. `lost` means the contents can no longer be trusted.
pub trait ReleaseCallback: Send {
    fn release(self: Box<Self>, sync_point: SyncPoint, lost: bool);
}

impl<F> ReleaseCallback for F
where
    F: FnOnce(SyncPoint, bool) + Send,
{
    fn release(self: Box<Self>, sync_point: SyncPoint, lost: bool) {
        (*self)(sync_point, lost)
    }
}

/// Storage handed in by an embedder that keeps ownership of it.
#[derive(Debug, Clone)]
pub enum TextureMailbox {
    Texture {
        holder: MailboxHolder,
        size: Size,
        format: ResourceFormat,
    },
    SharedBitmap(SharedBitmap),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackingKind {
    Texture,
    Bitmap,
}

/// What a lock exposes. `Lost` never carries a texture name, so a lost
/// resource cannot be sampled by mistake.
#[derive(Debug, Clone)]
pub enum ResourceView {
    Texture(TextureId),
    Bitmap(BitmapPixels),
    Lost,
}

impl ResourceView {
    pub fn texture(&self) -> Option<TextureId> {
        match self {
            ResourceView::Texture(texture) => Some(*texture),
            _ => None,
        }
    }

    pub fn pixels(&self) -> Option<&BitmapPixels> {
        match self {
            ResourceView::Bitmap(pixels) => Some(pixels),
            _ => None,
        }
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, ResourceView::Lost)
    }
}

/// Point-in-time copy of a resource's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub size: Size,
    pub format: ResourceFormat,
    pub backing: BackingKind,
    pub allocated: bool,
    pub lock_for_read_count: u32,
    pub locked_for_write: bool,
    pub pending_set_pixels: bool,
    pub exported_count: u32,
    pub imported_count: u32,
    pub marked_for_deletion: bool,
    pub lost: bool,
    pub external: bool,
    pub child: Option<ChildId>,
    pub has_mailbox: bool,
    pub has_read_lock_fence: bool,
    pub read_lock_fences_enabled: bool,
    pub filter: Option<Filter>,
}
