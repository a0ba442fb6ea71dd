use std::sync::Arc;

use gpu_context::{BitmapPixels, Fence, QueryId, TextureId};
use resource_protocol::{
    ChildId, Filter, MailboxHolder, ResourceFormat, SharedBitmapId, Size, TextureTarget,
    TextureUsageHint, WrapMode,
};

use crate::{BackingKind, ReleaseCallback, ResourceSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Storage {
    Unallocated,
    Allocated,
}

#[derive(Debug)]
pub(crate) struct TextureBacking {
    /// Local texture name. Absent until created, or until a mailbox is
    /// consumed for external and imported resources.
    pub(crate) texture: Option<TextureId>,
    pub(crate) storage: Storage,
    pub(crate) target: TextureTarget,
    pub(crate) filter: Filter,
    pub(crate) original_filter: Filter,
    pub(crate) mailbox: Option<MailboxHolder>,
    pub(crate) upload_query: Option<QueryId>,
}

impl TextureBacking {
    pub(crate) fn local(filter: Filter) -> Self {
        Self {
            texture: None,
            storage: Storage::Unallocated,
            target: TextureTarget::Texture2D,
            filter,
            original_filter: filter,
            mailbox: None,
            upload_query: None,
        }
    }

    pub(crate) fn from_mailbox(holder: MailboxHolder, filter: Filter) -> Self {
        Self {
            texture: None,
            storage: Storage::Allocated,
            target: holder.target,
            filter,
            original_filter: filter,
            mailbox: Some(holder),
            upload_query: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct BitmapBacking {
    pub(crate) pixels: BitmapPixels,
    /// Segment name when the pixels live in shared memory.
    pub(crate) shared: Option<SharedBitmapId>,
}

#[derive(Debug)]
pub(crate) enum Backing {
    Texture(TextureBacking),
    Bitmap(BitmapBacking),
}

pub(crate) enum Origin {
    Internal,
    External(Box<dyn ReleaseCallback>),
    Imported(ChildId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Active,
    MarkedForDeletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteState {
    Unlocked,
    Locked,
    /// Pixel buffer upload in flight. Readers are admitted once completion
    /// has been forced.
    Uploading { completion_forced: bool },
}

pub(crate) enum PixelBuffer {
    Unmapped(Vec<u8>),
    Mapped,
}

pub(crate) struct Resource {
    pub(crate) size: Size,
    pub(crate) format: ResourceFormat,
    pub(crate) wrap_mode: WrapMode,
    pub(crate) hint: TextureUsageHint,
    pub(crate) backing: Backing,
    pub(crate) origin: Origin,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) write: WriteState,
    pub(crate) lock_for_read_count: u32,
    pub(crate) exported_count: u32,
    pub(crate) imported_count: u32,
    pub(crate) read_lock_fences_enabled: bool,
    pub(crate) read_lock_fence: Option<Arc<dyn Fence>>,
    pub(crate) lost: bool,
    pub(crate) pixel_buffer: Option<PixelBuffer>,
}

impl Resource {
    pub(crate) fn new(
        size: Size,
        format: ResourceFormat,
        wrap_mode: WrapMode,
        hint: TextureUsageHint,
        backing: Backing,
        origin: Origin,
    ) -> Self {
        Self {
            size,
            format,
            wrap_mode,
            hint,
            backing,
            origin,
            lifecycle: Lifecycle::Active,
            write: WriteState::Unlocked,
            lock_for_read_count: 0,
            exported_count: 0,
            imported_count: 0,
            read_lock_fences_enabled: false,
            read_lock_fence: None,
            lost: false,
            pixel_buffer: None,
        }
    }

    pub(crate) fn backing_kind(&self) -> BackingKind {
        match self.backing {
            Backing::Texture(_) => BackingKind::Texture,
            Backing::Bitmap(_) => BackingKind::Bitmap,
        }
    }

    pub(crate) fn is_allocated(&self) -> bool {
        match &self.backing {
            Backing::Texture(texture) => texture.storage == Storage::Allocated,
            Backing::Bitmap(_) => true,
        }
    }

    pub(crate) fn child(&self) -> Option<ChildId> {
        match self.origin {
            Origin::Imported(child) => Some(child),
            _ => None,
        }
    }

    pub(crate) fn is_internal(&self) -> bool {
        matches!(self.origin, Origin::Internal)
    }

    pub(crate) fn is_marked_for_deletion(&self) -> bool {
        self.lifecycle == Lifecycle::MarkedForDeletion
    }

    pub(crate) fn admits_readers(&self) -> bool {
        match self.write {
            WriteState::Unlocked => true,
            WriteState::Locked => false,
            WriteState::Uploading { completion_forced } => completion_forced,
        }
    }

    pub(crate) fn read_lock_fence_has_passed(&self) -> bool {
        self.read_lock_fence
            .as_ref()
            .is_none_or(|fence| fence.has_passed())
    }

    /// Still referenced by a reader or by a parent.
    pub(crate) fn is_busy(&self) -> bool {
        self.lock_for_read_count > 0 || self.exported_count > 0
    }

    pub(crate) fn snapshot(&self) -> ResourceSnapshot {
        let (has_mailbox, filter) = match &self.backing {
            Backing::Texture(texture) => (texture.mailbox.is_some(), Some(texture.filter)),
            Backing::Bitmap(bitmap) => (bitmap.shared.is_some(), None),
        };
        ResourceSnapshot {
            size: self.size,
            format: self.format,
            backing: self.backing_kind(),
            allocated: self.is_allocated(),
            lock_for_read_count: self.lock_for_read_count,
            locked_for_write: self.write != WriteState::Unlocked,
            pending_set_pixels: matches!(self.write, WriteState::Uploading { .. }),
            exported_count: self.exported_count,
            imported_count: self.imported_count,
            marked_for_deletion: self.is_marked_for_deletion(),
            lost: self.lost,
            external: matches!(self.origin, Origin::External(_)),
            child: self.child(),
            has_mailbox,
            has_read_lock_fence: self.read_lock_fence.is_some(),
            read_lock_fences_enabled: self.read_lock_fences_enabled,
            filter,
        }
    }
}
