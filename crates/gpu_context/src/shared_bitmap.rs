use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use resource_protocol::{MAILBOX_NAME_BYTES, Mailbox, ResourceFormat, SharedBitmapId, Size};

/// Shared-memory bitmaps always hold 32-bit RGBA pixels.
pub const SHARED_BITMAP_FORMAT: ResourceFormat = ResourceFormat::Rgba8888;

/// Heap or shared-memory pixel storage of a software resource.
#[derive(Debug, Clone, Default)]
pub struct BitmapPixels(Arc<Mutex<Vec<u8>>>);

impl BitmapPixels {
    pub fn zeroed(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; len])))
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().expect("bitmap pixels lock poisoned")
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when both handles name the same storage.
    pub fn same_storage(&self, other: &BitmapPixels) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone)]
pub struct SharedBitmap {
    id: SharedBitmapId,
    size: Size,
    pixels: BitmapPixels,
}

impl SharedBitmap {
    pub fn id(&self) -> SharedBitmapId {
        self.id
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn pixels(&self) -> &BitmapPixels {
        &self.pixels
    }
}

pub trait SharedBitmapManager: Send + Sync {
    fn allocate_shared_bitmap(&self, size: Size) -> Option<SharedBitmap>;
    /// Resolves a segment named by another process. `None` when the id is
    /// unknown or the segment is too small for `size`.
    fn shared_bitmap_from_id(&self, size: Size, id: SharedBitmapId) -> Option<SharedBitmap>;
    fn release_shared_bitmap(&self, id: SharedBitmapId);
}

#[derive(Debug, Default)]
struct InProcessState {
    bitmaps: HashMap<SharedBitmapId, SharedBitmap>,
    next_segment: u64,
    allocated_bytes: usize,
}

/// Shared bitmaps for compositors living in one process.
#[derive(Debug, Clone, Default)]
pub struct InProcessSharedBitmapManager {
    state: Arc<Mutex<InProcessState>>,
    byte_limit: Option<usize>,
}

impl InProcessSharedBitmapManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_byte_limit(byte_limit: usize) -> Self {
        Self {
            state: Arc::default(),
            byte_limit: Some(byte_limit),
        }
    }

    pub fn live_bitmap_count(&self) -> usize {
        self.lock().bitmaps.len()
    }

    pub fn allocated_bytes(&self) -> usize {
        self.lock().allocated_bytes
    }

    fn lock(&self) -> MutexGuard<'_, InProcessState> {
        self.state.lock().expect("shared bitmap registry poisoned")
    }
}

fn segment_name(segment: u64) -> SharedBitmapId {
    let mut name = [0u8; MAILBOX_NAME_BYTES];
    name[..8].copy_from_slice(&segment.to_le_bytes());
    name[MAILBOX_NAME_BYTES - 1] = 0x5b;
    SharedBitmapId(Mailbox::from_bytes(name))
}

impl SharedBitmapManager for InProcessSharedBitmapManager {
    fn allocate_shared_bitmap(&self, size: Size) -> Option<SharedBitmap> {
        let byte_len = size
            .area()
            .checked_mul(SHARED_BITMAP_FORMAT.bits_per_pixel() as usize / 8)?;
        let mut state = self.lock();
        let allocated_after = state.allocated_bytes.checked_add(byte_len)?;
        if self.byte_limit.is_some_and(|limit| allocated_after > limit) {
            tracing::warn!(byte_len, allocated_after, "shared bitmap allocation refused");
            return None;
        }
        state.next_segment = state
            .next_segment
            .checked_add(1)
            .expect("shared bitmap segment space exhausted");
        let bitmap = SharedBitmap {
            id: segment_name(state.next_segment),
            size,
            pixels: BitmapPixels::zeroed(byte_len),
        };
        state.allocated_bytes = allocated_after;
        state.bitmaps.insert(bitmap.id, bitmap.clone());
        Some(bitmap)
    }

    fn shared_bitmap_from_id(&self, size: Size, id: SharedBitmapId) -> Option<SharedBitmap> {
        let state = self.lock();
        let bitmap = state.bitmaps.get(&id)?;
        let needed = SHARED_BITMAP_FORMAT.byte_len(size);
        if bitmap.pixels.len() < needed {
            return None;
        }
        Some(SharedBitmap {
            id,
            size,
            pixels: bitmap.pixels.clone(),
        })
    }

    fn release_shared_bitmap(&self, id: SharedBitmapId) {
        let mut state = self.lock();
        let Some(bitmap) = state.bitmaps.remove(&id) else {
            panic!("released shared bitmap {id:?} is not registered");
        };
        let byte_len = bitmap.pixels.len();
        state.allocated_bytes = state
            .allocated_bytes
            .checked_sub(byte_len)
            .expect("shared bitmap byte accounting underflow");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_bitmap_shares_storage_with_allocation() {
        let manager = InProcessSharedBitmapManager::new();
        let bitmap = manager
            .allocate_shared_bitmap(Size::new(2, 2))
            .expect("allocate bitmap");
        bitmap.pixels().lock()[0] = 42;

        let resolved = manager
            .shared_bitmap_from_id(Size::new(2, 2), bitmap.id())
            .expect("resolve bitmap");
        assert!(resolved.pixels().same_storage(bitmap.pixels()));
        assert_eq!(resolved.pixels().lock()[0], 42);
        assert_eq!(manager.allocated_bytes(), 16);
    }

    #[test]
    fn lookup_rejects_oversized_request_and_unknown_id() {
        let manager = InProcessSharedBitmapManager::new();
        let bitmap = manager
            .allocate_shared_bitmap(Size::new(1, 1))
            .expect("allocate bitmap");
        assert!(
            manager
                .shared_bitmap_from_id(Size::new(2, 1), bitmap.id())
                .is_none()
        );
        manager.release_shared_bitmap(bitmap.id());
        assert!(
            manager
                .shared_bitmap_from_id(Size::new(1, 1), bitmap.id())
                .is_none()
        );
        assert_eq!(manager.live_bitmap_count(), 0);
    }

    #[test]
    fn byte_limit_refuses_allocation() {
        let manager = InProcessSharedBitmapManager::with_byte_limit(16);
        assert!(manager.allocate_shared_bitmap(Size::new(2, 2)).is_some());
        assert!(manager.allocate_shared_bitmap(Size::new(1, 1)).is_none());
    }
}
