use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use resource_protocol::{
    Filter, MAILBOX_NAME_BYTES, Mailbox, Offset, ResourceFormat, Size, SyncPoint, TextureTarget,
    TextureUsageHint, WrapMode,
};

use crate::{
    BufferId, ContextCapabilities, Fence, GraphicsContext, ManualFence, QueryId, TextureId,
    TextureUnit,
};

#[derive(Debug)]
struct TestTexture {
    size: Size,
    format: ResourceFormat,
    pixels: Vec<u8>,
}

type SharedTexture = Arc<Mutex<TestTexture>>;

#[derive(Debug, Default)]
struct ShareGroupState {
    mailboxes: HashMap<Mailbox, SharedTexture>,
    next_mailbox: u64,
    next_sync_point: u32,
}

/// Mailbox namespace and sync point counter shared by several test contexts.
#[derive(Debug, Clone, Default)]
pub struct TestShareGroup {
    state: Arc<Mutex<ShareGroupState>>,
}

impl TestShareGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_context(&self) -> TestContext {
        TestContext::in_share_group(self.clone())
    }

    pub fn mailbox_count(&self) -> usize {
        self.lock().mailboxes.len()
    }

    fn lock(&self) -> MutexGuard<'_, ShareGroupState> {
        self.state.lock().expect("test share group poisoned")
    }
}

#[derive(Debug)]
struct TextureSlot {
    target: Option<TextureTarget>,
    filter: Filter,
    wrap_mode: WrapMode,
    data: Option<SharedTexture>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryKind {
    Upload,
    Readback,
}

#[derive(Debug)]
struct TestQuery {
    kind: QueryKind,
    complete: bool,
}

#[derive(Debug)]
struct TestContextState {
    capabilities: ContextCapabilities,
    lost: bool,
    next_texture: u32,
    textures: HashMap<TextureId, TextureSlot>,
    created_textures: usize,
    deleted_textures: usize,
    storage_allocations: usize,
    uploads: usize,
    next_query: u32,
    queries: BTreeMap<u32, TestQuery>,
    auto_complete_queries: bool,
    next_buffer: u32,
    readback_buffers: HashMap<BufferId, Vec<u8>>,
    bindings: HashMap<TextureUnit, TextureId>,
    filter_changes: Vec<(TextureId, Filter)>,
    inserted_sync_points: Vec<SyncPoint>,
    waited_sync_points: Vec<SyncPoint>,
    produced_mailboxes: usize,
    consumed_mailboxes: usize,
    fail_mailbox_generation: bool,
    fences: Vec<Arc<ManualFence>>,
    flushes: usize,
    finishes: usize,
}

/// Recording in-memory context. Clones share state, so a test keeps one
/// handle for inspection and hands another to the provider.
#[derive(Debug, Clone)]
pub struct TestContext {
    state: Arc<Mutex<TestContextState>>,
    share_group: TestShareGroup,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    pub fn new() -> Self {
        Self::in_share_group(TestShareGroup::new())
    }

    pub fn in_share_group(share_group: TestShareGroup) -> Self {
        Self {
            state: Arc::new(Mutex::new(TestContextState {
                capabilities: ContextCapabilities::default(),
                lost: false,
                next_texture: 0,
                textures: HashMap::new(),
                created_textures: 0,
                deleted_textures: 0,
                storage_allocations: 0,
                uploads: 0,
                next_query: 0,
                queries: BTreeMap::new(),
                auto_complete_queries: false,
                next_buffer: 0,
                readback_buffers: HashMap::new(),
                bindings: HashMap::new(),
                filter_changes: Vec::new(),
                inserted_sync_points: Vec::new(),
                waited_sync_points: Vec::new(),
                produced_mailboxes: 0,
                consumed_mailboxes: 0,
                fail_mailbox_generation: false,
                fences: Vec::new(),
                flushes: 0,
                finishes: 0,
            })),
            share_group,
        }
    }

    pub fn with_capabilities(self, capabilities: ContextCapabilities) -> Self {
        self.lock().capabilities = capabilities;
        self
    }

    pub fn share_group(&self) -> &TestShareGroup {
        &self.share_group
    }

    pub fn lose_context(&self) {
        self.lock().lost = true;
    }

    pub fn set_auto_complete_queries(&self, auto_complete: bool) {
        self.lock().auto_complete_queries = auto_complete;
    }

    pub fn set_fail_mailbox_generation(&self, fail: bool) {
        self.lock().fail_mailbox_generation = fail;
    }

    pub fn pending_queries(&self) -> Vec<QueryId> {
        self.lock()
            .queries
            .iter()
            .filter(|(_, query)| !query.complete)
            .map(|(raw, _)| QueryId(*raw))
            .collect()
    }

    pub fn pending_readback_queries(&self) -> Vec<QueryId> {
        self.lock()
            .queries
            .iter()
            .filter(|(_, query)| !query.complete && query.kind == QueryKind::Readback)
            .map(|(raw, _)| QueryId(*raw))
            .collect()
    }

    pub fn complete_query(&self, query: QueryId) {
        let mut state = self.lock();
        let Some(entry) = state.queries.get_mut(&query.0) else {
            panic!("completing unknown query {query:?}");
        };
        entry.complete = true;
    }

    pub fn complete_all_queries(&self) {
        for query in self.lock().queries.values_mut() {
            query.complete = true;
        }
    }

    pub fn signal_fences(&self) {
        for fence in &self.lock().fences {
            fence.signal();
        }
    }

    pub fn created_texture_count(&self) -> usize {
        self.lock().created_textures
    }

    pub fn deleted_texture_count(&self) -> usize {
        self.lock().deleted_textures
    }

    pub fn live_texture_count(&self) -> usize {
        self.lock().textures.len()
    }

    pub fn storage_allocation_count(&self) -> usize {
        self.lock().storage_allocations
    }

    pub fn upload_count(&self) -> usize {
        self.lock().uploads
    }

    pub fn texture_pixels(&self, texture: TextureId) -> Option<Vec<u8>> {
        let state = self.lock();
        let data = state.textures.get(&texture)?.data.as_ref()?;
        Some(data.lock().expect("test texture poisoned").pixels.clone())
    }

    pub fn texture_filter(&self, texture: TextureId) -> Option<Filter> {
        self.lock().textures.get(&texture).map(|slot| slot.filter)
    }

    pub fn texture_wrap_mode(&self, texture: TextureId) -> Option<WrapMode> {
        self.lock().textures.get(&texture).map(|slot| slot.wrap_mode)
    }

    pub fn filter_change_count(&self) -> usize {
        self.lock().filter_changes.len()
    }

    pub fn bound_texture(&self, unit: TextureUnit) -> Option<TextureId> {
        self.lock().bindings.get(&unit).copied()
    }

    pub fn inserted_sync_points(&self) -> Vec<SyncPoint> {
        self.lock().inserted_sync_points.clone()
    }

    pub fn waited_sync_points(&self) -> Vec<SyncPoint> {
        self.lock().waited_sync_points.clone()
    }

    pub fn produced_mailbox_count(&self) -> usize {
        self.lock().produced_mailboxes
    }

    pub fn consumed_mailbox_count(&self) -> usize {
        self.lock().consumed_mailboxes
    }

    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }

    pub fn finish_count(&self) -> usize {
        self.lock().finishes
    }

    fn lock(&self) -> MutexGuard<'_, TestContextState> {
        self.state.lock().expect("test context poisoned")
    }
}

impl TestContextState {
    fn slot(&self, texture: TextureId) -> &TextureSlot {
        let Some(slot) = self.textures.get(&texture) else {
            panic!("test context has no texture {texture:?}");
        };
        slot
    }

    fn slot_mut(&mut self, texture: TextureId) -> &mut TextureSlot {
        let Some(slot) = self.textures.get_mut(&texture) else {
            panic!("test context has no texture {texture:?}");
        };
        slot
    }

    fn storage(&self, texture: TextureId) -> SharedTexture {
        let Some(data) = self.slot(texture).data.clone() else {
            panic!("texture {texture:?} has no storage");
        };
        data
    }

    fn contents(&self, texture: TextureId, size: Size, format: ResourceFormat) -> Vec<u8> {
        let data = self.storage(texture);
        let data = data.lock().expect("test texture poisoned");
        assert_eq!((data.size, data.format), (size, format), "readback shape mismatch");
        data.pixels.clone()
    }

    fn new_query(&mut self, kind: QueryKind) -> QueryId {
        self.next_query += 1;
        let complete = self.auto_complete_queries;
        self.queries
            .insert(self.next_query, TestQuery { kind, complete });
        QueryId(self.next_query)
    }
}

fn write_region(texture: &mut TestTexture, origin: Offset, size: Size, pixels: &[u8]) {
    if texture.format.is_compressed() {
        assert_eq!(origin, Offset::default(), "compressed upload must cover the texture");
        assert_eq!(size, texture.size, "compressed upload must cover the texture");
        texture.pixels.copy_from_slice(pixels);
        return;
    }
    let pixel_bytes = texture.format.bits_per_pixel() as usize / 8;
    let texture_row = texture.size.width as usize * pixel_bytes;
    let row_bytes = size.width as usize * pixel_bytes;
    assert!(
        origin.x + size.width <= texture.size.width && origin.y + size.height <= texture.size.height,
        "upload region exceeds texture bounds"
    );
    assert_eq!(pixels.len(), row_bytes * size.height as usize, "upload length mismatch");
    for row in 0..size.height as usize {
        let dest = (origin.y as usize + row) * texture_row + origin.x as usize * pixel_bytes;
        texture.pixels[dest..dest + row_bytes]
            .copy_from_slice(&pixels[row * row_bytes..(row + 1) * row_bytes]);
    }
}

impl GraphicsContext for TestContext {
    fn capabilities(&self) -> ContextCapabilities {
        self.lock().capabilities
    }

    fn is_context_lost(&self) -> bool {
        self.lock().lost
    }

    fn gen_textures(&mut self, count: usize) -> Vec<TextureId> {
        let mut state = self.lock();
        (0..count)
            .map(|_| {
                state.next_texture += 1;
                let texture = TextureId(state.next_texture);
                state.textures.insert(
                    texture,
                    TextureSlot {
                        target: None,
                        filter: Filter::Linear,
                        wrap_mode: WrapMode::ClampToEdge,
                        data: None,
                    },
                );
                state.created_textures += 1;
                texture
            })
            .collect()
    }

    fn delete_textures(&mut self, textures: &[TextureId]) {
        let mut state = self.lock();
        for texture in textures {
            if state.textures.remove(texture).is_none() {
                panic!("deleting unknown texture {texture:?}");
            }
            state.bindings.retain(|_, bound| bound != texture);
            state.deleted_textures += 1;
        }
    }

    fn set_texture_parameters(
        &mut self,
        texture: TextureId,
        target: TextureTarget,
        filter: Filter,
        wrap_mode: WrapMode,
    ) {
        let mut state = self.lock();
        let slot = state.slot_mut(texture);
        slot.target = Some(target);
        slot.filter = filter;
        slot.wrap_mode = wrap_mode;
    }

    fn set_texture_filter(&mut self, texture: TextureId, target: TextureTarget, filter: Filter) {
        let mut state = self.lock();
        let slot = state.slot_mut(texture);
        slot.target = Some(target);
        slot.filter = filter;
        state.filter_changes.push((texture, filter));
    }

    fn allocate_texture_storage(
        &mut self,
        texture: TextureId,
        target: TextureTarget,
        size: Size,
        format: ResourceFormat,
        _hint: TextureUsageHint,
    ) {
        let mut state = self.lock();
        let slot = state.slot_mut(texture);
        assert!(slot.data.is_none(), "texture {texture:?} storage allocated twice");
        slot.target = Some(target);
        slot.data = Some(Arc::new(Mutex::new(TestTexture {
            size,
            format,
            pixels: vec![0; format.byte_len(size)],
        })));
        state.storage_allocations += 1;
    }

    fn upload_pixels(
        &mut self,
        texture: TextureId,
        origin: Offset,
        size: Size,
        format: ResourceFormat,
        pixels: &[u8],
    ) {
        let mut state = self.lock();
        let data = state.storage(texture);
        let mut data = data.lock().expect("test texture poisoned");
        assert_eq!(data.format, format, "upload format mismatch");
        write_region(&mut data, origin, size, pixels);
        state.uploads += 1;
    }

    fn read_pixels(
        &mut self,
        texture: TextureId,
        size: Size,
        format: ResourceFormat,
    ) -> Option<Vec<u8>> {
        Some(self.lock().contents(texture, size, format))
    }

    fn bind_texture(&mut self, unit: TextureUnit, target: TextureTarget, texture: TextureId) {
        let mut state = self.lock();
        state.slot_mut(texture).target = Some(target);
        state.bindings.insert(unit, texture);
    }

    fn begin_async_upload(
        &mut self,
        texture: TextureId,
        size: Size,
        format: ResourceFormat,
        pixels: &[u8],
    ) -> QueryId {
        self.upload_pixels(texture, Offset::default(), size, format, pixels);
        self.lock().new_query(QueryKind::Upload)
    }

    fn begin_async_readback(
        &mut self,
        texture: TextureId,
        size: Size,
        format: ResourceFormat,
    ) -> (BufferId, QueryId) {
        let mut state = self.lock();
        let pixels = state.contents(texture, size, format);
        state.next_buffer += 1;
        let buffer = BufferId(state.next_buffer);
        state.readback_buffers.insert(buffer, pixels);
        let query = state.new_query(QueryKind::Readback);
        (buffer, query)
    }

    fn is_query_complete(&mut self, query: QueryId) -> bool {
        let state = self.lock();
        let Some(entry) = state.queries.get(&query.0) else {
            panic!("polling unknown query {query:?}");
        };
        entry.complete
    }

    fn wait_query(&mut self, query: QueryId) {
        self.complete_query(query);
    }

    fn delete_query(&mut self, query: QueryId) {
        if self.lock().queries.remove(&query.0).is_none() {
            panic!("deleting unknown query {query:?}");
        }
    }

    fn take_readback_buffer(&mut self, buffer: BufferId) -> Option<Vec<u8>> {
        let mut state = self.lock();
        let pixels = state.readback_buffers.remove(&buffer);
        if state.lost {
            return None;
        }
        pixels
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        self.lock().readback_buffers.remove(&buffer);
    }

    fn gen_mailbox(&mut self) -> Mailbox {
        if self.lock().fail_mailbox_generation {
            return Mailbox::zero();
        }
        let mut group = self.share_group.lock();
        group.next_mailbox += 1;
        let mut name = [0u8; MAILBOX_NAME_BYTES];
        name[..8].copy_from_slice(&group.next_mailbox.to_le_bytes());
        name[MAILBOX_NAME_BYTES - 1] = 0x7e;
        Mailbox::from_bytes(name)
    }

    fn produce_texture(&mut self, texture: TextureId, _target: TextureTarget, mailbox: &Mailbox) {
        assert!(!mailbox.is_zero(), "cannot produce into a zero mailbox");
        let mut state = self.lock();
        let data = state.storage(texture);
        self.share_group.lock().mailboxes.insert(*mailbox, data);
        state.produced_mailboxes += 1;
    }

    fn consume_texture(
        &mut self,
        texture: TextureId,
        target: TextureTarget,
        mailbox: &Mailbox,
        size: Size,
        format: ResourceFormat,
    ) -> bool {
        let data = self
            .share_group
            .lock()
            .mailboxes
            .get(mailbox)
            .filter(|data| {
                let data = data.lock().expect("test texture poisoned");
                (data.size, data.format) == (size, format)
            })
            .cloned();
        let consumed = data.is_some();
        let mut state = self.lock();
        let slot = state.slot_mut(texture);
        slot.target = Some(target);
        slot.data = data;
        state.consumed_mailboxes += 1;
        consumed
    }

    fn discard_mailbox(&mut self, mailbox: &Mailbox) {
        self.share_group.lock().mailboxes.remove(mailbox);
    }

    fn insert_sync_point(&mut self) -> SyncPoint {
        let sync_point = {
            let mut group = self.share_group.lock();
            group.next_sync_point += 1;
            SyncPoint(group.next_sync_point)
        };
        self.lock().inserted_sync_points.push(sync_point);
        sync_point
    }

    fn wait_sync_point(&mut self, sync_point: SyncPoint) {
        self.lock().waited_sync_points.push(sync_point);
    }

    fn create_fence(&mut self) -> Arc<dyn Fence> {
        let fence = Arc::new(ManualFence::new());
        self.lock().fences.push(fence.clone());
        fence
    }

    fn flush(&mut self) {
        self.lock().flushes += 1;
    }

    fn finish(&mut self) {
        let mut state = self.lock();
        state.finishes += 1;
        for query in state.queries.values_mut() {
            query.complete = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumed_texture_aliases_produced_storage() {
        let group = TestShareGroup::new();
        let mut producer = group.create_context();
        let mut consumer = group.create_context();

        let texture = producer.gen_textures(1)[0];
        producer.allocate_texture_storage(
            texture,
            TextureTarget::Texture2D,
            Size::new(1, 1),
            ResourceFormat::Rgba8888,
            TextureUsageHint::Any,
        );
        producer.upload_pixels(
            texture,
            Offset::default(),
            Size::new(1, 1),
            ResourceFormat::Rgba8888,
            &[1, 2, 3, 4],
        );
        let mailbox = producer.gen_mailbox();
        producer.produce_texture(texture, TextureTarget::Texture2D, &mailbox);

        let local = consumer.gen_textures(1)[0];
        assert!(consumer.consume_texture(
            local,
            TextureTarget::Texture2D,
            &mailbox,
            Size::new(1, 1),
            ResourceFormat::Rgba8888,
        ));
        assert_eq!(consumer.texture_pixels(local), Some(vec![1, 2, 3, 4]));

        producer.discard_mailbox(&mailbox);
        assert_eq!(group.mailbox_count(), 0);
        assert_eq!(consumer.texture_pixels(local), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn consume_refuses_unknown_and_misshapen_mailboxes() {
        let group = TestShareGroup::new();
        let mut producer = group.create_context();
        let mut consumer = group.create_context();

        let texture = producer.gen_textures(1)[0];
        producer.allocate_texture_storage(
            texture,
            TextureTarget::Texture2D,
            Size::new(2, 2),
            ResourceFormat::Luminance8,
            TextureUsageHint::Any,
        );
        let mailbox = producer.gen_mailbox();
        producer.produce_texture(texture, TextureTarget::Texture2D, &mailbox);

        let textures = consumer.gen_textures(2);
        let (wrong_shape, unknown) = (textures[0], textures[1]);
        assert!(!consumer.consume_texture(
            wrong_shape,
            TextureTarget::Texture2D,
            &mailbox,
            Size::new(2, 2),
            ResourceFormat::Rgba8888,
        ));
        assert!(!consumer.consume_texture(
            unknown,
            TextureTarget::Texture2D,
            &producer.gen_mailbox(),
            Size::new(2, 2),
            ResourceFormat::Luminance8,
        ));
        assert_eq!(consumer.texture_pixels(wrong_shape), None);
        assert_eq!(consumer.texture_pixels(unknown), None);
    }

    #[test]
    fn sync_points_are_monotonic_across_share_group() {
        let group = TestShareGroup::new();
        let mut first = group.create_context();
        let mut second = group.create_context();
        let a = first.insert_sync_point();
        let b = second.insert_sync_point();
        let c = first.insert_sync_point();
        assert!(a < b && b < c);
    }

    #[test]
    fn queries_stay_pending_until_completed() {
        let mut context = TestContext::new();
        let texture = context.gen_textures(1)[0];
        context.allocate_texture_storage(
            texture,
            TextureTarget::Texture2D,
            Size::new(1, 1),
            ResourceFormat::Luminance8,
            TextureUsageHint::Any,
        );
        let query = context.begin_async_upload(
            texture,
            Size::new(1, 1),
            ResourceFormat::Luminance8,
            &[9],
        );
        assert!(!context.is_query_complete(query));
        context.complete_query(query);
        assert!(context.is_query_complete(query));
        assert_eq!(context.texture_pixels(texture), Some(vec![9]));
    }
}
