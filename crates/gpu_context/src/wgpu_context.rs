use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use resource_protocol::{
    ETC1_BLOCK_BYTES, ETC1_BLOCK_EDGE, Filter, MAILBOX_NAME_BYTES, Mailbox, Offset,
    ResourceFormat, Size, SyncPoint, TextureTarget, TextureUsageHint, WrapMode,
};

use crate::{
    BufferId, ContextCapabilities, Fence, GraphicsContext, QueryId, TextureId, TextureUnit,
};

#[derive(Debug, thiserror::Error)]
pub enum ContextCreateError {
    #[error("no wgpu adapter available: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    #[error("wgpu device request failed: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
}

#[derive(Debug)]
struct SharedTexture {
    texture: wgpu::Texture,
    size: Size,
    format: ResourceFormat,
}

#[derive(Debug, Default)]
struct ShareGroupState {
    mailboxes: HashMap<Mailbox, SharedTexture>,
    next_mailbox: u64,
    next_sync_point: u32,
}

/// Contexts created from one share group submit to the same device queue,
/// so they form a single command stream and see each other's mailboxes.
#[derive(Debug, Clone)]
pub struct WgpuShareGroup {
    device: wgpu::Device,
    queue: wgpu::Queue,
    lost: Arc<AtomicBool>,
    state: Arc<Mutex<ShareGroupState>>,
}

impl WgpuShareGroup {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            tracing::warn!(?reason, %message, "wgpu device lost");
            lost_flag.store(true, Ordering::Release);
        });
        Self {
            device,
            queue,
            lost,
            state: Arc::default(),
        }
    }

    pub fn create_headless() -> Result<Self, ContextCreateError> {
        let (device, queue) = pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await?;
            let mut required_features = wgpu::Features::empty();
            if adapter
                .features()
                .contains(wgpu::Features::TEXTURE_COMPRESSION_ETC2)
            {
                required_features |= wgpu::Features::TEXTURE_COMPRESSION_ETC2;
            }
            let device_and_queue = adapter
                .request_device(&wgpu::DeviceDescriptor {
                    label: Some("gpu_context"),
                    required_features,
                    required_limits: adapter.limits(),
                    experimental_features: wgpu::ExperimentalFeatures::disabled(),
                    memory_hints: wgpu::MemoryHints::Performance,
                    trace: wgpu::Trace::Off,
                })
                .await?;
            Ok::<_, ContextCreateError>(device_and_queue)
        })?;
        Ok(Self::new(device, queue))
    }

    pub fn create_context(&self) -> WgpuContext {
        WgpuContext {
            group: self.clone(),
            next_texture: 0,
            textures: HashMap::new(),
            next_query: 0,
            queries: HashMap::new(),
            next_buffer: 0,
            readbacks: HashMap::new(),
            bindings: HashMap::new(),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn lock(&self) -> MutexGuard<'_, ShareGroupState> {
        self.state.lock().expect("wgpu share group poisoned")
    }

    fn poll(&self, wait: bool) {
        let poll_type = if wait {
            wgpu::PollType::wait_indefinitely()
        } else {
            wgpu::PollType::Poll
        };
        if let Err(error) = self.device.poll(poll_type) {
            tracing::warn!(%error, "wgpu device poll failed");
        }
    }
}

#[derive(Debug)]
struct TextureEntry {
    target: TextureTarget,
    filter: Filter,
    wrap_mode: WrapMode,
    storage: Option<SharedTextureRef>,
}

#[derive(Debug, Clone)]
struct SharedTextureRef {
    texture: wgpu::Texture,
    size: Size,
    format: ResourceFormat,
}

#[derive(Debug)]
struct PendingReadback {
    buffer: wgpu::Buffer,
    padded_row_bytes: u32,
    row_bytes: u32,
    rows: u32,
    mapped: Arc<Mutex<Option<bool>>>,
}

/// [`GraphicsContext`] over a wgpu device.
///
/// 16-bit packed formats are stored as `R16Uint` so their bytes round-trip
/// unchanged; ETC1 uses the ETC2 RGB8 format when the device supports it.
#[derive(Debug)]
pub struct WgpuContext {
    group: WgpuShareGroup,
    next_texture: u32,
    textures: HashMap<TextureId, TextureEntry>,
    next_query: u32,
    queries: HashMap<QueryId, Arc<AtomicBool>>,
    next_buffer: u32,
    readbacks: HashMap<BufferId, PendingReadback>,
    bindings: HashMap<TextureUnit, TextureId>,
}

pub(crate) fn wgpu_format(format: ResourceFormat) -> wgpu::TextureFormat {
    match format {
        ResourceFormat::Rgba8888 => wgpu::TextureFormat::Rgba8Unorm,
        ResourceFormat::Bgra8888 => wgpu::TextureFormat::Bgra8Unorm,
        ResourceFormat::Luminance8 => wgpu::TextureFormat::R8Unorm,
        ResourceFormat::Rgba4444 | ResourceFormat::Rgb565 => wgpu::TextureFormat::R16Uint,
        ResourceFormat::Etc1 => wgpu::TextureFormat::Etc2Rgb8Unorm,
    }
}

fn upload_row_bytes(format: ResourceFormat, width: u32) -> u32 {
    if format.is_compressed() {
        return width.div_ceil(ETC1_BLOCK_EDGE) * ETC1_BLOCK_BYTES as u32;
    }
    format
        .row_bytes(width)
        .and_then(|bytes| u32::try_from(bytes).ok())
        .expect("upload row bytes overflow")
}

/// Texture and copy extent. Compressed textures are padded out to whole
/// blocks.
fn physical_extent(format: ResourceFormat, size: Size) -> wgpu::Extent3d {
    let (width, height) = if format.is_compressed() {
        (
            size.width.next_multiple_of(ETC1_BLOCK_EDGE),
            size.height.next_multiple_of(ETC1_BLOCK_EDGE),
        )
    } else {
        (size.width, size.height)
    };
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

fn padded_row_bytes(row_bytes: u32) -> u32 {
    row_bytes.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
}

fn wgpu_filter(filter: Filter) -> wgpu::FilterMode {
    match filter {
        Filter::Nearest => wgpu::FilterMode::Nearest,
        Filter::Linear => wgpu::FilterMode::Linear,
    }
}

fn wgpu_address_mode(wrap_mode: WrapMode) -> wgpu::AddressMode {
    match wrap_mode {
        WrapMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        WrapMode::Repeat => wgpu::AddressMode::Repeat,
    }
}

impl WgpuContext {
    pub fn share_group(&self) -> &WgpuShareGroup {
        &self.group
    }

    /// View of the texture bound to `unit`, for the renderer's bind groups.
    pub fn bound_texture_view(&self, unit: TextureUnit) -> Option<wgpu::TextureView> {
        let texture = self.bindings.get(&unit)?;
        let storage = self.textures.get(texture)?.storage.as_ref()?;
        Some(
            storage
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default()),
        )
    }

    /// Sampler matching the filter and wrap state recorded for the texture
    /// bound to `unit`.
    pub fn bound_sampler(&self, unit: TextureUnit) -> Option<wgpu::Sampler> {
        let texture = self.bindings.get(&unit)?;
        let entry = self.textures.get(texture)?;
        let address_mode = wgpu_address_mode(entry.wrap_mode);
        let filter = wgpu_filter(entry.filter);
        Some(self.group.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("gpu_context.bound_sampler"),
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            mag_filter: filter,
            min_filter: filter,
            ..Default::default()
        }))
    }

    fn entry(&self, texture: TextureId) -> &TextureEntry {
        let Some(entry) = self.textures.get(&texture) else {
            panic!("wgpu context has no texture {texture:?}");
        };
        entry
    }

    fn entry_mut(&mut self, texture: TextureId) -> &mut TextureEntry {
        let Some(entry) = self.textures.get_mut(&texture) else {
            panic!("wgpu context has no texture {texture:?}");
        };
        entry
    }

    fn storage(&self, texture: TextureId) -> SharedTextureRef {
        let Some(storage) = self.entry(texture).storage.clone() else {
            panic!("texture {texture:?} has no storage");
        };
        storage
    }

    fn new_query(&mut self) -> (QueryId, Arc<AtomicBool>) {
        self.next_query = self
            .next_query
            .checked_add(1)
            .expect("wgpu query id space exhausted");
        let query = QueryId(self.next_query);
        let flag = Arc::new(AtomicBool::new(false));
        self.queries.insert(query, flag.clone());
        (query, flag)
    }

    fn write_texture(
        &self,
        storage: &SharedTextureRef,
        origin: Offset,
        size: Size,
        pixels: &[u8],
    ) {
        let row_bytes = upload_row_bytes(storage.format, size.width);
        self.group.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &storage.texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: origin.x,
                    y: origin.y,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(row_bytes),
                rows_per_image: None,
            },
            physical_extent(storage.format, size),
        );
    }

    fn encode_readback(&self, storage: &SharedTextureRef) -> PendingReadback {
        assert!(
            !storage.format.is_compressed(),
            "compressed textures cannot be read back"
        );
        let row_bytes = upload_row_bytes(storage.format, storage.size.width);
        let padded = padded_row_bytes(row_bytes);
        let buffer = self.group.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gpu_context.readback"),
            size: u64::from(padded) * u64::from(storage.size.height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .group
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gpu_context.readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &storage.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(storage.size.height),
                },
            },
            wgpu::Extent3d {
                width: storage.size.width,
                height: storage.size.height,
                depth_or_array_layers: 1,
            },
        );
        self.group.queue.submit(Some(encoder.finish()));
        PendingReadback {
            buffer,
            padded_row_bytes: padded,
            row_bytes,
            rows: storage.size.height,
            mapped: Arc::new(Mutex::new(None)),
        }
    }
}

impl PendingReadback {
    fn start_map(&self, done: Arc<AtomicBool>) {
        let mapped = self.mapped.clone();
        self.buffer
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                if let Err(error) = &result {
                    tracing::warn!(%error, "readback buffer map failed");
                }
                *mapped.lock().expect("readback map state poisoned") = Some(result.is_ok());
                done.store(true, Ordering::Release);
            });
    }

    fn unpadded(self) -> Option<Vec<u8>> {
        let mapped = *self.mapped.lock().expect("readback map state poisoned");
        if mapped != Some(true) {
            return None;
        }
        let mut pixels = Vec::with_capacity((self.row_bytes * self.rows) as usize);
        {
            let view = self.buffer.slice(..).get_mapped_range();
            for row in 0..self.rows as usize {
                let start = row * self.padded_row_bytes as usize;
                pixels.extend_from_slice(&view[start..start + self.row_bytes as usize]);
            }
        }
        self.buffer.unmap();
        Some(pixels)
    }
}

struct WgpuFence {
    group: WgpuShareGroup,
    set: AtomicBool,
    armed: Mutex<Option<Arc<AtomicBool>>>,
}

impl Fence for WgpuFence {
    fn set(&self) {
        self.set.store(true, Ordering::Relaxed);
    }

    fn has_passed(&self) -> bool {
        if !self.set.load(Ordering::Relaxed) {
            return true;
        }
        let done = {
            let mut armed = self.armed.lock().expect("wgpu fence poisoned");
            armed
                .get_or_insert_with(|| {
                    // Covers every submission made up to the first query.
                    let done = Arc::new(AtomicBool::new(false));
                    let signal = done.clone();
                    self.group
                        .queue
                        .on_submitted_work_done(move || signal.store(true, Ordering::Release));
                    done
                })
                .clone()
        };
        self.group.poll(false);
        done.load(Ordering::Acquire)
    }
}

impl GraphicsContext for WgpuContext {
    fn capabilities(&self) -> ContextCapabilities {
        let limits = self.group.device.limits();
        ContextCapabilities {
            max_texture_size: limits.max_texture_dimension_2d,
            supports_etc1: self
                .group
                .device
                .features()
                .contains(wgpu::Features::TEXTURE_COMPRESSION_ETC2),
            best_texture_format: ResourceFormat::Rgba8888,
        }
    }

    fn is_context_lost(&self) -> bool {
        self.group.lost.load(Ordering::Acquire)
    }

    fn gen_textures(&mut self, count: usize) -> Vec<TextureId> {
        (0..count)
            .map(|_| {
                self.next_texture = self
                    .next_texture
                    .checked_add(1)
                    .expect("wgpu texture id space exhausted");
                let texture = TextureId(self.next_texture);
                self.textures.insert(
                    texture,
                    TextureEntry {
                        target: TextureTarget::Texture2D,
                        filter: Filter::Linear,
                        wrap_mode: WrapMode::ClampToEdge,
                        storage: None,
                    },
                );
                texture
            })
            .collect()
    }

    fn delete_textures(&mut self, textures: &[TextureId]) {
        for texture in textures {
            let Some(entry) = self.textures.remove(texture) else {
                panic!("deleting unknown texture {texture:?}");
            };
            self.bindings.retain(|_, bound| bound != texture);
            drop(entry);
        }
    }

    fn set_texture_parameters(
        &mut self,
        texture: TextureId,
        target: TextureTarget,
        filter: Filter,
        wrap_mode: WrapMode,
    ) {
        let entry = self.entry_mut(texture);
        entry.target = target;
        entry.filter = filter;
        entry.wrap_mode = wrap_mode;
    }

    fn set_texture_filter(&mut self, texture: TextureId, target: TextureTarget, filter: Filter) {
        let entry = self.entry_mut(texture);
        entry.target = target;
        entry.filter = filter;
    }

    fn allocate_texture_storage(
        &mut self,
        texture: TextureId,
        target: TextureTarget,
        size: Size,
        format: ResourceFormat,
        hint: TextureUsageHint,
    ) {
        let mut usage = wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::TEXTURE_BINDING;
        if hint == TextureUsageHint::Framebuffer && !format.is_compressed() {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        let wgpu_texture = self.group.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("gpu_context.resource"),
            size: physical_extent(format, size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu_format(format),
            usage,
            view_formats: &[],
        });
        let entry = self.entry_mut(texture);
        assert!(
            entry.storage.is_none(),
            "texture {texture:?} storage allocated twice"
        );
        entry.target = target;
        entry.storage = Some(SharedTextureRef {
            texture: wgpu_texture,
            size,
            format,
        });
    }

    fn upload_pixels(
        &mut self,
        texture: TextureId,
        origin: Offset,
        size: Size,
        format: ResourceFormat,
        pixels: &[u8],
    ) {
        let storage = self.storage(texture);
        assert_eq!(storage.format, format, "upload format mismatch");
        self.write_texture(&storage, origin, size, pixels);
    }

    fn read_pixels(
        &mut self,
        texture: TextureId,
        size: Size,
        format: ResourceFormat,
    ) -> Option<Vec<u8>> {
        let storage = self.storage(texture);
        assert_eq!(
            (storage.size, storage.format),
            (size, format),
            "readback shape mismatch"
        );
        let pending = self.encode_readback(&storage);
        let (sender, receiver) = crossbeam_channel::bounded(1);
        pending
            .buffer
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });
        self.group.poll(true);
        let mapped = receiver
            .recv()
            .map(|result| result.is_ok())
            .unwrap_or(false);
        *pending.mapped.lock().expect("readback map state poisoned") = Some(mapped);
        pending.unpadded()
    }

    fn bind_texture(&mut self, unit: TextureUnit, target: TextureTarget, texture: TextureId) {
        self.entry_mut(texture).target = target;
        self.bindings.insert(unit, texture);
    }

    fn begin_async_upload(
        &mut self,
        texture: TextureId,
        size: Size,
        format: ResourceFormat,
        pixels: &[u8],
    ) -> QueryId {
        let storage = self.storage(texture);
        assert_eq!(storage.format, format, "upload format mismatch");
        self.write_texture(&storage, Offset::default(), size, pixels);
        self.group.queue.submit([]);
        let (query, done) = self.new_query();
        self.group
            .queue
            .on_submitted_work_done(move || done.store(true, Ordering::Release));
        query
    }

    fn begin_async_readback(
        &mut self,
        texture: TextureId,
        size: Size,
        format: ResourceFormat,
    ) -> (BufferId, QueryId) {
        let storage = self.storage(texture);
        assert_eq!(
            (storage.size, storage.format),
            (size, format),
            "readback shape mismatch"
        );
        let pending = self.encode_readback(&storage);
        let (query, done) = self.new_query();
        pending.start_map(done);
        self.next_buffer = self
            .next_buffer
            .checked_add(1)
            .expect("wgpu buffer id space exhausted");
        let buffer = BufferId(self.next_buffer);
        self.readbacks.insert(buffer, pending);
        (buffer, query)
    }

    fn is_query_complete(&mut self, query: QueryId) -> bool {
        self.group.poll(false);
        let Some(done) = self.queries.get(&query) else {
            panic!("polling unknown query {query:?}");
        };
        done.load(Ordering::Acquire)
    }

    fn wait_query(&mut self, query: QueryId) {
        let Some(done) = self.queries.get(&query).cloned() else {
            panic!("waiting on unknown query {query:?}");
        };
        while !done.load(Ordering::Acquire) && !self.is_context_lost() {
            self.group.poll(true);
        }
    }

    fn delete_query(&mut self, query: QueryId) {
        if self.queries.remove(&query).is_none() {
            panic!("deleting unknown query {query:?}");
        }
    }

    fn take_readback_buffer(&mut self, buffer: BufferId) -> Option<Vec<u8>> {
        let Some(pending) = self.readbacks.remove(&buffer) else {
            panic!("taking unknown readback buffer {buffer:?}");
        };
        pending.unpadded()
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        if let Some(pending) = self.readbacks.remove(&buffer) {
            pending.buffer.destroy();
        }
    }

    fn gen_mailbox(&mut self) -> Mailbox {
        let mut group = self.group.lock();
        group.next_mailbox = group
            .next_mailbox
            .checked_add(1)
            .expect("mailbox name space exhausted");
        let mut name = [0u8; MAILBOX_NAME_BYTES];
        name[..8].copy_from_slice(&group.next_mailbox.to_le_bytes());
        name[MAILBOX_NAME_BYTES - 1] = 0x3d;
        Mailbox::from_bytes(name)
    }

    fn produce_texture(&mut self, texture: TextureId, _target: TextureTarget, mailbox: &Mailbox) {
        assert!(!mailbox.is_zero(), "cannot produce into a zero mailbox");
        let storage = self.storage(texture);
        self.group.lock().mailboxes.insert(
            *mailbox,
            SharedTexture {
                texture: storage.texture,
                size: storage.size,
                format: storage.format,
            },
        );
    }

    fn consume_texture(
        &mut self,
        texture: TextureId,
        target: TextureTarget,
        mailbox: &Mailbox,
        size: Size,
        format: ResourceFormat,
    ) -> bool {
        let storage = match self.group.lock().mailboxes.get(mailbox) {
            Some(shared) if (shared.size, shared.format) == (size, format) => {
                Some(SharedTextureRef {
                    texture: shared.texture.clone(),
                    size: shared.size,
                    format: shared.format,
                })
            }
            Some(shared) => {
                tracing::warn!(
                    ?mailbox,
                    expected = ?(size, format),
                    actual = ?(shared.size, shared.format),
                    "consumed mailbox has another shape"
                );
                None
            }
            None => {
                tracing::warn!(?mailbox, "consumed mailbox names no texture");
                None
            }
        };
        let consumed = storage.is_some();
        let entry = self.entry_mut(texture);
        entry.target = target;
        entry.storage = storage;
        consumed
    }

    fn discard_mailbox(&mut self, mailbox: &Mailbox) {
        self.group.lock().mailboxes.remove(mailbox);
    }

    fn insert_sync_point(&mut self) -> SyncPoint {
        self.group.queue.submit([]);
        let mut group = self.group.lock();
        group.next_sync_point = group
            .next_sync_point
            .checked_add(1)
            .expect("sync point space exhausted");
        SyncPoint(group.next_sync_point)
    }

    fn wait_sync_point(&mut self, _sync_point: SyncPoint) {
        // One queue per share group: submission order already puts the
        // producer's work ahead of ours.
    }

    fn create_fence(&mut self) -> Arc<dyn Fence> {
        Arc::new(WgpuFence {
            group: self.group.clone(),
            set: AtomicBool::new(false),
            armed: Mutex::new(None),
        })
    }

    fn flush(&mut self) {
        self.group.queue.submit([]);
        self.group.poll(false);
    }

    fn finish(&mut self) {
        self.group.queue.submit([]);
        self.group.poll(true);
    }
}
