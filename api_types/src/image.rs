use crate::usage::{ResourceAccess, ResourceUsageFlags, StorageMode};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TextureKind {
    D1,
    D2,
    D2Array,
    D3,
    Cube,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PixelFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    Rgba32Float,
    R32Uint,
    R32Float,
    Depth32Float,
    Depth24UnormStencil8,
}

impl PixelFormat {
    pub fn is_depth_format(&self) -> bool {
        matches!(self, PixelFormat::Depth32Float | PixelFormat::Depth24UnormStencil8)
    }
}

/// The tiling/compression state a texture must be in for a given usage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ImageLayout {
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    Present,
}

/// The layout a texture access induces.
///
/// Mixed read/write shader access falls back to `General`; attachment
/// accesses pick color vs depth from the pixel format.
pub fn layout_for_access(access: ResourceAccess, format: PixelFormat) -> ImageLayout {
    if access.contains(ResourceAccess::RENDER_TARGET) {
        if format.is_depth_format() {
            return ImageLayout::DepthStencilAttachment;
        }
        return ImageLayout::ColorAttachment;
    }
    if access.contains(ResourceAccess::BLIT_DST) {
        return ImageLayout::TransferDst;
    }
    if access.contains(ResourceAccess::BLIT_SRC) {
        return ImageLayout::TransferSrc;
    }
    if access.contains(ResourceAccess::WRITE) {
        return ImageLayout::General;
    }
    if access.intersects(ResourceAccess::READ | ResourceAccess::INPUT_ATTACHMENT) {
        return ImageLayout::ShaderReadOnly;
    }
    ImageLayout::Undefined
}

/// Immutable description of a texture. Created once, compared verbatim when
/// a backing is replaced.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct TextureDescriptor {
    pub kind: TextureKind,
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_length: u32,
    pub sample_count: u32,
    pub usage: ResourceUsageFlags,
    pub storage_mode: StorageMode,
}

impl TextureDescriptor {
    /// A 2D color or depth target with a single mip and layer.
    pub fn new_2d(
        pixel_format: PixelFormat,
        width: u32,
        height: u32,
        usage: ResourceUsageFlags,
        storage_mode: StorageMode,
    ) -> Self {
        TextureDescriptor {
            kind: TextureKind::D2,
            pixel_format,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_length: 1,
            sample_count: 1,
            usage,
            storage_mode,
        }
    }
}
