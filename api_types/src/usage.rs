use bitflags::bitflags;

bitflags! {
    /// How a pass touches a resource.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct ResourceAccess: u8 {
        const READ             = 1 << 0;
        const WRITE            = 1 << 1;
        const RENDER_TARGET    = 1 << 2;
        const INPUT_ATTACHMENT = 1 << 3;
        const BLIT_SRC         = 1 << 4;
        const BLIT_DST         = 1 << 5;
    }
}

impl ResourceAccess {
    /// Accesses that produce data another pass could consume.
    pub fn is_write(&self) -> bool {
        self.intersects(Self::WRITE | Self::RENDER_TARGET | Self::BLIT_DST)
    }

    pub fn is_read(&self) -> bool {
        self.intersects(Self::READ | Self::INPUT_ATTACHMENT | Self::BLIT_SRC)
    }
}

bitflags! {
    /// Pipeline stages participating in an access.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct StageMask: u8 {
        const VERTEX               = 1 << 0;
        const FRAGMENT             = 1 << 1;
        const COMPUTE              = 1 << 2;
        const BLIT                 = 1 << 3;
        const EARLY_FRAGMENT_TESTS = 1 << 4;
        const LATE_FRAGMENT_TESTS  = 1 << 5;
    }
}

bitflags! {
    /// Creation-time hint describing every way a resource may be used.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct ResourceUsageFlags: u8 {
        const SHADER_READ       = 1 << 0;
        const SHADER_WRITE      = 1 << 1;
        const RENDER_TARGET     = 1 << 2;
        const BLIT_SOURCE       = 1 << 3;
        const BLIT_DESTINATION  = 1 << 4;
        const INPUT_ATTACHMENT  = 1 << 5;
        const PIXEL_FORMAT_VIEW = 1 << 6;
    }
}

bitflags! {
    /// Which GPU caches a scoped barrier flushes and invalidates.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct BarrierScope: u8 {
        const BUFFERS        = 1 << 0;
        const TEXTURES       = 1 << 1;
        const RENDER_TARGETS = 1 << 2;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum StorageMode {
    Private,
    Managed,
    Shared,
    /// Tile-local only; legal solely for textures whose every usage sits
    /// inside a single render pass on tile-based GPUs.
    Memoryless,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum CacheMode {
    #[default]
    DefaultCache,
    WriteCombined,
}

/// Purgeability of a backing allocation. `Empty -> NonVolatile` is the only
/// transition that can fail (the contents were already discarded).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PurgeableState {
    KeepCurrent,
    NonVolatile,
    Volatile,
    Empty,
}

/// Bitmask over the (mip, layer) grid of a texture, or `ALL` for buffers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SubresourceMask(pub u64);

impl SubresourceMask {
    pub const ALL: SubresourceMask = SubresourceMask(u64::MAX);

    pub fn intersects(&self, other: SubresourceMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(&self, other: SubresourceMask) -> SubresourceMask {
        SubresourceMask(self.0 | other.0)
    }
}

impl Default for SubresourceMask {
    fn default() -> Self {
        SubresourceMask::ALL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_classification() {
        assert!(ResourceAccess::RENDER_TARGET.is_write());
        assert!(ResourceAccess::BLIT_DST.is_write());
        assert!(!ResourceAccess::READ.is_write());
        assert!((ResourceAccess::READ | ResourceAccess::WRITE).is_write());
        assert!(ResourceAccess::INPUT_ATTACHMENT.is_read());
    }

    #[test]
    fn subresource_overlap() {
        let low = SubresourceMask(0x0F);
        let high = SubresourceMask(0xF0);
        assert!(!low.intersects(high));
        assert!(low.union(high).intersects(SubresourceMask::ALL));
    }
}
