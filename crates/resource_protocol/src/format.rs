use serde::{Deserialize, Serialize};

use crate::Size;

pub const GL_UNSIGNED_BYTE: u32 = 0x1401;
pub const GL_UNSIGNED_SHORT_4_4_4_4: u32 = 0x8033;
pub const GL_UNSIGNED_SHORT_5_6_5: u32 = 0x8363;
pub const GL_RGB: u32 = 0x1907;
pub const GL_RGBA: u32 = 0x1908;
pub const GL_LUMINANCE: u32 = 0x1909;
pub const GL_BGRA_EXT: u32 = 0x80E1;
pub const GL_ETC1_RGB8_OES: u32 = 0x8D64;

pub const ETC1_BLOCK_EDGE: u32 = 4;
pub const ETC1_BLOCK_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceFormat {
    Rgba8888,
    Bgra8888,
    Rgba4444,
    Luminance8,
    Rgb565,
    Etc1,
}

impl ResourceFormat {
    pub const ALL: [ResourceFormat; 6] = [
        ResourceFormat::Rgba8888,
        ResourceFormat::Bgra8888,
        ResourceFormat::Rgba4444,
        ResourceFormat::Luminance8,
        ResourceFormat::Rgb565,
        ResourceFormat::Etc1,
    ];

    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            ResourceFormat::Rgba8888 | ResourceFormat::Bgra8888 => 32,
            ResourceFormat::Rgba4444 | ResourceFormat::Rgb565 => 16,
            ResourceFormat::Luminance8 => 8,
            ResourceFormat::Etc1 => 4,
        }
    }

    pub const fn gl_data_type(self) -> u32 {
        match self {
            ResourceFormat::Rgba8888
            | ResourceFormat::Bgra8888
            | ResourceFormat::Luminance8
            | ResourceFormat::Etc1 => GL_UNSIGNED_BYTE,
            ResourceFormat::Rgba4444 => GL_UNSIGNED_SHORT_4_4_4_4,
            ResourceFormat::Rgb565 => GL_UNSIGNED_SHORT_5_6_5,
        }
    }

    pub const fn gl_format(self) -> u32 {
        match self {
            ResourceFormat::Rgba8888 | ResourceFormat::Rgba4444 => GL_RGBA,
            ResourceFormat::Bgra8888 => GL_BGRA_EXT,
            ResourceFormat::Luminance8 => GL_LUMINANCE,
            ResourceFormat::Rgb565 => GL_RGB,
            ResourceFormat::Etc1 => GL_ETC1_RGB8_OES,
        }
    }

    pub const fn is_compressed(self) -> bool {
        matches!(self, ResourceFormat::Etc1)
    }

    /// Bytes in one tightly packed row. Compressed formats have no row
    /// granularity and report `None`.
    pub fn row_bytes(self, width: u32) -> Option<usize> {
        if self.is_compressed() {
            return None;
        }
        let bits = (width as usize).checked_mul(self.bits_per_pixel() as usize)?;
        Some(bits / 8)
    }

    /// Bytes needed to hold `size` pixels of this format. ETC1 stores whole
    /// 4x4 blocks, so partial blocks at the edges count in full.
    pub fn byte_len(self, size: Size) -> usize {
        if self.is_compressed() {
            let blocks = (size.width.div_ceil(ETC1_BLOCK_EDGE) as usize)
                .checked_mul(size.height.div_ceil(ETC1_BLOCK_EDGE) as usize)
                .expect("resource block count overflow");
            return blocks
                .checked_mul(ETC1_BLOCK_BYTES)
                .expect("resource byte size overflow");
        }
        let pixels = (size.width as usize)
            .checked_mul(size.height as usize)
            .expect("resource pixel count overflow");
        pixels
            .checked_mul(self.bits_per_pixel() as usize)
            .expect("resource byte size overflow")
            / 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_len_follows_bits_per_pixel() {
        let size = Size::new(4, 4);
        assert_eq!(ResourceFormat::Rgba8888.byte_len(size), 64);
        assert_eq!(ResourceFormat::Rgb565.byte_len(size), 32);
        assert_eq!(ResourceFormat::Luminance8.byte_len(size), 16);
        assert_eq!(ResourceFormat::Etc1.byte_len(size), 8);
    }

    #[test]
    fn etc1_byte_len_counts_partial_blocks() {
        assert_eq!(ResourceFormat::Etc1.byte_len(Size::new(1, 1)), 8);
        assert_eq!(ResourceFormat::Etc1.byte_len(Size::new(2, 2)), 8);
        assert_eq!(ResourceFormat::Etc1.byte_len(Size::new(5, 4)), 16);
        assert_eq!(ResourceFormat::Etc1.byte_len(Size::new(8, 9)), 48);
    }

    #[test]
    fn compressed_formats_have_no_row_stride() {
        assert_eq!(ResourceFormat::Etc1.row_bytes(8), None);
        assert_eq!(ResourceFormat::Bgra8888.row_bytes(3), Some(12));
        assert_eq!(ResourceFormat::Rgba4444.row_bytes(3), Some(6));
    }

    #[test]
    fn gl_mapping_pairs_type_and_format() {
        assert_eq!(
            (
                ResourceFormat::Rgba4444.gl_format(),
                ResourceFormat::Rgba4444.gl_data_type()
            ),
            (GL_RGBA, GL_UNSIGNED_SHORT_4_4_4_4)
        );
        assert_eq!(ResourceFormat::Bgra8888.gl_format(), GL_BGRA_EXT);
        assert!(ResourceFormat::ALL.iter().filter(|f| f.is_compressed()).count() == 1);
    }
}
