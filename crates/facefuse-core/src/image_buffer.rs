use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageBufferError {
    #[error("pixel data length {actual} does not match {width}x{height}x3 = {expected}")]
    InvalidLength {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// Dense RGB image: `height * width * 3` bytes, row-major.
///
/// Encoding and decoding of file formats happens at the caller's boundary;
/// everything in this crate works on decoded buffers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageBuffer {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl ImageBuffer {
    pub const CHANNELS: usize = 3;

    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, ImageBufferError> {
        let expected = width as usize * height as usize * Self::CHANNELS;
        if data.len() != expected {
            return Err(ImageBufferError::InvalidLength {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Uniformly colored image.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * Self::CHANNELS)
            .collect();
        Self {
            data,
            width,
            height,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn same_dimensions(&self, other: &ImageBuffer) -> bool {
        self.width == other.width && self.height == other.height
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = self.offset(x, y);
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        let i = self.offset(x, y);
        self.data[i..i + 3].copy_from_slice(&rgb);
    }

    /// Owned `image` crate buffer, for encoding at the caller's boundary.
    pub fn into_rgb_image(self) -> image::RgbImage {
        image::RgbImage::from_fn(self.width, self.height, |x, y| image::Rgb(self.pixel(x, y)))
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * Self::CHANNELS
    }
}

impl From<image::RgbImage> for ImageBuffer {
    fn from(img: image::RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            data: img.into_raw(),
            width,
            height,
        }
    }
}
