use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::{ImageReader, RgbaImage};
use std::borrow::Cow;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use std::sync::Arc;

/// Content identity of a frame: a hash of the encoded bytes it was decoded
/// from. Two frames with the same digest came from the same payload.
pub type FrameDigest = u64;

/// A snapshot decoded into an RGBA pixel buffer.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub image: RgbaImage,
    pub digest: FrameDigest,
    /// Validator token the server sent with this frame, if any.
    pub etag: Option<String>,
    /// Size of the encoded payload in bytes.
    pub encoded_len: usize,
}

/// A display area the frame should fit inside, in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// The value handed to the display layer on every publish.
///
/// `image` is `None` when the fetch failed; `error` is `None` when it
/// succeeded.
#[derive(Debug, Clone)]
pub struct PublishedFrame {
    pub image: Option<Arc<DecodedFrame>>,
    pub error: Option<String>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame body")]
    Empty,
    #[error("cannot guess frame format: {0}")]
    Format(std::io::Error),
    #[error("cannot decode frame: {0}")]
    Decode(image::ImageError),
}

impl DecodedFrame {
    /// Decode an encoded still (JPEG, PNG, ...) into RGBA pixels.
    pub fn decode(encoded: &[u8], etag: Option<String>) -> Result<Self, FrameError> {
        if encoded.is_empty() {
            return Err(FrameError::Empty);
        }

        let image = ImageReader::new(Cursor::new(encoded))
            .with_guessed_format()
            .map_err(FrameError::Format)?
            .decode()
            .map_err(FrameError::Decode)?
            .to_rgba8();

        Ok(Self {
            image,
            digest: digest(encoded),
            etag,
            encoded_len: encoded.len(),
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// The frame resized to fit inside `viewport`, or borrowed as-is when it
    /// already fits.
    pub fn scaled_to(&self, viewport: Viewport) -> Cow<'_, RgbaImage> {
        let (w, h) = fit_within(self.width(), self.height(), viewport);
        if (w, h) == (self.width(), self.height()) {
            Cow::Borrowed(&self.image)
        } else {
            Cow::Owned(image::imageops::resize(&self.image, w, h, FilterType::Triangle))
        }
    }
}

impl PublishedFrame {
    pub fn image(frame: Arc<DecodedFrame>, observed_at: DateTime<Utc>) -> Self {
        Self {
            image: Some(frame),
            error: None,
            observed_at,
        }
    }

    pub fn error(message: String, observed_at: DateTime<Utc>) -> Self {
        Self {
            image: None,
            error: Some(message),
            observed_at,
        }
    }
}

/// Hash the encoded payload into a [`FrameDigest`].
pub fn digest(encoded: &[u8]) -> FrameDigest {
    let mut hasher = DefaultHasher::new();
    encoded.hash(&mut hasher);
    hasher.finish()
}

/// Largest size that fits inside `viewport` while keeping the aspect ratio.
///
/// Frames are only ever shrunk. A zero-sized viewport axis is treated as 1.
pub fn fit_within(width: u32, height: u32, viewport: Viewport) -> (u32, u32) {
    let max_w = viewport.width.max(1);
    let max_h = viewport.height.max(1);

    if width == 0 || height == 0 || (width <= max_w && height <= max_h) {
        return (width, height);
    }

    let scale = f64::min(
        max_w as f64 / width as f64,
        max_h as f64 / height as f64,
    );
    let w = ((width as f64 * scale).round() as u32).clamp(1, max_w);
    let h = ((height as f64 * scale).round() as u32).clamp(1, max_h);
    (w, h)
}
