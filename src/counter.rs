//! Top-3 color counting
//!
//! Images are decoded as JPEG, every pixel is folded into a histogram of
//! packed 24-bit colors (alpha is ignored), and the three most frequent
//! colors are picked in one pass over the histogram.

use crate::{ColorResult, CountError, CounterKind, DownloadedImage, Rgb};
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::collections::HashMap;
use std::sync::Arc;

/// Typical number of distinct colors in a photo-sized JPEG.
const HISTOGRAM_CAPACITY: usize = 20_000;

pub type Histogram = HashMap<Rgb, u32>;

#[cfg_attr(test, mockall::automock)]
pub trait Counter: Send + Sync {
    fn count(&self, image: &DownloadedImage) -> Result<ColorResult, CountError>;
}

pub fn counter_for(kind: CounterKind) -> Arc<dyn Counter> {
    match kind {
        CounterKind::RawBuffer => Arc::new(RawBufferCounter::new()),
        CounterKind::PixelWalk => Arc::new(PixelWalkCounter::new()),
    }
}

/// Converts the decoded image to an interleaved RGB buffer and walks it
/// linearly. Faster, at the cost of one extra full-size copy.
#[derive(Debug, Default, Clone)]
pub struct RawBufferCounter;

impl RawBufferCounter {
    pub fn new() -> Self {
        Self
    }

    pub fn histogram(&self, decoded: &DynamicImage) -> Histogram {
        let rgb = decoded.to_rgb8();
        let mut histogram = Histogram::with_capacity(HISTOGRAM_CAPACITY);
        for pixel in rgb.as_raw().chunks_exact(3) {
            *histogram.entry(Rgb::from([pixel[0], pixel[1], pixel[2]])).or_insert(0) += 1;
        }
        histogram
    }
}

impl Counter for RawBufferCounter {
    fn count(&self, image: &DownloadedImage) -> Result<ColorResult, CountError> {
        let decoded = decode(image.bytes())?;
        let colors = top_three(&self.histogram(&decoded)).ok_or(CountError::EmptyImage)?;
        Ok(ColorResult::new(image.url(), colors))
    }
}

/// Visits pixels in the decoder's own layout without an intermediate copy.
#[derive(Debug, Default, Clone)]
pub struct PixelWalkCounter;

impl PixelWalkCounter {
    pub fn new() -> Self {
        Self
    }

    pub fn histogram(&self, decoded: &DynamicImage) -> Histogram {
        let mut histogram = Histogram::with_capacity(HISTOGRAM_CAPACITY);
        let mut add = |color: Rgb| *histogram.entry(color).or_insert(0) += 1;

        match decoded {
            DynamicImage::ImageRgb8(buffer) => {
                for pixel in buffer.pixels() {
                    add(Rgb::from(pixel.0));
                }
            }
            DynamicImage::ImageLuma8(buffer) => {
                for pixel in buffer.pixels() {
                    let [l] = pixel.0;
                    add(Rgb::from([l, l, l]));
                }
            }
            other => {
                for (_, _, pixel) in other.pixels() {
                    let [r, g, b, _] = pixel.0;
                    add(Rgb::from([r, g, b]));
                }
            }
        }

        histogram
    }
}

impl Counter for PixelWalkCounter {
    fn count(&self, image: &DownloadedImage) -> Result<ColorResult, CountError> {
        let decoded = decode(image.bytes())?;
        let colors = top_three(&self.histogram(&decoded)).ok_or(CountError::EmptyImage)?;
        Ok(ColorResult::new(image.url(), colors))
    }
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, CountError> {
    image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
        .map_err(|e| CountError::Decode(e.to_string()))
}

/// Picks the three most frequent colors, most frequent first.
///
/// Three slots are kept sorted by count; each entry is rejected cheaply
/// against the third slot before being insertion-sorted in. Among equal
/// counts the winner depends on iteration order. Slots left empty because
/// the image has fewer than three distinct colors repeat the most frequent
/// one. Returns `None` for an empty histogram.
pub fn top_three<'a, I>(histogram: I) -> Option<[Rgb; 3]>
where
    I: IntoIterator<Item = (&'a Rgb, &'a u32)>,
{
    let mut slots: [(Rgb, u32); 3] = [(Rgb::default(), 0); 3];

    for (&color, &count) in histogram {
        if count <= slots[2].1 {
            continue;
        }

        let mut at = 2;
        while at > 0 && count > slots[at - 1].1 {
            slots[at] = slots[at - 1];
            at -= 1;
        }
        slots[at] = (color, count);
    }

    if slots[0].1 == 0 {
        return None;
    }

    let top = slots[0].0;
    Some(slots.map(|(color, count)| if count == 0 { top } else { color }))
}
