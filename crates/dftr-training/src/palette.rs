//! Per-object colors for segmentation visualization.

use dftr_abstraction::Tensor;
use image::{Rgb, RgbImage};
use std::collections::HashSet;

const CUBE: u64 = 255 * 255 * 255;

/// Index 0 is the black background; ids `1..=n` get distinct colors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<[u8; 3]>,
}

fn split_digits(v: u64) -> [u8; 3] {
    [(v / (255 * 255)).min(255) as u8, ((v / 255) % 255) as u8, (v % 255) as u8]
}

impl Palette {
    #[must_use]
    pub fn new(n_objects: usize) -> Self {
        let mut colors = vec![[0, 0, 0]];
        let mut used: HashSet<[u8; 3]> = colors.iter().copied().collect();
        for i in 1..=n_objects as u64 {
            let mut value = CUBE / i;
            let mut color = split_digits(value);
            while used.contains(&color) && value > 0 {
                value -= 1;
                color = split_digits(value);
            }
            used.insert(color);
            colors.push(color);
        }
        Self { colors }
    }

    /// Number of object ids covered, excluding the background.
    #[must_use]
    pub fn n_objects(&self) -> usize {
        self.colors.len() - 1
    }

    /// Color for `id`; ids outside the palette render as background.
    #[must_use]
    pub fn color(&self, id: usize) -> [u8; 3] {
        self.colors.get(id).copied().unwrap_or([0, 0, 0])
    }

    /// Renders a `[height, width]` label map (or the first frame of `[batch, height, width]`).
    #[must_use]
    pub fn colorize(&self, labels: &Tensor, frame: usize) -> Option<RgbImage> {
        let (h, w) = match labels.shape() {
            [h, w] if frame == 0 => (*h, *w),
            [b, h, w] if frame < *b => (*h, *w),
            _ => return None,
        };
        let start = frame * h * w;
        let data = labels.data().get(start..start + h * w)?;
        let mut image = RgbImage::new(w as u32, h as u32);
        for (i, label) in data.iter().enumerate() {
            let id = if label.is_finite() && *label > 0.0 { label.round() as usize } else { 0 };
            image.put_pixel((i % w) as u32, (i / w) as u32, Rgb(self.color(id)));
        }
        Some(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_palette_is_injective_and_deterministic() {
        let palette = Palette::new(13);
        assert_eq!(palette.n_objects(), 13);
        assert_eq!(palette.color(0), [0, 0, 0]);
        assert_eq!(palette.color(1), [255, 0, 0]);

        let distinct: HashSet<[u8; 3]> = (0..=13).map(|i| palette.color(i)).collect();
        assert_eq!(distinct.len(), 14);
        assert_eq!(palette, Palette::new(13));
    }

    #[test]
    fn test_large_palettes_stay_injective() {
        let palette = Palette::new(2000);
        let distinct: HashSet<[u8; 3]> = (0..=2000).map(|i| palette.color(i)).collect();
        assert_eq!(distinct.len(), 2001);
    }

    #[test]
    fn test_colorize_batch_frame() {
        let palette = Palette::new(2);
        let labels = Tensor::new(vec![2, 1, 2], vec![0.0, 1.0, 2.0, 2.0]).unwrap();
        let image = palette.colorize(&labels, 1).unwrap();
        assert_eq!(image.dimensions(), (2, 1));
        assert_eq!(image.get_pixel(0, 0).0, palette.color(2));
        assert!(palette.colorize(&labels, 2).is_none());
    }
}
