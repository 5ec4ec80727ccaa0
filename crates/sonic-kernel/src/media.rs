//! Plain in-memory media representations exchanged between staging and the
//! model sub-networks.

/// An RGB image as interleaved `f32` samples in `[0, 1]`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub width: u32,
    pub height: u32,
    /// `width * height * 3` interleaved RGB values.
    pub data: Vec<f32>,
}

impl ImageTensor {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), (width * height * 3) as usize);
        Self {
            width,
            height,
            data,
        }
    }

    /// RGB triple at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 3] {
        let i = ((y * self.width + x) * 3) as usize;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Luma (BT.601) at `(x, y)`.
    pub fn luma(&self, x: u32, y: u32) -> f32 {
        let [r, g, b] = self.pixel(x, y);
        0.299 * r + 0.587 * g + 0.114 * b
    }

    /// Copy out the sub-rectangle described by `region`, clamped to bounds.
    pub fn crop(&self, region: &Region) -> ImageTensor {
        let x0 = region.x.min(self.width.saturating_sub(1));
        let y0 = region.y.min(self.height.saturating_sub(1));
        let w = region.width.min(self.width - x0).max(1);
        let h = region.height.min(self.height - y0).max(1);
        let mut data = Vec::with_capacity((w * h * 3) as usize);
        for y in y0..y0 + h {
            let start = ((y * self.width + x0) * 3) as usize;
            data.extend_from_slice(&self.data[start..start + (w * 3) as usize]);
        }
        ImageTensor::new(w, h, data)
    }
}

/// An axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Mono PCM audio as `f32` samples in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl Waveform {
    pub fn new(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            samples,
        }
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Samples covering `[start_secs, start_secs + len_secs)`, zero-padded
    /// past the end of the clip.
    pub fn window(&self, start_secs: f32, len_secs: f32) -> Vec<f32> {
        let start = (start_secs * self.sample_rate as f32).round() as usize;
        let len = (len_secs * self.sample_rate as f32).round().max(1.0) as usize;
        (start..start + len)
            .map(|i| self.samples.get(i).copied().unwrap_or(0.0))
            .collect()
    }
}

/// A decoded output frame, packed RGB8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}
