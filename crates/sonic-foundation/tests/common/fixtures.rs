//! Input media and checkpoint fixtures.

#![allow(dead_code)]

use image::{ImageFormat, Rgb, RgbImage};
use sonic_foundation::checkpoint::Component;
use std::io::Cursor;
use std::path::Path;

/// PNG with a high-contrast textured centre on a flat background, which the
/// reference detector reports as one face.
pub fn face_png(size: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(size, size, |x, y| {
        let inner = x > size / 4 && x < 3 * size / 4 && y > size / 4 && y < 3 * size / 4;
        if inner && (x / 5 + y / 5) % 2 == 0 {
            Rgb([230, 200, 180])
        } else if inner {
            Rgb([60, 40, 30])
        } else {
            Rgb([110, 120, 130])
        }
    });
    encode_png(&img)
}

/// Uniform PNG; no face can be found in it.
pub fn flat_png(size: u32) -> Vec<u8> {
    encode_png(&RgbImage::from_pixel(size, size, Rgb([128, 128, 128])))
}

fn encode_png(img: &RgbImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

/// 16-bit mono WAV holding `secs` of a 220 Hz tone with a slow envelope.
pub fn speech_wav(secs: f32, sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut out = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut out, spec).unwrap();
        let n = (secs * sample_rate as f32) as usize;
        for i in 0..n {
            let t = i as f32 / sample_rate as f32;
            let envelope = 0.5 + 0.5 * (t * 3.0 * std::f32::consts::TAU).sin();
            let v = envelope * (t * 220.0 * std::f32::consts::TAU).sin();
            writer.write_sample((v * 12_000.0) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    out.into_inner()
}

/// Placeholder file for every checkpoint component.
pub fn write_checkpoints(root: &Path) {
    for component in Component::ALL {
        let path = root.join(component.relative_path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("weights for {}", component.name())).unwrap();
    }
}
